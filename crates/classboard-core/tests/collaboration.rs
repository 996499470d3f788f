//! End-to-end room scenarios over both transports.

use classboard_core::shapes::{Ellipse, Freehand, Rectangle, ShapeTrait};
use classboard_core::{
    ActionKind, CanvasDocument, CanvasSurface, CollabConfig, CollabError, CollaborationSession, MemoryStore,
    Participant, RoomRegistry, Shape, SyncEvent,
};
use kurbo::{Point, Vec2};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// How long a session may stay quiet before pumping stops.
const IDLE: Duration = Duration::from_millis(250);

fn config() -> CollabConfig {
    CollabConfig {
        snapshot_delay_ms: 20,
        ..CollabConfig::default()
    }
}

fn relay() -> (Arc<MemoryStore>, RoomRegistry) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), RoomRegistry::new(store))
}

/// Process events until the session goes quiet.
async fn pump(session: &mut CollaborationSession, doc: &mut CanvasDocument) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(Some(batch)) = timeout(IDLE, session.process_next(doc)).await {
        events.extend(batch);
    }
    events
}

fn applied(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::ActionApplied { .. }))
        .count()
}

fn draw_ten(doc: &mut CanvasDocument) {
    for i in 0..10 {
        let x = i as f64 * 20.0;
        let shape: Shape = match i % 3 {
            0 => Rectangle::new(Point::new(x, 0.0), 10.0, 10.0).into(),
            1 => Ellipse::circle(Point::new(x, 40.0), 5.0).into(),
            _ => Freehand::from_points(vec![Point::new(x, 80.0), Point::new(x + 5.0, 90.0)]).into(),
        };
        doc.add_shape(shape);
    }
}

#[tokio::test]
async fn offline_edits_are_published_on_create() {
    let (_, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();

    // Edits before any room exists, including a modification and a clear
    draw_ten(&mut teacher_doc);
    teacher_doc.clear();
    draw_ten(&mut teacher_doc);
    let first = teacher_doc.shapes_ordered().next().map(Shape::id).unwrap();
    teacher_doc.translate_shape(first, Vec2::new(3.0, 3.0));

    let teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();

    let mut student_doc = CanvasDocument::new();
    CollaborationSession::join_relay(
        registry,
        Participant::student("A"),
        teacher.code().as_str(),
        &mut student_doc,
        &config,
    )
    .await
    .unwrap();

    assert_eq!(student_doc.to_snapshot(), teacher_doc.to_snapshot());
}

#[tokio::test]
async fn relay_late_joiner_matches_teacher() {
    let (_, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    let mut teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();

    for _ in 0..10 {
        draw_ten(&mut teacher_doc);
        assert!(teacher.flush(&mut teacher_doc).await > 0);
    }

    // Lowercase input is accepted
    let code = teacher.code().as_str().to_lowercase();
    let mut student_doc = CanvasDocument::new();
    let student = CollaborationSession::join_relay(
        registry,
        Participant::student("A"),
        &code,
        &mut student_doc,
        &config,
    )
    .await
    .unwrap();

    assert_eq!(student_doc.len(), 100);
    assert_eq!(student_doc.to_snapshot(), teacher_doc.to_snapshot());
    assert_eq!(student.roster().len(), 2);
}

#[tokio::test]
async fn relay_student_rectangle_reaches_other_student_once() {
    let (_, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    let mut teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();
    let code = teacher.code().to_string();

    let mut doc_1 = CanvasDocument::new();
    let mut student_1 =
        CollaborationSession::join_relay(registry.clone(), Participant::student("One"), &code, &mut doc_1, &config)
            .await
            .unwrap();
    let mut doc_2 = CanvasDocument::new();
    let mut student_2 =
        CollaborationSession::join_relay(registry.clone(), Participant::student("Two"), &code, &mut doc_2, &config)
            .await
            .unwrap();
    pump(&mut teacher, &mut teacher_doc).await;
    pump(&mut student_1, &mut doc_1).await;
    pump(&mut student_2, &mut doc_2).await;

    let rect = Rectangle::new(Point::new(5.0, 5.0), 40.0, 25.0);
    doc_1.add_shape(rect.clone().into());
    assert_eq!(student_1.flush(&mut doc_1).await, 1);

    pump(&mut student_2, &mut doc_2).await;
    pump(&mut teacher, &mut teacher_doc).await;
    let echoes = pump(&mut student_1, &mut doc_1).await;

    assert_eq!(doc_2.len(), 1);
    assert_eq!(doc_2.get_shape(rect.id()), Some(&Shape::from(rect.clone())));
    assert_eq!(teacher_doc.len(), 1);
    assert_eq!(applied(&echoes), 0);

    // Nothing applied remotely is sent back out
    assert_eq!(teacher.flush(&mut teacher_doc).await, 0);
    assert_eq!(student_2.flush(&mut doc_2).await, 0);
}

#[tokio::test]
async fn student_local_clear_never_wipes_the_room() {
    let (_, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    draw_ten(&mut teacher_doc);
    let mut teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();
    let code = teacher.code().to_string();

    let mut doc_1 = CanvasDocument::new();
    let mut student_1 =
        CollaborationSession::join_relay(registry.clone(), Participant::student("One"), &code, &mut doc_1, &config)
            .await
            .unwrap();
    let mut doc_2 = CanvasDocument::new();
    let mut student_2 =
        CollaborationSession::join_relay(registry.clone(), Participant::student("Two"), &code, &mut doc_2, &config)
            .await
            .unwrap();
    pump(&mut teacher, &mut teacher_doc).await;
    pump(&mut student_1, &mut doc_1).await;
    assert_eq!(doc_1.len(), 10);

    doc_1.clear();
    assert_eq!(student_1.flush(&mut doc_1).await, 0);
    let rect = Rectangle::new(Point::new(300.0, 300.0), 20.0, 20.0);
    doc_1.add_shape(rect.clone().into());
    assert_eq!(student_1.flush(&mut doc_1).await, 1);
    // Moving it would need a snapshot of the cleared canvas
    doc_1.translate_shape(rect.id(), Vec2::new(5.0, 0.0));
    assert_eq!(student_1.flush(&mut doc_1).await, 0);

    pump(&mut teacher, &mut teacher_doc).await;
    pump(&mut student_2, &mut doc_2).await;
    assert_eq!(teacher_doc.len(), 11);
    assert_eq!(doc_2.len(), 11);
    assert_eq!(doc_2.get_shape(rect.id()), Some(&Shape::from(rect)));
    assert_eq!(doc_1.len(), 1);
}

#[tokio::test]
async fn invalid_code_never_registers_participant() {
    let (store, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    let teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();

    let student = Participant::student("A");
    for code in ["", "ABC12", "ABC1O0", "ZZZZZZ"] {
        let mut doc = CanvasDocument::new();
        let err = CollaborationSession::join_relay(registry.clone(), student.clone(), code, &mut doc, &config)
            .await
            .err();
        assert!(matches!(err, Some(CollabError::RoomNotFound(_))), "code {:?}", code);
    }

    assert_eq!(store.read(&format!("users/{}", student.id)).unwrap(), None);
    let room = registry.room(teacher.code()).await.unwrap().unwrap();
    assert!(room.students.is_empty());
}

#[tokio::test]
async fn lock_blocks_student_drawing_until_unlocked() {
    let (_, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    let mut teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();
    let code = teacher.code().to_string();
    let mut student_doc = CanvasDocument::new();
    let mut student =
        CollaborationSession::join_relay(registry.clone(), Participant::student("A"), &code, &mut student_doc, &config)
            .await
            .unwrap();

    teacher.toggle_lock(true).await.unwrap();
    let events = pump(&mut student, &mut student_doc).await;
    assert!(events.contains(&SyncEvent::LockChanged(true)));
    assert!(matches!(student.ensure_can_draw(), Err(CollabError::CanvasLocked)));

    student_doc.add_shape(Rectangle::new(Point::ZERO, 5.0, 5.0).into());
    assert_eq!(student.flush(&mut student_doc).await, 0);
    assert_eq!(student.stats().discarded, 1);

    // The teacher still draws while locked
    teacher_doc.add_shape(Rectangle::new(Point::ZERO, 5.0, 5.0).into());
    assert_eq!(teacher.flush(&mut teacher_doc).await, 1);

    teacher.toggle_lock(false).await.unwrap();
    let events = pump(&mut student, &mut student_doc).await;
    assert!(events.contains(&SyncEvent::LockChanged(false)));
    assert!(student.ensure_can_draw().is_ok());
    student_doc.add_shape(Ellipse::circle(Point::new(50.0, 50.0), 5.0).into());
    assert!(student.flush(&mut student_doc).await > 0);
}

#[tokio::test]
async fn teacher_clear_reaches_students() {
    let (_, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    draw_ten(&mut teacher_doc);
    let mut teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();
    let code = teacher.code().to_string();
    let mut student_doc = CanvasDocument::new();
    let mut student =
        CollaborationSession::join_relay(registry.clone(), Participant::student("A"), &code, &mut student_doc, &config)
            .await
            .unwrap();
    assert_eq!(student_doc.len(), 10);

    teacher.clear_canvas(&mut teacher_doc).await.unwrap();
    let events = pump(&mut student, &mut student_doc).await;
    assert!(student_doc.is_empty());
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::ActionApplied {
            kind: ActionKind::Clear,
            ..
        }
    )));
}

#[tokio::test]
async fn owner_leaving_last_closes_room_for_nobody() {
    let (_, registry) = relay();
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    let mut teacher = CollaborationSession::create_relay(
        registry.clone(),
        Participant::teacher("T"),
        "Art",
        &mut teacher_doc,
        &config,
    )
    .await
    .unwrap();
    let code = teacher.code().clone();
    let mut student_doc = CanvasDocument::new();
    let mut student = CollaborationSession::join_relay(
        registry.clone(),
        Participant::student("A"),
        code.as_str(),
        &mut student_doc,
        &config,
    )
    .await
    .unwrap();

    // Owner leaves while a student remains: room survives, owner shown offline
    teacher.leave().await.unwrap();
    let events = pump(&mut student, &mut student_doc).await;
    assert!(events.contains(&SyncEvent::PeerLeft {
        id: teacher.participant().id.clone()
    }));
    assert!(registry.room(&code).await.unwrap().is_some());

    student.leave().await.unwrap();
    assert!(registry.room(&code).await.unwrap().is_none());
}

#[tokio::test]
async fn direct_chain_delivers_exactly_once() {
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    let mut teacher =
        CollaborationSession::host_direct(Participant::teacher("T"), "Art", &mut teacher_doc, &config)
            .await
            .unwrap();
    let url = teacher.endpoint().unwrap().to_string();
    let code = teacher.code().to_string();

    // Ten drawing actions before anyone joins
    for _ in 0..10 {
        teacher_doc.add_shape(Rectangle::new(Point::new(1.0, 1.0), 3.0, 3.0).into());
        teacher.flush(&mut teacher_doc).await;
    }

    let mut doc_a = CanvasDocument::new();
    let (joined, _) = tokio::join!(
        CollaborationSession::join_direct(&url, &code, Participant::student("A"), &mut doc_a, &config),
        pump(&mut teacher, &mut teacher_doc),
    );
    let mut student_a = joined.unwrap();
    pump(&mut student_a, &mut doc_a).await;
    assert_eq!(doc_a.to_snapshot(), teacher_doc.to_snapshot());

    let mut doc_b = CanvasDocument::new();
    let (joined, _) = tokio::join!(
        CollaborationSession::join_direct(&url, &code, Participant::student("B"), &mut doc_b, &config),
        pump(&mut teacher, &mut teacher_doc),
    );
    let mut student_b = joined.unwrap();
    pump(&mut student_b, &mut doc_b).await;
    pump(&mut student_a, &mut doc_a).await;
    assert_eq!(doc_b.len(), 10);

    let rect = Rectangle::new(Point::new(100.0, 100.0), 30.0, 20.0);
    doc_a.add_shape(rect.clone().into());
    assert_eq!(student_a.flush(&mut doc_a).await, 1);

    let at_teacher = pump(&mut teacher, &mut teacher_doc).await;
    let at_b = pump(&mut student_b, &mut doc_b).await;
    let at_a = pump(&mut student_a, &mut doc_a).await;

    assert_eq!(applied(&at_teacher), 1);
    assert_eq!(applied(&at_b), 1);
    assert_eq!(applied(&at_a), 0);
    assert_eq!(doc_b.len(), 11);
    assert_eq!(doc_b.get_shape(rect.id()), Some(&Shape::from(rect.clone())));
    assert_eq!(teacher_doc.len(), 11);

    // Applying produced nothing to send anywhere
    assert_eq!(teacher.flush(&mut teacher_doc).await, 0);
    assert_eq!(student_b.flush(&mut doc_b).await, 0);
    assert_eq!(teacher.stats().applied, 1);

    // Teacher ends the session; students see the room close
    teacher.leave().await.unwrap();
    let at_b = pump(&mut student_b, &mut doc_b).await;
    assert!(at_b.contains(&SyncEvent::RoomClosed));
}

#[tokio::test]
async fn direct_join_with_wrong_code_fails() {
    let config = config();
    let mut teacher_doc = CanvasDocument::new();
    let mut teacher =
        CollaborationSession::host_direct(Participant::teacher("T"), "Art", &mut teacher_doc, &config)
            .await
            .unwrap();
    let url = teacher.endpoint().unwrap().to_string();

    let mut doc = CanvasDocument::new();
    let (joined, events) = tokio::join!(
        CollaborationSession::join_direct(&url, "ZZZZZZ", Participant::student("A"), &mut doc, &config),
        pump(&mut teacher, &mut teacher_doc),
    );
    assert!(matches!(joined.err(), Some(CollabError::RoomNotFound(_))));
    assert!(events.is_empty());
    assert_eq!(teacher.roster().len(), 1);
}

#[tokio::test]
async fn direct_lock_and_cursor_presence() {
    let config = CollabConfig {
        cursor_interval_ms: 0,
        ..config()
    };
    let mut teacher_doc = CanvasDocument::new();
    let mut teacher =
        CollaborationSession::host_direct(Participant::teacher("T"), "Art", &mut teacher_doc, &config)
            .await
            .unwrap();
    let url = teacher.endpoint().unwrap().to_string();
    let code = teacher.code().to_string();

    let mut doc_a = CanvasDocument::new();
    let (joined, _) = tokio::join!(
        CollaborationSession::join_direct(&url, &code, Participant::student("A"), &mut doc_a, &config),
        pump(&mut teacher, &mut teacher_doc),
    );
    let mut student_a = joined.unwrap();
    pump(&mut student_a, &mut doc_a).await;

    // Student cursor is visible to the teacher
    assert!(student_a.move_cursor(classboard_core::CursorPosition::new(7.0, 8.0)).await.unwrap());
    let events = pump(&mut teacher, &mut teacher_doc).await;
    assert!(events.iter().any(|e| matches!(e, SyncEvent::CursorMoved(c) if c.id == student_a.participant().id)));
    assert_eq!(teacher.presence().len(), 1);

    teacher.toggle_lock(true).await.unwrap();
    let events = pump(&mut student_a, &mut doc_a).await;
    assert!(events.contains(&SyncEvent::LockChanged(true)));
    doc_a.add_shape(Rectangle::new(Point::ZERO, 2.0, 2.0).into());
    assert_eq!(student_a.flush(&mut doc_a).await, 0);

    // Leaving removes the student's cursor on the teacher's side
    student_a.leave().await.unwrap();
    let events = pump(&mut teacher, &mut teacher_doc).await;
    assert!(events.iter().any(|e| matches!(e, SyncEvent::CursorRemoved { .. })));
    assert!(teacher.presence().is_empty());
}

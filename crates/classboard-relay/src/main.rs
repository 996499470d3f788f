//! Classboard relay server binary.
//!
//! Configuration comes from the environment:
//!
//! - `CLASSBOARD_RELAY_ADDR` (default `0.0.0.0:3030`)
//! - `CLASSBOARD_ACTION_RETENTION_MS` (default `10000`)
//! - `CLASSBOARD_SWEEP_INTERVAL_MS` (default `5000`)
//! - `RUST_LOG` for log filtering

use classboard_relay::RelayConfig;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classboard_relay=info,classboard_core=info,tower_http=info".into()),
        )
        .init();

    classboard_relay::serve(RelayConfig::from_env()).await
}

//! wayfare-relay — WebSocket message relay for cross-device plan sync.
//!
//! Configuration comes from the environment:
//! - `WAYFARE_RELAY_ADDR` — bind address (default `127.0.0.1:9090`)
//! - `WAYFARE_RELAY_TOKEN` — bearer token clients must present (optional)
//!
//! Log verbosity follows `RUST_LOG`.

use wayfare_sync::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    if config.auth_token.is_none() {
        log::warn!("WAYFARE_RELAY_TOKEN not set; accepting unauthenticated peers");
    }

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}

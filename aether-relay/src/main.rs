//! aether-relay binary entry point.
//!
//! ```bash
//! aether-relay --config relay.toml
//! AETHER_GATEWAYS=native,nostr,http aether-relay
//! ```
//!
//! Exit codes: 0 clean shutdown, 64 invalid configuration, 74 I/O error.

use std::path::PathBuf;
use std::sync::Arc;

use aether_relay::cleanup::spawn_gc_task;
use aether_relay::config::{Config, ConfigError};
use aether_relay::error::RelayError;
use aether_relay::gateways;
use aether_relay::store::{EventStore, MemoryStore, SqliteStore};
use aether_relay::Relay;

const EXIT_CONFIG: i32 = 64;
const EXIT_IO: i32 = 74;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("failed to start runtime: {err}");
            std::process::exit(EXIT_IO);
        }
    };

    let code = match runtime.block_on(run()) {
        Ok(()) => 0,
        Err(RelayError::Config(err)) => {
            tracing::error!("{err}");
            EXIT_CONFIG
        }
        Err(err) => {
            tracing::error!("{err}");
            EXIT_IO
        }
    };
    std::process::exit(code);
}

fn config_path() -> Option<PathBuf> {
    let from_args = std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from);
    from_args.or_else(|| std::env::var("AETHER_CONFIG").ok().map(PathBuf::from))
}

async fn run() -> Result<(), RelayError> {
    let config = match config_path() {
        Some(path) => Config::from_file(&path)?,
        None => {
            let default = PathBuf::from("relay.toml");
            if default.exists() {
                Config::from_file(&default)?
            } else {
                Config::from_env()?
            }
        }
    };

    let store: Arc<dyn EventStore> = match config.storage.backend.as_str() {
        "memory" => Arc::new(MemoryStore::new()),
        "sqlite" => Arc::new(
            SqliteStore::open(&config.storage.database)
                .await
                .map_err(RelayError::Storage)?,
        ),
        other => {
            return Err(ConfigError::UnknownBackend {
                backend: other.to_string(),
            }
            .into())
        }
    };

    let gc = spawn_gc_task(store.clone(), config.cleanup.clone());
    let relay = Arc::new(Relay::new(config.clone(), store));

    let mut servers = Vec::new();
    if config.gateways.native {
        servers.push(serve(
            config.server.native_bind.clone(),
            gateways::native::router(relay.clone()),
            "native",
        ));
    }
    if config.gateways.nostr {
        servers.push(serve(
            config.server.nostr_bind.clone(),
            gateways::nostr::router(relay.clone()),
            "nostr",
        ));
    }
    if config.gateways.http {
        servers.push(serve(
            config.server.http_bind.clone(),
            gateways::http::router(relay.clone()),
            "http",
        ));
    }
    if servers.is_empty() {
        return Err(ConfigError::Invalid {
            reason: "all gateways disabled".into(),
        }
        .into());
    }

    let result = futures_util::future::try_join_all(servers).await;
    gc.abort();
    result.map(|_| ())
}

async fn serve(
    bind: String,
    router: axum::Router,
    surface: &'static str,
) -> Result<(), RelayError> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, surface, "listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

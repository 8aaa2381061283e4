//! Outbox delivery service.
//!
//! Reads `OUTBOX_*` variables, starts the trigger queue worker and the
//! reconciliation sweeper, and serves the trigger callback over HTTP.
//! `RUST_LOG` overrides the default log filter.

use relay_outbox::http::{serve, AppState};
use relay_outbox::{Config, Infrastructure};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_outbox=debug")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(backend = ?config.backend, listen = %config.listen_addr, "starting outbox server");

    // Blocking HTTP clients are created here, outside the async runtime.
    let infra = Infrastructure::from_config(&config)?;
    let workers = infra.spawn_workers();

    let state = AppState::new(infra.outbox().clone());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(async {
        tokio::select! {
            result = serve(state, &config.listen_addr) => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                Ok(())
            }
        }
    });
    drop(runtime);

    let (delivery, sweeps) = workers.stop();
    tracing::info!(
        delivered = delivery.delivered,
        dropped = delivery.dropped,
        republished = sweeps.published,
        "outbox server stopped"
    );
    served.map_err(Into::into)
}

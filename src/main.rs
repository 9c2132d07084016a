use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use forklift::{
    affinity::{SystemClock, spawn_sweeper},
    app::{AppState, app, reload_routes},
    config::Cfg,
    routes::RoutingConfig,
    weights::{RandomSource, SeededRandom, ThreadRandom},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // tracing enxuto
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forklift=info".parse()?)
                .add_directive("axum=warn".parse()?)
                .add_directive("tower_http=warn".parse()?),
        )
        .with_target(false)
        .compact()
        .init();

    // metrics (metrics 0.24 + prometheus 0.17)
    let prom_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    // config/env
    let cfg = Cfg::from_env()?;
    info!("cfg: {:?}", cfg.redacted());

    // topologia de rotas: erro aqui é fatal, nunca cai num default silencioso
    let routing = match &cfg.routes_file {
        Some(path) => RoutingConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            info!("ROUTES_FILE not set, using builtin topology");
            RoutingConfig::builtin()
        }
    };

    let rng: Arc<dyn RandomSource> = match cfg.rng_seed {
        Some(seed) => {
            info!(seed, "weighted draws are seeded");
            Arc::new(SeededRandom::new(seed))
        }
        None => Arc::new(ThreadRandom),
    };

    let state = AppState::new(cfg, routing, rng, Arc::new(SystemClock))?.with_metrics(prom_handle);

    // varredura de afinidades ociosas
    spawn_sweeper(
        state.affinity.clone(),
        Duration::from_secs(state.cfg.affinity_sweep_secs),
    );

    #[cfg(unix)]
    reload_on_sighup(state.clone());

    let addr: SocketAddr = format!("0.0.0.0:{}", state.cfg.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(unix)]
fn reload_on_sighup(state: AppState) {
    use tokio::signal::unix::{SignalKind, signal};
    use tracing::{error, warn};

    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGHUP reload unavailable: {e}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            match reload_routes(&state).await {
                Ok(version) => info!(version, "routes reloaded on SIGHUP"),
                Err(e) => error!("reload failed, keeping current routes: {e}"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("ctrl-c handler failed: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

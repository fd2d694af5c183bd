use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use dxx_tracker::archive::{ArchiveSink, JsonDirSink, NullSink};
use dxx_tracker::config::TrackerConfig;
use dxx_tracker::engine::{run_cleanup_ticker, run_poll_ticker, run_udp_loop, Engine};
use dxx_tracker::hub::BroadcastHub;
use dxx_tracker::publisher::{run_publisher, Publisher};
use dxx_tracker::registry::GameRegistry;
use dxx_tracker::server::{run_http_server, run_ws_server, AppState};
use dxx_tracker::uploads::UploadStore;
use dxx_tracker::watcher::run_gamelog_watcher;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = TrackerConfig::load(&args);
    info!(
        udp_port = config.udp_port,
        ws_port = config.ws_port,
        http_port = config.http_port,
        local_player = config.local_player.as_deref().unwrap_or("<none>"),
        snapshot = %config.snapshot_path.display(),
        "starting dxx tracker"
    );

    // Sockets bind up front; a failure here is the one fatal startup error.
    let udp = UdpSocket::bind(("0.0.0.0", config.udp_port))
        .await
        .with_context(|| format!("failed binding udp tracker port {}", config.udp_port))?;
    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed binding http port {}", config.http_port))?;
    let ws_listener = TcpListener::bind(("0.0.0.0", config.ws_port))
        .await
        .with_context(|| format!("failed binding websocket port {}", config.ws_port))?;
    info!(udp = %udp.local_addr().context("udp local addr")?, "udp tracker socket bound");

    let registry = Arc::new(GameRegistry::new());
    let uploads = Arc::new(UploadStore::new());
    let hub = Arc::new(BroadcastHub::new());
    let (notice_tx, notice_rx) = crossbeam_channel::unbounded();
    let started = Instant::now();

    let archive: Arc<dyn ArchiveSink> = match &config.archive_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "archiving finished games to disk");
            Arc::new(JsonDirSink::new(dir.clone()))
        }
        None => Arc::new(NullSink),
    };
    let publisher = Publisher {
        registry: Arc::clone(&registry),
        uploads: Arc::clone(&uploads),
        hub: Arc::clone(&hub),
        archive,
        snapshot_path: config.snapshot_path.clone(),
        started,
    };
    let publisher_shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let publisher_thread = {
        let shutdown = Arc::clone(&publisher_shutdown);
        std::thread::spawn(move || run_publisher(publisher, notice_rx, shutdown))
    };

    let engine = Arc::new(Engine::new(Arc::clone(&registry), notice_tx.clone()));
    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        uploads: Arc::clone(&uploads),
        hub: Arc::clone(&hub),
        notices: notice_tx.clone(),
        started,
    });

    let udp = Arc::new(udp);
    let receive_loop = tokio::spawn(run_udp_loop(Arc::clone(&engine), Arc::clone(&udp)));
    let mut workers: Vec<JoinHandle<()>> = vec![
        tokio::spawn(run_poll_ticker(Arc::clone(&engine), Arc::clone(&udp))),
        tokio::spawn(run_cleanup_ticker(Arc::clone(&engine))),
        tokio::spawn(run_gamelog_watcher(
            config.watch_dirs(),
            config.local_player.clone(),
            Arc::clone(&uploads),
            notice_tx.clone(),
        )),
    ];
    let mut readers: Vec<JoinHandle<()>> = vec![
        tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                if let Err(err) = run_http_server(state, http_listener).await {
                    error!(%err, "http server stopped");
                }
            }
        }),
        tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                if let Err(err) = run_ws_server(state, ws_listener).await {
                    error!(%err, "websocket server stopped");
                }
            }
        }),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal")?;
    info!("shutdown signal received, draining");

    // Stop ingest first so no new state enters, then pollers and watchers,
    // then the read-out surfaces.
    receive_loop.abort();
    let _ = receive_loop.await;
    for worker in &workers {
        worker.abort();
    }
    for reader in &readers {
        reader.abort();
    }
    let drained = timeout(SHUTDOWN_GRACE, async {
        for worker in workers.drain(..).chain(readers.drain(..)) {
            let _ = worker.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("workers did not stop within the grace period");
    }

    // Let the publisher drain its queue and write the final snapshot. The
    // flag bounds the wait even if a lingering connection still holds a
    // sender.
    drop(state);
    drop(engine);
    drop(notice_tx);
    publisher_shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    if publisher_thread.join().is_err() {
        warn!("publisher thread panicked during drain");
    }

    info!("tracker stopped");
    Ok(())
}

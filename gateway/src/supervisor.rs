//! Lifecycle wiring: boots every component in the documented order and tears
//! them down in reverse on shutdown, with a grace window for in-flight
//! downstream traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use crate::args::ServerArgs;
use crate::dispatcher::Dispatcher;
use crate::ingest;
use crate::server;
use crate::session::GatewayState;
use crate::store::Store;
use crate::sync::{BatchSynchronizer, DurableStore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Bounded outbound queue depth per downstream session.
const SESSION_OUTBOX_CAP: usize = 256;

/// Boots durable store -> in-memory store -> ingest client -> batch
/// synchronizer -> HTTP surface -> dispatcher, then blocks until shutdown is
/// requested. Only a failure standing up the durable store or in-memory
/// store is fatal; every other component's failures are logged and retried
/// internally.
pub async fn run(args: ServerArgs) -> Result<()> {
    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let pool = aislink_common::postgres::create_pool(args.postgres)
        .await
        .context("failed to create durable store connection pool")?;
    let durable = Arc::new(DurableStore::new(pool));
    durable
        .init_schema()
        .await
        .context("failed to initialize durable store schema")?;

    let ttl = Duration::from_secs(args.pipeline.vessel_ttl_seconds);
    let store = Store::new(ttl);

    let dispatcher = Dispatcher::new();

    let ingest_task = {
        let store = store.clone();
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        let flush_interval = Duration::from_millis(args.pipeline.ingest_flush_ms);
        let tile_zoom = args.pipeline.tile_zoom;
        let aisstream = args.aisstream;
        tokio::spawn(async move {
            ingest::run(aisstream, store, dispatcher, tile_zoom, flush_interval, cancel).await;
        })
    };

    let sync_task = {
        let synchronizer = BatchSynchronizer::new(store.clone(), durable.clone(), args.pipeline.batch_sync_size);
        let interval = Duration::from_millis(args.pipeline.batch_sync_interval_ms);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            synchronizer.run(interval, cancel).await;
        })
    };

    let gateway_state = Arc::new(GatewayState {
        store: store.clone(),
        dispatcher: dispatcher.clone(),
        outbox_cap: SESSION_OUTBOX_CAP,
    });

    let http_task = {
        let cancel = cancel.clone();
        let ready = ready.clone();
        let port = args.pipeline.port;
        tokio::spawn(async move { server::run(port, gateway_state, cancel, ready).await })
    };

    aislink_common::metrics::spawn_metrics_server(args.metrics_port, ready.clone());

    let heartbeat_task = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(args.pipeline.heartbeat_ms);
        tokio::spawn(async move { dispatcher.run_heartbeat(interval, cancel).await })
    };

    let dispatch_task = {
        let dispatcher = dispatcher.clone();
        let store = store.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_millis(args.pipeline.dispatch_flush_ms);
        tokio::spawn(async move { dispatcher.run(store, interval, cancel).await })
    };

    let sweep_task = {
        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.sweep_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, "swept expired vessel records");
                        }
                        crate::metrics::live_vessel_count(store.live_vessel_count());
                    }
                }
            }
        })
    };

    ready.store(true, Ordering::Relaxed);
    wait_for_shutdown_signal().await;
    tracing::info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "shutting down, draining in-flight work");
    ready.store(false, Ordering::Relaxed);
    cancel.cancel();

    let _ = tokio::time::timeout(
        SHUTDOWN_GRACE,
        futures_util::future::join_all(vec![dispatch_task, heartbeat_task, sweep_task, sync_task, ingest_task, http_task]),
    )
    .await;

    Ok(())
}

/// Resolves once SIGINT or SIGTERM is received (or Ctrl+C on non-Unix).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => eprintln!("{}", "received SIGINT".red()),
            _ = sigterm.recv() => eprintln!("{}", "received SIGTERM".red()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}

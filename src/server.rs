//! Server runtime: wires the heartbeat listener, watch manager, dispatch
//! pool and resync walker together.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::heartbeat::HeartbeatService;
use crate::protocol::SYNC_FILE_NUM_ONETIME;
use crate::registry::ClientRegistry;
use crate::resync::ResyncWalker;
use crate::watch::{event_queue, WatchManager};

/// Handles to a running server
pub struct ServerHandle {
    pub registry: Arc<ClientRegistry>,
    pub watches: WatchManager,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop every background task and release the OS watches
    pub fn shutdown(self) {
        for client in self.registry.snapshot() {
            info!(
                "client:{} online:{} last heartbeat:{}",
                client.ip, client.online, client.last_heartbeat
            );
        }
        for path in self.watches.watched_paths() {
            self.watches.unwatch(&path);
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Start all server components. Fails if the heartbeat listener cannot be
/// bound or a monitored root cannot be watched.
pub async fn start_server(config: &ServerConfig) -> Result<ServerHandle> {
    let listener = HeartbeatService::bind(&config.heartbeat_bind).await?;

    let dirs = Arc::new(config.moni_dir.clone());
    let policy = config.heartbeat_policy();
    let registry = Arc::new(ClientRegistry::new(policy.window_secs()));
    let (events_tx, events_rx) = event_queue(SYNC_FILE_NUM_ONETIME);
    let watches = WatchManager::new(events_tx);
    let (resync_tx, resync_rx) = mpsc::unbounded_channel();

    for moni in dirs.iter() {
        watches
            .watch(&moni.dir)
            .with_context(|| format!("monitor {}", moni.dir.display()))?;
    }

    let heartbeat = Arc::new(HeartbeatService::new(
        registry.clone(),
        dirs.clone(),
        policy,
        resync_tx,
    ));
    let dispatcher = Arc::new(Dispatcher::new(dirs.clone(), registry.clone()));
    let walker = Arc::new(ResyncWalker::new(dirs, watches.clone()));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = heartbeat.serve(listener).await {
            error!("heartbeat listener stopped: {:#}", e);
        }
    }));
    tasks.push(tokio::spawn(dispatcher.run(events_rx, config.workers)));
    tasks.push(tokio::spawn(walker.run(resync_rx)));

    info!(
        "server started: {} monitored dirs, {} workers, heartbeat on {}",
        config.moni_dir.len(),
        config.workers,
        config.heartbeat_bind
    );
    Ok(ServerHandle {
        registry,
        watches,
        tasks,
    })
}

/// Run until ctrl-c
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let handle = start_server(&config).await?;
    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;
    info!("shutting down");
    handle.shutdown();
    Ok(())
}

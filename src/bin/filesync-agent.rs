use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use filesync::agent::{self, CommandHandler};
use filesync::cli::AgentOpts;
use filesync::config::{load_client_config, ClientConfig};
use filesync::heartbeat::{keep_alive, HeartbeatPolicy};
use filesync::logger;
use filesync::protocol::MAX_RETRY_TIME;

async fn run(config: ClientConfig) -> Result<()> {
    // Bind before announcing ourselves so pushed commands have somewhere to land
    let listener = agent::bind(&config.listen).await?;

    let policy = HeartbeatPolicy::new(config.heartbeat_interval_secs, MAX_RETRY_TIME);
    for host in config.server_hosts() {
        let server = format!("{}:{}", host, config.heartbeat_port);
        tracing::info!("heartbeat target {}", server);
        tokio::spawn(keep_alive(server, policy));
    }

    let handler = Arc::new(CommandHandler::new(config.sync_dir));
    tokio::select! {
        res = agent::serve(handler, listener) => res,
        res = tokio::signal::ctrl_c() => {
            res.context("wait for ctrl-c")?;
            tracing::info!("shutting down");
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    let opts = AgentOpts::parse();

    let mut config = load_client_config(&opts.conf)
        .with_context(|| format!("load client config {}", opts.conf.display()))?;
    if opts.debug {
        config.debug = true;
    }
    logger::init(config.debug, config.log_file.as_deref(), config.log_file_num)?;

    tracing::info!("config:{:?}", config);
    for d in &config.sync_dir {
        tracing::info!("sync {} -> {} (server {})", d.server_dir, d.local_dir, d.server_addr);
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(config))
}

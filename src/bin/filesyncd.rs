use anyhow::{Context, Result};
use clap::Parser;

use filesync::cli::ServerOpts;
use filesync::config::load_server_config;
use filesync::{logger, server};

fn main() -> Result<()> {
    let opts = ServerOpts::parse();

    let mut config = load_server_config(&opts.conf)
        .with_context(|| format!("load server config {}", opts.conf.display()))?;
    if opts.debug {
        config.debug = true;
    }
    logger::init(config.debug, config.log_file.as_deref(), config.log_file_num)?;

    tracing::info!("config:{:?}", config);
    for moni in &config.moni_dir {
        tracing::info!(
            "monitor {} -> [{}]",
            moni.dir.display(),
            moni.white_list.join(", ")
        );
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(server::run_server(config))
}

//! Shared CLI fragments for the server and agent binaries

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// filesyncd: watch directories and push changes to clients
#[derive(Clone, Debug, Parser)]
#[command(name = "filesyncd", version)]
pub struct ServerOpts {
    /// Server config file (TOML, or JSON by extension)
    #[arg(long = "conf", default_value = "./conf/server.toml")]
    pub conf: PathBuf,

    /// Force debug logging regardless of the config file
    #[arg(long, action = ArgAction::SetTrue)]
    pub debug: bool,
}

/// filesync-agent: receive pushed changes into local mirrors
#[derive(Clone, Debug, Parser)]
#[command(name = "filesync-agent", version)]
pub struct AgentOpts {
    /// Client config file (TOML, or JSON by extension)
    #[arg(long = "conf", default_value = "./conf/client.toml")]
    pub conf: PathBuf,

    /// Force debug logging regardless of the config file
    #[arg(long, action = ArgAction::SetTrue)]
    pub debug: bool,
}

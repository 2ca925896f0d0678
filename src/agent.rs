//! Client agent: applies pushed commands to the local mirror.
//!
//! One framed request per connection, one framed `respOk`/`respFail` reply.
//! Filesystem failures become `respFail`; undecodable frames drop the
//! connection.

use anyhow::{anyhow, bail, Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::checksum::{digest_file_async, md5_hex};
use crate::codec::{read_message_bounded, write_message, SyncMessage};
use crate::config::SyncDir;
use crate::path_map::to_local;
use crate::protocol::timeouts::FRAME_HEADER_MS;
use crate::protocol::{MsgType, DIR_LEN, FILE_LEN};

pub struct CommandHandler {
    dirs: Vec<SyncDir>,
    // How long a fresh connection may stay silent before it is dropped
    idle_ms: u64,
}

impl CommandHandler {
    pub fn new(dirs: Vec<SyncDir>) -> Self {
        Self {
            dirs,
            idle_ms: FRAME_HEADER_MS,
        }
    }

    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_ms = ms;
        self
    }

    fn local_path(&self, msg: &SyncMessage) -> Result<PathBuf> {
        to_local(msg.file_name(), &self.dirs)
            .ok_or_else(|| anyhow!("not found dest file by req file:{}", msg.file_name()))
    }

    /// Apply one command to the local filesystem
    pub async fn apply(&self, msg: &SyncMessage) -> Result<()> {
        let local = self.local_path(msg)?;
        match msg.msg_type {
            MsgType::FileCreate => create(&local, msg.content_len()).await,
            MsgType::FileWrite => write(&local, msg).await,
            MsgType::FileRemove => remove(&local).await,
            MsgType::FileRename => rename_away(&local).await,
            MsgType::FileChmod => {
                // The request carries no mode bits
                debug!("chmod {} acknowledged", local.display());
                Ok(())
            }
            MsgType::FileExist => matches_local(&local, msg).await,
            other => bail!("unsupported msgtype {}", other),
        }
    }

    /// Serve one connection: read a command, apply it, reply
    pub async fn handle<S>(&self, mut stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let msg = read_message_bounded(&mut stream, self.idle_ms)
            .await
            .with_context(|| format!("read command from {}", peer))?;
        debug!("conn:{},{:?}", peer, msg);

        let ok = match self.apply(&msg).await {
            Ok(()) => true,
            Err(e) => {
                if msg.msg_type == MsgType::FileExist {
                    debug!("cmdtype:{} failed,err:{:#}", msg.msg_type.name(), e);
                } else {
                    warn!("cmdtype:{} failed,err:{:#}", msg.msg_type.name(), e);
                }
                false
            }
        };
        write_message(&mut stream, &SyncMessage::response(ok)).await?;
        stream.shutdown().await.ok();
        Ok(())
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind command listener {}", addr))
}

/// Accept loop; one task per pushed command
pub async fn serve(handler: Arc<CommandHandler>, listener: TcpListener) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("command listener on {}", addr);
    }
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("command accept failed: {}", e);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let handler = handler.clone();
        tokio::spawn(async move {
            let peer = peer.to_string();
            if let Err(e) = handler.handle(stream, &peer).await {
                warn!("handle msg failed,err:{:#}", e);
            }
        });
    }
}

/// Bind `addr` and serve commands for `dirs`. Bind failure is returned.
pub async fn serve_commands(addr: &str, dirs: Vec<SyncDir>) -> Result<()> {
    let listener = bind(addr).await?;
    serve(Arc::new(CommandHandler::new(dirs)), listener).await
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    Ok(())
}

async fn create(path: &Path, kind: u32) -> Result<()> {
    match kind {
        DIR_LEN => {
            info!("now MkdirAll:{}", path.display());
            tokio::fs::create_dir_all(path)
                .await
                .with_context(|| format!("mkdir {}", path.display()))
        }
        FILE_LEN => {
            info!("now OpenFile(create):{}", path.display());
            ensure_parent(path).await?;
            // Existing content is left for the write that follows
            tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(path)
                .await
                .with_context(|| format!("create {}", path.display()))?;
            Ok(())
        }
        other => bail!("unknown create kind {} for {}", other, path.display()),
    }
}

async fn write(path: &Path, msg: &SyncMessage) -> Result<()> {
    let content = msg.content();
    if content.len() != msg.content_len() as usize {
        bail!(
            "contentLen:{},content len:{},not equal",
            msg.content_len(),
            content.len()
        );
    }
    if msg.file_md5.is_some() && !md5_hex(content).eq_ignore_ascii_case(msg.file_md5()) {
        bail!("content md5 does not match {}", msg.file_md5());
    }
    info!("now OpenFile(write):{}", path.display());
    ensure_parent(path).await?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write {}", path.display()))
}

async fn remove(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("remove {}: already gone", path.display());
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    info!("now RemoveAll:{}", path.display());
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
    .with_context(|| format!("remove {}", path.display()))
}

// The new name arrives separately as a create
async fn rename_away(path: &Path) -> Result<()> {
    info!("now rename:{} (removing old name)", path.display());
    remove(path).await
}

async fn matches_local(path: &Path, msg: &SyncMessage) -> Result<()> {
    let local = digest_file_async(path.to_path_buf()).await?;
    if local.matches(msg.content_len(), msg.file_md5()) {
        return Ok(());
    }
    bail!(
        "server file:{},md5:{},len:{} not equal client file:{},md5:{},len:{}",
        msg.file_name(),
        msg.file_md5(),
        msg.content_len(),
        path.display(),
        local.md5,
        local.len
    )
}

//! Dispatch engine: worker pool that turns change events into protocol
//! messages and fans them out to every live, whitelisted client.
//!
//! Delivery is best-effort and at-most-once. A failed send is logged and the
//! event is dropped; clients catch up on their next full resync.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::checksum::md5_hex;
use crate::codec::{dial, read_message_timed, write_frame, SyncMessage};
use crate::config::{host_of, MonitoredDir};
use crate::protocol::timeouts::{read_deadline_ms, FRAME_HEADER_MS};
use crate::protocol::{MsgType, DIR_LEN, FILE_LEN};
use crate::registry::{unix_now, ClientRegistry};
use crate::watch::{ChangeEvent, ChangeKind, EventReceiver};

/// Outcome of fanning one event out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// One request/reply round trip on a fresh connection with an encoded payload
async fn request(addr: &str, payload: &[u8]) -> Result<SyncMessage> {
    let mut stream = dial(addr).await?;
    write_frame(&mut stream, payload)
        .await
        .with_context(|| format!("send to {}", addr))?;
    // The client writes the file before replying
    let ms = FRAME_HEADER_MS + read_deadline_ms(payload.len());
    read_message_timed(&mut stream, ms)
        .await
        .with_context(|| format!("reply from {}", addr))
}

/// Send `msg` to `addr` and return the client's reply
pub async fn send_message(addr: &str, msg: &SyncMessage) -> Result<SyncMessage> {
    debug!("conn:{},{:?}", addr, msg);
    let payload = msg.encode()?;
    request(addr, &payload).await
}

pub struct Dispatcher {
    dirs: Arc<Vec<MonitoredDir>>,
    registry: Arc<ClientRegistry>,
}

impl Dispatcher {
    pub fn new(dirs: Arc<Vec<MonitoredDir>>, registry: Arc<ClientRegistry>) -> Self {
        Self { dirs, registry }
    }

    /// Whitelist entries that should receive a change to `path` at `now`:
    /// the entry's monitored dir contains the path and its host is reachable.
    pub fn targets(&self, path: &Path, now: i64) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for moni in self.dirs.iter().filter(|m| m.contains(path)) {
            for entry in &moni.white_list {
                let host = host_of(entry);
                if !self.registry.is_reachable(host, now) {
                    debug!(
                        "client:{} lost or never seen, not sending {}",
                        host,
                        path.display()
                    );
                    continue;
                }
                if !out.contains(entry) {
                    out.push(entry.clone());
                }
            }
        }
        out
    }

    /// Build the protocol message for an event.
    /// `Ok(None)` means the event carries nothing to send.
    pub async fn build_message(event: &ChangeEvent) -> Result<Option<SyncMessage>> {
        let name = event.path.to_string_lossy().into_owned();
        let msg = match event.kind {
            ChangeKind::Create => {
                info!("process create:{}", name);
                let meta = tokio::fs::metadata(&event.path)
                    .await
                    .with_context(|| format!("stat {}", name))?;
                let len = if meta.is_dir() { DIR_LEN } else { FILE_LEN };
                SyncMessage::new(MsgType::FileCreate)
                    .with_file_name(name)
                    .with_content_len(len)
            }
            ChangeKind::Write => {
                info!("process write:{}", name);
                let meta = tokio::fs::metadata(&event.path)
                    .await
                    .with_context(|| format!("stat {}", name))?;
                if meta.is_dir() {
                    debug!("write event on directory {}, nothing to send", name);
                    return Ok(None);
                }
                let content = tokio::fs::read(&event.path)
                    .await
                    .with_context(|| format!("read {}", name))?;
                let md5 = md5_hex(&content);
                SyncMessage::new(MsgType::FileWrite)
                    .with_file_name(name)
                    .with_file_md5(md5)
                    .with_content(content)?
            }
            ChangeKind::Remove => {
                info!("process remove:{}", name);
                SyncMessage::new(MsgType::FileRemove)
                    .with_file_name(name)
                    .with_content_len(0)
            }
            ChangeKind::Rename => {
                info!("process rename:{}", name);
                SyncMessage::new(MsgType::FileRename)
                    .with_file_name(name)
                    .with_content_len(0)
            }
            ChangeKind::Chmod => {
                info!("process chmod:{}", name);
                SyncMessage::new(MsgType::FileChmod)
                    .with_file_name(name)
                    .with_content_len(0)
            }
        };
        Ok(Some(msg))
    }

    /// Deliver `msg` to every target concurrently. One target failing does
    /// not affect the others.
    pub async fn fan_out(&self, targets: Vec<String>, msg: &SyncMessage) -> Result<DeliveryReport> {
        let payload = Arc::new(msg.encode()?);
        let msg_type = msg.msg_type;
        let mut sends = JoinSet::new();
        for addr in targets {
            let payload = payload.clone();
            sends.spawn(async move {
                let res = request(&addr, &payload).await;
                (addr, res)
            });
        }

        let mut report = DeliveryReport::default();
        while let Some(joined) = sends.join_next().await {
            let (addr, res) = match joined {
                Ok(v) => v,
                Err(e) => {
                    error!("send task failed: {}", e);
                    continue;
                }
            };
            match res {
                Ok(reply) if reply.is_ok() => {
                    debug!("client:{} applied {}", addr, msg_type.name());
                    report.delivered.push(addr);
                }
                Ok(reply) => {
                    error!(
                        "send msg to client:{},msgName:{} failed, resp:{}",
                        addr,
                        msg_type.name(),
                        reply.msg_type
                    );
                    report.failed.push(addr);
                }
                Err(e) => {
                    error!(
                        "send msg to client:{},msgName:{} failed,err:{:#}",
                        addr,
                        msg_type.name(),
                        e
                    );
                    report.failed.push(addr);
                }
            }
        }
        Ok(report)
    }

    /// Process one event end to end
    pub async fn process(&self, event: ChangeEvent) -> Result<DeliveryReport> {
        let Some(msg) = Self::build_message(&event).await? else {
            return Ok(DeliveryReport::default());
        };
        let targets = self.targets(&event.path, unix_now());
        if targets.is_empty() {
            debug!("no live client for {}", event.path.display());
            return Ok(DeliveryReport::default());
        }
        self.fan_out(targets, &msg).await
    }

    /// Drain `events` with `workers` concurrent workers. Returns once the
    /// queue is closed and empty and every worker has finished.
    pub async fn run(self: Arc<Self>, events: EventReceiver, workers: usize) {
        let shared = Arc::new(tokio::sync::Mutex::new(events));
        let mut pool = JoinSet::new();
        for id in 0..workers.max(1) {
            let this = self.clone();
            let shared = shared.clone();
            pool.spawn(async move {
                loop {
                    let next = shared.lock().await.recv().await;
                    let Some(event) = next else { break };
                    let (path, kind) = (event.path.clone(), event.kind);
                    if let Err(e) = this.process(event).await {
                        warn!("process {:?} {} failed: {:#}", kind, path.display(), e);
                    }
                }
                debug!(worker = id, "dispatch worker exiting");
            });
        }
        info!("dispatch pool started with {} workers", workers.max(1));
        while let Some(res) = pool.join_next().await {
            if let Err(e) = res {
                error!("dispatch worker panicked: {}", e);
            }
        }
        info!("dispatch pool drained");
    }
}

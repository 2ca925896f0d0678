//! Full-tree resync for a client that just came online.
//!
//! Every file under the client's monitored dir is checked with an `exists`
//! query; anything the client does not already hold is queued as a write.
//! Directories are (re)registered with the watch manager on the way.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checksum::digest_file_async;
use crate::codec::SyncMessage;
use crate::config::MonitoredDir;
use crate::dispatch::send_message;
use crate::fs_enum::enumerate_tree_async;
use crate::protocol::MsgType;
use crate::watch::{ChangeEvent, ChangeKind, WatchManager};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResyncReport {
    pub dirs_seen: usize,
    pub files_checked: usize,
    pub files_queued: usize,
    pub watches_added: usize,
}

pub struct ResyncWalker {
    dirs: Arc<Vec<MonitoredDir>>,
    watches: WatchManager,
}

impl ResyncWalker {
    pub fn new(dirs: Arc<Vec<MonitoredDir>>, watches: WatchManager) -> Self {
        Self { dirs, watches }
    }

    /// First monitored dir listing `ip`, with the matching whitelist entry
    pub fn assignment(&self, ip: &str) -> Option<(PathBuf, String)> {
        self.dirs.iter().find_map(|m| {
            m.entry_for_host(ip)
                .map(|entry| (m.dir.clone(), entry.to_string()))
        })
    }

    /// Walk the client's tree once
    pub async fn resync(&self, ip: &str) -> Result<ResyncReport> {
        let mut report = ResyncReport::default();
        let Some((root, addr)) = self.assignment(ip) else {
            debug!("client:{} has no monitored dir, nothing to resync", ip);
            return Ok(report);
        };
        info!("resync {} for client:{}", root.display(), addr);

        let entries = enumerate_tree_async(root.clone())
            .await
            .with_context(|| format!("enumerate {}", root.display()))?;
        for entry in entries {
            if entry.is_directory {
                report.dirs_seen += 1;
                if !self.watches.is_watching(&entry.path) {
                    match self.watches.watch(&entry.path) {
                        Ok(()) => report.watches_added += 1,
                        Err(e) => warn!("watch {} failed: {:#}", entry.path.display(), e),
                    }
                }
                continue;
            }

            let digest = match digest_file_async(entry.path.clone()).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("skip {}: {:#}", entry.path.display(), e);
                    continue;
                }
            };
            report.files_checked += 1;
            let query = SyncMessage::new(MsgType::FileExist)
                .with_file_name(entry.path.to_string_lossy().into_owned())
                .with_file_md5(digest.md5)
                .with_content_len(digest.len);

            let present = match send_message(&addr, &query).await {
                Ok(reply) => reply.is_ok(),
                Err(e) => {
                    debug!("exists query for {} failed: {:#}", entry.path.display(), e);
                    false
                }
            };
            if present {
                continue;
            }
            self.watches
                .events()
                .send(ChangeEvent::new(entry.path, ChangeKind::Write))
                .await?;
            report.files_queued += 1;
        }

        info!(
            "resync for client:{} done: {} files checked, {} queued, {} dirs ({} newly watched)",
            addr, report.files_checked, report.files_queued, report.dirs_seen, report.watches_added
        );
        Ok(report)
    }

    /// Consume resync requests, one walk task per request
    pub async fn run(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<String>) {
        while let Some(ip) = requests.recv().await {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.resync(&ip).await {
                    warn!("resync for {} failed: {:#}", ip, e);
                }
            });
        }
        debug!("resync channel closed");
    }
}

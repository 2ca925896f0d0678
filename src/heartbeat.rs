//! Heartbeats: the server-side listener that keeps the client registry
//! current, and the client-side sender that keeps a session alive.
//!
//! Sessions are strict request/reply on one long-lived connection. The
//! server only accepts heartbeat requests on this port.

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::codec::{dial, read_message_timed, write_message, SyncMessage};
use crate::config::MonitoredDir;
use crate::protocol::timeouts::FRAME_HEADER_MS;
use crate::protocol::{MsgType, HEART_BEAT_INTERVAL, MAX_RETRY_TIME};
use crate::registry::{unix_now, ClientRegistry};

/// Heartbeat cadence and failure budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub max_retries: u32,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self::new(HEART_BEAT_INTERVAL, MAX_RETRY_TIME)
    }
}

impl HeartbeatPolicy {
    pub fn new(interval_secs: u64, max_retries: u32) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            max_retries,
        }
    }

    /// Liveness window in seconds: retries × interval
    pub fn window_secs(&self) -> i64 {
        self.interval.as_secs() as i64 * i64::from(self.max_retries)
    }

    // A live client sends one request per interval
    fn read_timeout_ms(&self) -> u64 {
        (self.interval.as_millis() as u64).saturating_mul(2).max(FRAME_HEADER_MS)
    }
}

/// Server side of the heartbeat protocol
pub struct HeartbeatService {
    registry: Arc<ClientRegistry>,
    dirs: Arc<Vec<MonitoredDir>>,
    policy: HeartbeatPolicy,
    resync: mpsc::UnboundedSender<String>,
    next_session: AtomicU64,
}

impl HeartbeatService {
    /// `resync` receives the IP of every client that comes online
    pub fn new(
        registry: Arc<ClientRegistry>,
        dirs: Arc<Vec<MonitoredDir>>,
        policy: HeartbeatPolicy,
        resync: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            registry,
            dirs,
            policy,
            resync,
            next_session: AtomicU64::new(1),
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind heartbeat listener {}", addr))
    }

    /// Accept loop; one session task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("heartbeat listener on {}", addr);
        }
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    error!("heartbeat accept failed: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let this = self.clone();
            tokio::spawn(async move {
                this.session(stream, peer.ip().to_string()).await;
            });
        }
    }

    /// Run one client session until the failure budget is exhausted
    pub async fn session<S>(&self, mut stream: S, ip: String)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!("heartbeat session {} from {}", session, ip);
        let mut failures = 0u32;
        loop {
            if failures >= self.policy.max_retries {
                if self.registry.mark_session_lost(&ip, session) {
                    warn!("Lost client:{}", ip);
                } else {
                    debug!("session {} for {} ended, a newer session is live", session, ip);
                }
                return;
            }
            match self.exchange(&mut stream, &ip, session).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!(
                        "heartbeat from {} failed ({}/{}): {:#}",
                        ip, failures, self.policy.max_retries, e
                    );
                    tokio::time::sleep(self.policy.interval).await;
                }
            }
        }
    }

    async fn exchange<S>(&self, stream: &mut S, ip: &str, session: u64) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let msg = read_message_timed(stream, self.policy.read_timeout_ms()).await?;
        if msg.msg_type != MsgType::HeartbeatReq {
            bail!("only heartbeat messages are accepted here, got {}", msg.msg_type);
        }
        self.on_heartbeat(ip, session);
        write_message(stream, &SyncMessage::heartbeat_res()).await
    }

    fn on_heartbeat(&self, ip: &str, session: u64) {
        if !self.dirs.iter().any(|m| m.entry_for_host(ip).is_some()) {
            debug!("heartbeat from {} which is not in any white list", ip);
            return;
        }
        if self.registry.record_session_heartbeat(ip, unix_now(), session) {
            info!("client:{} online, scheduling full resync", ip);
            if self.resync.send(ip.to_string()).is_err() {
                warn!("resync channel closed, client {} not resynced", ip);
            }
        }
    }
}

/// Bind `addr` and run the heartbeat service on it. Bind failure is returned.
pub async fn serve_heartbeats(addr: &str, service: Arc<HeartbeatService>) -> Result<()> {
    let listener = HeartbeatService::bind(addr).await?;
    service.serve(listener).await
}

/// One request/reply heartbeat on an open connection
pub async fn heartbeat_once<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, &SyncMessage::heartbeat_req()).await?;
    let reply = read_message_timed(stream, FRAME_HEADER_MS).await?;
    if reply.msg_type != MsgType::HeartbeatRes {
        bail!("expected heartbeat response, got {}", reply.msg_type);
    }
    Ok(())
}

/// Client side: keep a heartbeat session with `server` forever,
/// redialing after any failure.
pub async fn keep_alive(server: String, policy: HeartbeatPolicy) {
    loop {
        let mut stream = match dial(&server).await {
            Ok(s) => s,
            Err(e) => {
                error!("Dial for heartbeat to server:{} failed,err:{:#}", server, e);
                tokio::time::sleep(policy.interval).await;
                continue;
            }
        };
        info!("heartbeat session with {} established", server);
        loop {
            if let Err(e) = heartbeat_once(&mut stream).await {
                warn!("HeartBeat with server:{} failed,err:{:#}", server, e);
                break;
            }
            tokio::time::sleep(policy.interval).await;
        }
        tokio::time::sleep(policy.interval).await;
    }
}

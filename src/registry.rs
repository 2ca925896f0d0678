//! Client registry: per-IP online flag and last heartbeat time
//!
//! The map is only reachable through the methods below; every operation
//! takes the lock once, so read-modify-write sequences are atomic.

use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub ip: String,
    pub online: bool,
    pub last_heartbeat: i64,
    /// Heartbeat session that delivered the latest heartbeat
    pub session: u64,
}

pub struct ClientRegistry {
    clients: Mutex<HashMap<String, ClientRecord>>,
    window_secs: i64,
}

/// Current time in unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl ClientRegistry {
    /// `window_secs` is the liveness window (retry count × heartbeat interval)
    pub fn new(window_secs: i64) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            window_secs,
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// Refresh a client's heartbeat. Returns true when this heartbeat
    /// brought the client online (first contact or after being lost).
    pub fn record_heartbeat(&self, ip: &str, now: i64) -> bool {
        self.record_session_heartbeat(ip, now, 0)
    }

    /// `record_heartbeat` on behalf of heartbeat session `session`
    pub fn record_session_heartbeat(&self, ip: &str, now: i64, session: u64) -> bool {
        let mut clients = self.clients.lock();
        let record = clients.entry(ip.to_string()).or_insert_with(|| ClientRecord {
            ip: ip.to_string(),
            online: false,
            last_heartbeat: now,
            session,
        });
        record.last_heartbeat = now;
        record.session = session;
        let came_online = !record.online;
        record.online = true;
        came_online
    }

    pub fn mark_offline(&self, ip: &str) {
        if let Some(record) = self.clients.lock().get_mut(ip) {
            record.online = false;
        }
    }

    /// Mark offline only if `session` delivered the latest heartbeat.
    /// A dying session must not take down a newer live one.
    pub fn mark_session_lost(&self, ip: &str, session: u64) -> bool {
        match self.clients.lock().get_mut(ip) {
            Some(record) if record.session == session => {
                record.online = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, ip: &str) -> bool {
        self.clients.lock().get(ip).map(|r| r.online).unwrap_or(false)
    }

    /// Dispatch gate: heartbeat seen within the liveness window.
    /// Independent of the online flag.
    pub fn is_reachable(&self, ip: &str, now: i64) -> bool {
        match self.clients.lock().get(ip) {
            Some(record) => now - record.last_heartbeat <= self.window_secs,
            None => false,
        }
    }

    pub fn get(&self, ip: &str) -> Option<ClientRecord> {
        self.clients.lock().get(ip).cloned()
    }

    pub fn snapshot(&self) -> Vec<ClientRecord> {
        let mut all: Vec<ClientRecord> = self.clients.lock().values().cloned().collect();
        all.sort_by(|a, b| a.ip.cmp(&b.ip));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_heartbeat_brings_client_online() {
        let reg = ClientRegistry::new(300);
        assert!(!reg.is_online("10.0.0.5"));
        assert!(reg.record_heartbeat("10.0.0.5", 1_000));
        assert!(reg.is_online("10.0.0.5"));
        // Refresh is not a transition
        assert!(!reg.record_heartbeat("10.0.0.5", 1_010));
        assert_eq!(reg.get("10.0.0.5").unwrap().last_heartbeat, 1_010);
    }

    #[test]
    fn test_lost_client_comes_back_online() {
        let reg = ClientRegistry::new(300);
        reg.record_heartbeat("10.0.0.5", 1_000);
        reg.mark_offline("10.0.0.5");
        assert!(!reg.is_online("10.0.0.5"));
        assert!(reg.record_heartbeat("10.0.0.5", 1_500));
    }

    #[test]
    fn test_stale_session_cannot_mark_offline() {
        let reg = ClientRegistry::new(300);
        assert!(reg.record_session_heartbeat("10.0.0.5", 1_000, 1));
        assert!(!reg.record_session_heartbeat("10.0.0.5", 1_000, 2));
        assert!(!reg.mark_session_lost("10.0.0.5", 1));
        assert!(reg.is_online("10.0.0.5"));
        assert!(reg.mark_session_lost("10.0.0.5", 2));
        assert!(!reg.is_online("10.0.0.5"));
        assert!(!reg.mark_session_lost("10.0.0.9", 2));
    }

    #[test]
    fn test_liveness_window() {
        let reg = ClientRegistry::new(30 * 10);
        reg.record_heartbeat("1.1.1.1", 1_000);
        assert!(reg.is_reachable("1.1.1.1", 1_000));
        assert!(reg.is_reachable("1.1.1.1", 1_300));
        assert!(!reg.is_reachable("1.1.1.1", 1_301));
        assert!(!reg.is_reachable("2.2.2.2", 1_000));
    }

    #[test]
    fn test_regular_heartbeats_stay_reachable() {
        let reg = ClientRegistry::new(300);
        let mut now = 0;
        for _ in 0..100 {
            reg.record_heartbeat("1.1.1.1", now);
            now += 10;
            assert!(reg.is_reachable("1.1.1.1", now));
        }
    }

    #[test]
    fn test_reachability_ignores_online_flag() {
        let reg = ClientRegistry::new(300);
        reg.record_heartbeat("1.1.1.1", 1_000);
        reg.mark_offline("1.1.1.1");
        assert!(reg.is_reachable("1.1.1.1", 1_100));
    }

    #[test]
    fn test_concurrent_first_heartbeats_transition_once() {
        let reg = Arc::new(ClientRegistry::new(300));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.record_heartbeat("1.1.1.1", 1_000 + i))
            })
            .collect();
        let transitions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|came_online| *came_online)
            .count();
        assert_eq!(transitions, 1);
        assert_eq!(reg.snapshot().len(), 1);
    }
}

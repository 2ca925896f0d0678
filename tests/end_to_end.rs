use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use filesync::agent::{self, CommandHandler};
use filesync::config::{MonitoredDir, ServerConfig, SyncDir};
use filesync::heartbeat::{keep_alive, HeartbeatPolicy};
use filesync::server::start_server;

fn free_port() -> Result<u16> {
    let sock = std::net::TcpListener::bind("127.0.0.1:0")?;
    let p = sock.local_addr()?.port();
    drop(sock);
    Ok(p)
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) -> Result<()> {
    for _ in 0..200u32 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("timed out waiting for {}", what)
}

fn read(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

struct Setup {
    _srv: tempfile::TempDir,
    _cli: tempfile::TempDir,
    server_root: PathBuf,
    client_root: PathBuf,
}

fn setup() -> Result<Setup> {
    let srv = tempfile::tempdir()?;
    let cli = tempfile::tempdir()?;
    let server_root = std::fs::canonicalize(srv.path())?;
    let client_root = std::fs::canonicalize(cli.path())?;
    Ok(Setup {
        _srv: srv,
        _cli: cli,
        server_root,
        client_root,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn changes_reach_live_client() -> Result<()> {
    let s = setup()?;
    // Present before the client connects; arrives through the resync walk
    std::fs::write(s.server_root.join("old.txt"), b"from before")?;

    let handler = Arc::new(CommandHandler::new(vec![SyncDir {
        server_dir: s.server_root.to_string_lossy().into_owned(),
        local_dir: s.client_root.to_string_lossy().into_owned(),
        server_addr: "127.0.0.1".into(),
    }]));
    let listener = agent::bind("127.0.0.1:0").await?;
    let agent_addr = listener.local_addr()?.to_string();
    let agent_task = tokio::spawn(agent::serve(handler, listener));

    let hb_port = free_port()?;
    let config = ServerConfig {
        listen: None,
        debug: true,
        log_file: None,
        log_file_num: 1,
        heartbeat_bind: format!("127.0.0.1:{}", hb_port),
        heartbeat_interval_secs: 1,
        max_retry_time: 30,
        workers: 4,
        moni_dir: vec![MonitoredDir {
            dir: s.server_root.clone(),
            white_list: vec![agent_addr],
        }],
    };
    let server = start_server(&config).await?;

    let policy = HeartbeatPolicy {
        interval: Duration::from_millis(200),
        max_retries: 3,
    };
    let hb_task = tokio::spawn(keep_alive(format!("127.0.0.1:{}", hb_port), policy));

    let registry = server.registry.clone();
    wait_for("client online", || registry.is_online("127.0.0.1")).await?;

    let old = s.client_root.join("old.txt");
    wait_for("resync of old.txt", || {
        read(&old).as_deref() == Some(&b"from before"[..])
    })
    .await?;

    std::fs::write(s.server_root.join("readme.txt"), b"hi")?;
    let readme = s.client_root.join("readme.txt");
    wait_for("readme.txt", || read(&readme).as_deref() == Some(&b"hi"[..])).await?;

    std::fs::create_dir(s.server_root.join("sub"))?;
    let sub = s.client_root.join("sub");
    wait_for("sub/", || sub.is_dir()).await?;
    let watches = server.watches.clone();
    let server_sub = s.server_root.join("sub");
    wait_for("watch on sub/", || watches.is_watching(&server_sub)).await?;

    std::fs::write(server_sub.join("nested.txt"), b"deeper")?;
    let nested = sub.join("nested.txt");
    wait_for("sub/nested.txt", || {
        read(&nested).as_deref() == Some(&b"deeper"[..])
    })
    .await?;

    std::fs::remove_file(s.server_root.join("readme.txt"))?;
    wait_for("readme.txt removal", || !readme.exists()).await?;

    hb_task.abort();
    agent_task.abort();
    server.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_receives_nothing() -> Result<()> {
    let s = setup()?;

    let handler = Arc::new(CommandHandler::new(vec![SyncDir {
        server_dir: s.server_root.to_string_lossy().into_owned(),
        local_dir: s.client_root.to_string_lossy().into_owned(),
        server_addr: "127.0.0.1".into(),
    }]));
    let listener = agent::bind("127.0.0.1:0").await?;
    let agent_addr = listener.local_addr()?.to_string();
    let agent_task = tokio::spawn(agent::serve(handler, listener));

    let config = ServerConfig {
        listen: None,
        debug: false,
        log_file: None,
        log_file_num: 1,
        heartbeat_bind: format!("127.0.0.1:{}", free_port()?),
        heartbeat_interval_secs: 1,
        max_retry_time: 3,
        workers: 2,
        moni_dir: vec![MonitoredDir {
            dir: s.server_root.clone(),
            white_list: vec![agent_addr],
        }],
    };
    let server = start_server(&config).await?;

    // No heartbeats: the client is never reachable
    std::fs::write(s.server_root.join("quiet.txt"), b"shh")?;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!s.client_root.join("quiet.txt").exists());
    assert!(server.registry.get("127.0.0.1").is_none());

    agent_task.abort();
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn heartbeat_bind_failure_is_fatal() -> Result<()> {
    let s = setup()?;
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let config = ServerConfig {
        listen: None,
        debug: false,
        log_file: None,
        log_file_num: 1,
        heartbeat_bind: taken.local_addr()?.to_string(),
        heartbeat_interval_secs: 1,
        max_retry_time: 3,
        workers: 1,
        moni_dir: vec![MonitoredDir {
            dir: s.server_root.clone(),
            white_list: vec!["127.0.0.1:1".into()],
        }],
    };
    assert!(start_server(&config).await.is_err());
    Ok(())
}

//! Checksum and hashing utilities

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Length + MD5 pair used to decide whether two copies of a file match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub len: u32,
    pub md5: String,
}

impl FileDigest {
    pub fn matches(&self, len: u32, md5: &str) -> bool {
        self.len == len && self.md5.eq_ignore_ascii_case(md5)
    }
}

/// Lowercase hex MD5 of a buffer
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn digest_bytes(data: &[u8]) -> Result<FileDigest> {
    let len = u32::try_from(data.len())
        .with_context(|| format!("{} bytes exceeds protocol length field", data.len()))?;
    Ok(FileDigest {
        len,
        md5: md5_hex(data),
    })
}

/// Stream a file through MD5 (64KB chunks)
pub fn digest_file(path: &Path) -> Result<FileDigest> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buffer[..n]);
        total += n as u64;
    }
    let len = u32::try_from(total)
        .with_context(|| format!("{} is {} bytes, exceeds protocol length field", path.display(), total))?;
    Ok(FileDigest {
        len,
        md5: format!("{:x}", ctx.compute()),
    })
}

/// `digest_file` on the blocking pool
pub async fn digest_file_async(path: PathBuf) -> Result<FileDigest> {
    tokio::task::spawn_blocking(move || digest_file(&path))
        .await
        .context("digest task panicked")?
}

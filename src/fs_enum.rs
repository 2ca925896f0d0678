use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;
// Filesystem enumeration for full resync

/// Entry with size information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub is_directory: bool,
}

/// Enumerate everything below `root` (the root itself excluded), parents
/// before children. Symlinks are not followed; unreadable entries are
/// logged and skipped.
pub fn enumerate_tree(root: &Path) -> Result<Vec<FileEntry>> {
    use walkdir::WalkDir;

    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skip unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push(FileEntry {
                path: entry.path().to_path_buf(),
                size: 0,
                is_directory: true,
            });
        } else if file_type.is_file() {
            if let Ok(metadata) = entry.metadata() {
                entries.push(FileEntry {
                    path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    is_directory: false,
                });
            } // else: skip unreadable entries
        }
    }

    Ok(entries)
}

/// `enumerate_tree` on the blocking pool
pub async fn enumerate_tree_async(root: PathBuf) -> Result<Vec<FileEntry>> {
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }
    tokio::task::spawn_blocking(move || enumerate_tree(&root))
        .await
        .context("enumeration task panicked")?
}

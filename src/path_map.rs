//! Server path → client path translation
//!
//! Server and client may use different path styles. A directory containing
//! a backslash is treated as a Windows path, anything else as POSIX.

use std::path::PathBuf;

use crate::config::SyncDir;

fn separator(dir: &str) -> char {
    if dir.contains('\\') {
        '\\'
    } else {
        '/'
    }
}

/// Portion of `file` below `dir`, or None when `file` is not inside `dir`
fn relative_part<'a>(file: &'a str, dir: &str, sep: char) -> Option<&'a str> {
    let trimmed = dir.trim_end_matches(sep);
    let rest = file.strip_prefix(trimmed)?;
    if rest.is_empty() {
        return Some("");
    }
    // Component boundary: /srv/docs must not claim /srv/docs2
    rest.strip_prefix(sep).map(|r| r.trim_start_matches(sep))
}

/// Map a server-side file name onto the first matching sync dir.
/// Parent-directory components are refused.
pub fn to_local(server_file: &str, dirs: &[SyncDir]) -> Option<PathBuf> {
    for d in dirs {
        let server_sep = separator(&d.server_dir);
        let Some(rel) = relative_part(server_file, &d.server_dir, server_sep) else {
            continue;
        };
        let parts: Vec<&str> = rel.split(server_sep).filter(|p| !p.is_empty()).collect();
        if parts.iter().any(|p| *p == "..") {
            return None;
        }
        let local_sep = separator(&d.local_dir);
        let mut out = d.local_dir.trim_end_matches(local_sep).to_string();
        if out.is_empty() {
            out.push(local_sep);
        }
        for part in parts {
            if !out.ends_with(local_sep) {
                out.push(local_sep);
            }
            out.push_str(part);
        }
        return Some(PathBuf::from(out));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(server: &str, local: &str) -> SyncDir {
        SyncDir {
            server_dir: server.to_string(),
            local_dir: local.to_string(),
            server_addr: "10.0.0.1:6000".to_string(),
        }
    }

    fn dirs() -> Vec<SyncDir> {
        vec![
            pair("E:\\Tools\\", "/mnt/tools"),
            pair("E:\\Work\\src\\", "E:\\Backup\\src"),
            pair("/home/dev/src/", "D:\\mirror"),
            pair("/home/ops/src", "/var/mirror/"),
        ]
    }

    fn map(file: &str) -> Option<String> {
        to_local(file, &dirs()).map(|p| p.to_string_lossy().into_owned())
    }

    #[test]
    fn test_windows_server_posix_client() {
        assert_eq!(
            map("E:\\Tools\\goenv\\errcheck.zip").as_deref(),
            Some("/mnt/tools/goenv/errcheck.zip")
        );
    }

    #[test]
    fn test_windows_server_windows_client() {
        assert_eq!(
            map("E:\\Work\\src\\go\\a.go").as_deref(),
            Some("E:\\Backup\\src\\go\\a.go")
        );
    }

    #[test]
    fn test_posix_server_windows_client() {
        assert_eq!(
            map("/home/dev/src/mygo/my.go").as_deref(),
            Some("D:\\mirror\\mygo\\my.go")
        );
    }

    #[test]
    fn test_posix_server_posix_client() {
        assert_eq!(
            map("/home/ops/src/mygo/my.go").as_deref(),
            Some("/var/mirror/mygo/my.go")
        );
        assert_eq!(map("/home/ops/src").as_deref(), Some("/var/mirror"));
    }

    #[test]
    fn test_unmatched_and_sibling_prefix() {
        assert!(map("/etc/passwd").is_none());
        assert!(map("/home/ops/src2/x").is_none());
    }

    #[test]
    fn test_parent_components_refused() {
        assert!(map("/home/ops/src/../../etc/passwd").is_none());
        assert!(map("E:\\Tools\\..\\secret").is_none());
    }
}

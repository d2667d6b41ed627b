//! Local route list
//!
//! A plain text file of extra destinations to send through the tunnel,
//! one per line:
//!
//! ```text
//! # office networks
//! 10.20.0.0/16
//! 192.168.7.4
//! intranet.example.com
//! *.build.example.com
//! ```
//!
//! Blank lines and `#` comments are skipped, and only the first token of
//! a line counts. Anything that starts with a digit or contains `/` or
//! `:` is treated as an address; everything else is a domain.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Parsed route list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteEntries {
    pub ips: Vec<String>,
    pub domains: Vec<String>,
}

impl RouteEntries {
    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.domains.is_empty()
    }
}

/// Whether an entry is an address/prefix rather than a domain
pub fn looks_like_ip(entry: &str) -> bool {
    entry.contains('/')
        || entry.contains(':')
        || entry.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Parse route list text
pub fn parse(text: &str) -> RouteEntries {
    let mut entries = RouteEntries::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some(token) = line.split_whitespace().next() else {
            continue;
        };

        if looks_like_ip(token) {
            entries.ips.push(token.to_string());
        } else {
            entries.domains.push(token.to_string());
        }
    }

    entries
}

/// The route list file
#[derive(Debug, Clone)]
pub struct RouteList {
    path: PathBuf,
}

impl RouteList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse; a missing file is an empty list.
    pub async fn read(&self) -> Result<RouteEntries, RouteListError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(parse(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RouteEntries::default()),
            Err(e) => Err(RouteListError::io(&self.path, e)),
        }
    }

    /// Append an entry unless an identical line already exists.
    pub async fn append(&self, entry: &str) -> Result<bool, RouteListError> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(RouteListError::EmptyEntry);
        }

        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(RouteListError::io(&self.path, e)),
        };

        if existing.lines().any(|line| line.trim() == entry) {
            debug!("Route entry {} already present", entry);
            return Ok(false);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RouteListError::io(&self.path, e))?;

        let mut line = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(entry);
        line.push('\n');

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RouteListError::io(&self.path, e))?;
        file.flush().await.map_err(|e| RouteListError::io(&self.path, e))?;
        Ok(true)
    }

    /// Remove every line equal to the entry.
    pub async fn delete(&self, entry: &str) -> Result<bool, RouteListError> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(RouteListError::EmptyEntry);
        }

        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(RouteListError::io(&self.path, e)),
        };

        let kept: Vec<&str> = existing.lines().filter(|line| line.trim() != entry).collect();
        if kept.len() == existing.lines().count() {
            return Ok(false);
        }

        let mut text = kept.join("\n");
        text.push('\n');
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| RouteListError::io(&self.path, e))?;
        Ok(true)
    }

    /// Fail early when the file cannot be written.
    pub async fn check_writable(&self) -> Result<(), RouteListError> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map(|_| ())
            .map_err(|e| RouteListError::io(&self.path, e))
    }
}

/// Route list errors
#[derive(Debug, thiserror::Error)]
pub enum RouteListError {
    #[error("route entry is empty")]
    EmptyEntry,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RouteListError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        RouteListError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_list(name: &str) -> RouteList {
        let path = std::env::temp_dir().join(format!("veil-routes-{}-{}.txt", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        RouteList::new(path)
    }

    #[test]
    fn test_parse_mixed_entries() {
        let entries = parse("# c\n10.0.0.0/8\nexample.com\n  \n192.168.1.1 trailing\n*.foo.org\n");
        assert_eq!(entries.ips, vec!["10.0.0.0/8", "192.168.1.1"]);
        assert_eq!(entries.domains, vec!["example.com", "*.foo.org"]);
    }

    #[test]
    fn test_looks_like_ip() {
        assert!(looks_like_ip("2001:db8::/32"));
        assert!(looks_like_ip("8.8.8.8"));
        assert!(looks_like_ip("fd00::1"));
        assert!(!looks_like_ip("example.com"));
        assert!(!looks_like_ip("*.example.com"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let list = temp_list("missing");
        assert!(list.read().await.unwrap().is_empty());
        assert!(!list.delete("10.0.0.0/8").await.unwrap());
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let list = temp_list("append");
        std::fs::write(list.path(), "# header\n10.1.0.0/16").unwrap();

        assert!(list.append("  example.com ").await.unwrap());
        assert!(!list.append("example.com").await.unwrap());

        let text = std::fs::read_to_string(list.path()).unwrap();
        assert_eq!(text, "# header\n10.1.0.0/16\nexample.com\n");

        let entries = list.read().await.unwrap();
        assert_eq!(entries.ips, vec!["10.1.0.0/16"]);
        assert_eq!(entries.domains, vec!["example.com"]);
        let _ = std::fs::remove_file(list.path());
    }

    #[tokio::test]
    async fn test_delete_exact_lines() {
        let list = temp_list("delete");
        std::fs::write(list.path(), "10.1.0.0/16\nexample.com\n10.1.0.0/160\n").unwrap();

        assert!(list.delete("10.1.0.0/16").await.unwrap());
        let text = std::fs::read_to_string(list.path()).unwrap();
        assert_eq!(text, "example.com\n10.1.0.0/160\n");

        assert!(matches!(list.delete("  ").await, Err(RouteListError::EmptyEntry)));
        let _ = std::fs::remove_file(list.path());
    }
}

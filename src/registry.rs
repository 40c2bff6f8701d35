use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Durable per-app ledger of containers started by this tool.
///
/// Lives in the platform temp directory so a later `stop` can clean up after
/// a crashed session. Append-only while a session runs, deleted wholesale on
/// clean shutdown. No locking: the tool is single-operator and concurrent
/// sessions for the same app are out of contract.
#[derive(Debug, Clone)]
pub struct ContainerRegistry {
    path: PathBuf,
}

impl ContainerRegistry {
    pub fn for_app(app: &str) -> Self {
        Self {
            path: std::env::temp_dir().join(format!(".apikit_{app}_containers")),
        }
    }

    #[cfg(test)]
    fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a started container. Must succeed before the container is
    /// relied upon for cleanup.
    pub fn record(&self, container_name: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        write!(file, ",{container_name}")
    }

    /// Names recorded so far, in record order. A missing file is the normal
    /// "nothing running" state, not an error.
    pub fn running(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents
                .split(',')
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Delete the ledger. Idempotent.
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

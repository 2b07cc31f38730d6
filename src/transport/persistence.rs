//! Per-client persistence directories
//!
//! Every pooled client owns a directory under the persistence root, named
//! after its identity and server URI. The directory exists while the client
//! is connected and is removed when the client is closed.

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory name used under the working directory when no root is configured
pub const PERSISTENCE_LOCATION: &str = ".interlok-mqtt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePersistence {
    root: PathBuf,
    directory: PathBuf,
}

impl FilePersistence {
    /// `<cwd>/.interlok-mqtt`
    pub fn default_root() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(PERSISTENCE_LOCATION)
    }

    pub fn new(root: impl Into<PathBuf>, client_id: &str, server_uri: &str) -> Self {
        let root = root.into();
        let directory = root.join(format!("{}-{}", sanitize(client_id), sanitize(server_uri)));
        Self { root, directory }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn open(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        debug!("Opened persistence directory {}", self.directory.display());
        Ok(())
    }

    /// Remove the client's directory, and the root once it is empty
    pub fn close(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.directory) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        // other clients may still hold directories here
        let _ = std::fs::remove_dir(&self.root);
        Ok(())
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_name_is_sanitized() {
        let persistence = FilePersistence::new("/tmp/root", "owner-abc", "tcp://localhost:1883");
        assert_eq!(
            persistence.directory(),
            Path::new("/tmp/root/owner-abc-tcplocalhost1883")
        );
    }

    #[test]
    fn test_open_and_close() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join(PERSISTENCE_LOCATION);
        let persistence = FilePersistence::new(&root, "client-1", "tcp://localhost:1883");

        persistence.open().unwrap();
        assert!(persistence.directory().is_dir());

        persistence.close().unwrap();
        assert!(!persistence.directory().exists());
        assert!(!root.exists());
    }

    #[test]
    fn test_close_keeps_shared_root() {
        let temp = TempDir::new().unwrap();
        let first = FilePersistence::new(temp.path(), "client-1", "tcp://a:1883");
        let second = FilePersistence::new(temp.path(), "client-2", "tcp://a:1883");

        first.open().unwrap();
        second.open().unwrap();
        first.close().unwrap();

        assert!(second.directory().is_dir());
    }

    #[test]
    fn test_close_without_open() {
        let temp = TempDir::new().unwrap();
        let persistence = FilePersistence::new(temp.path().join("never"), "c", "tcp://a:1");
        assert!(persistence.close().is_ok());
    }
}

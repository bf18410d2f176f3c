//! Persisted alert receiver address.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("receiver address must not be empty")]
    Empty,
    #[error("receiver store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the current receiver address comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSource {
    Stored,
    Environment,
    Unset,
}

/// Single durable string, stored in a plain text file.
///
/// The file is re-read on every `get`, so the value seen at dispatch time
/// is always the latest one written.
pub struct ReceiverConfigStore {
    path: PathBuf,
    env_default: Option<String>,
    write_lock: Mutex<()>,
}

impl ReceiverConfigStore {
    pub fn open(path: impl Into<PathBuf>, env_default: Option<String>) -> Self {
        let store = Self {
            path: path.into(),
            env_default: env_default.filter(|v| !v.trim().is_empty()),
            write_lock: Mutex::new(()),
        };
        tracing::info!(
            path = %store.path.display(),
            source = ?store.source(),
            "receiver store opened"
        );
        store
    }

    /// Current receiver: the stored value, else the environment default.
    pub fn get(&self) -> Option<String> {
        self.read_stored().or_else(|| self.env_default.clone())
    }

    pub fn source(&self) -> ReceiverSource {
        if self.read_stored().is_some() {
            ReceiverSource::Stored
        } else if self.env_default.is_some() {
            ReceiverSource::Environment
        } else {
            ReceiverSource::Unset
        }
    }

    /// Persist `address`, replacing any previous value atomically.
    pub fn set(&self, address: &str) -> Result<(), StoreError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(StoreError::Empty);
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, address).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        tracing::info!(path = %self.path.display(), "receiver address updated");
        Ok(())
    }

    fn read_stored(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read receiver store");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_without_file_or_env() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiverConfigStore::open(dir.path().join("receiver.txt"), None);
        assert_eq!(store.get(), None);
        assert_eq!(store.source(), ReceiverSource::Unset);
    }

    #[test]
    fn test_env_default_when_nothing_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiverConfigStore::open(
            dir.path().join("receiver.txt"),
            Some("env@example.com".into()),
        );
        assert_eq!(store.get().as_deref(), Some("env@example.com"));
        assert_eq!(store.source(), ReceiverSource::Environment);
    }

    #[test]
    fn test_set_overrides_env_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/receiver.txt");
        let store = ReceiverConfigStore::open(&path, Some("env@example.com".into()));
        store.set("  boss@example.com \n").unwrap();
        assert_eq!(store.get().as_deref(), Some("boss@example.com"));
        assert_eq!(store.source(), ReceiverSource::Stored);

        let reopened = ReceiverConfigStore::open(&path, None);
        assert_eq!(reopened.get().as_deref(), Some("boss@example.com"));
        assert!(!dir.path().join("nested/receiver.txt.tmp").exists());
    }

    #[test]
    fn test_set_empty_rejected_and_value_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceiverConfigStore::open(dir.path().join("receiver.txt"), None);
        store.set("a@example.com").unwrap();
        assert!(matches!(store.set("   "), Err(StoreError::Empty)));
        assert_eq!(store.get().as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_blank_file_falls_back_to_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receiver.txt");
        std::fs::write(&path, "\n").unwrap();
        let store = ReceiverConfigStore::open(&path, Some("env@example.com".into()));
        assert_eq!(store.get().as_deref(), Some("env@example.com"));
    }
}

//! The single persisted session slot.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Error;
use crate::types::SessionRecord;

/// Default file name of the session slot under the user's config directory.
pub const SESSION_FILE_NAME: &str = "session.json";

/// One persisted slot holding the current [`SessionRecord`].
///
/// Only the session controller writes to the store; implementations need no
/// coordination beyond last-write-wins.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStore for KeyringStore {
///     fn read(&self) -> Result<Option<SessionRecord>, Error> {
///         match self.entry.get_password() {
///             Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
///             Err(keyring::Error::NoEntry) => Ok(None),
///             Err(e) => Err(Error::Store(e.to_string())),
///         }
///     }
///     // write / clear ...
/// }
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Load the stored record, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the slot exists but cannot be read or parsed.
    fn read(&self) -> Result<Option<SessionRecord>, Error>;

    /// Replace the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the slot cannot be written.
    fn write(&self, record: &SessionRecord) -> Result<(), Error>;

    /// Remove the stored record. Clearing an empty slot succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the slot exists but cannot be removed.
    fn clear(&self) -> Result<(), Error>;
}

/// Session slot backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config_dir>/fieldtrack/session.json`, falling back to the working directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldtrack")
            .join(SESSION_FILE_NAME)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileSessionStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl SessionStore for FileSessionStore {
    fn read(&self) -> Result<Option<SessionRecord>, Error> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map(Some).map_err(|e| {
            Error::Store(format!("corrupt session file {}: {e}", self.path.display()))
        })
    }

    fn write(&self, record: &SessionRecord) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a half-written slot.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(record)?)?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Session file removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

/// Process-local session slot.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<SessionRecord>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `record`, as if persisted by an earlier run.
    #[must_use]
    pub fn with_record(record: SessionRecord) -> Self {
        Self {
            slot: Mutex::new(Some(record)),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<SessionRecord>>, Error> {
        self.slot
            .lock()
            .map_err(|_| Error::Store("session slot lock poisoned".into()))
    }
}

impl SessionStore for MemorySessionStore {
    fn read(&self) -> Result<Option<SessionRecord>, Error> {
        Ok(self.slot()?.clone())
    }

    fn write(&self, record: &SessionRecord) -> Result<(), Error> {
        *self.slot()? = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        *self.slot()? = None;
        Ok(())
    }
}

impl<T: SessionStore> SessionStore for std::sync::Arc<T> {
    fn read(&self) -> Result<Option<SessionRecord>, Error> {
        (**self).read()
    }

    fn write(&self, record: &SessionRecord) -> Result<(), Error> {
        (**self).write(record)
    }

    fn clear(&self) -> Result<(), Error> {
        (**self).clear()
    }
}

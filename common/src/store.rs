use std::{
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use log::{info, warn};
use thiserror::Error;

use crate::{
    credentials::{NetworkCredentials, CREDENTIALS_RECORD_LEN},
    types::RelayState,
};

const CREDENTIALS_FILE: &str = "credentials";
const RELAY_STATE_FILE: &str = "relay-state";
const RELAY_RECORD_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage access failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt record {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: &'static str },
}

/// Persistence used by the relay controller.
pub trait RelayStore {
    fn load_relay_state(&self) -> RelayState;
    fn save_relay_state(&self, state: RelayState) -> Result<(), StoreError>;
}

/// Flat-file store for the two device records. `root` must already exist
/// (`/spiffs` on the device).
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn try_load_credentials(&self) -> Result<Option<NetworkCredentials>, StoreError> {
        let Some(record) = self.read_record(CREDENTIALS_FILE, CREDENTIALS_RECORD_LEN)? else {
            return Ok(None);
        };
        NetworkCredentials::decode(&record)
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt {
                path: self.root.join(CREDENTIALS_FILE),
                reason: "credentials record is truncated",
            })
    }

    /// Stored credentials, or the compiled-in defaults when none are usable.
    pub fn load_credentials(&self) -> NetworkCredentials {
        match self.try_load_credentials() {
            Ok(Some(creds)) => creds,
            Ok(None) => NetworkCredentials::default(),
            Err(err) => {
                warn!("failed to load credentials, using defaults: {err}");
                NetworkCredentials::default()
            }
        }
    }

    pub fn save_credentials(&self, creds: &NetworkCredentials) -> Result<(), StoreError> {
        self.write_record(CREDENTIALS_FILE, &creds.encode())
    }

    pub fn try_load_relay_state(&self) -> Result<Option<RelayState>, StoreError> {
        let Some(record) = self.read_record(RELAY_STATE_FILE, RELAY_RECORD_LEN)? else {
            return Ok(None);
        };
        if record.len() < RELAY_RECORD_LEN {
            return Err(StoreError::Corrupt {
                path: self.root.join(RELAY_STATE_FILE),
                reason: "relay record is truncated",
            });
        }
        Ok(Some(RelayState {
            fence: record[0] == b'1',
            siren: record[1] == b'1',
        }))
    }

    /// Removes every stored record. Missing files are not an error.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        for name in [CREDENTIALS_FILE, RELAY_STATE_FILE] {
            remove_if_present(&self.root.join(name))?;
            remove_if_present(&self.temp_path(name))?;
        }
        info!("cleared stored settings under {}", self.root.display());
        Ok(())
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.tmp"))
    }

    fn write_record(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.root.join(name);
        let tmp = self.temp_path(name);

        {
            let mut file = File::create(&tmp).map_err(io_at(&tmp))?;
            file.write_all(bytes).map_err(io_at(&tmp))?;
            file.sync_all().map_err(io_at(&tmp))?;
        }
        remove_if_present(&path)?;
        fs::rename(&tmp, &path).map_err(io_at(&path))
    }

    fn read_record(&self, name: &str, full_len: usize) -> Result<Option<Vec<u8>>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.root.join(name);
        match fs::read(&path) {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_at(&path)(err)),
        }

        // A complete temporary without its target means power was lost
        // between removing the old record and renaming the new one.
        let tmp = self.temp_path(name);
        match fs::read(&tmp) {
            Ok(bytes) if bytes.len() >= full_len => {
                warn!("recovering {} from an interrupted save", path.display());
                if let Err(err) = fs::rename(&tmp, &path) {
                    warn!("failed to move recovered record into place: {err}");
                }
                Ok(Some(bytes))
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_at(&tmp)(err)),
        }
    }
}

impl RelayStore for FileStore {
    fn load_relay_state(&self) -> RelayState {
        match self.try_load_relay_state() {
            Ok(Some(state)) => state,
            Ok(None) => RelayState::default(),
            Err(err) => {
                warn!("failed to load relay state, using defaults: {err}");
                RelayState::default()
            }
        }
    }

    fn save_relay_state(&self, state: RelayState) -> Result<(), StoreError> {
        let record = [flag_byte(state.fence), flag_byte(state.siren)];
        self.write_record(RELAY_STATE_FILE, &record)
    }
}

fn flag_byte(on: bool) -> u8 {
    if on {
        b'1'
    } else {
        b'0'
    }
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_at(path)(err)),
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::WifiMode;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn empty_store_yields_defaults() {
        let (_dir, store) = store();
        assert_eq!(store.load_relay_state(), RelayState::default());
        assert_eq!(store.load_credentials(), NetworkCredentials::default());
    }

    #[test]
    fn relay_state_survives_reload() {
        let (dir, store) = store();
        let state = RelayState {
            fence: true,
            siren: false,
        };
        store.save_relay_state(state).expect("save");

        assert_eq!(fs::read(dir.path().join(RELAY_STATE_FILE)).unwrap(), b"10");
        assert_eq!(FileStore::new(dir.path()).load_relay_state(), state);
    }

    #[test]
    fn credentials_survive_reload() {
        let (dir, store) = store();
        let (creds, _) = NetworkCredentials::new("Net", "Pass1234", WifiMode::Client);
        store.save_credentials(&creds).expect("save");

        let raw = fs::read(dir.path().join(CREDENTIALS_FILE)).unwrap();
        assert_eq!(raw.len(), CREDENTIALS_RECORD_LEN);
        assert_eq!(FileStore::new(dir.path()).load_credentials(), creds);
    }

    #[test]
    fn save_leaves_no_temporary_behind() {
        let (dir, store) = store();
        store.save_relay_state(RelayState::default()).expect("save");
        assert!(!dir.path().join("relay-state.tmp").exists());
    }

    #[test]
    fn clear_all_restores_defaults_and_is_idempotent() {
        let (_dir, store) = store();
        let (creds, _) = NetworkCredentials::new("Net", "Pass1234", WifiMode::Client);
        store.save_credentials(&creds).expect("save creds");
        store
            .save_relay_state(RelayState {
                fence: true,
                siren: true,
            })
            .expect("save relays");

        store.clear_all().expect("clear");
        store.clear_all().expect("second clear");

        assert_eq!(store.load_credentials(), NetworkCredentials::default());
        assert_eq!(store.load_relay_state(), RelayState::default());
    }

    #[test]
    fn truncated_relay_record_falls_back_to_defaults() {
        let (dir, store) = store();
        fs::write(dir.path().join(RELAY_STATE_FILE), b"1").unwrap();

        assert!(matches!(
            store.try_load_relay_state(),
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(store.load_relay_state(), RelayState::default());
    }

    #[test]
    fn truncated_credentials_fall_back_to_defaults() {
        let (dir, store) = store();
        fs::write(dir.path().join(CREDENTIALS_FILE), b"Net\0").unwrap();
        assert_eq!(store.load_credentials(), NetworkCredentials::default());
    }

    #[test]
    fn complete_temporary_is_recovered_when_target_is_missing() {
        let (dir, store) = store();
        fs::write(dir.path().join("relay-state.tmp"), b"11").unwrap();

        assert_eq!(
            store.load_relay_state(),
            RelayState {
                fence: true,
                siren: true
            }
        );
        assert!(dir.path().join(RELAY_STATE_FILE).exists());
    }

    #[test]
    fn partial_temporary_is_ignored() {
        let (dir, store) = store();
        fs::write(dir.path().join("credentials.tmp"), b"Half").unwrap();
        assert_eq!(store.try_load_credentials().expect("load"), None);
    }

    #[test]
    fn missing_root_reports_io_error_on_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("absent"));
        let err = store
            .save_relay_state(RelayState::default())
            .expect_err("save must fail");
        assert!(matches!(err, StoreError::Io { .. }));
    }
}

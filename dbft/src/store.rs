use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use dbft_types::{RecoveryStore, RoundSnapshot, StoreError};

/// Keeps the round snapshot in a single file.
///
/// Writes go to a temporary file which then replaces the snapshot, so a crash
/// leaves either the old or the new snapshot behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".tmp");
        p.into()
    }
}

impl RecoveryStore for FileStore {
    fn load(&self) -> Result<Option<RoundSnapshot>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => RoundSnapshot::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, s: &RoundSnapshot) -> Result<(), StoreError> {
        let bytes = s.encode()?;
        let tmp = self.temp_path();
        let mut f = File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

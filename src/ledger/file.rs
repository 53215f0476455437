//! Ledger store backed by one text file per key.

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};

use super::{LedgerError, LedgerKey, LedgerStore};

/// Stores each key as a file named after it inside an instance working
/// directory, one entry per line.
#[derive(Debug)]
pub struct FileLedgerStore {
    root: Utf8PathBuf,
    dir: Dir,
}

impl FileLedgerStore {
    /// Opens (creating if needed) the ledger directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] when the directory cannot be created or
    /// opened.
    pub fn open(root: &Utf8Path) -> Result<Self, LedgerError> {
        let io_error = |err: io::Error| LedgerError::Io {
            key: LedgerKey::InstanceId,
            location: root.to_string(),
            message: err.to_string(),
        };
        Dir::create_ambient_dir_all(root, ambient_authority()).map_err(io_error)?;
        let dir = Dir::open_ambient_dir(root, ambient_authority()).map_err(io_error)?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn io_error(&self, key: LedgerKey, err: &io::Error) -> LedgerError {
        LedgerError::Io {
            key,
            location: self.root.join(key.as_str()).to_string(),
            message: err.to_string(),
        }
    }
}

impl LedgerStore for FileLedgerStore {
    fn read(&self, key: LedgerKey) -> Result<Vec<String>, LedgerError> {
        match self.dir.read_to_string(key.as_str()) {
            Ok(contents) => Ok(contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_owned)
                .collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(self.io_error(key, &err)),
        }
    }

    fn append(&self, key: LedgerKey, entry: &str) -> Result<(), LedgerError> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        let mut file = self
            .dir
            .open_with(key.as_str(), &options)
            .map_err(|err| self.io_error(key, &err))?;
        writeln!(file, "{}", entry.trim_end()).map_err(|err| self.io_error(key, &err))?;
        file.sync_all().map_err(|err| self.io_error(key, &err))
    }

    fn remove(&self, key: LedgerKey) -> Result<(), LedgerError> {
        match self.dir.remove_file(key.as_str()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(key, &err)),
        }
    }
}

// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{Storage, StorageError};

/// Filesystem-backed blob storage rooted at a data directory.
#[derive(Clone, Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<FileStorage, StorageError> {
        let root = root.into();
        if !root.exists() {
            debug!("Storage data directory {:?} is not found; creating one", root);
            fs::create_dir_all(&root).map_err(io_error)?;
        }
        Ok(FileStorage { root })
    }

    fn file_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for part in path.split('/') {
            full.push(part);
        }
        full
    }

    fn collect(
        &self,
        dir: &Path,
        relative: &str,
        found: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error(err)),
        };
        for entry in entries {
            let entry = entry.map_err(io_error)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };
            let file_type = entry.file_type().map_err(io_error)?;
            if file_type.is_dir() {
                self.collect(&entry.path(), &child, found)?;
            } else {
                found.push(child);
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn put(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.file_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(full, data).map_err(io_error)
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.file_path(path)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(io_error(err)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut found = vec![];
        self.collect(&self.file_path(prefix), prefix, &mut found)?;
        found.sort();
        Ok(found)
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.file_path(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(io_error(err)),
        }
    }
}

fn io_error(err: std::io::Error) -> StorageError {
    StorageError::Io(err.to_string())
}

//! One-JSON-file-per-record persistence for rule tables

use portcullis_core::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory of JSON records
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Open a store, creating the directory if it does not exist
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory backing this store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Whether a record named `name` exists
    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    /// Write a record, pretty-printed
    pub fn write<T: Serialize>(&self, name: &str, record: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        fs::write(self.path_of(name), content)?;
        Ok(())
    }

    /// Read the record named `name`, `None` when it does not exist
    pub fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match fs::read(self.path_of(name)) {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Remove a record. Returns `false` when it was already absent.
    pub fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.path_of(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Load every record, sorted by file name.
    ///
    /// Files that cannot be parsed are logged and skipped.
    pub fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let parsed = fs::read(&path)
                .map_err(Error::from)
                .and_then(|content| serde_json::from_slice::<T>(&content).map_err(Error::from));

            match parsed {
                Ok(record) => records.push((name.to_string(), record)),
                Err(e) => {
                    tracing::warn!(
                        category = "rules",
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable rule record"
                    );
                }
            }
        }

        Ok(records)
    }
}

const ESCAPES: &[(char, &str)] = &[
    ('#', "%pound%"),
    ('&', "%amp%"),
    ('{', "%left_cur%"),
    ('}', "%right_cur%"),
    ('\\', "%backslash%"),
    ('<', "%left_ang%"),
    ('>', "%right_ang%"),
    ('*', "%aster%"),
    ('?', "%quest%"),
    (' ', "%space%"),
    ('$', "%dollar%"),
    ('!', "%exclan%"),
    ('\'', "%sin_q%"),
    ('"', "%dou_q%"),
    (':', "%colon%"),
    ('@', "%at%"),
    ('+', "%plus%"),
    ('`', "%backtick%"),
    ('|', "%pipe%"),
    ('=', "%equal%"),
    ('.', "_"),
    ('/', "-"),
];

/// Turn a rule key into a file-name-safe record name
pub fn escape_filename(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match ESCAPES.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => out.push_str(to),
            None => out.push(c),
        }
    }
    out
}

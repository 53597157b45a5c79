//! On-disk cache for compile artifacts. Entries are keyed by an md5
//! fingerprint of the caller's key bytes and stored as hex-named files; the
//! total size is kept under a budget by evicting the oldest entries.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::common::Map;

pub trait Cache {
    /// Store data in the cache.
    fn store(&mut self, key: &[u8], data: &[u8]) -> crate::Result<()>;

    /// Load the data matching the key, or `CacheMiss`.
    fn load(&mut self, key: &[u8]) -> crate::Result<Vec<u8>>;
}

pub type Fingerprint = [u8; 16];

struct FileData {
    usetime: SystemTime,
    path: PathBuf,
    size: u64,
}

pub struct FileCache {
    dir: PathBuf,
    data: Map<Fingerprint, FileData>,
    maxsize: u64,
}

impl FileCache {
    /// Opens (creating if needed) a cache directory and indexes whatever
    /// valid entries already live there. Files that do not look like cache
    /// entries are left alone.
    pub fn new(dir: impl Into<PathBuf>, maxsize: u64) -> crate::Result<FileCache> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut data = Map::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let fingerprint = match string_to_fingerprint(name) {
                Ok(fingerprint) => fingerprint,
                Err(_) => {
                    log::debug!("Odd file name {} in cache {}", name, dir.display());
                    continue;
                }
            };
            let meta = entry.metadata()?;
            data.insert(
                fingerprint,
                FileData {
                    usetime: meta.modified()?,
                    path: entry.path(),
                    size: meta.len(),
                },
            );
        }

        let mut cache = FileCache { dir, data, maxsize };
        cache.trim()?;
        Ok(cache)
    }

    fn fingerprint(key: &[u8]) -> Fingerprint {
        md5::compute(key).0
    }

    fn path_of(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint_to_string(fingerprint))
    }

    /// Evicts oldest entries until the total size fits the budget.
    fn trim(&mut self) -> crate::Result<()> {
        loop {
            let total: u64 = self.data.values().map(|fd| fd.size).sum();
            if total < self.maxsize {
                return Ok(());
            }
            let oldest = self
                .data
                .iter()
                .min_by_key(|(_, fd)| fd.usetime)
                .map(|(fingerprint, _)| *fingerprint);
            let oldest = match oldest {
                Some(oldest) => oldest,
                None => return Ok(()),
            };
            if let Some(fd) = self.data.remove(&oldest) {
                std::fs::remove_file(&fd.path)?;
            }
        }
    }
}

impl Cache for FileCache {
    fn store(&mut self, key: &[u8], data: &[u8]) -> crate::Result<()> {
        let fingerprint = Self::fingerprint(key);
        let fd = FileData {
            usetime: SystemTime::now(),
            path: self.path_of(&fingerprint),
            size: data.len() as u64,
        };

        std::fs::write(&fd.path, data)?;
        self.data.insert(fingerprint, fd);
        self.trim()
    }

    fn load(&mut self, key: &[u8]) -> crate::Result<Vec<u8>> {
        let fingerprint = Self::fingerprint(key);
        match self.data.get(&fingerprint) {
            Some(fd) => Ok(std::fs::read(&fd.path)?),
            None => Err(crate::Error::CacheMiss),
        }
    }
}

pub fn fingerprint_to_string(fingerprint: &Fingerprint) -> String {
    hex::encode(fingerprint)
}

pub fn string_to_fingerprint(name: &str) -> crate::Result<Fingerprint> {
    let bytes = hex::decode(name)
        .map_err(|e| crate::Error::GenericError(format!("invalid fingerprint: {}", e)))?;
    if bytes.len() != 16 {
        return Err(crate::Error::GenericError(format!(
            "invalid fingerprint length: {}",
            bytes.len()
        )));
    }
    let mut fingerprint = Fingerprint::default();
    fingerprint.copy_from_slice(&bytes);
    Ok(fingerprint)
}

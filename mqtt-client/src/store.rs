// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, ErrorKind};

/// Persists in-flight packets across disconnects, keyed by `o:<id>` (outbound) or
/// `i:<id>` (inbound). Implementations are only ever driven by `LogicCore`, so atomicity
/// per key is sufficient; cross-key atomicity is not required.
pub trait Store: Send + Sync {
    fn open(&self) -> Result<(), Error>;
    fn close(&self) -> Result<(), Error>;

    /// Wipe all persisted keys, used when `clean_session` is set.
    fn reset(&self) -> Result<(), Error>;

    fn put(&self, key: &str, packet_bytes: &[u8]) -> Result<(), Error>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    fn del(&self, key: &str) -> Result<(), Error>;

    /// All keys currently persisted; used at resume.
    fn all(&self) -> Result<Vec<String>, Error>;
}

/// Default `Store`. Data does not survive process restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        MemoryStore {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Store for MemoryStore {
    fn open(&self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    fn reset(&self) -> Result<(), Error> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn put(&self, key: &str, packet_bytes: &[u8]) -> Result<(), Error> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), packet_bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn del(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn all(&self) -> Result<Vec<String>, Error> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }
}

/// File-backed `Store`, one file per key under `<root>/<client_id>/`. Survives process
/// restarts, which is the whole point of persisting QoS>=1 state across a `clean_session=false`
/// reconnect.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(root: &str, client_id: &str) -> Self {
        let mut dir = PathBuf::from(root);
        dir.push(client_id);
        FileStore { dir }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // `o:` / `i:` prefix is not filesystem-safe as-is; swap `:` for `_`.
        self.dir.join(key.replace(':', "_"))
    }
}

impl Store for FileStore {
    fn open(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    fn reset(&self) -> Result<(), Error> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn put(&self, key: &str, packet_bytes: &[u8]) -> Result<(), Error> {
        fs::write(self.key_path(key), packet_bytes)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn del(&self, key: &str) -> Result<(), Error> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    fn all(&self) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            Error::from_string(ErrorKind::TransportError, format!("store dir: {err}"))
        })?;
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                // Invert the `:` -> `_` substitution used by `key_path`.
                if let Some(idx) = name.find('_') {
                    let (prefix, rest) = name.split_at(idx);
                    keys.push(format!("{prefix}:{}", &rest[1..]));
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.open().unwrap();
        store.put("o:1", b"hello").unwrap();
        assert_eq!(store.get("o:1").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.all().unwrap(), vec!["o:1".to_string()]);
        store.del("o:1").unwrap();
        assert_eq!(store.get("o:1").unwrap(), None);
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("ruo-test-{}", std::process::id()));
        let store = FileStore::new(dir.to_str().unwrap(), "client-a");
        store.open().unwrap();
        store.put("o:42", b"payload").unwrap();
        assert_eq!(store.get("o:42").unwrap(), Some(b"payload".to_vec()));
        assert_eq!(store.all().unwrap(), vec!["o:42".to_string()]);
        store.reset().unwrap();
        assert_eq!(store.get("o:42").unwrap(), None);
        fs::remove_dir_all(&dir).ok();
    }
}

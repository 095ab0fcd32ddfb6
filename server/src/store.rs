//! §4.C State Store — narrow `load`/`save` interface over flat JSON files
//! under the data directory, shared (by trait, not by instance) with the
//! client's own store implementation. Best-effort atomicity via
//! write-to-temp-then-rename; failed reads are "not present", failed
//! writes are logged and ignored.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

pub trait StateStore: Send + Sync {
    fn load(&self, key: &str) -> Option<Vec<u8>>;
    fn save(&self, key: &str, bytes: &[u8]);
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!("failed to create data dir {:?}: {e}", root);
        }
        FileStore { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl StateStore for FileStore {
    fn load(&self, key: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path_for(key)).ok()
    }

    fn save(&self, key: &str, bytes: &[u8]) {
        let path = self.path_for(key);
        if let Err(e) = write_then_rename(&path, bytes) {
            warn!("failed to persist {:?}: {e}", path);
        }
    }
}

fn write_then_rename(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)
}

/// Loads and deserializes pretty-printed JSON for `key`; `None` on any
/// failure (missing file or malformed content), per the "not present"
/// equivalence in the spec.
pub fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Option<T> {
    let bytes = store.load(key)?;
    serde_json::from_slice(&bytes).ok()
}

/// Serializes `value` as pretty-printed JSON and persists it under `key`.
pub fn save_json<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) {
    match serde_json::to_vec_pretty(value) {
        Ok(bytes) => store.save(key, &bytes),
        Err(e) => warn!("failed to serialize {key}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Demo {
        a: u32,
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("tunnelcow-test-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&dir);
        save_json(&store, "demo", &Demo { a: 7 });
        let back: Option<Demo> = load_json(&store, "demo");
        assert_eq!(back, Some(Demo { a: 7 }));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_key_is_none() {
        let dir = std::env::temp_dir().join(format!("tunnelcow-test-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&dir);
        let back: Option<Demo> = load_json(&store, "nope");
        assert_eq!(back, None);
        std::fs::remove_dir_all(&dir).ok();
    }
}

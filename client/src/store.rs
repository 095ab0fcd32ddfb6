//! §4.C State Store, client side. Identical narrow interface to the
//! server's store — the core treats persistence as an opaque dependency,
//! not a shared library, so each binary owns its own small copy.

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

pub fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Option<T> {
    let bytes = store.load(key)?;
    serde_json::from_slice(&bytes).ok()
}

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
        let dir = std::env::temp_dir().join(format!("tunnelcow-client-test-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&dir);
        save_json(&store, "demo", &Demo { a: 3 });
        let back: Option<Demo> = load_json(&store, "demo");
        assert_eq!(back, Some(Demo { a: 3 }));
        std::fs::remove_dir_all(&dir).ok();
    }
}

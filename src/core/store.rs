use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::warn;

use super::statedir::restrict_file_permissions;

/// A single-file JSON store with an in-memory snapshot.
///
/// All mutations pass through one serial lane (`mutate`); writes go to a
/// sibling tmp file and are renamed over the target, so a crash mid-write
/// never leaves a torn file. Readers clone the current snapshot and never
/// wait on writers.
///
/// A malformed file found at load time is moved aside to
/// `<name>.corrupt.<millis>` and the store starts empty.
pub struct JsonStore<T> {
    path: PathBuf,
    snapshot: std::sync::Mutex<Arc<T>>,
    lane: Mutex<()>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync,
{
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir {}", parent.display()))?;
        }
        let initial = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => value,
                Err(e) => {
                    quarantine(&path, &e.to_string());
                    T::default()
                }
            },
            Err(_) => T::default(),
        };
        Ok(Self {
            path,
            snapshot: std::sync::Mutex::new(Arc::new(initial)),
            lane: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current state. Cheap; never blocks on a writer.
    pub fn get(&self) -> Arc<T> {
        self.snapshot.lock().expect("store snapshot poisoned").clone()
    }

    /// Apply `f` to a writable draft under the store lane, persist
    /// atomically, then publish the new snapshot. The draft is discarded if
    /// the write fails.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let _lane = self.lane.lock().await;
        let mut draft = (*self.get()).clone();
        let out = f(&mut draft);
        write_atomic(&self.path, &draft)?;
        *self.snapshot.lock().expect("store snapshot poisoned") = Arc::new(draft);
        Ok(out)
    }

    /// Re-read the file from disk, replacing the in-memory snapshot. Used
    /// when another process may have edited the store (CLI against a live
    /// daemon).
    pub async fn reload(&self) -> Result<()> {
        let _lane = self.lane.lock().await;
        let value = match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => value,
                Err(e) => {
                    quarantine(&self.path, &e.to_string());
                    T::default()
                }
            },
            Err(_) => T::default(),
        };
        *self.snapshot.lock().expect("store snapshot poisoned") = Arc::new(value);
        Ok(())
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value).context("failed to serialize store")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data.as_bytes())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    restrict_file_permissions(&tmp);
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename over {}", path.display()))?;
    Ok(())
}

fn quarantine(path: &Path, err: &str) {
    let stamp = crate::core::now_ms();
    let aside = path.with_extension(format!("corrupt.{stamp}"));
    warn!(
        "malformed store file {} ({}); moving aside to {}",
        path.display(),
        err,
        aside.display()
    );
    let _ = std::fs::rename(path, &aside);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Demo {
        counter: u64,
        names: BTreeMap<String, String>,
    }

    #[tokio::test]
    async fn mutate_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("demo.json");

        let store: JsonStore<Demo> = JsonStore::load(&path).unwrap();
        store
            .mutate(|d| {
                d.counter = 3;
                d.names.insert("a".into(), "alpha".into());
            })
            .await
            .unwrap();

        let reopened: JsonStore<Demo> = JsonStore::load(&path).unwrap();
        let snap = reopened.get();
        assert_eq!(snap.counter, 3);
        assert_eq!(snap.names.get("a").map(String::as_str), Some("alpha"));
    }

    #[tokio::test]
    async fn snapshot_is_stable_across_mutations() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonStore<Demo> = JsonStore::load(tmp.path().join("demo.json")).unwrap();

        let before = store.get();
        store.mutate(|d| d.counter = 9).await.unwrap();

        assert_eq!(before.counter, 0, "earlier snapshot must not change");
        assert_eq!(store.get().counter, 9);
    }

    #[test]
    fn malformed_file_is_quarantined() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("demo.json");
        std::fs::write(&path, "{not json").unwrap();

        let store: JsonStore<Demo> = JsonStore::load(&path).unwrap();
        assert_eq!(*store.get(), Demo::default());

        let quarantined = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(quarantined, "corrupt file should be moved aside");
    }

    #[tokio::test]
    async fn no_tmp_file_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("demo.json");
        let store: JsonStore<Demo> = JsonStore::load(&path).unwrap();
        store.mutate(|d| d.counter = 1).await.unwrap();

        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn reload_picks_up_external_edits() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("demo.json");
        let store: JsonStore<Demo> = JsonStore::load(&path).unwrap();
        store.mutate(|d| d.counter = 1).await.unwrap();

        let external = Demo {
            counter: 42,
            names: BTreeMap::new(),
        };
        std::fs::write(&path, serde_json::to_string(&external).unwrap()).unwrap();

        store.reload().await.unwrap();
        assert_eq!(store.get().counter, 42);
    }
}

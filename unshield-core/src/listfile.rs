//! Persistent corpus of known archive file names.
//!
//! Names are compared case-insensitively (the archive hash is case-insensitive) but
//! stored with the spelling they were first seen with.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::Result;

fn key(name: &str) -> String {
    name.replace('/', "\\").to_lowercase()
}

fn clean(line: &str) -> Option<&str> {
    let name = line.trim();
    (!name.is_empty()).then_some(name)
}

/// Sorted, case-insensitively deduplicated union of `existing` and `discovered`.
pub fn merge<'a>(
    existing: impl IntoIterator<Item = &'a str>,
    discovered: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut names: BTreeMap<String, String> = BTreeMap::new();
    for name in existing.into_iter().chain(discovered).filter_map(clean) {
        names.entry(key(name)).or_insert_with(|| name.to_string());
    }
    names.into_values().collect()
}

pub struct ListfileStore {
    path: Option<PathBuf>,
    names: Mutex<BTreeMap<String, String>>,
    appended: Mutex<Vec<String>>,
}

impl ListfileStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            names: Mutex::new(BTreeMap::new()),
            appended: Mutex::new(Vec::new()),
        }
    }

    /// Loads the corpus at `path`; a missing file is an empty corpus.
    pub fn load(path: &Path) -> Result<Self> {
        let store = Self {
            path: Some(path.to_path_buf()),
            ..Self::in_memory()
        };
        if path.exists() {
            let text = fs::read(path)?;
            store.merge(String::from_utf8_lossy(&text).lines());
        }
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // A panic on another worker leaves the maps intact, so poisoning is ignored.
    fn lock_names(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_appended(&self) -> MutexGuard<'_, Vec<String>> {
        self.appended.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds names without counting them as discoveries.
    pub fn merge<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut map = self.lock_names();
        for name in names.into_iter().filter_map(clean) {
            map.entry(key(name)).or_insert_with(|| name.to_string());
        }
    }

    /// Records a newly discovered name. Returns `false` when it was already known.
    pub fn append(&self, name: &str) -> bool {
        let Some(name) = clean(name) else {
            return false;
        };
        let inserted = {
            let mut map = self.lock_names();
            let k = key(name);
            if map.contains_key(&k) {
                false
            } else {
                map.insert(k, name.to_string());
                true
            }
        };
        if inserted {
            self.lock_appended().push(name.to_string());
        }
        inserted
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock_names().contains_key(&key(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.lock_names().values().cloned().collect()
    }

    /// Names appended during this run, in discovery order.
    pub fn appended(&self) -> Vec<String> {
        self.lock_appended().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the sorted corpus, folding in whatever is on disk now so the stored
    /// file only ever grows.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let on_disk = if path.exists() {
            String::from_utf8_lossy(&fs::read(path)?).into_owned()
        } else {
            String::new()
        };
        let current = self.names();
        let merged = merge(on_disk.lines(), current.iter().map(String::as_str));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut text = merged.join("\n");
        text.push('\n');
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_dedupes_case_insensitively_and_sorts() {
        let merged = merge(
            ["war3map.j", "Units\\B.mdx", ""],
            ["WAR3MAP.J", "units/a.mdx", "  Units\\b.MDX "],
        );
        assert_eq!(merged, vec!["units/a.mdx", "Units\\B.mdx", "war3map.j"]);
    }

    #[test]
    fn append_reports_only_new_names() {
        let store = ListfileStore::in_memory();
        store.merge(["war3map.j"]);
        assert!(!store.append("WAR3MAP.J"));
        assert!(store.append("war3map.w3e"));
        assert!(!store.append("War3Map.W3E"));
        assert_eq!(store.appended(), vec!["war3map.w3e".to_string()]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn concurrent_appends_do_not_duplicate() {
        let store = ListfileStore::in_memory();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for i in 0..50 {
                        store.append(&format!("dir\\file{i}.blp"));
                    }
                });
            }
        });
        assert_eq!(store.len(), 50);
        assert_eq!(store.appended().len(), 50);
    }

    #[test]
    fn appends_survive_a_panicked_writer() {
        let store = ListfileStore::in_memory();
        store.append("war3map.j");
        std::thread::scope(|scope| {
            let failed = scope
                .spawn(|| {
                    let _names = store.names.lock().unwrap();
                    let _appended = store.appended.lock().unwrap();
                    panic!("worker failed while holding the corpus");
                })
                .join();
            assert!(failed.is_err());
        });
        assert!(store.names.is_poisoned());

        assert!(store.append("war3map.w3e"));
        assert!(store.contains("WAR3MAP.W3E"));
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.appended(),
            vec!["war3map.j".to_string(), "war3map.w3e".to_string()]
        );
    }

    #[test]
    fn persisted_corpus_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listfile.txt");
        fs::write(&path, "b.txt\na.txt\n").unwrap();

        let store = ListfileStore::load(&path).unwrap();
        // Another process adds a name after we loaded.
        fs::write(&path, "b.txt\na.txt\nz.txt\n").unwrap();
        store.append("C.txt");
        store.persist().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a.txt\nb.txt\nC.txt\nz.txt\n");
    }
}

//! File-backed collection persisted as a JSON-lines log.
//!
//! Every write appends the full new record as one line and is flushed to disk
//! before the in-memory view changes, so a failed write never leaves the
//! process believing something the file does not record. Opening a
//! collection replays its log and rewrites it compacted, dropping a final
//! line torn by a crash mid-write.

use std::collections::BTreeMap;
use std::fs::{self, create_dir_all, rename, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Collection, Conditional, StoreKey, StoreRecord};
use crate::core::SchedulerError;

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize, V: Serialize"))]
#[serde(bound(deserialize = "K: serde::de::DeserializeOwned, V: serde::de::DeserializeOwned"))]
struct LogLine<K, V> {
    key: K,
    value: V,
}

struct Inner<K, V> {
    records: BTreeMap<K, V>,
    file: File,
}

/// JSON-lines collection stored at `<dir>/<name>.jsonl`.
pub struct JsonlCollection<K, V> {
    name: String,
    path: PathBuf,
    inner: Mutex<Inner<K, V>>,
}

fn backend<E: std::fmt::Display>(e: E) -> SchedulerError {
    SchedulerError::Backend(e.to_string())
}

impl<K: StoreKey, V: StoreRecord> JsonlCollection<K, V> {
    /// Open (or create) a collection, replaying any existing log.
    pub fn open(dir: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, SchedulerError> {
        let dir = dir.as_ref();
        let name = name.into();
        create_dir_all(dir).map_err(backend)?;
        let path = dir.join(format!("{name}.jsonl"));

        let records = Self::replay(&path)?;
        Self::rewrite(&path, &records)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(backend)?;

        tracing::debug!("opened collection {} with {} records", name, records.len());
        Ok(Self {
            name,
            path,
            inner: Mutex::new(Inner { records, file }),
        })
    }

    /// Path of the backing log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log. A final line that does not parse is the tail of a
    /// write cut short by a crash and is dropped; anywhere else it is
    /// corruption.
    fn replay(path: &Path) -> Result<BTreeMap<K, V>, SchedulerError> {
        let mut records = BTreeMap::new();
        if !path.exists() {
            return Ok(records);
        }
        let bytes = fs::read(path).map_err(backend)?;
        let lines: Vec<&[u8]> = bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.trim_ascii().is_empty())
            .collect();
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_slice::<LogLine<K, V>>(line) {
                Ok(entry) => {
                    records.insert(entry.key, entry.value);
                }
                Err(e) if i + 1 == lines.len() => {
                    tracing::warn!(
                        "{}: dropping torn final line ({} bytes): {}",
                        path.display(),
                        line.len(),
                        e
                    );
                }
                Err(e) => {
                    return Err(SchedulerError::Backend(format!(
                        "{}: corrupt record {}: {e}",
                        path.display(),
                        i + 1
                    )));
                }
            }
        }
        Ok(records)
    }

    fn rewrite(path: &Path, records: &BTreeMap<K, V>) -> Result<(), SchedulerError> {
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp).map_err(backend)?;
            for (key, value) in records {
                let line = serde_json::to_string(&LogLine { key, value }).map_err(backend)?;
                writeln!(file, "{line}").map_err(backend)?;
            }
            file.sync_all().map_err(backend)?;
        }
        rename(&tmp, path).map_err(backend)
    }

    /// Write one record as a single line. A failed write is cut back off so
    /// later appends never land behind a partial line.
    fn append(file: &mut File, key: &K, value: &V) -> Result<(), SchedulerError> {
        let mut line = serde_json::to_vec(&LogLine { key, value }).map_err(backend)?;
        line.push(b'\n');
        let len = file.metadata().map_err(backend)?.len();
        let written = file
            .write_all(&line)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            if let Err(trim) = file.set_len(len) {
                tracing::error!("could not trim failed append: {}", trim);
            }
            return Err(backend(e));
        }
        Ok(())
    }

    /// Rewrite the log so it holds exactly one line per record.
    pub fn compact(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        Self::rewrite(&self.path, &inner.records)?;
        inner.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(backend)?;
        Ok(())
    }
}

impl<K: StoreKey, V: StoreRecord> Collection<K, V> for JsonlCollection<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, key: K, value: V) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&key) {
            return Err(SchedulerError::Backend(format!(
                "{}: duplicate key {key:?}",
                self.name
            )));
        }
        Self::append(&mut inner.file, &key, &value)?;
        inner.records.insert(key, value);
        Ok(())
    }

    fn put(&self, key: K, value: V) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        Self::append(&mut inner.file, &key, &value)?;
        inner.records.insert(key, value);
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Option<V>, SchedulerError> {
        Ok(self.inner.lock().records.get(key).cloned())
    }

    fn find(&self, filter: &dyn Fn(&V) -> bool) -> Result<Vec<V>, SchedulerError> {
        Ok(self
            .inner
            .lock()
            .records
            .values()
            .filter(|v| filter(v))
            .cloned()
            .collect())
    }

    fn update_if(
        &self,
        key: &K,
        filter: &dyn Fn(&V) -> bool,
        update: &mut dyn FnMut(&mut V),
    ) -> Result<Conditional<V>, SchedulerError> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.records.get(key) else {
            return Ok(Conditional::Missing);
        };
        if !filter(current) {
            return Ok(Conditional::Rejected(current.clone()));
        }
        let mut next = current.clone();
        update(&mut next);
        Self::append(&mut inner.file, key, &next)?;
        inner.records.insert(key.clone(), next.clone());
        Ok(Conditional::Applied(next))
    }

    fn len(&self) -> Result<usize, SchedulerError> {
        Ok(self.inner.lock().records.len())
    }
}

//! Key-value store. A flat directory on a private tmpfs;
//! each node is a file of length-delimited records, later records
//! overriding earlier ones on a per-key basis. Grounded on
//! `original_source/src/kvalue.cpp`'s `TKeyValueNode::Merge`/`Load`/
//! `Append`/`Save`, reimplemented with a `u32`-length-prefixed framing
//! instead of protobuf delimited messages (the wire protocol framework
//! itself is an external collaborator, out of scope here).

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, ErrorKind as EK, Result};

/// One record: an ordered list of (key, value) pairs, as appended in a
/// single `Append` call.
pub type Record = Vec<(String, String)>;

/// Append-only per-node persistence store backed by a directory (intended
/// to live on a private tmpfs). A single mutex serializes writes; readers
/// take the same lock for the duration of a read to guarantee a
/// consistent view.
pub struct KeyValueStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl KeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn node_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::new(EK::InvalidValue, format!("invalid node name: {name}")));
        }
        Ok(self.root.join(name))
    }

    /// `Create(name)`: writes an empty record.
    pub fn create(&self, name: &str) -> Result<()> {
        let path = self.node_path(name)?;
        let _guard = self.lock.lock().unwrap();
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        opts.mode_or_err(&path)?;
        Ok(())
    }

    /// `Append(name, pairs)`: appends one record without disturbing
    /// previously written records.
    pub fn append(&self, name: &str, pairs: Record) -> Result<()> {
        let path = self.node_path(name)?;
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        write_record(&mut file, &pairs)?;
        Ok(())
    }

    /// `Save(name, pairs)`: truncate and write, replacing all history with
    /// a single record.
    pub fn save(&self, name: &str, pairs: Record) -> Result<()> {
        let path = self.node_path(name)?;
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        write_record(&mut file, &pairs)?;
        Ok(())
    }

    /// `Load(name) -> merged map`: reads every record in order, later
    /// records overriding earlier ones per key. A truncated trailing
    /// record (detected via its length prefix) is discarded with a
    /// warning rather than
    /// failing the whole load, matching the tmpfs-crash-recovery contract.
    pub fn load(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let path = self.node_path(name)?;
        let _guard = self.lock.lock().unwrap();
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("no such node: {name}")))
            }
            Err(e) => return Err(e.into()),
        };
        let mut map = BTreeMap::new();
        loop {
            match read_record(&mut file) {
                Ok(Some(record)) => {
                    for (k, v) in record {
                        map.insert(k, v);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(node = name, "discarding half-written key-value record");
                    break;
                }
            }
        }
        Ok(map)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.node_path(name)?;
        let _guard = self.lock.lock().unwrap();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `List() -> [name]`.
    pub fn list(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().unwrap();
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

trait CreateNewOrErr {
    fn mode_or_err(self, path: &Path) -> Result<()>;
}

impl CreateNewOrErr for OpenOptions {
    fn mode_or_err(self, path: &Path) -> Result<()> {
        match self.open(path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::already_exists(format!("node already exists: {}", path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn write_record(file: &mut File, pairs: &Record) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (k, v) in pairs {
        write_string(&mut buf, k);
        write_string(&mut buf, v);
    }
    let mut framed = Vec::with_capacity(buf.len() + 4);
    framed.extend_from_slice(&(buf.len() as u32).to_le_bytes());
    framed.extend_from_slice(&buf);
    file.seek(SeekFrom::End(0))?;
    file.write_all(&framed)?;
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Reads one length-framed record. Returns `Ok(None)` at a clean EOF and
/// `Err` if the frame is truncated (caller treats that as "half record,
/// discard").
fn read_record(file: &mut File) -> Result<Option<Record>> {
    let mut len_buf = [0u8; 4];
    match file.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    file.read_exact(&mut body)
        .map_err(|_| Error::new(EK::InvalidData, "truncated key-value record"))?;
    let mut cursor = &body[..];
    let count = read_u32(&mut cursor)? as usize;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_string(&mut cursor)?;
        let value = read_string(&mut cursor)?;
        pairs.push((key, value));
    }
    Ok(Some(pairs))
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Error::new(EK::InvalidData, "truncated key-value record"));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn read_string(cursor: &mut &[u8]) -> Result<String> {
    let len = read_u32(cursor)? as usize;
    if cursor.len() < len {
        return Err(Error::new(EK::InvalidData, "truncated key-value record"));
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    String::from_utf8(head.to_vec()).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KeyValueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn append_then_merge_on_load() {
        let (_dir, store) = store();
        store.create("demo").unwrap();
        store
            .append("demo", vec![("k1".into(), "v1".into())])
            .unwrap();
        store
            .append(
                "demo",
                vec![("k1".into(), "v2".into()), ("k2".into(), "v3".into())],
            )
            .unwrap();
        let map = store.load("demo").unwrap();
        assert_eq!(map.get("k1").unwrap(), "v2");
        assert_eq!(map.get("k2").unwrap(), "v3");
    }

    #[test]
    fn save_replaces_history() {
        let (_dir, store) = store();
        store
            .save("demo", vec![("k".into(), "first".into())])
            .unwrap();
        store
            .save("demo", vec![("k".into(), "second".into())])
            .unwrap();
        let map = store.load("demo").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("k").unwrap(), "second");
    }

    #[test]
    fn half_written_trailing_record_is_discarded() {
        let (_dir, store) = store();
        store
            .append("demo", vec![("k1".into(), "v1".into())])
            .unwrap();
        // Corrupt with a dangling length prefix that claims more bytes
        // than are actually present.
        let path = store.node_path("demo").unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(b"short").unwrap();
        let map = store.load("demo").unwrap();
        assert_eq!(map.get("k1").unwrap(), "v1");
    }

    #[test]
    fn list_and_remove() {
        let (_dir, store) = store();
        store.create("a").unwrap();
        store.create("b").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_owned(), "b".to_owned()]);
        store.remove("a").unwrap();
        assert_eq!(store.list().unwrap(), vec!["b".to_owned()]);
    }
}

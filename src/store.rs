//! Append-only embedding store keyed by sequence identifier.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! MAGIC
//! record*  = id_len:u32 id dim*f32 crc32:u32
//! index    = count:u64 (id_len:u32 id offset:u64)*
//! trailer  = index_offset:u64 count:u64 dim:u32 precision:u8 MAGIC
//! ```
//!
//! Writers stream into `<path>.partial` and only rename onto `path` in
//! [`EmbeddingWriter::close`], so a store visible at its final path is always
//! complete.

use crate::descriptor::PrecisionMode;
use crc32fast::Hasher as Crc32;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const MAGIC: &[u8; 8] = b"SOLEMB01";
const TRAILER_LEN: u64 = 8 + 8 + 4 + 1 + 8;
const PARTIAL_SUFFIX: &str = "partial";

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the embedding store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be opened for exclusive writing.
    #[error("cannot open embedding store {path:?} for writing: {reason}")]
    Open {
        /// Target store path.
        path: PathBuf,
        /// Why the open failed.
        reason: String,
    },
    /// The identifier already has a vector.
    #[error("embedding for {id} already written")]
    DuplicateKey {
        /// Repeated identifier.
        id: String,
    },
    /// Vector length differs from the store dimension.
    #[error("embedding for {id} has dimension {actual}, store dimension is {expected}")]
    DimensionMismatch {
        /// Identifier being written.
        id: String,
        /// Store dimension fixed by the first vector.
        expected: usize,
        /// Dimension of the rejected vector.
        actual: usize,
    },
    /// Empty or non-finite vector.
    #[error("invalid embedding for {id}: {reason}")]
    InvalidVector {
        /// Identifier being written.
        id: String,
        /// Rejection reason.
        reason: &'static str,
    },
    /// The file on disk does not match the store layout.
    #[error("corrupt embedding store {path:?}: {reason}")]
    Corrupt {
        /// Store path.
        path: PathBuf,
        /// What failed to validate.
        reason: String,
    },
    /// Underlying I/O failure.
    #[error("embedding store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Path of the in-progress file for a store destined for `path`.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

/// Exclusive, append-only writer for one embedding store.
#[derive(Debug)]
pub struct EmbeddingWriter {
    path: PathBuf,
    partial: PathBuf,
    writer: Option<BufWriter<File>>,
    precision: PrecisionMode,
    dimension: Option<usize>,
    offset: u64,
    index: Vec<(String, u64)>,
    seen: HashSet<String>,
}

impl EmbeddingWriter {
    /// Opens a new store at `path`, failing if it exists or cannot be created.
    pub fn open(path: impl AsRef<Path>, precision: PrecisionMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(StoreError::Open {
                path,
                reason: "store already exists".to_string(),
            });
        }
        let partial = partial_path(&path);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .map_err(|err| StoreError::Open {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        debug!(path = %partial.display(), "opened embedding store for writing");
        Ok(Self {
            path,
            partial,
            writer: Some(writer),
            precision,
            dimension: None,
            offset: MAGIC.len() as u64,
            index: Vec::new(),
            seen: HashSet::new(),
        })
    }

    /// Appends one vector under `id`.
    pub fn write(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        if self.seen.contains(id) {
            return Err(StoreError::DuplicateKey { id: id.to_string() });
        }
        if vector.is_empty() {
            return Err(StoreError::InvalidVector {
                id: id.to_string(),
                reason: "vector is empty",
            });
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(StoreError::InvalidVector {
                id: id.to_string(),
                reason: "vector contains non-finite values",
            });
        }
        match self.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(StoreError::DimensionMismatch {
                    id: id.to_string(),
                    expected,
                    actual: vector.len(),
                })
            }
            Some(_) => {}
            None => self.dimension = Some(vector.len()),
        }
        let id_len = u32::try_from(id.len()).map_err(|_| StoreError::InvalidVector {
            id: id.to_string(),
            reason: "identifier too long",
        })?;

        let writer = self.writer.as_mut().ok_or_else(|| StoreError::Open {
            path: self.path.clone(),
            reason: "writer already closed".to_string(),
        })?;
        let body = encode_vector(vector);
        let mut hasher = Crc32::new();
        hasher.update(id.as_bytes());
        hasher.update(&body);

        writer.write_all(&id_len.to_le_bytes())?;
        writer.write_all(id.as_bytes())?;
        writer.write_all(&body)?;
        writer.write_all(&hasher.finalize().to_le_bytes())?;

        self.index.push((id.to_string(), self.offset));
        self.seen.insert(id.to_string());
        self.offset += 4 + id.len() as u64 + body.len() as u64 + 4;
        Ok(())
    }

    /// Number of vectors written so far.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True when `id` has been written.
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Final path of the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the index and trailer, syncs, and publishes the store at its final path.
    pub fn close(mut self) -> Result<PathBuf> {
        let writer = self.writer.take().ok_or_else(|| StoreError::Open {
            path: self.path.clone(),
            reason: "writer already closed".to_string(),
        })?;
        if let Err(err) = self.finish(writer) {
            let _ = fs::remove_file(&self.partial);
            return Err(err);
        }
        debug!(
            path = %self.path.display(),
            vectors = self.index.len(),
            dimension = self.dimension.unwrap_or(0),
            "closed embedding store"
        );
        Ok(self.path.clone())
    }

    fn finish(&self, mut writer: BufWriter<File>) -> Result<()> {
        let index_offset = self.offset;
        writer.write_all(&(self.index.len() as u64).to_le_bytes())?;
        for (id, offset) in &self.index {
            writer.write_all(&(id.len() as u32).to_le_bytes())?;
            writer.write_all(id.as_bytes())?;
            writer.write_all(&offset.to_le_bytes())?;
        }
        let dimension = self.dimension.unwrap_or(0) as u32;
        writer.write_all(&index_offset.to_le_bytes())?;
        writer.write_all(&(self.index.len() as u64).to_le_bytes())?;
        writer.write_all(&dimension.to_le_bytes())?;
        writer.write_all(&[precision_tag(self.precision)])?;
        writer.write_all(MAGIC)?;
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.partial, &self.path)?;
        Ok(())
    }
}

impl Drop for EmbeddingWriter {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.partial);
        }
    }
}

/// Random-access reader over a closed store.
#[derive(Debug)]
pub struct EmbeddingStoreReader {
    path: PathBuf,
    file: BufReader<File>,
    order: Vec<String>,
    offsets: HashMap<String, u64>,
    dimension: usize,
    precision: PrecisionMode,
}

impl EmbeddingStoreReader {
    /// Opens a closed store and loads its identifier index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let corrupt = |reason: &str| StoreError::Corrupt {
            path: path.clone(),
            reason: reason.to_string(),
        };
        let mut file = BufReader::new(File::open(&path)?);
        let len = file.seek(SeekFrom::End(0))?;
        if len < MAGIC.len() as u64 + 8 + TRAILER_LEN {
            return Err(corrupt("file too short"));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(corrupt("bad header magic"));
        }

        file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
        let index_offset = read_u64(&mut file)?;
        let count = read_u64(&mut file)?;
        let dimension = read_u32(&mut file)? as usize;
        let mut tag = [0u8; 1];
        file.read_exact(&mut tag)?;
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(corrupt("bad trailer magic"));
        }
        let precision = precision_from_tag(tag[0]).ok_or_else(|| corrupt("unknown precision"))?;
        if index_offset >= len - TRAILER_LEN {
            return Err(corrupt("index offset out of range"));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        if read_u64(&mut file)? != count {
            return Err(corrupt("index count disagrees with trailer"));
        }
        let mut order = Vec::with_capacity(count as usize);
        let mut offsets = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let id = read_id(&mut file)?;
            let offset = read_u64(&mut file)?;
            if offset >= index_offset {
                return Err(corrupt("record offset out of range"));
            }
            if offsets.insert(id.clone(), offset).is_some() {
                return Err(corrupt("duplicate identifier in index"));
            }
            order.push(id);
        }

        Ok(Self {
            path,
            file,
            order,
            offsets,
            dimension,
            precision,
        })
    }

    /// Reads the vector stored under `id`.
    pub fn get(&mut self, id: &str) -> Result<Option<Vec<f32>>> {
        let Some(&offset) = self.offsets.get(id) else {
            return Ok(None);
        };
        self.file.seek(SeekFrom::Start(offset))?;
        let stored_id = read_id(&mut self.file)?;
        if stored_id != id {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: format!("index points {id} at record for {stored_id}"),
            });
        }
        let mut body = vec![0u8; self.dimension * 4];
        self.file.read_exact(&mut body)?;
        let expected = read_u32(&mut self.file)?;
        let mut hasher = Crc32::new();
        hasher.update(id.as_bytes());
        hasher.update(&body);
        if hasher.finalize() != expected {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: format!("checksum mismatch for {id}"),
            });
        }
        Ok(Some(decode_vector(&body)))
    }

    /// True when `id` is stored.
    pub fn contains(&self, id: &str) -> bool {
        self.offsets.contains_key(id)
    }

    /// Identifiers in write order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when the store holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Vector dimension (0 for an empty store).
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Precision mode the vectors were produced under.
    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn precision_tag(precision: PrecisionMode) -> u8 {
    match precision {
        PrecisionMode::Full => 0,
        PrecisionMode::Reduced => 1,
    }
}

fn precision_from_tag(tag: u8) -> Option<PrecisionMode> {
    match tag {
        0 => Some(PrecisionMode::Full),
        1 => Some(PrecisionMode::Reduced),
        _ => None,
    }
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_id<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = read_u32(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn vectors_round_trip_bit_exact() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.emb");
        let vectors = vec![
            ("alpha", vec![0.1f32, -2.5, f32::MIN_POSITIVE]),
            ("beta", vec![1.0e-7, 3.402_823_5e38, -0.0]),
            ("gamma", vec![0.333_333_34, 42.0, 7.5]),
        ];

        let mut writer = EmbeddingWriter::open(&path, PrecisionMode::Reduced).expect("open");
        for (id, vector) in &vectors {
            writer.write(id, vector).expect("write");
        }
        assert_eq!(writer.close().expect("close"), path);

        let mut reader = EmbeddingStoreReader::open(&path).expect("reader");
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.dimension(), 3);
        assert_eq!(reader.precision(), PrecisionMode::Reduced);
        assert_eq!(reader.ids(), ["alpha", "beta", "gamma"]);
        for (id, vector) in &vectors {
            let stored = reader.get(id).expect("get").expect("present");
            let expected_bits: Vec<u32> = vector.iter().map(|v| v.to_bits()).collect();
            let stored_bits: Vec<u32> = stored.iter().map(|v| v.to_bits()).collect();
            assert_eq!(stored_bits, expected_bits, "bits differ for {id}");
        }
        assert!(reader.get("delta").expect("get").is_none());
    }

    #[test]
    fn duplicate_key_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut writer =
            EmbeddingWriter::open(dir.path().join("dup.emb"), PrecisionMode::Full).expect("open");
        writer.write("a", &[1.0, 2.0]).expect("first write");
        match writer.write("a", &[3.0, 4.0]) {
            Err(StoreError::DuplicateKey { id }) => assert_eq!(id, "a"),
            other => panic!("expected duplicate key, got {other:?}"),
        }
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn dimension_fixed_by_first_vector() {
        let dir = tempdir().expect("tempdir");
        let mut writer =
            EmbeddingWriter::open(dir.path().join("dim.emb"), PrecisionMode::Full).expect("open");
        writer.write("a", &[1.0, 2.0]).expect("first write");
        assert!(matches!(
            writer.write("b", &[1.0]),
            Err(StoreError::DimensionMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
        assert!(matches!(
            writer.write("c", &[]),
            Err(StoreError::InvalidVector { .. })
        ));
        assert!(matches!(
            writer.write("d", &[f32::NAN, 0.0]),
            Err(StoreError::InvalidVector { .. })
        ));
    }

    #[test]
    fn store_invisible_until_closed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pending.emb");
        let mut writer = EmbeddingWriter::open(&path, PrecisionMode::Full).expect("open");
        writer.write("a", &[1.0]).expect("write");
        assert!(!path.exists());
        assert!(partial_path(&path).exists());
        drop(writer);
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn open_is_exclusive() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("exclusive.emb");
        let _first = EmbeddingWriter::open(&path, PrecisionMode::Full).expect("open");
        assert!(matches!(
            EmbeddingWriter::open(&path, PrecisionMode::Full),
            Err(StoreError::Open { .. })
        ));
    }

    #[test]
    fn open_fails_without_parent_directory() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("store.emb");
        assert!(matches!(
            EmbeddingWriter::open(&path, PrecisionMode::Full),
            Err(StoreError::Open { .. })
        ));
    }

    #[test]
    fn existing_store_not_overwritten() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("done.emb");
        let writer = EmbeddingWriter::open(&path, PrecisionMode::Full).expect("open");
        writer.close().expect("close");
        assert!(matches!(
            EmbeddingWriter::open(&path, PrecisionMode::Full),
            Err(StoreError::Open { .. })
        ));
    }

    #[test]
    fn flipped_byte_detected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("flip.emb");
        let mut writer = EmbeddingWriter::open(&path, PrecisionMode::Full).expect("open");
        writer.write("a", &[1.0, 2.0, 3.0]).expect("write");
        writer.close().expect("close");

        let mut bytes = fs::read(&path).expect("read");
        // First vector byte: magic(8) + id_len(4) + id(1).
        bytes[13] ^= 0xFF;
        fs::write(&path, bytes).expect("rewrite");

        let mut reader = EmbeddingStoreReader::open(&path).expect("reader");
        assert!(matches!(reader.get("a"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn empty_store_is_readable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("empty.emb");
        EmbeddingWriter::open(&path, PrecisionMode::Full)
            .expect("open")
            .close()
            .expect("close");
        let reader = EmbeddingStoreReader::open(&path).expect("reader");
        assert!(reader.is_empty());
        assert_eq!(reader.dimension(), 0);
    }
}

//! FASTA sequence records and the bounded batch reader feeding the embedder.
//!
//! The reader makes two passes over its source: a cheap pre-scan that counts
//! record headers, then the streaming pass that yields batches. Knowing the
//! total up front lets callers flush the final short batch without lookahead.

use bio::io::fasta;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Protein residue letters accepted in sequence bodies (case-insensitive).
pub const RESIDUE_ALPHABET: &[u8] = b"ACDEFGHIKLMNPQRSTVWYBXZJUO";

/// One identifier plus its residue string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    /// Identifier taken from the FASTA header; the join key for every later stage.
    pub id: String,
    /// Residue letters exactly as they appeared in the source.
    pub residues: String,
}

impl SequenceRecord {
    /// Builds a record without validation.
    pub fn new(id: impl Into<String>, residues: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            residues: residues.into(),
        }
    }
}

/// Ordered group of records handed to the embedder in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based position of this batch within the run.
    pub index: usize,
    /// Records in source order.
    pub records: Vec<SequenceRecord>,
}

impl Batch {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Identifiers in batch order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|record| record.id.as_str())
    }

    /// Residue strings in batch order.
    pub fn residues(&self) -> Vec<&str> {
        self.records
            .iter()
            .map(|record| record.residues.as_str())
            .collect()
    }
}

/// Errors raised while reading a sequence source.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The batch size must be at least one.
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    /// The source could not be opened or read.
    #[error("failed to read sequence source {path:?}: {source}")]
    Io {
        /// Source path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The FASTA reader rejected the input.
    #[error("malformed FASTA in {path:?} near record {record}: {source}")]
    Malformed {
        /// Source path.
        path: PathBuf,
        /// One-based record number where parsing failed.
        record: usize,
        /// Reader error.
        #[source]
        source: io::Error,
    },
    /// A header carried no identifier.
    #[error("record {record} in {path:?} has no identifier")]
    MissingIdentifier {
        /// Source path.
        path: PathBuf,
        /// One-based record number.
        record: usize,
    },
    /// A record had no residues.
    #[error("record {id} has an empty sequence")]
    EmptySequence {
        /// Offending identifier.
        id: String,
    },
    /// A residue outside the protein alphabet.
    #[error("record {id} has invalid residue {residue:?} at position {position}")]
    InvalidResidue {
        /// Offending identifier.
        id: String,
        /// One-based residue position.
        position: usize,
        /// The rejected character.
        residue: char,
    },
    /// The same identifier appeared twice.
    #[error("duplicate sequence identifier {id}")]
    DuplicateIdentifier {
        /// Repeated identifier.
        id: String,
    },
    /// The streaming pass disagreed with the pre-scan count.
    #[error("sequence source {path:?} changed during the run: pre-scan counted {expected} records, stream produced {actual}")]
    CountMismatch {
        /// Source path.
        path: PathBuf,
        /// Records counted during the pre-scan.
        expected: usize,
        /// Records produced by the stream so far.
        actual: usize,
    },
}

/// Counts FASTA records by scanning header lines.
pub fn count_records(path: &Path) -> Result<usize, ParseError> {
    let io_err = |source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut count = 0usize;
    for line in reader.lines() {
        if line.map_err(io_err)?.starts_with('>') {
            count += 1;
        }
    }
    Ok(count)
}

/// Lazy, single-use iterator over bounded batches of a FASTA source.
pub struct BatchReader {
    path: PathBuf,
    records: fasta::Records<BufReader<File>>,
    batch_size: usize,
    total: usize,
    processed: usize,
    next_index: usize,
    finished: bool,
}

impl std::fmt::Debug for BatchReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchReader")
            .field("path", &self.path)
            .field("batch_size", &self.batch_size)
            .field("total", &self.total)
            .field("processed", &self.processed)
            .finish()
    }
}

impl BatchReader {
    /// Pre-scans `path` for its record count and opens the streaming pass.
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self, ParseError> {
        if batch_size == 0 {
            return Err(ParseError::InvalidBatchSize);
        }
        let path = path.as_ref().to_path_buf();
        let total = count_records(&path)?;
        let file = File::open(&path).map_err(|source| ParseError::Io {
            path: path.clone(),
            source,
        })?;
        let records = fasta::Reader::new(file).records();
        Ok(Self {
            path,
            records,
            batch_size,
            total,
            processed: 0,
            next_index: 0,
            finished: false,
        })
    }

    /// Total record count from the pre-scan.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Records yielded so far.
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Configured maximum batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches this reader will produce.
    pub fn expected_batches(&self) -> usize {
        self.total.div_ceil(self.batch_size)
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn next_record(&mut self) -> Result<Option<SequenceRecord>, ParseError> {
        let ordinal = self.processed + 1;
        let record = match self.records.next() {
            Some(Ok(record)) => record,
            Some(Err(source)) => {
                return Err(ParseError::Malformed {
                    path: self.path.clone(),
                    record: ordinal,
                    source,
                })
            }
            None => return Ok(None),
        };
        validate_record(&self.path, ordinal, record.id(), record.seq()).map(Some)
    }

    fn fill_batch(&mut self) -> Result<Option<Batch>, ParseError> {
        let mut records = Vec::with_capacity(self.batch_size.min(self.total.max(1)));
        loop {
            if records.len() == self.batch_size
                || (!records.is_empty() && self.processed + records.len() == self.total)
            {
                break;
            }
            match self.next_record()? {
                Some(record) => {
                    if self.processed + records.len() >= self.total {
                        return Err(self.count_mismatch(self.processed + records.len() + 1));
                    }
                    records.push(record);
                }
                None => {
                    let seen = self.processed + records.len();
                    if seen != self.total {
                        return Err(self.count_mismatch(seen));
                    }
                    break;
                }
            }
        }

        if records.is_empty() {
            return Ok(None);
        }
        let batch = Batch {
            index: self.next_index,
            records,
        };
        self.next_index += 1;
        self.processed += batch.len();
        Ok(Some(batch))
    }

    fn count_mismatch(&self, actual: usize) -> ParseError {
        ParseError::CountMismatch {
            path: self.path.clone(),
            expected: self.total,
            actual,
        }
    }
}

impl Iterator for BatchReader {
    type Item = Result<Batch, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.fill_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

fn validate_record(
    path: &Path,
    ordinal: usize,
    id: &str,
    seq: &[u8],
) -> Result<SequenceRecord, ParseError> {
    if id.trim().is_empty() {
        return Err(ParseError::MissingIdentifier {
            path: path.to_path_buf(),
            record: ordinal,
        });
    }
    if seq.is_empty() {
        return Err(ParseError::EmptySequence { id: id.to_string() });
    }
    if let Some((idx, &byte)) = seq
        .iter()
        .enumerate()
        .find(|(_, byte)| !RESIDUE_ALPHABET.contains(&byte.to_ascii_uppercase()))
    {
        return Err(ParseError::InvalidResidue {
            id: id.to_string(),
            position: idx + 1,
            residue: byte as char,
        });
    }
    // Validated as ASCII above.
    let residues = String::from_utf8_lossy(seq).into_owned();
    Ok(SequenceRecord::new(id, residues))
}

/// Identifier → residues lookup over a whole source, in source order.
#[derive(Debug, Clone, Default)]
pub struct SequenceIndex {
    order: Vec<String>,
    residues: HashMap<String, String>,
}

impl SequenceIndex {
    /// Reads and validates every record in `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let path = path.as_ref();
        let reader = BatchReader::open(path, 256)?;
        let mut index = Self::default();
        for batch in reader {
            for record in batch?.records {
                index.insert(record)?;
            }
        }
        Ok(index)
    }

    /// Adds a record, rejecting repeated identifiers.
    pub fn insert(&mut self, record: SequenceRecord) -> Result<(), ParseError> {
        if self.residues.contains_key(&record.id) {
            return Err(ParseError::DuplicateIdentifier { id: record.id });
        }
        self.order.push(record.id.clone());
        self.residues.insert(record.id, record.residues);
        Ok(())
    }

    /// Residues for `id`, if present.
    pub fn get(&self, id: &str) -> Option<&str> {
        self.residues.get(id).map(String::as_str)
    }

    /// True when `id` is indexed.
    pub fn contains(&self, id: &str) -> bool {
        self.residues.contains_key(id)
    }

    /// Identifiers in source order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

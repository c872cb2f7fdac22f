//! Maps the scoring stage's raw prediction table onto the canonical output schema.
//!
//! Raw tables come in several dialects depending on the scorer build: some
//! carry an explicit `SolubilityScore`, some only a `probability`, some only a
//! `pred_label`. Each row is turned into a [`ScoreEvidence`] once, and the
//! score is resolved from that value rather than by probing columns ad hoc.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sequences::SequenceIndex;
use crate::store::partial_path;

/// Predictor name stamped on canonical rows unless configured otherwise.
pub const DEFAULT_PREDICTOR: &str = "PLM_Sol";

/// Header of the canonical output table, in column order.
pub const CANONICAL_HEADER: [&str; 6] = [
    "Accession",
    "Sequence",
    "Predictor",
    "SolubilityScore",
    "Probability_Soluble",
    "Probability_Insoluble",
];

const ACCESSION_COLUMN: &str = "Accession";
const NAME_COLUMN: &str = "name";
const SCORE_COLUMN: &str = "SolubilityScore";
const PROBABILITY_COLUMN: &str = "probability";
const LABEL_COLUMN: &str = "pred_label";

/// One row of the scorer's raw table, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    fields: HashMap<String, String>,
}

impl RawRow {
    /// Builds a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// True when the table has `column`, even if this row's cell is empty.
    pub fn has_column(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    /// Trimmed cell value. Empty cells read as absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// Value of a `pred_label` cell.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelValue {
    /// Numeric class label.
    Numeric(f64),
    /// Textual class label such as `soluble`.
    Text(String),
}

impl LabelValue {
    fn parse(raw: &str) -> Self {
        match raw.parse::<f64>() {
            Ok(value) => Self::Numeric(value),
            Err(_) => Self::Text(raw.to_string()),
        }
    }

    /// True for numeric `1` or a case-insensitive `soluble`.
    pub fn is_soluble(&self) -> bool {
        match self {
            Self::Numeric(value) => *value == 1.0,
            Self::Text(text) => text.eq_ignore_ascii_case("soluble"),
        }
    }
}

/// The best score evidence a raw row offers, in precedence order.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreEvidence {
    /// An explicit `SolubilityScore`.
    Explicit(f64),
    /// A `probability` used directly as the score.
    Probability(f64),
    /// A `pred_label` mapped onto `{0.0, 1.0}`.
    Label(LabelValue),
    /// Nothing usable; the row scores `0.0` and is flagged degraded.
    Missing,
}

impl ScoreEvidence {
    /// Extracts evidence from `row`, taking the first present field.
    pub fn from_row(row: &RawRow, accession: &str) -> Result<Self, NormalizeError> {
        if let Some(value) = row.get(SCORE_COLUMN) {
            return parse_number(accession, SCORE_COLUMN, value).map(Self::Explicit);
        }
        if let Some(value) = row.get(PROBABILITY_COLUMN) {
            return parse_number(accession, PROBABILITY_COLUMN, value).map(Self::Probability);
        }
        if let Some(value) = row.get(LABEL_COLUMN) {
            return Ok(Self::Label(LabelValue::parse(value)));
        }
        Ok(Self::Missing)
    }

    /// Resolved solubility score.
    pub fn score(&self) -> f64 {
        match self {
            Self::Explicit(score) | Self::Probability(score) => *score,
            Self::Label(label) if label.is_soluble() => 1.0,
            Self::Label(_) | Self::Missing => 0.0,
        }
    }

    /// Which rung of the precedence ladder produced the score.
    pub fn source(&self) -> ScoreSource {
        match self {
            Self::Explicit(_) => ScoreSource::Explicit,
            Self::Probability(_) => ScoreSource::Probability,
            Self::Label(_) => ScoreSource::Label,
            Self::Missing => ScoreSource::Fallback,
        }
    }
}

fn parse_number(accession: &str, column: &str, value: &str) -> Result<f64, NormalizeError> {
    match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => Ok(parsed),
        _ => Err(NormalizeError::InvalidNumber {
            accession: accession.to_string(),
            column: column.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Provenance of a canonical row's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// `SolubilityScore` column.
    Explicit,
    /// `probability` column.
    Probability,
    /// `pred_label` column.
    Label,
    /// No usable column.
    Fallback,
}

/// Published output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    /// Sequence identifier.
    #[serde(rename = "Accession")]
    pub accession: String,
    /// Residues of the sequence.
    #[serde(rename = "Sequence")]
    pub sequence: String,
    /// Predictor that produced the score.
    #[serde(rename = "Predictor")]
    pub predictor: String,
    /// Resolved solubility score.
    #[serde(rename = "SolubilityScore")]
    pub solubility_score: f64,
    /// Equal to the score.
    #[serde(rename = "Probability_Soluble")]
    pub probability_soluble: f64,
    /// `1 - score`.
    #[serde(rename = "Probability_Insoluble")]
    pub probability_insoluble: f64,
}

/// Canonical rows plus the provenance of each score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedTable {
    rows: Vec<CanonicalRow>,
    sources: Vec<ScoreSource>,
}

impl NormalizedTable {
    /// Canonical rows in raw table order.
    pub fn rows(&self) -> &[CanonicalRow] {
        &self.rows
    }

    /// Score provenance, parallel to [`NormalizedTable::rows`].
    pub fn sources(&self) -> &[ScoreSource] {
        &self.sources
    }

    /// Accessions whose score came from the `0.0` fallback.
    pub fn degraded(&self) -> Vec<&str> {
        self.rows
            .iter()
            .zip(&self.sources)
            .filter(|(_, source)| **source == ScoreSource::Fallback)
            .map(|(row, _)| row.accession.as_str())
            .collect()
    }

    /// Summary for the report sidecar.
    pub fn report(&self, predictor: &str) -> NormalizationReport {
        let count = |wanted: ScoreSource| {
            self.sources
                .iter()
                .filter(|source| **source == wanted)
                .count()
        };
        NormalizationReport {
            predictor: predictor.to_string(),
            rows: self.rows.len(),
            explicit: count(ScoreSource::Explicit),
            probability: count(ScoreSource::Probability),
            label: count(ScoreSource::Label),
            degraded: self.degraded().into_iter().map(str::to_string).collect(),
        }
    }
}

/// Per-run normalization summary written beside the canonical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationReport {
    /// Predictor name stamped on the rows.
    pub predictor: String,
    /// Canonical rows written.
    pub rows: usize,
    /// Rows scored from `SolubilityScore`.
    pub explicit: usize,
    /// Rows scored from `probability`.
    pub probability: usize,
    /// Rows scored from `pred_label`.
    pub label: usize,
    /// Accessions that fell back to `0.0`.
    pub degraded: Vec<String>,
}

impl NormalizationReport {
    /// Writes the report as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<(), NormalizeError> {
        let file = File::create(path).map_err(|source| NormalizeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|source| {
            NormalizeError::Report {
                path: path.to_path_buf(),
                source,
            }
        })?;
        writer.flush().map_err(|source| NormalizeError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Sidecar path for the report of a table written at `output`.
pub fn report_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".report.json");
    PathBuf::from(name)
}

/// Errors raised while normalizing scorer output.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// A raw row names a sequence the input never contained.
    #[error("raw row {row} names accession {accession:?}, which is not in the input")]
    UnmatchedAccession {
        /// Offending accession.
        accession: String,
        /// Zero-based raw row index.
        row: usize,
    },
    /// The same accession appears on more than one raw row.
    #[error("raw row {row} repeats accession {accession:?}")]
    DuplicateAccession {
        /// Repeated accession.
        accession: String,
        /// Zero-based index of the repeat.
        row: usize,
    },
    /// The scorer produced no row for some input sequences.
    #[error(
        "scorer produced no row for {} input sequences (first: {})",
        .missing.len(),
        .missing.first().map(String::as_str).unwrap_or("-")
    )]
    MissingRows {
        /// Input accessions without a raw row, in input order.
        missing: Vec<String>,
    },
    /// The raw table has neither an `Accession` nor a `name` column.
    #[error("raw row {row} has no Accession or name column")]
    MissingAccessionColumn {
        /// Zero-based raw row index.
        row: usize,
    },
    /// The accession cell is present but empty.
    #[error("raw row {row} has an empty accession")]
    EmptyAccession {
        /// Zero-based raw row index.
        row: usize,
    },
    /// A numeric score field holds something other than a finite number.
    #[error("{column} for {accession:?} is not a finite number: {value:?}")]
    InvalidNumber {
        /// Row accession.
        accession: String,
        /// Column name.
        column: String,
        /// Cell content.
        value: String,
    },
    /// Reading or writing a CSV table failed.
    #[error("csv table {path:?}: {source}")]
    Csv {
        /// Table path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: csv::Error,
    },
    /// Filesystem failure around the output files.
    #[error("{path:?}: {source}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The report could not be serialized.
    #[error("failed to write report {path:?}: {source}")]
    Report {
        /// Report path.
        path: PathBuf,
        /// Serializer failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Knobs for the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationConfig {
    /// Value of the `Predictor` column.
    pub predictor: String,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            predictor: DEFAULT_PREDICTOR.to_string(),
        }
    }
}

/// Stateless raw-to-canonical row mapper.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizationConfig,
}

impl Normalizer {
    /// Builds a new normalizer instance.
    pub fn new(config: NormalizationConfig) -> Self {
        Self { config }
    }

    /// Returns the underlying config reference.
    pub fn config(&self) -> &NormalizationConfig {
        &self.config
    }

    /// Maps every raw row to a canonical row, preserving row order.
    ///
    /// Raw rows and input sequences must correspond one to one: an unknown,
    /// repeated or missing accession is an error, never a dropped row.
    pub fn normalize(
        &self,
        raw_rows: &[RawRow],
        sequences: &SequenceIndex,
    ) -> Result<NormalizedTable, NormalizeError> {
        let mut table = NormalizedTable {
            rows: Vec::with_capacity(raw_rows.len()),
            sources: Vec::with_capacity(raw_rows.len()),
        };
        let mut seen = HashSet::with_capacity(raw_rows.len());

        for (index, row) in raw_rows.iter().enumerate() {
            let accession = accession_of(row, index)?;
            let sequence =
                sequences
                    .get(accession)
                    .ok_or_else(|| NormalizeError::UnmatchedAccession {
                        accession: accession.to_string(),
                        row: index,
                    })?;
            if !seen.insert(accession) {
                return Err(NormalizeError::DuplicateAccession {
                    accession: accession.to_string(),
                    row: index,
                });
            }
            let evidence = ScoreEvidence::from_row(row, accession)?;
            if evidence == ScoreEvidence::Missing {
                warn!(accession, row = index, "no usable score column, defaulting to 0.0");
            }
            let score = evidence.score();
            table.rows.push(CanonicalRow {
                accession: accession.to_string(),
                sequence: sequence.to_string(),
                predictor: self.config.predictor.clone(),
                solubility_score: score,
                probability_soluble: score,
                probability_insoluble: 1.0 - score,
            });
            table.sources.push(evidence.source());
        }

        let missing: Vec<String> = sequences
            .ids()
            .iter()
            .filter(|id| !seen.contains(id.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(NormalizeError::MissingRows { missing });
        }
        debug!(rows = table.rows.len(), "normalized raw predictions");
        Ok(table)
    }
}

fn accession_of(row: &RawRow, index: usize) -> Result<&str, NormalizeError> {
    let column = if row.has_column(ACCESSION_COLUMN) {
        ACCESSION_COLUMN
    } else if row.has_column(NAME_COLUMN) {
        NAME_COLUMN
    } else {
        return Err(NormalizeError::MissingAccessionColumn { row: index });
    };
    row.get(column)
        .ok_or(NormalizeError::EmptyAccession { row: index })
}

/// Reads the scorer's raw CSV table.
pub fn read_raw_table(path: &Path) -> Result<Vec<RawRow>, NormalizeError> {
    let csv_err = |source| NormalizeError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(RawRow::from_pairs(
            headers.iter().zip(record.iter()).map(|(key, value)| (key.trim(), value)),
        ));
    }
    Ok(rows)
}

/// Writes `rows` to `path` under the canonical header.
///
/// The table is written to `<path>.partial` and renamed into place once
/// complete; parent directories are created as needed.
pub fn write_canonical_table(path: &Path, rows: &[CanonicalRow]) -> Result<(), NormalizeError> {
    let io_err = |source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let partial = partial_path(path);
    if let Err(err) = write_rows(&partial, rows) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }
    fs::rename(&partial, path).map_err(io_err)
}

/// Publishes the canonical table and its report sidecar together.
///
/// Both files are written under `.partial` names first. The report is renamed
/// into place before the table, so a table at `output` always has its report.
/// On any failure neither file is left behind.
pub fn write_canonical_outputs(
    output: &Path,
    rows: &[CanonicalRow],
    report: &NormalizationReport,
) -> Result<(), NormalizeError> {
    let io_err = |path: &Path, source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| io_err(parent, source))?;
    }
    let sidecar = report_path(output);
    let table_partial = partial_path(output);
    let report_partial = partial_path(&sidecar);
    let discard = || {
        let _ = fs::remove_file(&table_partial);
        let _ = fs::remove_file(&report_partial);
    };

    let written = write_rows(&table_partial, rows).and_then(|()| report.write_to(&report_partial));
    if let Err(err) = written {
        discard();
        return Err(err);
    }
    if let Err(source) = fs::rename(&report_partial, &sidecar) {
        discard();
        return Err(io_err(&sidecar, source));
    }
    if let Err(source) = fs::rename(&table_partial, output) {
        discard();
        let _ = fs::remove_file(&sidecar);
        return Err(io_err(output, source));
    }
    Ok(())
}

fn write_rows(path: &Path, rows: &[CanonicalRow]) -> Result<(), NormalizeError> {
    let csv_err = |source| NormalizeError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(csv_err)?;
    writer.write_record(CANONICAL_HEADER).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

//! Run directory layout and artifact persistence.
//!
//! A run lives at `<data_dir>/<owner>/<name>/eval/<run_id>/`. JSON artifacts
//! are canonical, pretty-printed and written atomically (temp file in the
//! target directory, then persist). The record log is the only file that
//! grows: [`RecordLog::append`] opens it once per item and writes exactly one
//! compact canonical line.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use routing_history::PrNumber;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::domain::digest::{canonical_json, canonical_json_pretty, sha256_hex};
use crate::domain::{EvalError, PerPrRecord, Result};

pub const EVAL_DIR: &str = "eval";
pub const COMPARE_DIR: &str = "_compare";

pub const PER_PR_JSONL: &str = "per_pr.jsonl";
pub const REPORT_JSON: &str = "report.json";
pub const REPORT_MD: &str = "report.md";
pub const MANIFEST_JSON: &str = "manifest.json";
pub const COHORT_JSON: &str = "cohort.json";
pub const RUN_SUMMARY_JSON: &str = "run_summary.json";
pub const COMPARE_SUMMARY_JSON: &str = "compare_summary.json";

pub const PRS_DIR: &str = "prs";
pub const INPUTS_TEMPLATE: &str = "prs/{pr_number}/inputs.json";
pub const ROUTE_TEMPLATE: &str = "prs/{pr_number}/routes/{predictor_id}.json";

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<data_dir>/<owner>/<name>`.
pub fn repo_dir(data_dir: &Path, repo: &str) -> PathBuf {
    repo.split('/')
        .filter(|part| !part.is_empty())
        .fold(data_dir.to_path_buf(), |acc, part| acc.join(part))
}

/// `<data_dir>/<owner>/<name>/eval`.
pub fn eval_root(data_dir: &Path, repo: &str) -> PathBuf {
    repo_dir(data_dir, repo).join(EVAL_DIR)
}

/// `<eval_root>/_compare/<baseline>__vs__<candidate>`.
pub fn compare_dir(data_dir: &Path, repo: &str, baseline_run_id: &str, candidate_run_id: &str) -> PathBuf {
    eval_root(data_dir, repo)
        .join(COMPARE_DIR)
        .join(format!("{baseline_run_id}__vs__{candidate_run_id}"))
}

/// File-name-safe form of a predictor id.
pub fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

/// Handle on one run's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(data_dir: &Path, repo: &str, run_id: &str) -> Self {
        Self {
            root: eval_root(data_dir, repo).join(run_id),
        }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Create the run directory, refusing one left by an earlier run.
    pub fn create_new(&self) -> Result<()> {
        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir(&self.root).map_err(|e| already_exists(e, &self.root))
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn per_pr(&self) -> PathBuf {
        self.file(PER_PR_JSONL)
    }

    pub fn report_json(&self) -> PathBuf {
        self.file(REPORT_JSON)
    }

    pub fn report_md(&self) -> PathBuf {
        self.file(REPORT_MD)
    }

    pub fn manifest(&self) -> PathBuf {
        self.file(MANIFEST_JSON)
    }

    pub fn cohort(&self) -> PathBuf {
        self.file(COHORT_JSON)
    }

    pub fn run_summary(&self) -> PathBuf {
        self.file(RUN_SUMMARY_JSON)
    }

    pub fn pr_dir(&self, pr_number: PrNumber) -> PathBuf {
        self.root.join(PRS_DIR).join(pr_number.to_string())
    }

    pub fn inputs(&self, pr_number: PrNumber) -> PathBuf {
        self.pr_dir(pr_number).join("inputs.json")
    }

    pub fn route(&self, pr_number: PrNumber, predictor_id: &str) -> PathBuf {
        self.pr_dir(pr_number)
            .join("routes")
            .join(format!("{}.json", file_safe(predictor_id)))
    }
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Write bytes via a sibling temp file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write a document as canonical pretty JSON. Returns the file's sha256.
pub fn write_json<T: Serialize>(path: &Path, doc: &T) -> Result<String> {
    let text = canonical_json_pretty(&serde_json::to_value(doc)?)?;
    write_atomic(path, text.as_bytes())?;
    Ok(sha256_hex(text.as_bytes()))
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    write_atomic(path, text.as_bytes())
}

/// Read a typed JSON document; a missing file is [`EvalError::MissingArtifact`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(EvalError::MissingArtifact(path.display().to_string()));
    }
    Ok(serde_json::from_slice(&std::fs::read(path)?)?)
}

/// Read a JSON object leniently: missing, unparsable or non-object files are `None`.
pub fn read_json_object(path: &Path) -> Option<serde_json::Map<String, serde_json::Value>> {
    let raw = std::fs::read(path).ok()?;
    match serde_json::from_slice(&raw).ok()? {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// sha256 of a file's bytes, `None` when absent.
pub fn file_sha256(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(sha256_hex(&std::fs::read(path)?)))
}

fn already_exists(err: std::io::Error, path: &Path) -> EvalError {
    if err.kind() == std::io::ErrorKind::AlreadyExists {
        EvalError::RunExists(path.display().to_string())
    } else {
        EvalError::Io(err)
    }
}

// ---------------------------------------------------------------------------
// Record log
// ---------------------------------------------------------------------------

/// Append-only writer for `per_pr.jsonl`.
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    appended: usize,
}

impl RecordLog {
    /// Start an empty log at `path`. An existing log is never truncated.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| already_exists(e, &path))?;
        Ok(Self { path, appended: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Append one record as a single canonical line.
    pub fn append(&mut self, record: &PerPrRecord) -> Result<()> {
        let mut line = canonical_json(&serde_json::to_value(record)?)?;
        line.push('\n');
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        self.appended += 1;
        Ok(())
    }
}

/// Parse every non-blank line of a record log.
pub fn read_records(path: &Path) -> Result<Vec<PerPrRecord>> {
    if !path.is_file() {
        return Err(EvalError::MissingArtifact(path.display().to_string()));
    }
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

/// Non-blank rows of a JSONL file; 0 when absent.
pub fn count_jsonl_rows(path: &Path) -> Result<usize> {
    if !path.is_file() {
        return Ok(0);
    }
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut n = 0;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            n += 1;
        }
    }
    Ok(n)
}

/// Raw JSONL rows as loose JSON values, skipping unparsable lines.
pub fn read_jsonl_values(path: &Path) -> Result<Vec<serde_json::Value>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str(&line) {
            out.push(value);
        }
    }
    Ok(out)
}

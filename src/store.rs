//! In-memory record store of one realm.
//!
//! The store is a cache of the realm's bibliography file: it is rebuilt from
//! the file on load and written back after every mutation.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::record::{bibtex, BibtexError, Record, ENTRYTYPE_FIELD};

/// Minimum length of every search term.
pub const MIN_QUERY_TERM: usize = 3;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Malformed bibliography: {0}")]
    Parse(#[from] BibtexError),

    #[error("Each search term must be at least {MIN_QUERY_TERM} characters: {0:?}")]
    QueryTooShort(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A validated search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    terms: Vec<String>,
}

impl SearchQuery {
    /// Split on whitespace; every term must be at least three characters.
    pub fn parse(query: &str) -> Result<Self> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();

        if terms.is_empty() {
            return Err(StoreError::QueryTooShort(query.to_string()));
        }
        if let Some(short) = terms.iter().find(|t| t.chars().count() < MIN_QUERY_TERM) {
            return Err(StoreError::QueryTooShort(short.clone()));
        }

        Ok(Self { terms })
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Every term occurs in some field other than the entry type.
    pub fn matches(&self, record: &Record) -> bool {
        let values: Vec<String> = record
            .fields()
            .filter(|(name, _)| *name != ENTRYTYPE_FIELD)
            .map(|(_, value)| value.to_lowercase())
            .collect();

        self.terms
            .iter()
            .all(|term| values.iter().any(|v| v.contains(term.as_str())))
    }
}

/// Ordered collection of records with unique IDs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordStore {
    records: Vec<Record>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.upsert(record);
        }
        store
    }

    /// Read a bibliography file; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)?;
        Ok(Self::from_records(bibtex::parse(&text)?))
    }

    /// Write the store as BibTeX, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("bib.tmp");
        let written = fs::write(&tmp, self.to_bibtex()).and_then(|_| fs::rename(&tmp, path));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                debug!(path = %tmp.display(), error = %cleanup, "Could not remove temporary file");
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn to_bibtex(&self) -> String {
        bibtex::render_all(&self.records)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record with exactly this ID.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Record for a citation key: an exact match, else the first record whose
    /// ID extends the key or is a prefix of it.
    pub fn lookup(&self, key: &str) -> Option<&Record> {
        if key.is_empty() {
            return None;
        }
        self.get(key).or_else(|| {
            self.records
                .iter()
                .find(|r| r.id().starts_with(key) || key.starts_with(r.id()))
        })
    }

    pub fn search(&self, query: &SearchQuery) -> Vec<&Record> {
        self.records.iter().filter(|r| query.matches(r)).collect()
    }

    /// Append a record whose ID is not yet taken; returns false otherwise.
    pub fn insert(&mut self, record: Record) -> bool {
        if self.contains(record.id()) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Replace the record with ID `id` in place; returns the old record.
    pub fn replace(&mut self, id: &str, record: Record) -> Option<Record> {
        let pos = self.records.iter().position(|r| r.id() == id)?;
        Some(std::mem::replace(&mut self.records[pos], record))
    }

    pub fn remove(&mut self, id: &str) -> Option<Record> {
        let pos = self.records.iter().position(|r| r.id() == id)?;
        Some(self.records.remove(pos))
    }

    fn upsert(&mut self, record: Record) {
        let id = record.id().to_string();
        if self.replace(&id, record.clone()).is_none() {
            self.records.push(record);
        }
    }
}

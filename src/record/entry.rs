//! Bibliography record value type.
//!
//! A record is a flat map from field name to string value with a mandatory
//! `ID` field (the citation key). Field names are case-insensitive: `ID` and
//! `ENTRYTYPE` keep their canonical spelling, every other name is stored
//! lower-cased. Records are immutable values - changing one means replacing
//! it as a whole.
//!
//! Every record is normalized to the form the BibTeX reader produces: the
//! entry type is lower-cased (`misc` when absent) and whitespace runs in
//! values collapse to one space. Keys, names and values that could not be
//! read back from a bibliography file are rejected.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field holding the citation key.
pub const ID_FIELD: &str = "ID";

/// Field holding the BibTeX entry type (`article`, `book`, ...).
pub const ENTRYTYPE_FIELD: &str = "ENTRYTYPE";

/// Entry type given to records that carry none.
pub const DEFAULT_ENTRY_TYPE: &str = "misc";

/// Entry kinds the BibTeX reader treats as directives, not records.
const RESERVED_ENTRY_TYPES: &[&str] = &["comment", "preamble", "string"];

/// Untyped field map as it arrives on the wire.
pub type FieldMap = BTreeMap<String, String>;

/// Record validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record has no ID field")]
    MissingId,

    #[error("record ID is empty")]
    EmptyId,

    #[error("record ID {0:?} cannot be written as a citation key")]
    InvalidId(String),

    #[error("field name {0:?} cannot be written to a bibliography")]
    InvalidFieldName(String),

    #[error("entry type {0:?} cannot be written to a bibliography")]
    InvalidEntryType(String),

    #[error("field {0:?} has unbalanced braces")]
    UnbalancedBraces(String),
}

/// Map a field name onto its canonical spelling.
pub fn normalize_field_name(name: &str) -> String {
    let name = name.trim();
    if name.eq_ignore_ascii_case(ID_FIELD) {
        ID_FIELD.to_string()
    } else if name.eq_ignore_ascii_case(ENTRYTYPE_FIELD) {
        ENTRYTYPE_FIELD.to_string()
    } else {
        name.to_lowercase()
    }
}

/// Collapse whitespace runs to single spaces and trim the ends.
pub fn normalize_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Characters a field name or entry type may use.
fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || "_-:.+/'".contains(c)
}

fn is_key_char(c: char) -> bool {
    !c.is_whitespace() && !c.is_control() && !"{}(),\"#%@=\\".contains(c)
}

/// Braces open and close in order and all of them close.
fn braces_balance(value: &str) -> bool {
    let mut depth = 0usize;
    for c in value.chars() {
        match c {
            '{' => depth += 1,
            '}' => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            _ => {}
        }
    }
    depth == 0
}

/// A single bibliography entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FieldMap", into = "FieldMap")]
pub struct Record {
    fields: FieldMap,
}

impl Record {
    /// Create a record with just an ID and an entry type.
    pub fn new(id: impl Into<String>, entry_type: impl Into<String>) -> Result<Self, RecordError> {
        let mut fields = FieldMap::new();
        fields.insert(ID_FIELD.to_string(), id.into());
        fields.insert(ENTRYTYPE_FIELD.to_string(), entry_type.into());
        Self::try_from(fields)
    }

    /// Build a record from arbitrary `(name, value)` pairs.
    pub fn from_fields<I, K, V>(fields: I) -> Result<Self, RecordError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let map = fields
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .collect::<FieldMap>();
        Self::try_from(map)
    }

    /// Build a record from a wire map, using `fallback_id` when the map has no ID.
    pub fn from_map_or_key(mut map: FieldMap, fallback_id: &str) -> Result<Self, RecordError> {
        let has_id = map.keys().any(|k| k.trim().eq_ignore_ascii_case(ID_FIELD));
        if !has_id {
            map.insert(ID_FIELD.to_string(), fallback_id.to_string());
        }
        Self::try_from(map)
    }

    /// Return a copy with one field set (builder style).
    ///
    /// A name or value that would make an invalid record leaves the record
    /// unchanged.
    pub fn with_field(self, name: &str, value: impl Into<String>) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(name.to_string(), value.into());
        Self::try_from(fields).unwrap_or(self)
    }

    /// The citation key.
    pub fn id(&self) -> &str {
        // Present by construction.
        self.fields.get(ID_FIELD).map(String::as_str).unwrap_or_default()
    }

    /// The BibTeX entry type, if recorded.
    pub fn entry_type(&self) -> Option<&str> {
        self.fields.get(ENTRYTYPE_FIELD).map(String::as_str)
    }

    /// Value of a field (name is case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(&normalize_field_name(name)).map(String::as_str)
    }

    /// Whether the record has a field (name is case-insensitive).
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(&normalize_field_name(name))
    }

    /// All fields including `ID` and `ENTRYTYPE`, in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// All field names including `ID` and `ENTRYTYPE`, in name order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Whether both records carry exactly the same set of field names.
    pub fn same_field_names(&self, other: &Record) -> bool {
        self.fields.len() == other.fields.len()
            && self.fields.keys().zip(other.fields.keys()).all(|(a, b)| a == b)
    }

    /// Number of fields including `ID`.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Records always carry an ID, so they are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &FieldMap {
        &self.fields
    }
}

impl TryFrom<FieldMap> for Record {
    type Error = RecordError;

    fn try_from(raw: FieldMap) -> Result<Self, Self::Error> {
        let mut fields = FieldMap::new();

        for (name, value) in raw {
            let name = normalize_field_name(&name);
            let value = match name.as_str() {
                ID_FIELD => value.trim().to_string(),
                ENTRYTYPE_FIELD => value.trim().to_lowercase(),
                _ => normalize_value(&value),
            };

            if name != ID_FIELD && name != ENTRYTYPE_FIELD {
                if name.is_empty() || !name.chars().all(is_name_char) {
                    return Err(RecordError::InvalidFieldName(name));
                }
                if !braces_balance(&value) {
                    return Err(RecordError::UnbalancedBraces(name));
                }
            }
            fields.insert(name, value);
        }

        match fields.get(ID_FIELD) {
            None => return Err(RecordError::MissingId),
            Some(id) if id.is_empty() => return Err(RecordError::EmptyId),
            Some(id) if !id.chars().all(is_key_char) => return Err(RecordError::InvalidId(id.clone())),
            Some(_) => {}
        }

        let entry_type = fields
            .entry(ENTRYTYPE_FIELD.to_string())
            .or_insert_with(|| DEFAULT_ENTRY_TYPE.to_string());
        let reserved = RESERVED_ENTRY_TYPES.contains(&entry_type.as_str());
        if entry_type.is_empty() || reserved || !entry_type.chars().all(is_name_char) {
            return Err(RecordError::InvalidEntryType(entry_type.clone()));
        }

        Ok(Self { fields })
    }
}

impl From<Record> for FieldMap {
    fn from(record: Record) -> Self {
        record.fields
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

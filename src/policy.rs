//! Admission policy for new and replaced records.
//!
//! A deployment injects one gate at startup; it is shared by every realm and
//! must not have side effects. Forced writes skip it.

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    Reject(String),
}

impl PolicyDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, PolicyDecision::Accept)
    }
}

/// Domain-specific veto over records entering a realm.
pub trait PolicyGate: Send + Sync {
    /// Judge `candidate` given the records already in the realm.
    fn check(&self, candidate: &Record, existing: &[Record]) -> PolicyDecision;
}

/// Gate that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PolicyGate for AcceptAll {
    fn check(&self, _candidate: &Record, _existing: &[Record]) -> PolicyDecision {
        PolicyDecision::Accept
    }
}

/// Gate that rejects records lacking any of a set of fields.
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| crate::record::normalize_field_name(f.as_ref()))
                .collect(),
        }
    }
}

impl PolicyGate for RequiredFields {
    fn check(&self, candidate: &Record, _existing: &[Record]) -> PolicyDecision {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| candidate.get(f).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            PolicyDecision::Accept
        } else {
            PolicyDecision::Reject(format!("missing required field(s): {}", missing.join(", ")))
        }
    }
}

/// A record turned away by the gate, annotated with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRejection {
    #[serde(flatten)]
    pub record: Record,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all() {
        let record = Record::new("a", "misc").unwrap();
        assert!(AcceptAll.check(&record, &[]).is_accept());
    }

    #[test]
    fn test_required_fields() {
        let gate = RequiredFields::new(["Title", "year"]);

        let complete = Record::new("a", "article")
            .unwrap()
            .with_field("title", "Foo")
            .with_field("year", "2020");
        assert!(gate.check(&complete, &[]).is_accept());

        let partial = Record::new("b", "article").unwrap().with_field("title", "Foo");
        assert_eq!(
            gate.check(&partial, &[]),
            PolicyDecision::Reject("missing required field(s): year".into())
        );
    }

    #[test]
    fn test_rejection_wire_shape() {
        let rejection = PolicyRejection {
            record: Record::new("a", "misc").unwrap(),
            reason: "nope".into(),
        };

        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ID": "a", "ENTRYTYPE": "misc", "reason": "nope"})
        );
    }
}

//! Bibliography record types.
//!
//! Records are the unit of everything the server stores, classifies and
//! returns. The BibTeX codec is used for the on-disk bibliography file and
//! for the text responses clients paste into their projects.

pub mod bibtex;
pub mod entry;

pub use bibtex::BibtexError;
pub use entry::{
    normalize_field_name, normalize_value, FieldMap, Record, RecordError, DEFAULT_ENTRY_TYPE, ENTRYTYPE_FIELD, ID_FIELD,
};

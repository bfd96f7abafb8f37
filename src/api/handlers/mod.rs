//! API request handlers.

pub mod entries;
pub mod query;
pub mod status;
pub mod sync;

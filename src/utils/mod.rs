//! Shared utility functions.

pub mod json;

pub use json::{extract_json_object, find_matching_brace, schema_version};

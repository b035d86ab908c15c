//! Document values
//!
//! Minimal dynamically-typed values for the documents carried by buffered
//! transaction operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single field value inside a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// An ordered field-name to value mapping
pub type Document = BTreeMap<String, Value>;

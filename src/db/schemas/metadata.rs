//! Storage bookkeeping shared by every document
//!
//! Domain timestamps (claimed, delivered, confirmed) live on the documents
//! themselves; these only say when the row was inserted and last written.

use bson::DateTime;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_at: Option<DateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_at: Option<DateTime>,
}

impl Metadata {
    pub fn new() -> Self {
        let mut metadata = Self::default();
        metadata.stamp_insert();
        metadata
    }

    /// Mark both timestamps as now, for a fresh insert
    pub fn stamp_insert(&mut self) {
        let now = DateTime::now();
        self.inserted_at = Some(now);
        self.written_at = Some(now);
    }
}

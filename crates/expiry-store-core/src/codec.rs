//! JSON encoding of `Document`.
//!
//! Records are written as an array sorted by id. Key order inside each record
//! follows the struct declaration, so identical content always produces
//! identical bytes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{Document, SCHEMA_VERSION};
use crate::error::StoreError;
use crate::record::Record;

#[derive(Serialize)]
struct DocumentOut<'a> {
    schema_version: u32,
    document_updated_at: Option<&'a DateTime<Utc>>,
    records: Vec<&'a Record>,
}

#[derive(Deserialize)]
struct DocumentHeader {
    schema_version: u32,
    #[serde(default)]
    document_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    records: Vec<serde_json::Value>,
}

/// Encode a document. Pure and deterministic.
pub fn encode(document: &Document) -> Result<Vec<u8>, StoreError> {
    let out = DocumentOut {
        schema_version: document.schema_version,
        document_updated_at: document.document_updated_at.as_ref(),
        records: document.records.values().collect(),
    };
    let mut bytes = serde_json::to_vec_pretty(&out).map_err(|e| {
        StoreError::Serialization(format!("Failed to serialize document: {}", e))
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode and validate a document.
///
/// Fails with `CorruptStore` on malformed JSON, an unsupported schema version,
/// duplicate ids, or a record violating its invariants.
pub fn decode(bytes: &[u8]) -> Result<Document, StoreError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(StoreError::corrupt(None, "document is empty"));
    }

    let header: DocumentHeader = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::corrupt(None, format!("Failed to parse document: {}", e)))?;

    if header.schema_version == 0 || header.schema_version > SCHEMA_VERSION {
        return Err(StoreError::corrupt(
            None,
            format!(
                "unsupported schema_version {} (supported 1..={})",
                header.schema_version, SCHEMA_VERSION
            ),
        ));
    }

    let mut records = BTreeMap::new();
    for (position, value) in header.records.into_iter().enumerate() {
        let raw_id = value
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("<record {}>", position));

        let record: Record = serde_json::from_value(value).map_err(|e| {
            StoreError::corrupt(Some(&raw_id), format!("Failed to parse record: {}", e))
        })?;
        record
            .check_invariants()
            .map_err(|reason| StoreError::corrupt(Some(&raw_id), reason))?;

        if records.contains_key(&record.id) {
            return Err(StoreError::corrupt(Some(&raw_id), "duplicate id"));
        }
        records.insert(record.id.clone(), record);
    }

    Ok(Document {
        schema_version: header.schema_version,
        records,
        document_updated_at: header.document_updated_at,
    })
}

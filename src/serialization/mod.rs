//! Versioned postcard envelopes for persisted store records.
//!
//! Every record written to the persistence backend is wrapped as:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "SKRC"              u32                postcard::to_allocvec(T)
//! ```
//!
//! A magic or version mismatch is reported as a persistence error; hydration
//! skips such entries and the next refresh rewrites them.
//!
//! ```rust
//! use sync_kit::serialization::{encode_record, decode_record};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Module { id: u64, name: String }
//!
//! # fn main() -> sync_kit::Result<()> {
//! let module = Module { id: 1, name: "Week 1".to_string() };
//! let bytes = encode_record(&module)?;
//! let decoded: Module = decode_record(&bytes)?;
//! assert_eq!(module, decoded);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Magic header for persisted records: b"SKRC"
pub const RECORD_MAGIC: [u8; 4] = *b"SKRC";

/// Current schema version of persisted records.
///
/// Bump when the stored layout changes (record fields, key membership format).
/// Old entries then fail to decode and are dropped during hydration.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope around a persisted value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordEnvelope<T> {
    pub magic: [u8; 4],
    pub version: u32,
    pub payload: T,
}

impl<T> RecordEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: RECORD_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Encode a value for the persistence backend.
///
/// # Errors
///
/// Returns `Error::Persistence` if postcard encoding fails.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let envelope = RecordEnvelope::new(value);
    postcard::to_allocvec(&envelope).map_err(|e| {
        log::error!("Record encoding failed: {}", e);
        Error::Persistence(format!("encode: {}", e))
    })
}

/// Decode a value read back from the persistence backend.
///
/// # Errors
///
/// Returns `Error::Persistence` on a corrupted payload, bad magic or a schema
/// version mismatch.
pub fn decode_record<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    let envelope: RecordEnvelope<T> = postcard::from_bytes(bytes).map_err(|e| {
        log::error!("Record decoding failed: {}", e);
        Error::Persistence(format!("decode: {}", e))
    })?;

    if envelope.magic != RECORD_MAGIC {
        log::warn!(
            "Invalid stored record: expected magic {:?}, got {:?}",
            RECORD_MAGIC,
            envelope.magic
        );
        return Err(Error::Persistence(format!(
            "invalid magic {:?}",
            envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        log::warn!(
            "Stored record version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION,
            envelope.version
        );
        return Err(Error::Persistence(format!(
            "schema version {} (expected {})",
            envelope.version, CURRENT_SCHEMA_VERSION
        )));
    }

    Ok(envelope.payload)
}

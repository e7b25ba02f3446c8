//! Hash chain utilities for audit integrity

use crate::audit::AuditLogEntry;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex-encoded SHA-256 of `bytes`
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Serialize `value` as compact JSON with object keys sorted at every depth
///
/// The output does not depend on map insertion order, so it is safe to hash.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Fingerprint of a request body for idempotency comparisons
pub fn request_hash(request: &Value) -> String {
    sha256_hex(canonical_json(request))
}

/// Timestamp text as stored and hashed in the audit log
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Hash of one audit entry: `H(prev_hash ‖ canonical(record))`
///
/// The first entry of a tenant has no predecessor and hashes with an empty prefix.
pub fn entry_hash(
    prev_hash: Option<&str>,
    tenant_id: &str,
    actor_id: &str,
    action: &str,
    payload: &Value,
    created_at: &str,
) -> String {
    let record = json!({
        "action": action,
        "actorId": actor_id,
        "createdAt": created_at,
        "payload": payload,
        "tenantId": tenant_id,
    });

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(canonical_json(&record).as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the stored hash of `entry`
pub fn calculate_entry_hash(entry: &AuditLogEntry) -> String {
    entry_hash(
        entry.prev_hash.as_deref(),
        &entry.tenant_id,
        &entry.actor_id,
        &entry.action,
        &entry.payload,
        &entry.created_at,
    )
}

/// Where and how a chain failed verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Entry {entry_id} has sequence {actual}, expected {expected}")]
    InvalidSequence {
        entry_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Entry {entry_id} does not link to its predecessor")]
    BrokenLink { entry_id: String },

    #[error("Entry {entry_id} hash does not match its contents")]
    InvalidHash { entry_id: String },
}

impl ChainError {
    /// Id of the first entry that failed
    pub fn entry_id(&self) -> &str {
        match self {
            ChainError::InvalidSequence { entry_id, .. }
            | ChainError::BrokenLink { entry_id }
            | ChainError::InvalidHash { entry_id } => entry_id,
        }
    }
}

/// Verify one tenant's entries, ordered by sequence, from the first entry
pub fn verify_chain(entries: &[AuditLogEntry]) -> Result<(), ChainError> {
    let mut prev_hash: Option<&str> = None;

    for (i, entry) in entries.iter().enumerate() {
        let expected = i as i64 + 1;
        if entry.seq != expected {
            return Err(ChainError::InvalidSequence {
                entry_id: entry.id.clone(),
                expected,
                actual: entry.seq,
            });
        }

        if entry.prev_hash.as_deref() != prev_hash {
            return Err(ChainError::BrokenLink {
                entry_id: entry.id.clone(),
            });
        }

        if calculate_entry_hash(entry) != entry.hash {
            return Err(ChainError::InvalidHash {
                entry_id: entry.id.clone(),
            });
        }

        prev_hash = Some(&entry.hash);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chain(len: usize) -> Vec<AuditLogEntry> {
        let mut entries: Vec<AuditLogEntry> = Vec::new();
        for i in 0..len {
            let prev_hash = entries.last().map(|e| e.hash.clone());
            let created_at = format_timestamp(Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, i as u32).unwrap());
            let payload = json!({ "amountMinorUnits": 100 * (i + 1) });
            let hash = entry_hash(prev_hash.as_deref(), "org-1", "system", "contribution.applied", &payload, &created_at);
            entries.push(AuditLogEntry {
                id: format!("entry-{}", i + 1),
                tenant_id: "org-1".to_string(),
                seq: i as i64 + 1,
                actor_id: "system".to_string(),
                action: "contribution.applied".to_string(),
                payload,
                prev_hash,
                hash,
                created_at,
            });
        }
        entries
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({ "b": 1, "a": { "z": [1, { "y": true, "x": null }], "c": "s" } });
        assert_eq!(canonical_json(&a), r#"{"a":{"c":"s","z":[1,{"x":null,"y":true}]},"b":1}"#);
    }

    #[test]
    fn test_request_hash_ignores_key_order() {
        let a = json!({ "tenantId": "org-1", "amountMinorUnits": 5 });
        let b = json!({ "amountMinorUnits": 5, "tenantId": "org-1" });
        assert_eq!(request_hash(&a), request_hash(&b));
        assert_ne!(request_hash(&a), request_hash(&json!({ "tenantId": "org-1", "amountMinorUnits": 6 })));
    }

    #[test]
    fn test_timestamp_has_microseconds() {
        let at = Utc.with_ymd_and_hms(2025, 3, 12, 1, 2, 3).unwrap();
        assert_eq!(format_timestamp(at), "2025-03-12T01:02:03.000000Z");
    }

    #[test]
    fn test_prev_hash_changes_entry_hash() {
        let payload = json!({});
        let genesis = entry_hash(None, "org-1", "a", "x", &payload, "t");
        let linked = entry_hash(Some("abc"), "org-1", "a", "x", &payload, "t");
        assert_ne!(genesis, linked);
        assert_eq!(genesis.len(), 64);
    }

    #[test]
    fn test_valid_chain() {
        assert!(verify_chain(&chain(5)).is_ok());
        assert!(verify_chain(&[]).is_ok());
    }

    #[test]
    fn test_tampered_payload_detected() {
        let mut entries = chain(4);
        entries[2].payload = json!({ "amountMinorUnits": 1 });

        let err = verify_chain(&entries).unwrap_err();
        assert_eq!(err.entry_id(), "entry-3");
        assert!(matches!(err, ChainError::InvalidHash { .. }));
    }

    #[test]
    fn test_removed_entry_detected() {
        let mut entries = chain(4);
        entries.remove(1);

        let err = verify_chain(&entries).unwrap_err();
        assert_eq!(err.entry_id(), "entry-3");
    }

    #[test]
    fn test_reordered_entries_detected() {
        let mut entries = chain(3);
        entries.swap(1, 2);
        entries[1].seq = 2;
        entries[2].seq = 3;

        let err = verify_chain(&entries).unwrap_err();
        assert!(matches!(err, ChainError::BrokenLink { .. }));
        assert_eq!(err.entry_id(), "entry-3");
    }
}

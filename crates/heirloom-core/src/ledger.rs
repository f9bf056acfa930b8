use crate::error::HeirloomError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Position and proof of a record inside its hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChainLink {
    pub index: u64,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Record type that can be sealed into an [`AppendOnlyLog`].
pub trait ChainRecord: Serialize + DeserializeOwned + Clone {
    fn link(&self) -> &ChainLink;

    fn link_mut(&mut self) -> &mut ChainLink;
}

/// Append-only log with BLAKE3 hash-chain proofs.
///
/// No in-place mutation APIs are exposed: event and audit records are write-once.
#[derive(Debug, Clone)]
pub struct AppendOnlyLog<T> {
    entries: Vec<T>,
}

impl<T> Default for AppendOnlyLog<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: ChainRecord> AppendOnlyLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted records and verify chain integrity.
    pub fn from_entries(entries: Vec<T>) -> Result<Self, HeirloomError> {
        for (expected_index, entry) in entries.iter().enumerate() {
            if entry.link().index != expected_index as u64 {
                return Err(HeirloomError::Ledger(format!(
                    "log index gap detected at position {} (found {})",
                    expected_index,
                    entry.link().index
                )));
            }
        }

        let log = Self { entries };
        if !log.verify_chain() {
            return Err(HeirloomError::Ledger(
                "persisted log hash-chain verification failed".to_string(),
            ));
        }
        Ok(log)
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seal the next record without mutating the in-memory chain.
    pub fn seal_next(&self, record: T) -> Result<T, HeirloomError> {
        seal_after(self.entries.last().map(|e| e.link()), record)
    }

    /// Commit a sealed record, typically after external durability succeeds.
    pub fn commit(&mut self, record: T) -> Result<(), HeirloomError> {
        let expected_index = self.entries.len() as u64;
        if record.link().index != expected_index {
            return Err(HeirloomError::Ledger(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index,
                record.link().index
            )));
        }

        let expected_previous = self.entries.last().map(|e| e.link().entry_hash.clone());
        if record.link().previous_hash != expected_previous {
            return Err(HeirloomError::Ledger(
                "commit previous hash mismatch".to_string(),
            ));
        }

        if compute_record_hash(&record)? != record.link().entry_hash {
            return Err(HeirloomError::Ledger(
                "commit hash mismatch for log record".to_string(),
            ));
        }

        self.entries.push(record);
        Ok(())
    }

    pub fn append(&mut self, record: T) -> Result<T, HeirloomError> {
        let sealed = self.seal_next(record)?;
        self.commit(sealed.clone())?;
        Ok(sealed)
    }

    pub fn verify_chain(&self) -> bool {
        verify_records(&self.entries)
    }
}

/// Seal `record` as the successor of `tail`, the link of the current last record.
///
/// Stores that keep the chain outside process memory read the tail and call this
/// while holding their own append lock.
pub fn seal_after<T: ChainRecord>(
    tail: Option<&ChainLink>,
    mut record: T,
) -> Result<T, HeirloomError> {
    let link = ChainLink {
        index: tail.map_or(0, |link| link.index + 1),
        previous_hash: tail.map(|link| link.entry_hash.clone()),
        entry_hash: String::new(),
    };
    *record.link_mut() = link;
    let hash = compute_record_hash(&record)?;
    record.link_mut().entry_hash = hash;
    Ok(record)
}

/// True when `entries` are contiguous from index 0 and every hash and back-link holds.
pub fn verify_records<T: ChainRecord>(entries: &[T]) -> bool {
    let mut previous_hash: Option<String> = None;
    for (expected_index, entry) in entries.iter().enumerate() {
        if entry.link().index != expected_index as u64
            || entry.link().previous_hash != previous_hash
        {
            return false;
        }
        match compute_record_hash(entry) {
            Ok(hash) if hash == entry.link().entry_hash => {}
            _ => return false,
        }
        previous_hash = Some(entry.link().entry_hash.clone());
    }
    true
}

/// Hash over the canonical JSON of the record with its own `entry_hash` blanked.
fn compute_record_hash<T: ChainRecord>(record: &T) -> Result<String, HeirloomError> {
    let mut material = record.clone();
    material.link_mut().entry_hash = String::new();
    let bytes = serde_json::to_vec(&material)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeadManSwitchEvent, SwitchEventKind};
    use chrono::Utc;

    fn event(vault: &str, kind: SwitchEventKind) -> DeadManSwitchEvent {
        DeadManSwitchEvent::new(vault, kind, serde_json::json!({ "note": "t" }), Utc::now())
    }

    #[test]
    fn verifies_hash_chain() {
        let mut log = AppendOnlyLog::new();
        log.append(event("v1", SwitchEventKind::WarningSent)).unwrap();
        log.append(event("v1", SwitchEventKind::AssetsReleased))
            .unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(
            log.entries()[1].link.previous_hash.as_deref(),
            Some(log.entries()[0].link.entry_hash.as_str())
        );
        assert!(log.verify_chain());
    }

    #[test]
    fn detects_tampered_records() {
        let mut log = AppendOnlyLog::new();
        log.append(event("v1", SwitchEventKind::WarningSent)).unwrap();

        let mut tampered = log.clone();
        tampered.entries[0].detail = serde_json::json!({ "tampered": true });
        assert!(!tampered.verify_chain());
    }

    #[test]
    fn rejects_stale_sealed_record() {
        let mut log = AppendOnlyLog::new();
        let stale = log.seal_next(event("v1", SwitchEventKind::WarningSent)).unwrap();
        log.append(event("v2", SwitchEventKind::WarningSent)).unwrap();

        let err = log.commit(stale).unwrap_err();
        assert!(err.to_string().contains("index mismatch"));
    }

    #[test]
    fn from_entries_rehydrates_verified_chain() {
        let mut base = AppendOnlyLog::new();
        base.append(event("v1", SwitchEventKind::HeartbeatRecorded))
            .unwrap();
        base.append(event("v1", SwitchEventKind::WarningSent)).unwrap();

        let rehydrated = AppendOnlyLog::from_entries(base.entries().to_vec()).unwrap();
        assert_eq!(rehydrated.len(), 2);

        let mut gapped = base.entries().to_vec();
        gapped.remove(0);
        assert!(AppendOnlyLog::from_entries(gapped).is_err());
    }

    #[test]
    fn sealing_after_a_loaded_tail_continues_the_chain() {
        let mut log = AppendOnlyLog::new();
        log.append(event("v1", SwitchEventKind::WarningSent)).unwrap();
        log.append(event("v1", SwitchEventKind::ReminderSent)).unwrap();

        // A second writer that only sees the persisted tail row.
        let loaded_tail = log.entries()[1].clone();
        let next = seal_after(
            Some(&loaded_tail.link),
            event("v1", SwitchEventKind::AssetsReleased),
        )
        .unwrap();
        assert_eq!(next.link.index, 2);
        assert_eq!(
            next.link.previous_hash.as_deref(),
            Some(loaded_tail.link.entry_hash.as_str())
        );

        let mut records = log.entries().to_vec();
        records.push(next.clone());
        assert!(verify_records(&records));
        log.commit(next).unwrap();
        assert!(log.verify_chain());

        let first = seal_after(None, event("v2", SwitchEventKind::WarningSent)).unwrap();
        assert_eq!(first.link.index, 0);
        assert!(first.link.previous_hash.is_none());
    }

    #[test]
    fn verify_records_rejects_duplicate_indexes() {
        let mut log = AppendOnlyLog::new();
        log.append(event("v1", SwitchEventKind::WarningSent)).unwrap();
        let tail = log.entries()[0].link.clone();

        // Two writers sealing against the same tail produce the same index.
        let a = seal_after(Some(&tail), event("v1", SwitchEventKind::ReminderSent)).unwrap();
        let b = seal_after(Some(&tail), event("v2", SwitchEventKind::ReminderSent)).unwrap();
        let records = vec![log.entries()[0].clone(), a, b];
        assert!(!verify_records(&records));
    }
}

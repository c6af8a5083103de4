use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::hash::{chained_digest, HashError, GENESIS_HASH};
use crate::ids::{AuditId, IdSequence};

/// One link of an audit chain. `A` is the store's action vocabulary and `D`
/// its typed per-action details.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry<A, D> {
    pub id: AuditId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub action: A,
    pub subject_id: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<D>,
    pub hash: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsealedEntry<'a, A, D> {
    id: AuditId,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    action: &'a A,
    subject_id: &'a str,
    actor: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a D>,
}

impl<A: Serialize, D: Serialize> AuditEntry<A, D> {
    /// Digest of this entry chained onto `previous`.
    ///
    /// # Errors
    /// Returns [`HashError::Encoding`] when the entry cannot be canonically encoded.
    pub fn compute_hash(&self, previous: &str) -> Result<String, HashError> {
        let unsealed = UnsealedEntry {
            id: self.id,
            timestamp: self.timestamp,
            action: &self.action,
            subject_id: &self.subject_id,
            actor: &self.actor,
            details: self.details.as_ref(),
        };
        chained_digest(&unsealed, previous)
    }
}

/// Result of an integrity check. Checks report problems instead of failing so
/// the caller decides whether a mismatch is fatal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    #[must_use]
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors }
    }

    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.errors.extend(other.errors);
        self.valid = self.errors.is_empty();
        self
    }
}

/// Append-only, hash-chained log starting at [`GENESIS_HASH`].
///
/// With a capacity the oldest entries are evicted first; the hash of the last
/// evicted entry becomes the base the remaining chain is verified from, and
/// the evicted entries' subjects are remembered.
#[derive(Debug, Clone)]
pub struct AuditChain<A, D> {
    entries: VecDeque<AuditEntry<A, D>>,
    evicted_subjects: BTreeSet<String>,
    base_hash: String,
    head_hash: String,
    capacity: Option<usize>,
    ids: IdSequence,
}

impl<A, D> AuditChain<A, D>
where
    A: Serialize + Copy + Eq,
    D: Serialize,
{
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            evicted_subjects: BTreeSet::new(),
            base_hash: GENESIS_HASH.to_string(),
            head_hash: GENESIS_HASH.to_string(),
            capacity,
            ids: IdSequence::new("audit"),
        }
    }

    /// Append a new entry and advance the chain head.
    ///
    /// # Errors
    /// Returns [`HashError::Encoding`] when the entry cannot be canonically encoded.
    /// The chain is left untouched in that case.
    pub fn append(
        &mut self,
        timestamp: OffsetDateTime,
        action: A,
        subject_id: &str,
        actor: &str,
        details: Option<D>,
    ) -> Result<&AuditEntry<A, D>, HashError> {
        let mut entry = AuditEntry {
            id: AuditId(self.ids.next(timestamp, subject_id)),
            timestamp,
            action,
            subject_id: subject_id.to_string(),
            actor: actor.to_string(),
            details,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash(&self.head_hash)?;

        if let Some(capacity) = self.capacity {
            while self.entries.len() >= capacity.max(1) {
                match self.entries.pop_front() {
                    Some(evicted) => {
                        self.base_hash = evicted.hash;
                        self.evicted_subjects.insert(evicted.subject_id);
                    }
                    None => break,
                }
            }
        }

        self.head_hash.clone_from(&entry.hash);
        self.entries.push_back(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Replace the chain with previously exported entries. The head becomes the
    /// hash of the last entry.
    pub fn restore(&mut self, entries: Vec<AuditEntry<A, D>>) {
        self.evicted_subjects.clear();
        self.base_hash = GENESIS_HASH.to_string();
        self.head_hash =
            entries.last().map_or_else(|| GENESIS_HASH.to_string(), |entry| entry.hash.clone());
        let counter = u64::try_from(entries.len()).unwrap_or(u64::MAX);
        self.ids = IdSequence::resume("audit", &self.head_hash, counter);
        self.entries = entries.into();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted_subjects.clear();
        self.base_hash = GENESIS_HASH.to_string();
        self.head_hash = GENESIS_HASH.to_string();
        self.ids = IdSequence::new("audit");
    }

    #[must_use]
    pub fn head(&self) -> &str {
        &self.head_hash
    }

    /// Whether entries have been evicted to honour the capacity.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.base_hash != GENESIS_HASH
    }

    /// Whether at least one entry for `subject_id` was evicted.
    #[must_use]
    pub fn was_evicted(&self, subject_id: &str) -> bool {
        self.evicted_subjects.contains(subject_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditEntry<A, D>> {
        self.entries.iter()
    }

    #[must_use]
    pub fn for_subject(&self, subject_id: &str) -> Vec<&AuditEntry<A, D>> {
        self.entries.iter().filter(|entry| entry.subject_id == subject_id).collect()
    }

    #[must_use]
    pub fn has_action(&self, subject_id: &str, action: A) -> bool {
        self.entries.iter().any(|entry| entry.subject_id == subject_id && entry.action == action)
    }

    /// Recompute every link from the base hash and compare with the stored
    /// digests and the recorded head.
    #[must_use]
    pub fn verify(&self) -> IntegrityReport {
        let mut errors = Vec::new();
        let mut previous = self.base_hash.clone();
        for entry in &self.entries {
            match entry.compute_hash(&previous) {
                Ok(expected) if expected == entry.hash => {}
                Ok(_) => errors.push(format!("audit hash mismatch for entry {}", entry.id)),
                Err(err) => errors.push(format!("audit entry {} could not be encoded: {err}", entry.id)),
            }
            previous.clone_from(&entry.hash);
        }
        if previous != self.head_hash {
            errors.push("audit chain head does not match last entry".to_string());
        }
        IntegrityReport::from_errors(errors)
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    enum Action {
        Created,
        Touched,
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn append(chain: &mut AuditChain<Action, String>, action: Action, subject: &str) -> String {
        match chain.append(fixture_time(), action, subject, "tester", Some("note".to_string())) {
            Ok(entry) => entry.hash.clone(),
            Err(err) => panic!("append failed: {err}"),
        }
    }

    #[test]
    fn chain_links_each_entry_to_its_predecessor() {
        let mut chain = AuditChain::<Action, String>::new(None);
        let first = append(&mut chain, Action::Created, "a");
        let second = append(&mut chain, Action::Touched, "a");

        let entries: Vec<_> = chain.iter().collect();
        assert_eq!(entries[0].compute_hash(GENESIS_HASH).ok(), Some(first.clone()));
        assert_eq!(entries[1].compute_hash(&first).ok(), Some(second.clone()));
        assert_eq!(chain.head(), second);
        assert!(chain.verify().valid);
    }

    #[test]
    fn tampered_entry_breaks_verification() {
        let mut chain = AuditChain::<Action, String>::new(None);
        append(&mut chain, Action::Created, "a");
        append(&mut chain, Action::Touched, "a");

        let mut entries: Vec<_> = chain.iter().cloned().collect();
        entries[0].actor = "mallory".to_string();
        chain.restore(entries);

        let report = chain.verify();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn capped_chain_evicts_oldest_and_still_verifies() {
        let mut chain = AuditChain::<Action, String>::new(Some(2));
        append(&mut chain, Action::Created, "a");
        append(&mut chain, Action::Created, "b");
        let last = append(&mut chain, Action::Created, "c");

        assert_eq!(chain.len(), 2);
        assert!(chain.is_truncated());
        assert!(chain.for_subject("a").is_empty());
        assert!(chain.was_evicted("a"));
        assert!(!chain.was_evicted("b"));
        assert!(chain.has_action("c", Action::Created));
        assert_eq!(chain.head(), last);
        assert!(chain.verify().valid);
    }

    #[test]
    fn clear_resets_to_genesis() {
        let mut chain = AuditChain::<Action, String>::new(None);
        append(&mut chain, Action::Created, "a");
        chain.clear();
        assert!(chain.is_empty());
        assert_eq!(chain.head(), GENESIS_HASH);
    }
}

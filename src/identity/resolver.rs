//! Identity resolver: maps every observed external key onto one stable
//! internal id per physical location.
//!
//! Keys that co-occur on one record are merged into the same id the first
//! time they are seen together. The map only grows: keys are added, never
//! repointed, with [`IdMap::normalize_legacy_keys`] as the single corrective
//! exception.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::core::errors::{AvlError, Result};
use crate::identity::keys::{ExternalKey, candidate_keys, scrub_legacy_key};

/// Stable positive integer identifying one physical location.
pub type InternalId = u64;

/// How new internal ids are minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicy {
    /// `max(loaded ids) + 1`. Collision-free; requires the prior map.
    Counter,
    /// SHA-1 of the primary key's value reduced modulo `10^digits`.
    /// Run-independent; distinct locations may collide.
    Hash { digits: u32 },
}

/// What to do when a record's keys already point at more than one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeConflict {
    /// Take the first id found, silently.
    FirstWins,
    /// Take the first id found and report the conflict.
    #[default]
    Warn,
}

/// Outcome of one `resolve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: InternalId,
    /// A fresh id was minted for this record.
    pub minted: bool,
    /// Number of keys newly added to the map.
    pub added_keys: usize,
    /// Distinct ids found among the record's keys, when there was more than
    /// one and the policy asks for a report. First entry is the winner.
    pub conflicting_ids: Vec<InternalId>,
    /// A hash-minted id was already in use by another key set.
    pub hash_collision: bool,
}

/// External key → internal id mapping plus the minting policy.
#[derive(Debug, Clone)]
pub struct IdMap {
    keys: BTreeMap<ExternalKey, InternalId>,
    assigned: HashSet<InternalId>,
    max_id: InternalId,
    policy: IdPolicy,
    merge_conflict: MergeConflict,
}

impl IdMap {
    #[must_use]
    pub fn new(policy: IdPolicy, merge_conflict: MergeConflict) -> Self {
        Self {
            keys: BTreeMap::new(),
            assigned: HashSet::new(),
            max_id: 0,
            policy,
            merge_conflict,
        }
    }

    /// Seed from persisted `(key, id)` pairs. A key listed twice keeps its
    /// first id; the returned list names the ignored duplicates.
    pub fn load<I>(&mut self, pairs: I) -> Result<Vec<ExternalKey>>
    where
        I: IntoIterator<Item = (ExternalKey, InternalId)>,
    {
        let mut duplicates = Vec::new();
        for (key, id) in pairs {
            if id == 0 {
                return Err(AvlError::InvalidConfig {
                    details: format!("id map entry {key} has non-positive id 0"),
                });
            }
            if self.keys.contains_key(&key) {
                duplicates.push(key);
                continue;
            }
            self.insert(key, id);
        }
        Ok(duplicates)
    }

    #[must_use]
    pub fn policy(&self) -> IdPolicy {
        self.policy
    }

    #[must_use]
    pub fn get(&self, key: &ExternalKey) -> Option<InternalId> {
        self.keys.get(key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of distinct internal ids.
    #[must_use]
    pub fn id_count(&self) -> usize {
        self.assigned.len()
    }

    #[must_use]
    pub fn max_id(&self) -> InternalId {
        self.max_id
    }

    /// All mappings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ExternalKey, InternalId)> {
        self.keys.iter().map(|(key, id)| (key, *id))
    }

    /// Resolve the keys of one record to an internal id, merging and minting
    /// as needed. `primary` is always treated as the first candidate.
    pub fn resolve(
        &mut self,
        candidates: &[ExternalKey],
        primary: &ExternalKey,
    ) -> Result<Resolution> {
        let keys = candidate_keys(primary, candidates);

        let mut distinct: Vec<InternalId> = Vec::new();
        let mut overlap = 0usize;
        for key in &keys {
            if let Some(id) = self.keys.get(key) {
                overlap += 1;
                if !distinct.contains(id) {
                    distinct.push(*id);
                }
            }
        }

        let mut resolution = Resolution {
            id: 0,
            minted: false,
            added_keys: 0,
            conflicting_ids: Vec::new(),
            hash_collision: false,
        };

        let target = if let Some(first) = distinct.first() {
            *first
        } else {
            let id = self.mint(primary)?;
            resolution.minted = true;
            resolution.hash_collision = self.assigned.contains(&id);
            id
        };

        if distinct.len() > 1 && self.merge_conflict == MergeConflict::Warn {
            resolution.conflicting_ids.clone_from(&distinct);
        }

        if overlap < keys.len() {
            for key in keys {
                if !self.keys.contains_key(&key) {
                    self.insert(key, target);
                    resolution.added_keys += 1;
                }
            }
        }

        resolution.id = self.keys.get(primary).copied().ok_or_else(|| AvlError::Runtime {
            details: format!("id not found for primary key {primary} after insertion"),
        })?;
        Ok(resolution)
    }

    /// Attach `key` to the id already held by `anchor`. Used when a feed
    /// publishes key equivalences separately from the records themselves.
    /// Returns `None` when `anchor` is unknown; an existing mapping for `key`
    /// is left untouched.
    pub fn alias(&mut self, key: ExternalKey, anchor: &ExternalKey) -> Option<InternalId> {
        let id = self.get(anchor)?;
        if !self.keys.contains_key(&key) {
            self.insert(key, id);
        }
        Some(id)
    }

    /// Rewrite keys stored before legacy scrubbing existed. An unscrubbed key
    /// is replaced by its scrubbed form; if the scrubbed form is already
    /// mapped to a different id the existing mapping wins. Returns
    /// `(old, new, kept_id)` for every rewritten key.
    pub fn normalize_legacy_keys(&mut self) -> Vec<(ExternalKey, ExternalKey, InternalId)> {
        let stale: Vec<(ExternalKey, ExternalKey)> = self
            .keys
            .keys()
            .filter_map(|key| {
                let scrubbed = scrub_legacy_key(key.as_str());
                if scrubbed == key.as_str() {
                    return None;
                }
                ExternalKey::parse(&scrubbed)
                    .ok()
                    .map(|new| (key.clone(), new))
            })
            .collect();

        let mut rewritten = Vec::with_capacity(stale.len());
        for (old, new) in stale {
            let Some(old_id) = self.keys.remove(&old) else {
                continue;
            };
            let kept = *self.keys.entry(new.clone()).or_insert(old_id);
            rewritten.push((old, new, kept));
        }
        self.assigned = self.keys.values().copied().collect();
        rewritten
    }

    fn insert(&mut self, key: ExternalKey, id: InternalId) {
        self.keys.insert(key, id);
        self.assigned.insert(id);
        self.max_id = self.max_id.max(id);
    }

    fn mint(&self, primary: &ExternalKey) -> Result<InternalId> {
        match self.policy {
            IdPolicy::Counter => {
                self.max_id
                    .checked_add(1)
                    .ok_or_else(|| AvlError::InvalidConfig {
                        details: format!(
                            "id map is exhausted at {}; cannot mint an id for {primary}",
                            self.max_id
                        ),
                    })
            }
            IdPolicy::Hash { digits } => Ok(hash_id(primary.value(), digits)),
        }
    }
}

/// Deterministic, non-unique integer for a string: the SHA-1 hex digest
/// read as a big-endian integer modulo `10^digits`, so ids match those
/// written by earlier hash-keyed runs. Zero maps to `10^digits` so ids stay
/// positive.
#[must_use]
pub fn hash_id(value: &str, digits: u32) -> InternalId {
    let modulus = 10u128.pow(digits.clamp(1, 18));
    let digest = Sha1::digest(value.as_bytes());
    let rem = digest
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % modulus);
    let id = if rem == 0 { modulus } else { rem };
    u64::try_from(id).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(raw: &str) -> ExternalKey {
        ExternalKey::parse(raw).expect("valid key")
    }

    fn counter_map() -> IdMap {
        IdMap::new(IdPolicy::Counter, MergeConflict::Warn)
    }

    #[test]
    fn co_occurring_keys_share_an_id_later() {
        let mut map = counter_map();
        let uuid = key("uuid:A");
        let sys = key("sysX:123");
        let first = map.resolve(&[uuid.clone(), sys.clone()], &uuid).unwrap();
        assert!(first.minted);
        assert_eq!(first.added_keys, 2);

        let later = map.resolve(&[sys.clone()], &sys).unwrap();
        assert!(!later.minted);
        assert_eq!(later.added_keys, 0);
        assert_eq!(later.id, first.id);
    }

    #[test]
    fn counter_continues_from_loaded_maximum() {
        let mut map = counter_map();
        map.load([(key("uuid:A"), 7), (key("uuid:B"), 3)]).unwrap();
        let res = map.resolve(&[], &key("uuid:C")).unwrap();
        assert_eq!(res.id, 8);
    }

    #[test]
    fn partial_overlap_adds_new_keys_to_existing_id() {
        let mut map = counter_map();
        let a = key("uuid:A");
        let x = key("vtrcks:1");
        let id = map.resolve(&[], &a).unwrap().id;
        let res = map.resolve(&[x.clone()], &a).unwrap();
        assert_eq!(res.id, id);
        assert_eq!(res.added_keys, 1);
        assert_eq!(map.get(&x), Some(id));
    }

    #[test]
    fn full_overlap_is_a_no_op() {
        let mut map = counter_map();
        let a = key("uuid:A");
        let x = key("vtrcks:1");
        map.resolve(&[x.clone()], &a).unwrap();
        let before = map.len();
        let res = map.resolve(&[x], &a).unwrap();
        assert_eq!(res.added_keys, 0);
        assert_eq!(map.len(), before);
    }

    #[test]
    fn conflicting_ids_reported_first_found_wins_and_nothing_repointed() {
        let mut map = counter_map();
        let a = key("uuid:A");
        let b = key("uuid:B");
        let x = key("vtrcks:1");
        let id_a = map.resolve(&[], &a).unwrap().id;
        let id_b = map.resolve(&[x.clone()], &b).unwrap().id;
        assert_ne!(id_a, id_b);

        let res = map
            .resolve(&[x.clone(), key("cvs:9")], &a)
            .unwrap();
        assert_eq!(res.id, id_a);
        assert_eq!(res.conflicting_ids, vec![id_a, id_b]);
        // existing mapping untouched
        assert_eq!(map.get(&x), Some(id_b));
        assert_eq!(map.get(&key("cvs:9")), Some(id_a));
    }

    #[test]
    fn first_wins_policy_stays_quiet() {
        let mut map = IdMap::new(IdPolicy::Counter, MergeConflict::FirstWins);
        let a = key("uuid:A");
        let b = key("uuid:B");
        map.resolve(&[], &a).unwrap();
        map.resolve(&[], &b).unwrap();
        let res = map.resolve(&[b], &a).unwrap();
        assert!(res.conflicting_ids.is_empty());
    }

    #[test]
    fn hash_policy_is_run_independent() {
        let mut one = IdMap::new(IdPolicy::Hash { digits: 8 }, MergeConflict::Warn);
        let mut two = IdMap::new(IdPolicy::Hash { digits: 8 }, MergeConflict::Warn);
        two.resolve(&[], &key("uuid:unrelated")).unwrap();
        let a = key("uuid:5c5c4a7b-0b1e-4b7f-9a3c-2f0e6d1c8a90");
        let id_one = one.resolve(&[], &a).unwrap().id;
        let id_two = two.resolve(&[], &a).unwrap().id;
        assert_eq!(id_one, id_two);
        assert!(id_one > 0 && id_one <= 100_000_000);
        assert_eq!(id_one, hash_id(a.value(), 8));
    }

    #[test]
    fn hash_ids_match_sha1_modulo_digits() {
        assert_eq!(hash_id("5c5c4a7b-0b1e-4b7f-9a3c-2f0e6d1c8a90", 8), 86_225_384);
        assert_eq!(hash_id("0f9e8d7c-6b5a-4c3d-8e1f-2a3b4c5d6e7f", 8), 20_257_350);
        assert_eq!(hash_id("77", 8), 89_408_286);
        assert_eq!(hash_id("5c5c4a7b-0b1e-4b7f-9a3c-2f0e6d1c8a90", 4), 5_384);
    }

    #[test]
    fn counter_refuses_to_mint_past_the_largest_id() {
        let mut map = counter_map();
        map.load([(key("uuid:A"), u64::MAX)]).unwrap();
        let err = map.resolve(&[], &key("uuid:B")).unwrap_err();
        assert!(matches!(err, AvlError::InvalidConfig { .. }));
        assert_eq!(map.get(&key("uuid:B")), None);
        assert_eq!(map.get(&key("uuid:A")), Some(u64::MAX));
    }

    #[test]
    fn hash_collision_is_flagged() {
        // With one digit, eleven distinct keys must collide somewhere.
        let mut map = IdMap::new(IdPolicy::Hash { digits: 1 }, MergeConflict::Warn);
        let collided = (0..11)
            .map(|i| map.resolve(&[], &key(&format!("uuid:{i}"))).unwrap())
            .any(|res| res.hash_collision);
        assert!(collided);
    }

    #[test]
    fn alias_attaches_to_anchor_only_when_known() {
        let mut map = counter_map();
        let a = key("uuid:A");
        let id = map.resolve(&[], &a).unwrap().id;
        assert_eq!(map.alias(key("vtrcks:5"), &a), Some(id));
        assert_eq!(map.alias(key("vtrcks:6"), &key("uuid:Z")), None);
        assert_eq!(map.get(&key("vtrcks:6")), None);
    }

    #[test]
    fn legacy_keys_are_rewritten_once() {
        let mut map = counter_map();
        map.load([
            (key("univaf_v1_2:abc"), 4),
            (key("univaf_v1_3:def"), 5),
            (key("univaf_v1:def"), 6),
        ])
        .unwrap();
        let rewritten = map.normalize_legacy_keys();
        assert_eq!(rewritten.len(), 2);
        assert_eq!(map.get(&key("univaf_v1:abc")), Some(4));
        // existing scrubbed mapping wins over the stale one
        assert_eq!(map.get(&key("univaf_v1:def")), Some(6));
        assert_eq!(map.get(&key("univaf_v1_2:abc")), None);
        assert!(map.normalize_legacy_keys().is_empty());
    }

    #[test]
    fn load_rejects_zero_and_reports_duplicates() {
        let mut map = counter_map();
        assert!(map.load([(key("uuid:A"), 0)]).is_err());
        let dups = map
            .load([(key("uuid:A"), 1), (key("uuid:A"), 2)])
            .unwrap();
        assert_eq!(dups, vec![key("uuid:A")]);
        assert_eq!(map.get(&key("uuid:A")), Some(1));
    }

    fn arb_keys() -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set("[a-d]{1}:[0-9]{1,2}", 1..6)
            .prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn merge_decision_ignores_candidate_order(
            seeded in arb_keys(),
            extra in arb_keys(),
            seed in any::<u64>(),
        ) {
            // One entity already owns `seeded`; any ordering of a record that
            // overlaps it lands on the same id.
            let mut base = counter_map();
            let seeded: Vec<ExternalKey> = seeded.iter().map(|k| key(k)).collect();
            let owner = base.resolve(&seeded, &seeded[0]).unwrap().id;

            let mut record: Vec<ExternalKey> = extra.iter().map(|k| key(k)).collect();
            record.push(seeded[0].clone());
            let mut shuffled = record.clone();
            let len = shuffled.len();
            let rotate = usize::try_from(seed % len as u64).unwrap_or(0);
            shuffled.rotate_left(rotate);
            shuffled.reverse();

            let mut one = base.clone();
            let mut two = base.clone();
            let r1 = one.resolve(&record, &seeded[0]).unwrap();
            let r2 = two.resolve(&shuffled, &seeded[0]).unwrap();
            prop_assert_eq!(r1.id, owner);
            prop_assert_eq!(r2.id, owner);
        }

        #[test]
        fn re_resolving_is_stable(records in prop::collection::vec(arb_keys(), 1..8)) {
            let mut map = counter_map();
            let mut seen = Vec::new();
            for record in &records {
                let keys: Vec<ExternalKey> = record.iter().map(|k| key(k)).collect();
                let res = map.resolve(&keys, &keys[0]).unwrap();
                seen.push((keys[0].clone(), res.id));
            }
            for (primary, _) in &seen {
                let first = map.get(primary).unwrap();
                let again = map.resolve(&[], primary).unwrap();
                prop_assert_eq!(again.id, first);
                prop_assert!(!again.minted);
            }
        }
    }
}

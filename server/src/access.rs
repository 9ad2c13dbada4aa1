//! Reusable access control: a minimum-rank gate plus explicit per-subject
//! include/exclude overrides.
//!
//! The hot path is `check`, called by every block-change request. Readers
//! never take a lock: they load an immutable snapshot (min rank + included
//! array + excluded array, all built at the same instant) through an atomic
//! reference swap. Writers serialize under a mutex, mutate the backing sets,
//! and publish a freshly built snapshot, so a reader can never observe one
//! array updated and the other not.

use arc_swap::ArcSwap;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use crate::rank::{Rank, RankGraph};

/// Result of an include/exclude mutation: the subject's previous standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOverride {
    None,
    Allow,
    Deny,
}

/// Detailed outcome of an access check, for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityCheck {
    Allowed,
    WhiteListed,
    RankTooLow,
    BlackListed,
}

impl SecurityCheck {
    pub fn permitted(self) -> bool {
        matches!(self, SecurityCheck::Allowed | SecurityCheck::WhiteListed)
    }
}

/// Immutable published view. Both arrays reflect the same point in time.
#[derive(Debug)]
struct PolicySnapshot<K> {
    min_rank: Arc<Rank>,
    included: Vec<K>,
    excluded: Vec<K>,
}

/// Writer-side state, only touched under the policy mutex.
#[derive(Debug)]
struct PolicySets<K> {
    min_rank: Arc<Rank>,
    included: HashSet<K>,
    excluded: HashSet<K>,
}

impl<K: Eq + Hash + Clone> PolicySets<K> {
    fn build_snapshot(&self) -> PolicySnapshot<K> {
        PolicySnapshot {
            min_rank: Arc::clone(&self.min_rank),
            included: self.included.iter().cloned().collect(),
            excluded: self.excluded.iter().cloned().collect(),
        }
    }
}

/// A minimum-rank gate with explicit allow/deny override sets, generic over
/// the subject key (player names for world and zone policies).
#[derive(Debug)]
pub struct AccessPolicy<K> {
    sets: Mutex<PolicySets<K>>,
    snapshot: ArcSwap<PolicySnapshot<K>>,
}

impl<K: Eq + Hash + Clone> AccessPolicy<K> {
    pub fn new(min_rank: Arc<Rank>) -> AccessPolicy<K> {
        let sets = PolicySets {
            min_rank,
            included: HashSet::new(),
            excluded: HashSet::new(),
        };
        let snapshot = ArcSwap::from_pointee(sets.build_snapshot());
        AccessPolicy {
            sets: Mutex::new(sets),
            snapshot,
        }
    }

    /// Adds an explicit allow override. If the subject was excluded, the
    /// exclusion is lifted instead. Returns the subject's previous standing.
    pub fn include(&self, key: K) -> PermissionOverride {
        let mut sets = self.sets.lock();
        let previous = if sets.included.contains(&key) {
            PermissionOverride::Allow
        } else if sets.excluded.remove(&key) {
            PermissionOverride::Deny
        } else {
            sets.included.insert(key);
            PermissionOverride::None
        };
        self.snapshot.store(Arc::new(sets.build_snapshot()));
        previous
    }

    /// Adds an explicit deny override; mirror of [`AccessPolicy::include`].
    pub fn exclude(&self, key: K) -> PermissionOverride {
        let mut sets = self.sets.lock();
        let previous = if sets.excluded.contains(&key) {
            PermissionOverride::Deny
        } else if sets.included.remove(&key) {
            PermissionOverride::Allow
        } else {
            sets.excluded.insert(key);
            PermissionOverride::None
        };
        self.snapshot.store(Arc::new(sets.build_snapshot()));
        previous
    }

    /// Clears both override sets, leaving only the min-rank gate.
    pub fn reset(&self) {
        let mut sets = self.sets.lock();
        sets.included.clear();
        sets.excluded.clear();
        self.snapshot.store(Arc::new(sets.build_snapshot()));
    }

    pub fn set_min_rank(&self, rank: Arc<Rank>) {
        let mut sets = self.sets.lock();
        sets.min_rank = rank;
        self.snapshot.store(Arc::new(sets.build_snapshot()));
    }

    pub fn min_rank(&self) -> Arc<Rank> {
        Arc::clone(&self.snapshot.load().min_rank)
    }

    /// Lock-free access decision. Exclusion wins over everything; otherwise
    /// a sufficient rank or an explicit inclusion allows.
    pub fn check(&self, key: &K, rank: &Rank) -> bool {
        self.check_detailed(key, rank).permitted()
    }

    /// Same precedence as [`AccessPolicy::check`], with the reason.
    pub fn check_detailed(&self, key: &K, rank: &Rank) -> SecurityCheck {
        let snapshot = self.snapshot.load();
        if snapshot.excluded.contains(key) {
            SecurityCheck::BlackListed
        } else if rank.at_least(&snapshot.min_rank) {
            SecurityCheck::Allowed
        } else if snapshot.included.contains(key) {
            SecurityCheck::WhiteListed
        } else {
            SecurityCheck::RankTooLow
        }
    }
}

/// Persisted form: min rank by name plus both override key sets.
#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyRecord<K> {
    pub min_rank: String,
    pub included: Vec<K>,
    pub excluded: Vec<K>,
}

impl<K: Eq + Hash + Clone> AccessPolicy<K> {
    pub fn to_record(&self) -> PolicyRecord<K> {
        let snapshot = self.snapshot.load();
        PolicyRecord {
            min_rank: snapshot.min_rank.name().to_string(),
            included: snapshot.included.clone(),
            excluded: snapshot.excluded.clone(),
        }
    }

    /// Restores a policy. An unresolvable min-rank name falls back to the
    /// graph's lowest rank with a logged warning rather than failing the
    /// owning world's load.
    pub fn from_record(record: PolicyRecord<K>, ranks: &RankGraph) -> Option<AccessPolicy<K>> {
        let min_rank = match ranks.find(&record.min_rank) {
            Some(rank) => rank,
            None => {
                let fallback = ranks.lowest()?;
                warn!(
                    "Policy min rank '{}' not found, defaulting to '{}'",
                    record.min_rank,
                    fallback.name()
                );
                fallback
            }
        };
        let policy = AccessPolicy::new(min_rank);
        {
            let mut sets = policy.sets.lock();
            sets.included = record.included.into_iter().collect();
            // A key can never be in both sets; exclusion wins on bad input.
            for key in record.excluded {
                sets.included.remove(&key);
                sets.excluded.insert(key);
            }
            policy.snapshot.store(Arc::new(sets.build_snapshot()));
        }
        Some(policy)
    }
}

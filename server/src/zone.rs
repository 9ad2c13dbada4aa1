//! Spatially bounded regions of a world, each carrying its own access policy.
//!
//! Zones are evaluated in registration order with deny-wins semantics: the
//! first containing zone that denies the actor short-circuits the scan, while
//! allows are remembered and the scan continues (a later zone can still deny).
//! Overlapping zones with conflicting policies are therefore order-dependent.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared::Position;
use std::sync::Arc;
use thiserror::Error;

use crate::access::{AccessPolicy, PolicyRecord};
use crate::rank::{Rank, RankGraph};
use crate::utils::unix_timestamp;

/// Inclusive axis-aligned bounding volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: i16,
    pub x_max: i16,
    pub y_min: i16,
    pub y_max: i16,
    pub h_min: i16,
    pub h_max: i16,
}

impl BoundingBox {
    /// Builds a box from two opposite corners, in any order.
    pub fn new(a: Position, b: Position) -> BoundingBox {
        BoundingBox {
            x_min: a.x.min(b.x),
            x_max: a.x.max(b.x),
            y_min: a.y.min(b.y),
            y_max: a.y.max(b.y),
            h_min: a.h.min(b.h),
            h_max: a.h.max(b.h),
        }
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos.x >= self.x_min
            && pos.x <= self.x_max
            && pos.y >= self.y_min
            && pos.y <= self.y_max
            && pos.h >= self.h_min
            && pos.h <= self.h_max
    }

    pub fn volume(&self) -> u64 {
        let dx = (self.x_max - self.x_min) as u64 + 1;
        let dy = (self.y_max - self.y_min) as u64 + 1;
        let dh = (self.h_max - self.h_min) as u64 + 1;
        dx * dy * dh
    }
}

/// Who last touched a zone's definition, and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneEdit {
    pub by: String,
    pub at: u64,
}

/// A named sub-region with its own access policy and audit trail. Owned by a
/// world's map; its lifetime is tied to the owning world.
#[derive(Debug)]
pub struct Zone {
    name: String,
    bounds: BoundingBox,
    pub policy: AccessPolicy<String>,
    created_by: String,
    created_at: u64,
    edited: RwLock<Option<ZoneEdit>>,
}

impl Zone {
    pub fn new(
        name: &str,
        bounds: BoundingBox,
        min_rank: Arc<Rank>,
        created_by: &str,
    ) -> Zone {
        Zone {
            name: name.to_string(),
            bounds,
            policy: AccessPolicy::new(min_rank),
            created_by: created_by.to_string(),
            created_at: unix_timestamp(),
            edited: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    pub fn created_by(&self) -> &str {
        &self.created_by
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_edit(&self) -> Option<ZoneEdit> {
        self.edited.read().clone()
    }

    /// Records an edit in the audit trail.
    pub fn touch(&self, editor: &str) {
        *self.edited.write() = Some(ZoneEdit {
            by: editor.to_string(),
            at: unix_timestamp(),
        });
    }
}

/// How the zone layer feels about a block change: no containing zone had an
/// opinion, some zone allowed it, or a zone denied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneOverride {
    None,
    Allow,
    Deny,
}

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("a zone named '{0}' already exists")]
    DuplicateName(String),
}

/// All zones of one world, kept in registration order.
pub struct ZoneIndex {
    zones: RwLock<Vec<Arc<Zone>>>,
}

impl ZoneIndex {
    pub fn new() -> ZoneIndex {
        ZoneIndex {
            zones: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, zone: Zone) -> Result<Arc<Zone>, ZoneError> {
        let mut zones = self.zones.write();
        if zones.iter().any(|z| z.name.eq_ignore_ascii_case(&zone.name)) {
            return Err(ZoneError::DuplicateName(zone.name));
        }
        let zone = Arc::new(zone);
        zones.push(Arc::clone(&zone));
        Ok(zone)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Zone>> {
        let mut zones = self.zones.write();
        let position = zones.iter().position(|z| z.name.eq_ignore_ascii_case(name))?;
        Some(zones.remove(position))
    }

    pub fn find(&self, name: &str) -> Option<Arc<Zone>> {
        self.zones
            .read()
            .iter()
            .find(|z| z.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Zone>> {
        self.zones.read().clone()
    }

    pub fn len(&self) -> usize {
        self.zones.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.read().is_empty()
    }

    /// Scans all zones containing the point, in registration order. The
    /// first denial returns immediately; an allow is remembered and the scan
    /// continues, since a later zone can still deny and override it.
    pub fn check(&self, pos: Position, key: &String, rank: &Rank) -> ZoneOverride {
        let mut result = ZoneOverride::None;
        for zone in self.zones.read().iter() {
            if !zone.bounds.contains(pos) {
                continue;
            }
            if zone.policy.check(key, rank) {
                result = ZoneOverride::Allow;
            } else {
                return ZoneOverride::Deny;
            }
        }
        result
    }

    /// The first zone (in scan order) that denies the actor at this point,
    /// for error messaging.
    pub fn find_denied_zone(&self, pos: Position, key: &String, rank: &Rank) -> Option<Arc<Zone>> {
        self.zones
            .read()
            .iter()
            .find(|zone| zone.bounds.contains(pos) && !zone.policy.check(key, rank))
            .cloned()
    }

    pub fn to_records(&self) -> Vec<ZoneRecord> {
        self.zones
            .read()
            .iter()
            .map(|zone| ZoneRecord {
                name: zone.name.clone(),
                bounds: zone.bounds,
                created_by: zone.created_by.clone(),
                created_at: zone.created_at,
                edited: zone.last_edit(),
                policy: zone.policy.to_record(),
            })
            .collect()
    }

    /// Restores zones in record order, preserving scan order across a
    /// save/load cycle. Records whose policy cannot be restored are skipped
    /// with a logged warning from the policy layer.
    pub fn from_records(records: Vec<ZoneRecord>, ranks: &RankGraph) -> ZoneIndex {
        let index = ZoneIndex::new();
        for record in records {
            let Some(policy) = AccessPolicy::from_record(record.policy, ranks) else {
                continue;
            };
            let zone = Zone {
                name: record.name,
                bounds: record.bounds,
                policy,
                created_by: record.created_by,
                created_at: record.created_at,
                edited: RwLock::new(record.edited),
            };
            let mut zones = index.zones.write();
            zones.push(Arc::new(zone));
        }
        index
    }
}

impl Default for ZoneIndex {
    fn default() -> Self {
        ZoneIndex::new()
    }
}

/// Persisted form of one zone.
#[derive(Debug, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub name: String,
    pub bounds: BoundingBox,
    pub created_by: String,
    pub created_at: u64,
    pub edited: Option<ZoneEdit>,
    pub policy: PolicyRecord<String>,
}

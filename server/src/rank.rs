//! Rank definitions and the ordered rank graph.
//!
//! Ranks form a total order: index 0 is the highest rank, so comparisons are
//! inverted relative to the index (`a` outranks `b` iff `a.index < b.index`).
//! The graph re-stamps every rank's index after each structural change, and
//! keeps a legacy-id table so serialized references to deleted ranks still
//! resolve to their replacements.

use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Anything with a color-coded display name: ranks, players, worlds.
pub trait Classy {
    /// The name prefixed with its color code, ready for chat output.
    fn classy_name(&self) -> String;
}

/// Individual capabilities a rank can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Chat,
    Build,
    Delete,
    PlaceAdmincrete,
    DeleteAdmincrete,
    PlaceWater,
    PlaceLava,
    Draw,
    Teleport,
    ManageZones,
    ManageWorlds,
    Lock,
    Kick,
    Ban,
    Promote,
    Demote,
}

impl Permission {
    pub const COUNT: usize = 16;

    pub const ALL: [Permission; Permission::COUNT] = [
        Permission::Chat,
        Permission::Build,
        Permission::Delete,
        Permission::PlaceAdmincrete,
        Permission::DeleteAdmincrete,
        Permission::PlaceWater,
        Permission::PlaceLava,
        Permission::Draw,
        Permission::Teleport,
        Permission::ManageZones,
        Permission::ManageWorlds,
        Permission::Lock,
        Permission::Kick,
        Permission::Ban,
        Permission::Promote,
        Permission::Demote,
    ];

    /// Stable name used in persisted rank records.
    pub fn name(self) -> &'static str {
        match self {
            Permission::Chat => "chat",
            Permission::Build => "build",
            Permission::Delete => "delete",
            Permission::PlaceAdmincrete => "place-admincrete",
            Permission::DeleteAdmincrete => "delete-admincrete",
            Permission::PlaceWater => "place-water",
            Permission::PlaceLava => "place-lava",
            Permission::Draw => "draw",
            Permission::Teleport => "teleport",
            Permission::ManageZones => "manage-zones",
            Permission::ManageWorlds => "manage-worlds",
            Permission::Lock => "lock",
            Permission::Kick => "kick",
            Permission::Ban => "ban",
            Permission::Promote => "promote",
            Permission::Demote => "demote",
        }
    }

    pub fn from_name(name: &str) -> Option<Permission> {
        Permission::ALL.iter().copied().find(|p| p.name() == name)
    }

    fn slot(self) -> usize {
        Permission::ALL
            .iter()
            .position(|p| *p == self)
            .unwrap_or(0)
    }
}

/// A permission tier. Identity fields are immutable after load; the index is
/// re-stamped by the owning graph whenever the ordered list changes, and the
/// per-permission limits may be edited or reset at runtime.
#[derive(Debug)]
pub struct Rank {
    name: String,
    id: String,
    color: String,
    prefix: String,
    index: AtomicUsize,
    permissions: [bool; Permission::COUNT],
    /// Per-permission rank ceiling. `None` means no limit (the rank itself).
    limits: RwLock<Vec<Option<Arc<Rank>>>>,
    pub anti_grief_blocks: u32,
    pub anti_grief_seconds: u32,
    pub draw_limit: u32,
    pub idle_kick_minutes: u32,
}

impl Rank {
    pub fn new(name: &str, id: &str) -> Rank {
        Rank {
            name: name.to_string(),
            id: id.to_string(),
            color: String::new(),
            prefix: String::new(),
            index: AtomicUsize::new(0),
            permissions: [false; Permission::COUNT],
            limits: RwLock::new(vec![None; Permission::COUNT]),
            anti_grief_blocks: 0,
            anti_grief_seconds: 0,
            draw_limit: 0,
            idle_kick_minutes: 0,
        }
    }

    pub fn with_color(mut self, color: &str) -> Rank {
        self.color = color.to_string();
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Rank {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_permissions(mut self, granted: &[Permission]) -> Rank {
        for permission in granted {
            self.permissions[permission.slot()] = true;
        }
        self
    }

    pub fn with_anti_grief(mut self, blocks: u32, seconds: u32) -> Rank {
        self.anti_grief_blocks = blocks;
        self.anti_grief_seconds = seconds;
        self
    }

    pub fn with_draw_limit(mut self, limit: u32) -> Rank {
        self.draw_limit = limit;
        self
    }

    pub fn with_idle_kick(mut self, minutes: u32) -> Rank {
        self.idle_kick_minutes = minutes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Position in the ordered rank list. 0 is the highest rank.
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.permissions[permission.slot()]
    }

    /// True if `self` is strictly higher-ranked than `other`.
    pub fn outranks(&self, other: &Rank) -> bool {
        self.index() < other.index()
    }

    /// True if `self` is at least as high-ranked as `other`.
    pub fn at_least(&self, other: &Rank) -> bool {
        self.index() <= other.index()
    }

    /// The rank ceiling for a permission, or `None` when the rank itself is
    /// the limit.
    pub fn limit(&self, permission: Permission) -> Option<Arc<Rank>> {
        self.limits.read()[permission.slot()].clone()
    }

    pub fn set_limit(&self, permission: Permission, limit: Option<Arc<Rank>>) {
        self.limits.write()[permission.slot()] = limit;
    }
}

impl Classy for Rank {
    fn classy_name(&self) -> String {
        format!("{}{}", self.color, self.name)
    }
}

#[derive(Debug, Error)]
pub enum RankError {
    #[error("duplicate rank name: {0}")]
    DuplicateName(String),
    #[error("duplicate rank id: {0}")]
    DuplicateId(String),
    #[error("rank not found: {0}")]
    NotFound(String),
    #[error("replacement rank must differ from the rank being deleted")]
    SelfReplacement,
    #[error("cannot delete the only rank")]
    LastRank,
}

/// Persisted form of one rank.
#[derive(Debug, Serialize, Deserialize)]
pub struct RankRecord {
    pub name: String,
    pub id: String,
    pub color: String,
    pub prefix: String,
    pub permissions: Vec<String>,
    /// Permission name to limiting rank name.
    pub limits: HashMap<String, String>,
    pub anti_grief_blocks: u32,
    pub anti_grief_seconds: u32,
    pub draw_limit: u32,
    pub idle_kick_minutes: u32,
}

/// Persisted form of the whole graph: ranks in order plus the legacy table.
#[derive(Debug, Serialize, Deserialize)]
pub struct RankGraphRecord {
    pub ranks: Vec<RankRecord>,
    pub legacy_ids: HashMap<String, String>,
}

/// The ordered, totally-ordered list of rank definitions.
pub struct RankGraph {
    ranks: Vec<Arc<Rank>>,
    by_name: HashMap<String, Arc<Rank>>,
    by_id: HashMap<String, Arc<Rank>>,
    legacy_ids: HashMap<String, String>,
}

impl RankGraph {
    pub fn new() -> RankGraph {
        RankGraph {
            ranks: Vec::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            legacy_ids: HashMap::new(),
        }
    }

    /// Inserts a rank at `position` (clamped to the list length). Rejects
    /// duplicate names and ids. Returns the shared handle to the new rank.
    pub fn insert(&mut self, rank: Rank, position: usize) -> Result<Arc<Rank>, RankError> {
        let key = rank.name.to_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(RankError::DuplicateName(rank.name));
        }
        if self.by_id.contains_key(&rank.id) {
            return Err(RankError::DuplicateId(rank.id));
        }

        let rank = Arc::new(rank);
        let position = position.min(self.ranks.len());
        self.ranks.insert(position, Arc::clone(&rank));
        self.by_name.insert(key, Arc::clone(&rank));
        self.by_id.insert(rank.id.clone(), Arc::clone(&rank));
        self.reindex();
        Ok(rank)
    }

    /// Deletes a rank, redirecting its id to `replacement` in the legacy
    /// table. Any other rank whose permission limit pointed at the deleted
    /// rank has that limit reset to default; the number of limits reset is
    /// returned so an operator can re-audit them.
    pub fn delete(&mut self, name: &str, replacement: &str) -> Result<usize, RankError> {
        if self.ranks.len() <= 1 {
            return Err(RankError::LastRank);
        }
        let doomed = self
            .find(name)
            .ok_or_else(|| RankError::NotFound(name.to_string()))?;
        let replacement = self
            .find(replacement)
            .ok_or_else(|| RankError::NotFound(replacement.to_string()))?;
        if Arc::ptr_eq(&doomed, &replacement) {
            return Err(RankError::SelfReplacement);
        }

        self.ranks.retain(|r| !Arc::ptr_eq(r, &doomed));
        self.by_name.remove(&doomed.name.to_lowercase());
        self.by_id.remove(&doomed.id);

        // Re-point existing redirects at the replacement, then record the
        // deleted id itself.
        for target in self.legacy_ids.values_mut() {
            if *target == doomed.id {
                *target = replacement.id.clone();
            }
        }
        self.legacy_ids
            .insert(doomed.id.clone(), replacement.id.clone());

        let mut limits_reset = 0;
        for rank in &self.ranks {
            for permission in Permission::ALL {
                if let Some(limit) = rank.limit(permission) {
                    if Arc::ptr_eq(&limit, &doomed) {
                        rank.set_limit(permission, None);
                        limits_reset += 1;
                    }
                }
            }
        }

        self.reindex();
        Ok(limits_reset)
    }

    /// Moves a rank to a new position in the order and re-stamps indices.
    pub fn reorder(&mut self, name: &str, new_position: usize) -> Result<(), RankError> {
        let rank = self
            .find(name)
            .ok_or_else(|| RankError::NotFound(name.to_string()))?;
        self.ranks.retain(|r| !Arc::ptr_eq(r, &rank));
        let new_position = new_position.min(self.ranks.len());
        self.ranks.insert(new_position, rank);
        self.reindex();
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<Rank>> {
        self.by_name.get(&name.to_lowercase()).cloned()
    }

    /// Looks up a rank by id, following legacy redirects left behind by
    /// deletions. Redirects may chain when replacements were themselves
    /// deleted later; the walk is bounded by the table size.
    pub fn find_by_id(&self, id: &str) -> Option<Arc<Rank>> {
        let mut current = id;
        for _ in 0..=self.legacy_ids.len() {
            if let Some(rank) = self.by_id.get(current) {
                return Some(Arc::clone(rank));
            }
            match self.legacy_ids.get(current) {
                Some(next) => current = next,
                None => return None,
            }
        }
        None
    }

    /// The lowest-authority rank (highest index).
    pub fn lowest(&self) -> Option<Arc<Rank>> {
        self.ranks.last().cloned()
    }

    /// The highest-authority rank (index 0).
    pub fn highest(&self) -> Option<Arc<Rank>> {
        self.ranks.first().cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rank>> {
        self.ranks.iter()
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    fn reindex(&mut self) {
        for (position, rank) in self.ranks.iter().enumerate() {
            rank.index.store(position, Ordering::Release);
        }
    }

    pub fn to_record(&self) -> RankGraphRecord {
        let ranks = self
            .ranks
            .iter()
            .map(|rank| {
                let permissions = Permission::ALL
                    .iter()
                    .filter(|p| rank.can(**p))
                    .map(|p| p.name().to_string())
                    .collect();
                let mut limits = HashMap::new();
                for permission in Permission::ALL {
                    if let Some(limit) = rank.limit(permission) {
                        limits.insert(permission.name().to_string(), limit.name.clone());
                    }
                }
                RankRecord {
                    name: rank.name.clone(),
                    id: rank.id.clone(),
                    color: rank.color.clone(),
                    prefix: rank.prefix.clone(),
                    permissions,
                    limits,
                    anti_grief_blocks: rank.anti_grief_blocks,
                    anti_grief_seconds: rank.anti_grief_seconds,
                    draw_limit: rank.draw_limit,
                    idle_kick_minutes: rank.idle_kick_minutes,
                }
            })
            .collect();
        RankGraphRecord {
            ranks,
            legacy_ids: self.legacy_ids.clone(),
        }
    }

    /// Rebuilds a graph from its persisted record. Malformed permission or
    /// limit references are logged and skipped or reset rather than failing
    /// the whole load.
    pub fn from_record(record: RankGraphRecord) -> Result<RankGraph, RankError> {
        let mut graph = RankGraph::new();

        for entry in &record.ranks {
            let mut rank = Rank::new(&entry.name, &entry.id)
                .with_color(&entry.color)
                .with_prefix(&entry.prefix)
                .with_anti_grief(entry.anti_grief_blocks, entry.anti_grief_seconds)
                .with_draw_limit(entry.draw_limit)
                .with_idle_kick(entry.idle_kick_minutes);
            for name in &entry.permissions {
                match Permission::from_name(name) {
                    Some(permission) => rank.permissions[permission.slot()] = true,
                    None => warn!("Rank '{}': unknown permission '{}' skipped", entry.name, name),
                }
            }
            let position = graph.len();
            graph.insert(rank, position)?;
        }

        // Limits can only be resolved once every rank exists.
        for entry in &record.ranks {
            let Some(rank) = graph.find(&entry.name) else {
                continue;
            };
            for (permission_name, limit_name) in &entry.limits {
                let Some(permission) = Permission::from_name(permission_name) else {
                    warn!(
                        "Rank '{}': unknown permission '{}' in limits skipped",
                        entry.name, permission_name
                    );
                    continue;
                };
                match graph.find(limit_name) {
                    Some(limit) => rank.set_limit(permission, Some(limit)),
                    None => warn!(
                        "Rank '{}': limit rank '{}' for '{}' not found, defaulting to no limit",
                        entry.name, limit_name, permission_name
                    ),
                }
            }
        }

        graph.legacy_ids = record.legacy_ids;
        Ok(graph)
    }

    /// The stock four-tier ladder used when no rank configuration exists.
    pub fn with_defaults() -> RankGraph {
        let mut graph = RankGraph::new();
        let build = [Permission::Chat, Permission::Build, Permission::Delete];
        let trusted = [
            Permission::Chat,
            Permission::Build,
            Permission::Delete,
            Permission::Draw,
            Permission::Teleport,
            Permission::PlaceWater,
            Permission::PlaceLava,
        ];
        let op = [
            Permission::Chat,
            Permission::Build,
            Permission::Delete,
            Permission::Draw,
            Permission::Teleport,
            Permission::PlaceWater,
            Permission::PlaceLava,
            Permission::PlaceAdmincrete,
            Permission::DeleteAdmincrete,
            Permission::ManageZones,
            Permission::Lock,
            Permission::Kick,
        ];

        // Insertion order is highest first, so positions are appended.
        let inserts = [
            Rank::new("owner", "rank-owner")
                .with_color("&c")
                .with_permissions(&Permission::ALL),
            Rank::new("op", "rank-op")
                .with_color("&9")
                .with_permissions(&op)
                .with_draw_limit(200_000),
            Rank::new("builder", "rank-builder")
                .with_color("&f")
                .with_permissions(&trusted)
                .with_anti_grief(47, 6)
                .with_draw_limit(8_000)
                .with_idle_kick(20),
            Rank::new("guest", "rank-guest")
                .with_color("&7")
                .with_permissions(&build)
                .with_anti_grief(37, 5)
                .with_idle_kick(10),
        ];
        for rank in inserts {
            let position = graph.len();
            // Stock names and ids are distinct, insertion cannot fail.
            let _ = graph.insert(rank, position);
        }
        graph
    }
}

impl Default for RankGraph {
    fn default() -> Self {
        RankGraph::with_defaults()
    }
}

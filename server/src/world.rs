//! World state: the shared block array, the block-change queue, and the
//! tick that drains it.
//!
//! Many actor threads enqueue approved changes concurrently; exactly one
//! consumer, the world's scheduled tick, ever writes the block array. The
//! array cells are relaxed atomics so readers (the authorizer checking the
//! current block, session resends) can load them without synchronization;
//! all stores happen on the tick path.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared::{Block, BlockChangeCause, Position};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::access::{AccessPolicy, PolicyRecord};
use crate::config::ServerConfig;
use crate::player::PlayerInfo;
use crate::rank::{Rank, RankGraph};
use crate::utils::timestamp_millis;
use crate::zone::{ZoneIndex, ZoneRecord};

/// Per-tick update ceiling applied when nobody is observing the world, so
/// simulation still progresses while the world is empty.
const EMPTY_WORLD_BUDGET: usize = 100_000;

/// Capacity of the applied-change fan-out channel.
const BROADCAST_CHANNEL_SIZE: usize = 4096;

/// One proposed change to a single block position. Immutable once built;
/// produced by an approved placement, consumed exactly once by the tick.
#[derive(Debug, Clone)]
pub struct BlockUpdate {
    pub pos: Position,
    pub old_block: Block,
    pub new_block: Block,
    /// Session id of the originating actor, if any; used to skip the
    /// originator when broadcasting.
    pub actor_id: Option<u32>,
    /// Persistent name of the originating actor, for ownership stamping.
    pub actor_name: Option<String>,
    pub cause: BlockChangeCause,
    pub timestamp: u64,
}

impl BlockUpdate {
    /// An unattributed change (physics, restore jobs).
    pub fn new(
        pos: Position,
        old_block: Block,
        new_block: Block,
        cause: BlockChangeCause,
    ) -> BlockUpdate {
        BlockUpdate {
            pos,
            old_block,
            new_block,
            actor_id: None,
            actor_name: None,
            cause,
            timestamp: timestamp_millis(),
        }
    }

    /// A change attributed to a connected actor.
    pub fn by(
        actor: &PlayerInfo,
        pos: Position,
        old_block: Block,
        new_block: Block,
        cause: BlockChangeCause,
    ) -> BlockUpdate {
        BlockUpdate {
            pos,
            old_block,
            new_block,
            actor_id: Some(actor.id()),
            actor_name: Some(actor.name().to_string()),
            cause,
            timestamp: timestamp_millis(),
        }
    }
}

/// A change that made it into the block array, fanned out to observers. The
/// session layer skips the originating actor when relaying it.
#[derive(Debug, Clone)]
pub struct AppliedChange {
    pub pos: Position,
    pub block: Block,
    pub origin: Option<u32>,
}

/// Sparse block-ownership audit data: actor names get a compact numeric id
/// the first time they touch a block, and each touched cell remembers the
/// last such id.
struct OwnerTable {
    compact_ids: HashMap<String, u16>,
    next_id: u16,
    owners: HashMap<usize, u16>,
}

impl OwnerTable {
    fn new() -> OwnerTable {
        OwnerTable {
            compact_ids: HashMap::new(),
            next_id: 1,
            owners: HashMap::new(),
        }
    }

    fn stamp(&mut self, cell: usize, actor: &str) -> u16 {
        let id = match self.compact_ids.get(actor) {
            Some(id) => *id,
            None => {
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1).max(1);
                self.compact_ids.insert(actor.to_string(), id);
                id
            }
        };
        self.owners.insert(cell, id);
        id
    }
}

/// The block grid of one world. `width` spans x, `length` spans y, `height`
/// spans h.
pub struct Map {
    width: i16,
    length: i16,
    height: i16,
    blocks: Box<[AtomicU8]>,
    owners: Mutex<OwnerTable>,
}

impl Map {
    pub fn new(width: i16, length: i16, height: i16) -> Map {
        let volume = width as usize * length as usize * height as usize;
        let blocks = (0..volume)
            .map(|_| AtomicU8::new(Block::Air.id()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Map {
            width,
            length,
            height,
            blocks,
            owners: Mutex::new(OwnerTable::new()),
        }
    }

    /// A flat test/starter world: dirt below `ground`, grass at `ground`.
    pub fn flat(width: i16, length: i16, height: i16, ground: i16) -> Map {
        let map = Map::new(width, length, height);
        for h in 0..=ground.min(height - 1) {
            let block = if h == ground { Block::Grass } else { Block::Dirt };
            for y in 0..length {
                for x in 0..width {
                    if let Some(cell) = map.cell(Position::new(x, y, h)) {
                        map.blocks[cell].store(block.id(), Ordering::Relaxed);
                    }
                }
            }
        }
        map
    }

    pub fn dimensions(&self) -> (i16, i16, i16) {
        (self.width, self.length, self.height)
    }

    pub fn volume(&self) -> usize {
        self.blocks.len()
    }

    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= 0
            && pos.x < self.width
            && pos.y >= 0
            && pos.y < self.length
            && pos.h >= 0
            && pos.h < self.height
    }

    fn cell(&self, pos: Position) -> Option<usize> {
        if !self.in_bounds(pos) {
            return None;
        }
        let (x, y, h) = (pos.x as usize, pos.y as usize, pos.h as usize);
        Some((h * self.length as usize + y) * self.width as usize + x)
    }

    /// Current block at a position; `None` out of bounds.
    pub fn block_at(&self, pos: Position) -> Option<Block> {
        let cell = self.cell(pos)?;
        let raw = self.blocks[cell].load(Ordering::Relaxed);
        Some(Block::from_id(raw).unwrap_or(Block::Air))
    }

    /// Compact owner id stamped on a position, if any actor touched it.
    pub fn owner_of(&self, pos: Position) -> Option<u16> {
        let cell = self.cell(pos)?;
        self.owners.lock().owners.get(&cell).copied()
    }

    /// Compact id assigned to an actor name, if it ever touched a block.
    pub fn compact_id(&self, actor: &str) -> Option<u16> {
        self.owners.lock().compact_ids.get(actor).copied()
    }
}

/// Persisted per-world metadata: the build policy and the zone set. The
/// block array itself is saved by the map binary format, which lives outside
/// this crate.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorldRecord {
    pub name: String,
    pub policy: PolicyRecord<String>,
    pub zones: Vec<ZoneRecord>,
}

/// One world: map, access control, zones, the block-change queue and its
/// single scheduled consumer.
pub struct World {
    name: String,
    map: Map,
    pub policy: AccessPolicy<String>,
    pub zones: ZoneIndex,
    queue_tx: Sender<BlockUpdate>,
    queue_rx: Mutex<Receiver<BlockUpdate>>,
    locked: AtomicBool,
    loaded: AtomicBool,
    pending_unload: AtomicBool,
    observers: RwLock<HashSet<u32>>,
    changes_tx: broadcast::Sender<AppliedChange>,
}

impl World {
    pub fn new(name: &str, map: Map, build_rank: Arc<Rank>) -> World {
        let (queue_tx, queue_rx) = unbounded();
        let (changes_tx, _) = broadcast::channel(BROADCAST_CHANNEL_SIZE);
        World {
            name: name.to_string(),
            map,
            policy: AccessPolicy::new(build_rank),
            zones: ZoneIndex::new(),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            locked: AtomicBool::new(false),
            loaded: AtomicBool::new(true),
            pending_unload: AtomicBool::new(false),
            observers: RwLock::new(HashSet::new()),
            changes_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    /// Queues an approved change. Never blocks the calling actor thread.
    pub fn enqueue(&self, update: BlockUpdate) {
        // Send on an unbounded channel only fails when the receiver is gone,
        // which cannot outlive the world.
        let _ = self.queue_tx.send(update);
    }

    pub fn queued_changes(&self) -> usize {
        self.queue_rx.lock().len()
    }

    /// Subscribes to changes applied by the tick.
    pub fn subscribe(&self) -> broadcast::Receiver<AppliedChange> {
        self.changes_tx.subscribe()
    }

    pub fn observer_join(&self, actor_id: u32) {
        self.observers.write().insert(actor_id);
    }

    pub fn observer_leave(&self, actor_id: u32) {
        self.observers.write().remove(&actor_id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Puts the world in read-only mode: queued and future changes are
    /// discarded until unlocked.
    pub fn lock(&self) {
        if !self.locked.swap(true, Ordering::AcqRel) {
            info!("World '{}' locked", self.name);
        }
    }

    pub fn unlock(&self) {
        if self.locked.swap(false, Ordering::AcqRel) {
            info!("World '{}' unlocked", self.name);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Marks the world for unload once its queue is empty and the last
    /// observer leaves.
    pub fn request_unload(&self) {
        self.pending_unload.store(true, Ordering::Release);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Per-tick update budget. Bandwidth is KB/s; the 128 factor converts
    /// the per-tick share into update packets. Without observers a large
    /// fixed ceiling keeps simulation moving.
    pub fn update_budget(&self, config: &ServerConfig) -> usize {
        let tps = config.ticks_per_second().max(1);
        let ticks_budget = (config.packets_per_second / tps) as usize;
        let bandwidth_budget = (config.upload_bandwidth / tps * 128) as usize;
        let observers = self.observer_count();
        if observers > 0 {
            (bandwidth_budget / observers).min(ticks_budget)
        } else {
            EMPTY_WORLD_BUDGET
        }
    }

    /// One scheduled tick: drain the queue under the computed budget, or
    /// discard it entirely while the world is locked. Returns how many
    /// updates were applied.
    pub fn tick(&self, config: &ServerConfig) -> usize {
        if self.is_locked() {
            let discarded = self.discard_queue();
            if discarded > 0 {
                debug!(
                    "World '{}' locked: discarded {} queued changes",
                    self.name, discarded
                );
            }
            self.check_pending_unload();
            return 0;
        }

        let budget = self.update_budget(config);
        let applied = self.process_updates(budget);
        self.check_pending_unload();
        applied
    }

    /// Dequeues and applies at most `budget` updates in FIFO order. This is
    /// the only code path that writes the block array.
    pub fn process_updates(&self, budget: usize) -> usize {
        let queue = self.queue_rx.lock();
        let mut applied = 0;
        for _ in 0..budget {
            let update = match queue.try_recv() {
                Ok(update) => update,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };

            let Some(cell) = self.map.cell(update.pos) else {
                debug!(
                    "World '{}': skipped out-of-bounds update at ({}, {}, {})",
                    self.name, update.pos.x, update.pos.y, update.pos.h
                );
                continue;
            };

            self.map.blocks[cell].store(update.new_block.id(), Ordering::Relaxed);
            if let Some(actor) = &update.actor_name {
                self.map.owners.lock().stamp(cell, actor);
            }
            // No receivers just means nobody is watching this world.
            let _ = self.changes_tx.send(AppliedChange {
                pos: update.pos,
                block: update.new_block,
                origin: update.actor_id,
            });
            applied += 1;
        }
        applied
    }

    fn discard_queue(&self) -> usize {
        let queue = self.queue_rx.lock();
        let mut discarded = 0;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    fn check_pending_unload(&self) {
        if self.pending_unload.load(Ordering::Acquire)
            && self.observers.read().is_empty()
            && self.queue_rx.lock().is_empty()
            && self.loaded.swap(false, Ordering::AcqRel)
        {
            info!("World '{}' unloaded", self.name);
        }
    }

    pub fn to_record(&self) -> WorldRecord {
        WorldRecord {
            name: self.name.clone(),
            policy: self.policy.to_record(),
            zones: self.zones.to_records(),
        }
    }

    /// Rebuilds a world around a freshly loaded map from its persisted
    /// metadata.
    pub fn from_record(record: WorldRecord, map: Map, ranks: &RankGraph) -> Option<World> {
        let build_rank = ranks.lowest()?;
        let mut world = World::new(&record.name, map, build_rank);
        if let Some(policy) = AccessPolicy::from_record(record.policy, ranks) {
            world.policy = policy;
        }
        world.zones = ZoneIndex::from_records(record.zones, ranks);
        Some(world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerRegistry;
    use crate::rank::RankGraph;

    fn graph() -> RankGraph {
        RankGraph::with_defaults()
    }

    fn world(graph: &RankGraph) -> World {
        World::new("main", Map::new(16, 16, 16), graph.find("guest").unwrap())
    }

    fn update_at(x: i16, y: i16, h: i16, block: Block) -> BlockUpdate {
        BlockUpdate::new(
            Position::new(x, y, h),
            Block::Air,
            block,
            BlockChangeCause::Built,
        )
    }

    #[test]
    fn test_map_bounds_and_cells() {
        let map = Map::new(4, 5, 6);
        assert_eq!(map.volume(), 4 * 5 * 6);
        assert!(map.in_bounds(Position::new(3, 4, 5)));
        assert!(!map.in_bounds(Position::new(4, 0, 0)));
        assert!(!map.in_bounds(Position::new(-1, 0, 0)));
        assert_eq!(map.block_at(Position::new(0, 0, 0)), Some(Block::Air));
        assert_eq!(map.block_at(Position::new(9, 9, 9)), None);
    }

    #[test]
    fn test_flat_map_layers() {
        let map = Map::flat(8, 8, 8, 3);
        assert_eq!(map.block_at(Position::new(2, 2, 0)), Some(Block::Dirt));
        assert_eq!(map.block_at(Position::new(2, 2, 3)), Some(Block::Grass));
        assert_eq!(map.block_at(Position::new(2, 2, 4)), Some(Block::Air));
    }

    #[test]
    fn test_drain_respects_budget() {
        let graph = graph();
        let world = world(&graph);

        for i in 0..12 {
            world.enqueue(update_at(i, 0, 0, Block::Stone));
        }

        // Budget 5 over 12 queued updates drains as 5, 5, 2.
        assert_eq!(world.process_updates(5), 5);
        assert_eq!(world.process_updates(5), 5);
        assert_eq!(world.process_updates(5), 2);
        assert_eq!(world.process_updates(5), 0);
    }

    #[test]
    fn test_drain_applies_in_fifo_order() {
        let graph = graph();
        let world = world(&graph);
        let pos = Position::new(1, 1, 1);

        world.enqueue(update_at(1, 1, 1, Block::Stone));
        world.enqueue(update_at(1, 1, 1, Block::Glass));
        world.process_updates(1);
        assert_eq!(world.map().block_at(pos), Some(Block::Stone));
        world.process_updates(1);
        assert_eq!(world.map().block_at(pos), Some(Block::Glass));
    }

    #[test]
    fn test_out_of_bounds_update_skipped() {
        let graph = graph();
        let world = world(&graph);

        world.enqueue(update_at(99, 0, 0, Block::Stone));
        world.enqueue(update_at(2, 2, 2, Block::Stone));

        world.process_updates(10);
        assert_eq!(world.map().block_at(Position::new(2, 2, 2)), Some(Block::Stone));
    }

    #[test]
    fn test_locked_world_discards_queue() {
        let graph = graph();
        let world = world(&graph);
        let config = ServerConfig::default();

        world.enqueue(update_at(1, 1, 1, Block::Stone));
        world.lock();
        assert_eq!(world.tick(&config), 0);
        assert_eq!(world.queued_changes(), 0);
        assert_eq!(world.map().block_at(Position::new(1, 1, 1)), Some(Block::Air));

        // Unlocking resumes normal draining of later changes.
        world.unlock();
        world.enqueue(update_at(1, 1, 1, Block::Stone));
        assert_eq!(world.tick(&config), 1);
        assert_eq!(world.map().block_at(Position::new(1, 1, 1)), Some(Block::Stone));
    }

    #[test]
    fn test_update_budget_math() {
        let graph = graph();
        let world = world(&graph);
        let mut config = ServerConfig::default();
        config.packets_per_second = 200;
        config.upload_bandwidth = 100;
        config.tick_interval_ms = 100;

        // Nobody watching: the fixed ceiling applies.
        assert_eq!(world.update_budget(&config), EMPTY_WORLD_BUDGET);

        // 10 ticks/s: ticks budget 20, bandwidth budget 1280.
        world.observer_join(1);
        assert_eq!(world.update_budget(&config), 20);

        // Enough observers that the bandwidth share is the binding limit.
        for id in 2..=100 {
            world.observer_join(id);
        }
        assert_eq!(world.update_budget(&config), 12);
    }

    #[test]
    fn test_owner_stamping_assigns_compact_ids() {
        let graph = graph();
        let world = world(&graph);
        let registry = PlayerRegistry::new(4);
        let rank = graph.find("guest").unwrap();
        let ada = registry.add("ada", Arc::clone(&rank)).unwrap();
        let bo = registry.add("bo", Arc::clone(&rank)).unwrap();

        let a = Position::new(1, 1, 1);
        let b = Position::new(2, 2, 2);
        let c = Position::new(3, 3, 3);
        world.enqueue(BlockUpdate::by(&ada, a, Block::Air, Block::Stone, BlockChangeCause::Built));
        world.enqueue(BlockUpdate::by(&ada, b, Block::Air, Block::Stone, BlockChangeCause::Built));
        world.enqueue(BlockUpdate::by(&bo, c, Block::Air, Block::Stone, BlockChangeCause::Built));
        world.process_updates(10);

        let ada_id = world.map().compact_id("ada").unwrap();
        let bo_id = world.map().compact_id("bo").unwrap();
        assert_ne!(ada_id, bo_id);
        assert_eq!(world.map().owner_of(a), Some(ada_id));
        assert_eq!(world.map().owner_of(b), Some(ada_id));
        assert_eq!(world.map().owner_of(c), Some(bo_id));
        assert_eq!(world.map().owner_of(Position::new(9, 9, 9)), None);
    }

    #[test]
    fn test_broadcast_carries_origin() {
        let graph = graph();
        let world = world(&graph);
        let registry = PlayerRegistry::new(4);
        let rank = graph.find("guest").unwrap();
        let ada = registry.add("ada", Arc::clone(&rank)).unwrap();

        let mut changes = world.subscribe();
        let pos = Position::new(1, 2, 3);
        world.enqueue(BlockUpdate::by(&ada, pos, Block::Air, Block::Stone, BlockChangeCause::Built));
        world.process_updates(1);

        let change = changes.try_recv().unwrap();
        assert_eq!(change.pos, pos);
        assert_eq!(change.block, Block::Stone);
        assert_eq!(change.origin, Some(ada.id()));
    }

    #[test]
    fn test_pending_unload_waits_for_queue_and_observers() {
        let graph = graph();
        let world = world(&graph);
        let config = ServerConfig::default();

        world.observer_join(1);
        world.enqueue(update_at(1, 1, 1, Block::Stone));
        world.request_unload();

        world.tick(&config);
        assert!(world.is_loaded(), "unloaded while an observer remains");

        world.observer_leave(1);
        world.tick(&config);
        assert!(!world.is_loaded());
    }

    #[test]
    fn test_record_roundtrip() {
        let graph = graph();
        let world = world(&graph);
        world.policy.set_min_rank(graph.find("builder").unwrap());
        world.policy.include("ada".to_string());

        let record = world.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let parsed: WorldRecord = serde_json::from_str(&json).unwrap();
        let restored = World::from_record(parsed, Map::new(16, 16, 16), &graph).unwrap();

        assert_eq!(restored.name(), "main");
        assert_eq!(restored.policy.min_rank().name(), "builder");
        let guest = graph.find("guest").unwrap();
        assert!(restored.policy.check(&"ada".to_string(), &guest));
    }
}

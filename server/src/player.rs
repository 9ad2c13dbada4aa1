//! Connected actors and their registry.
//!
//! This module handles the server-side roster of connected players:
//! - session lifecycle (join, leave, capacity enforcement)
//! - rank lookups for the permission pipeline
//! - idle tracking against the rank's idle-kick threshold
//! - the anti-grief placement window
//!
//! Network address bookkeeping stays in the session layer; game logic only
//! ever sees `PlayerInfo` handles.

use log::info;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::rank::{Classy, Permission, Rank};

/// One connected actor. Shared freely across the session, authorization and
/// tick layers; all mutable state is interior.
pub struct PlayerInfo {
    id: u32,
    name: String,
    rank: RwLock<Arc<Rank>>,
    last_active: Mutex<Instant>,
    placements: Mutex<VecDeque<Instant>>,
}

impl PlayerInfo {
    fn new(id: u32, name: &str, rank: Arc<Rank>) -> PlayerInfo {
        PlayerInfo {
            id,
            name: name.to_string(),
            rank: RwLock::new(rank),
            last_active: Mutex::new(Instant::now()),
            placements: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> Arc<Rank> {
        Arc::clone(&self.rank.read())
    }

    pub fn set_rank(&self, rank: Arc<Rank>) {
        *self.rank.write() = rank;
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.rank.read().can(permission)
    }

    /// Marks the player as active now.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// True once the player has idled past their rank's kick threshold.
    /// Ranks with a zero threshold are never idle-kicked.
    pub fn idle_kick_due(&self) -> bool {
        let minutes = self.rank.read().idle_kick_minutes;
        minutes > 0 && self.idle_for() > Duration::from_secs(minutes as u64 * 60)
    }

    /// Records a placement and reports whether it pushes the player over the
    /// rank's anti-grief threshold (more than `anti_grief_blocks` changes
    /// within `anti_grief_seconds`). Ranks with zero thresholds are exempt.
    pub fn check_block_spam(&self) -> bool {
        let rank = self.rank();
        if rank.anti_grief_blocks == 0 || rank.anti_grief_seconds == 0 {
            return false;
        }
        let window = Duration::from_secs(rank.anti_grief_seconds as u64);
        let now = Instant::now();

        let mut placements = self.placements.lock();
        while let Some(oldest) = placements.front() {
            if now.duration_since(*oldest) > window {
                placements.pop_front();
            } else {
                break;
            }
        }
        placements.push_back(now);
        placements.len() > rank.anti_grief_blocks as usize
    }
}

impl Classy for PlayerInfo {
    fn classy_name(&self) -> String {
        let rank = self.rank.read();
        format!("{}{}{}", rank.color(), rank.prefix(), self.name)
    }
}

/// Roster of all connected players, capacity-limited.
pub struct PlayerRegistry {
    players: RwLock<HashMap<u32, Arc<PlayerInfo>>>,
    next_id: Mutex<u32>,
    max_players: usize,
}

impl PlayerRegistry {
    pub fn new(max_players: usize) -> PlayerRegistry {
        PlayerRegistry {
            players: RwLock::new(HashMap::new()),
            next_id: Mutex::new(1),
            max_players,
        }
    }

    /// Registers a new player. Returns `None` when the server is full or the
    /// name is already connected.
    pub fn add(&self, name: &str, rank: Arc<Rank>) -> Option<Arc<PlayerInfo>> {
        let mut players = self.players.write();
        if players.len() >= self.max_players {
            return None;
        }
        if players.values().any(|p| p.name.eq_ignore_ascii_case(name)) {
            return None;
        }

        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let player = Arc::new(PlayerInfo::new(id, name, rank));
        info!("Player {} connected as #{}", name, id);
        players.insert(id, Arc::clone(&player));
        Some(player)
    }

    pub fn remove(&self, id: u32) -> bool {
        if let Some(player) = self.players.write().remove(&id) {
            info!("Player {} disconnected", player.name);
            true
        } else {
            false
        }
    }

    pub fn find(&self, id: u32) -> Option<Arc<PlayerInfo>> {
        self.players.read().get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<PlayerInfo>> {
        self.players
            .read()
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<PlayerInfo>> {
        self.players.read().values().cloned().collect()
    }

    /// Players currently past their rank's idle-kick threshold.
    pub fn idle_players(&self) -> Vec<Arc<PlayerInfo>> {
        self.players
            .read()
            .values()
            .filter(|p| p.idle_kick_due())
            .cloned()
            .collect()
    }

    /// Moves every player holding `from` onto `to`; used when a rank is
    /// deleted so nobody keeps a rank that no longer exists. Returns how
    /// many players were moved.
    pub fn reassign_rank(&self, from: &Rank, to: Arc<Rank>) -> usize {
        let mut moved = 0;
        for player in self.players.read().values() {
            if std::ptr::eq(Arc::as_ptr(&player.rank()), from as *const Rank) {
                player.set_rank(Arc::clone(&to));
                moved += 1;
            }
        }
        moved
    }

    pub fn len(&self) -> usize {
        self.players.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.read().is_empty()
    }
}

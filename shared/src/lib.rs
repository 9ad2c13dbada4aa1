use serde::{Deserialize, Serialize};

/// Wire protocol version expected from connecting clients.
pub const PROTOCOL_VERSION: u32 = 7;

/// Maximum serialized packet size accepted by either side.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Block types understood by the server, with their wire identifiers.
///
/// The discriminants are the classic-protocol block ids and are what travels
/// in `Packet::SetBlock` / `Packet::BlockUpdate`. Only blocks the server
/// actually reasons about are listed; unknown ids are rejected at the session
/// layer before they reach game logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Block {
    Air = 0,
    Stone = 1,
    Grass = 2,
    Dirt = 3,
    Cobblestone = 4,
    Planks = 5,
    Sapling = 6,
    Admincrete = 7,
    Water = 8,
    StillWater = 9,
    Lava = 10,
    StillLava = 11,
    Sand = 12,
    Gravel = 13,
    Log = 17,
    Leaves = 18,
    Glass = 20,
    DoubleStair = 43,
    Stair = 44,
}

impl Block {
    /// Maps a wire id back to a block, if the server knows it.
    pub fn from_id(id: u8) -> Option<Block> {
        let block = match id {
            0 => Block::Air,
            1 => Block::Stone,
            2 => Block::Grass,
            3 => Block::Dirt,
            4 => Block::Cobblestone,
            5 => Block::Planks,
            6 => Block::Sapling,
            7 => Block::Admincrete,
            8 => Block::Water,
            9 => Block::StillWater,
            10 => Block::Lava,
            11 => Block::StillLava,
            12 => Block::Sand,
            13 => Block::Gravel,
            17 => Block::Log,
            18 => Block::Leaves,
            20 => Block::Glass,
            43 => Block::DoubleStair,
            44 => Block::Stair,
            _ => return None,
        };
        Some(block)
    }

    /// The id sent on the wire and stored in the map's block array.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// True for flowing or still water.
    pub fn is_water(self) -> bool {
        matches!(self, Block::Water | Block::StillWater)
    }

    /// True for flowing or still lava.
    pub fn is_lava(self) -> bool {
        matches!(self, Block::Lava | Block::StillLava)
    }

    pub fn is_liquid(self) -> bool {
        self.is_water() || self.is_lava()
    }
}

/// A block position within a world. `h` is the vertical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i16,
    pub y: i16,
    pub h: i16,
}

impl Position {
    pub fn new(x: i16, y: i16, h: i16) -> Self {
        Self { x, y, h }
    }

    /// The same column position, one layer lower.
    pub fn below(self) -> Position {
        Position {
            x: self.x,
            y: self.y,
            h: self.h - 1,
        }
    }
}

/// Why a block change happened, carried with every queued update for
/// auditing and for consumers that care about provenance (undo, logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockChangeCause {
    Built,
    Deleted,
    Painted,
    Drawn,
    Replaced,
    Pasted,
    Undone,
    Restored,
}

/// Whether a client click is placing a block or removing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClickAction {
    Build,
    Delete,
}

/// Packets exchanged between client and server, bincode-serialized.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        name: String,
        client_version: u32,
    },
    SetBlock {
        x: i16,
        y: i16,
        h: i16,
        action: ClickAction,
        block: u8,
    },
    Disconnect,

    Connected {
        actor_id: u32,
    },
    BlockUpdate {
        x: i16,
        y: i16,
        h: i16,
        block: u8,
    },
    Message {
        text: String,
    },
    Disconnected {
        reason: String,
    },
}

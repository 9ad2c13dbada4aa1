//! Server session layer: UDP transport, connection handshake, and the
//! bridge between client clicks and the authorization/update core.
//!
//! Placement requests are authorized on the session task and, when approved,
//! enqueued for the world's scheduled tick; rejected requests get the
//! authoritative block resent plus a reason message. Applied changes come
//! back through the world's broadcast channel and are relayed to every
//! observer except the originator.

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    Block, BlockChangeCause, ClickAction, Packet, Position, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

use crate::authorizer::{can_place, plan_placement, CanPlaceResult};
use crate::player::{PlayerInfo, PlayerRegistry};
use crate::rank::Rank;
use crate::world::{BlockUpdate, World};

/// Messages sent from network tasks to the main session loop
#[derive(Debug)]
pub enum SessionMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    /// Disconnect every player past their rank's idle threshold.
    KickIdle,
    Shutdown,
}

/// Cloneable control handle into a running session loop, for scheduler
/// tasks and shutdown wiring.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn kick_idle(&self) {
        let _ = self.tx.send(SessionMessage::KickIdle);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SessionMessage::Shutdown);
    }
}

/// Messages sent from the session loop to the outbound network task
#[derive(Debug)]
pub enum OutboundMessage {
    Send {
        packet: Packet,
        addr: SocketAddr,
    },
    Broadcast {
        packet: Packet,
        exclude: Option<u32>,
    },
}

/// Maps between network addresses and connected actor ids.
#[derive(Default)]
struct AddrBook {
    by_addr: HashMap<SocketAddr, u32>,
    by_actor: HashMap<u32, SocketAddr>,
}

impl AddrBook {
    fn insert(&mut self, addr: SocketAddr, actor_id: u32) {
        self.by_addr.insert(addr, actor_id);
        self.by_actor.insert(actor_id, addr);
    }

    fn remove_actor(&mut self, actor_id: u32) {
        if let Some(addr) = self.by_actor.remove(&actor_id) {
            self.by_addr.remove(&addr);
        }
    }
}

/// The session server: owns the socket and wires actors to the world.
pub struct Server {
    socket: Arc<UdpSocket>,
    registry: Arc<PlayerRegistry>,
    world: Arc<World>,
    default_rank: Arc<Rank>,
    addr_book: Arc<RwLock<AddrBook>>,

    session_tx: mpsc::UnboundedSender<SessionMessage>,
    session_rx: mpsc::UnboundedReceiver<SessionMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: Option<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        registry: Arc<PlayerRegistry>,
        world: Arc<World>,
        default_rank: Arc<Rank>,
    ) -> Result<Server, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            registry,
            world,
            default_rank,
            addr_book: Arc::new(RwLock::new(AddrBook::default())),
            session_tx,
            session_rx,
            out_tx,
            out_rx: Some(out_rx),
        })
    }

    /// Spawns the task that listens for incoming packets
    fn spawn_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let session_tx = self.session_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if session_tx
                                .send(SessionMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outbound queue
    fn spawn_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let addr_book = Arc::clone(&self.addr_book);
        let Some(mut out_rx) = self.out_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::Send { packet, addr } => {
                        Self::send_impl(&socket, &packet, addr).await;
                    }
                    OutboundMessage::Broadcast { packet, exclude } => {
                        let targets: Vec<(u32, SocketAddr)> = {
                            let book = addr_book.read().await;
                            book.by_actor.iter().map(|(id, a)| (*id, *a)).collect()
                        };
                        for (actor_id, addr) in targets {
                            if Some(actor_id) == exclude {
                                continue;
                            }
                            Self::send_impl(&socket, &packet, addr).await;
                        }
                    }
                }
            }
        });
    }

    /// Spawns the task relaying applied block changes to observers
    fn spawn_change_relay(&self) {
        let mut changes = self.world.subscribe();
        let out_tx = self.out_tx.clone();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let packet = Packet::BlockUpdate {
                            x: change.pos.x,
                            y: change.pos.y,
                            h: change.pos.h,
                            block: change.block.id(),
                        };
                        if out_tx
                            .send(OutboundMessage::Broadcast {
                                packet,
                                exclude: change.origin,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Change relay lagged, {} updates dropped", missed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn send_impl(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) {
        match serialize(packet) {
            Ok(data) => {
                if let Err(e) = socket.send_to(&data, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
            Err(e) => error!("Failed to serialize packet: {}", e),
        }
    }

    /// A control handle usable from scheduler tasks and shutdown wiring.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.session_tx.clone(),
        }
    }

    fn send(&self, packet: Packet, addr: SocketAddr) {
        let _ = self.out_tx.send(OutboundMessage::Send { packet, addr });
    }

    pub fn broadcast(&self, packet: Packet, exclude: Option<u32>) {
        let _ = self.out_tx.send(OutboundMessage::Broadcast { packet, exclude });
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                name,
                client_version,
            } => {
                if client_version != PROTOCOL_VERSION {
                    self.send(
                        Packet::Disconnected {
                            reason: "Protocol version mismatch".to_string(),
                        },
                        addr,
                    );
                    return;
                }
                if !crate::utils::is_valid_name(&name) {
                    self.send(
                        Packet::Disconnected {
                            reason: "Invalid player name".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Replace an existing session from the same address.
                let existing = self.addr_book.read().await.by_addr.get(&addr).copied();
                if let Some(actor_id) = existing {
                    self.drop_actor(actor_id).await;
                }

                match self.registry.add(&name, Arc::clone(&self.default_rank)) {
                    Some(actor) => {
                        self.addr_book.write().await.insert(addr, actor.id());
                        self.world.observer_join(actor.id());
                        self.send(Packet::Connected { actor_id: actor.id() }, addr);
                        info!("Actor {} joined world '{}'", actor.name(), self.world.name());
                    }
                    None => {
                        self.send(
                            Packet::Disconnected {
                                reason: "Server full or name taken".to_string(),
                            },
                            addr,
                        );
                    }
                }
            }

            Packet::SetBlock {
                x,
                y,
                h,
                action,
                block,
            } => {
                let actor_id = self.addr_book.read().await.by_addr.get(&addr).copied();
                let Some(actor_id) = actor_id else {
                    debug!("SetBlock from unknown address {}", addr);
                    return;
                };
                let Some(actor) = self.registry.find(actor_id) else {
                    return;
                };
                self.submit_placement(&actor, addr, Position::new(x, y, h), action, block);
            }

            Packet::Disconnect => {
                let actor_id = self.addr_book.read().await.by_addr.get(&addr).copied();
                if let Some(actor_id) = actor_id {
                    self.drop_actor(actor_id).await;
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Runs one placement request through the authorization pipeline.
    fn submit_placement(
        &self,
        actor: &Arc<PlayerInfo>,
        addr: SocketAddr,
        clicked: Position,
        action: ClickAction,
        raw_block: u8,
    ) {
        actor.touch();

        let Some(block) = Block::from_id(raw_block) else {
            self.send(
                Packet::Message {
                    text: "Unknown block type".to_string(),
                },
                addr,
            );
            return;
        };
        let requested = match action {
            ClickAction::Build => block,
            ClickAction::Delete => Block::Air,
        };

        if !self.world.map().in_bounds(clicked) {
            debug!(
                "Actor {} clicked out of bounds at ({}, {}, {})",
                actor.name(),
                clicked.x,
                clicked.y,
                clicked.h
            );
            return;
        }

        if actor.check_block_spam() {
            self.revert(addr, clicked);
            self.send(
                Packet::Message {
                    text: "You are placing blocks too fast".to_string(),
                },
                addr,
            );
            return;
        }

        let (target, target_block) = plan_placement(&self.world, clicked, requested);
        let result = can_place(&self.world, actor, target, target_block);
        if result.allowed() {
            let old_block = self
                .world
                .map()
                .block_at(target)
                .unwrap_or(Block::Air);
            let cause = change_cause(old_block, target_block);
            self.world
                .enqueue(BlockUpdate::by(actor, target, old_block, target_block, cause));
        } else {
            self.revert(addr, clicked);
            let text = self.denial_message(actor, target, result);
            self.send(Packet::Message { text }, addr);
        }
    }

    /// Resends the authoritative block for a rejected click.
    fn revert(&self, addr: SocketAddr, pos: Position) {
        if let Some(block) = self.world.map().block_at(pos) {
            self.send(
                Packet::BlockUpdate {
                    x: pos.x,
                    y: pos.y,
                    h: pos.h,
                    block: block.id(),
                },
                addr,
            );
        }
    }

    fn denial_message(
        &self,
        actor: &PlayerInfo,
        pos: Position,
        result: CanPlaceResult,
    ) -> String {
        match result {
            CanPlaceResult::BlocktypeDenied => {
                "You are not allowed to place or remove this block type".to_string()
            }
            CanPlaceResult::ZoneDenied => {
                let key = actor.name().to_string();
                let rank = actor.rank();
                match self.world.zones.find_denied_zone(pos, &key, &rank) {
                    Some(zone) => format!("You are not allowed to build in zone '{}'", zone.name()),
                    None => "You are not allowed to build in this zone".to_string(),
                }
            }
            CanPlaceResult::WorldDenied => {
                format!("You are not allowed to build in world '{}'", self.world.name())
            }
            CanPlaceResult::RankDenied | CanPlaceResult::Allowed => {
                "Your rank is not allowed to build here".to_string()
            }
        }
    }

    async fn kick_idle_players(&self) {
        for actor in self.registry.idle_players() {
            let addr = self.addr_book.read().await.by_actor.get(&actor.id()).copied();
            if let Some(addr) = addr {
                self.send(
                    Packet::Disconnected {
                        reason: "Kicked for inactivity".to_string(),
                    },
                    addr,
                );
            }
            info!("Actor {} kicked for inactivity", actor.name());
            self.drop_actor(actor.id()).await;
        }
    }

    async fn drop_actor(&self, actor_id: u32) {
        self.addr_book.write().await.remove_actor(actor_id);
        self.world.observer_leave(actor_id);
        self.registry.remove(actor_id);
    }

    /// Main session loop processing inbound traffic until shutdown.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_receiver();
        self.spawn_sender();
        self.spawn_change_relay();

        info!("Session layer started");

        loop {
            let Some(message) = self.session_rx.recv().await else {
                break;
            };
            match message {
                SessionMessage::PacketReceived { packet, addr } => {
                    self.handle_packet(packet, addr).await;
                }
                SessionMessage::KickIdle => {
                    self.kick_idle_players().await;
                }
                SessionMessage::Shutdown => {
                    info!("Session layer shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Classifies an applied change for auditing.
fn change_cause(old_block: Block, new_block: Block) -> BlockChangeCause {
    if new_block == Block::Air {
        BlockChangeCause::Deleted
    } else if old_block == Block::Air {
        BlockChangeCause::Built
    } else {
        BlockChangeCause::Replaced
    }
}

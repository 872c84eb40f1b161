//! Signaling events and per-connection delivery
//!
//! The orchestration layer never talks to sockets. It hands every subscriber
//! an unbounded receiver; the signaling layer forwards whatever arrives on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{AppData, ConnectionId, MediaKind, ProducerId, RoomId, UserId};

/// Events pushed to peers about changes in their room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEvent {
    /// Another peer started producing media
    NewProducer {
        room_id: RoomId,
        producer_id: ProducerId,
        kind: MediaKind,
        user_id: UserId,
        app_data: AppData,
        timestamp: DateTime<Utc>,
    },

    /// A producer is gone; consumers of it are already closed
    ProducerClosed {
        room_id: RoomId,
        producer_id: ProducerId,
        timestamp: DateTime<Utc>,
    },

    /// A producer was muted by its owner
    ProducerPaused {
        room_id: RoomId,
        producer_id: ProducerId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// A producer was unmuted by its owner
    ProducerResumed {
        room_id: RoomId,
        producer_id: ProducerId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// A peer left the room; its producers are already closed
    PeerLeft {
        room_id: RoomId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
}

impl SignalEvent {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        match self {
            Self::NewProducer { room_id, .. }
            | Self::ProducerClosed { room_id, .. }
            | Self::ProducerPaused { room_id, .. }
            | Self::ProducerResumed { room_id, .. }
            | Self::PeerLeft { room_id, .. } => room_id,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::NewProducer { timestamp, .. }
            | Self::ProducerClosed { timestamp, .. }
            | Self::ProducerPaused { timestamp, .. }
            | Self::ProducerResumed { timestamp, .. }
            | Self::PeerLeft { timestamp, .. } => timestamp,
        }
    }

    /// Get a short description of the event type
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::NewProducer { .. } => "new_producer",
            Self::ProducerClosed { .. } => "producer_closed",
            Self::ProducerPaused { .. } => "producer_paused",
            Self::ProducerResumed { .. } => "producer_resumed",
            Self::PeerLeft { .. } => "peer_left",
        }
    }
}

/// Message sender for a client connection
pub type EventSender = mpsc::UnboundedSender<SignalEvent>;

/// Subscriber information
#[derive(Debug, Clone)]
struct Subscriber {
    connection_id: ConnectionId,
    user_id: UserId,
    sender: EventSender,
}

/// In-memory hub routing room events to connected clients
#[derive(Clone)]
pub struct SignalHub {
    /// Map of room_id -> list of subscribers
    rooms: Arc<DashMap<RoomId, Vec<Subscriber>>>,

    /// Map of connection_id -> (room_id, user_id) for cleanup
    connections: Arc<DashMap<ConnectionId, (RoomId, UserId)>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe a connection to room events, returning its receiver. A
    /// previous subscription for the same connection is replaced.
    pub fn subscribe(
        &self,
        room_id: RoomId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> mpsc::UnboundedReceiver<SignalEvent> {
        self.unsubscribe(&connection_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let subscriber = Subscriber {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
            sender: tx,
        };

        self.rooms
            .entry(room_id.clone())
            .or_insert_with(Vec::new)
            .push(subscriber);

        self.connections
            .insert(connection_id.clone(), (room_id.clone(), user_id.clone()));

        debug!(
            room_id = %room_id,
            user_id = %user_id,
            connection_id = %connection_id,
            "Connection subscribed to room events"
        );

        rx
    }

    /// Unsubscribe a connection. Unknown connections are ignored.
    pub fn unsubscribe(&self, connection_id: &ConnectionId) {
        if let Some((_, (room_id, user_id))) = self.connections.remove(connection_id) {
            if let Some(mut subscribers) = self.rooms.get_mut(&room_id) {
                subscribers.retain(|sub| sub.connection_id != *connection_id);

                if subscribers.is_empty() {
                    drop(subscribers); // Drop the RefMut before removing
                    self.rooms.remove(&room_id);
                }
            }

            debug!(
                room_id = %room_id,
                user_id = %user_id,
                connection_id = %connection_id,
                "Connection unsubscribed from room events"
            );
        }
    }

    /// Broadcast an event to all subscribers in a room
    pub fn broadcast(&self, room_id: &RoomId, event: SignalEvent) -> usize {
        self.broadcast_filtered(room_id, None, event)
    }

    /// Broadcast an event to everyone in a room except the originating
    /// connection
    pub fn broadcast_except(
        &self,
        room_id: &RoomId,
        except: &ConnectionId,
        event: SignalEvent,
    ) -> usize {
        self.broadcast_filtered(room_id, Some(except), event)
    }

    fn broadcast_filtered(
        &self,
        room_id: &RoomId,
        except: Option<&ConnectionId>,
        event: SignalEvent,
    ) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(subscribers) = self.rooms.get(room_id) {
            for subscriber in subscribers.iter() {
                if except == Some(&subscriber.connection_id) {
                    continue;
                }
                match subscriber.sender.send(event.clone()) {
                    Ok(()) => {
                        sent_count += 1;
                    }
                    Err(err) => {
                        warn!(
                            room_id = %room_id,
                            user_id = %subscriber.user_id,
                            connection_id = %subscriber.connection_id,
                            error = %err,
                            "Failed to send event to client, marking for cleanup"
                        );
                        failed_connections.push(subscriber.connection_id.clone());
                    }
                }
            }
        }

        for conn_id in failed_connections {
            self.unsubscribe(&conn_id);
        }

        if sent_count > 0 {
            debug!(
                room_id = %room_id,
                sent_count = sent_count,
                event_type = %event.event_type(),
                "Event broadcast complete"
            );
        }

        sent_count
    }

    /// Get the number of subscribers in a room
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Get total number of active connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

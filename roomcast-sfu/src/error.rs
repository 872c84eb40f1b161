use thiserror::Error;

use crate::engine::EngineError;
use crate::types::{ConnectionId, ConsumerId, ProducerId, RoomId, TransportId, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Room not found: {room_id}")]
    RoomNotFound { room_id: RoomId },

    #[error("Peer not found: {connection_id}")]
    PeerNotFound { connection_id: ConnectionId },

    #[error("Transport not found: {transport_id}")]
    TransportNotFound { transport_id: TransportId },

    #[error("Transport not connected: {transport_id}")]
    TransportNotConnected { transport_id: TransportId },

    #[error("Producer not found: {producer_id}")]
    ProducerNotFound { producer_id: ProducerId },

    #[error("Consumer not found: {consumer_id}")]
    ConsumerNotFound { consumer_id: ConsumerId },

    #[error("Capabilities cannot consume producer: {producer_id}")]
    IncompatibleCapabilities { producer_id: ProducerId },

    #[error("Room is full: {room_id}")]
    RoomFull { room_id: RoomId },

    #[error("Room limit reached")]
    RoomLimitReached,

    #[error("Media worker failed: {worker_id}")]
    WorkerFatal { worker_id: WorkerId },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl Error {
    /// Stable machine-readable tag for signaling-layer error events
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RoomNotFound { .. } => "room_not_found",
            Self::PeerNotFound { .. } => "peer_not_found",
            Self::TransportNotFound { .. } => "transport_not_found",
            Self::TransportNotConnected { .. } => "transport_not_connected",
            Self::ProducerNotFound { .. } => "producer_not_found",
            Self::ConsumerNotFound { .. } => "consumer_not_found",
            Self::IncompatibleCapabilities { .. } => "incompatible_capabilities",
            Self::RoomFull { .. } => "room_full",
            Self::RoomLimitReached => "room_limit_reached",
            Self::WorkerFatal { .. } => "worker_fatal",
            Self::Engine(_) => "engine_error",
        }
    }

    /// Whether the failure is scoped to the requesting peer. Everything except
    /// a worker failure is; callers report it back and carry on.
    #[must_use]
    pub const fn is_request_scoped(&self) -> bool {
        !matches!(self, Self::WorkerFatal { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

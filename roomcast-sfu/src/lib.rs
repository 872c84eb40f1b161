//! Roomcast SFU (Selective Forwarding Unit) orchestration
//!
//! This crate maps signaling requests onto a graph of media-engine objects:
//! workers, per-room routers, per-peer transports, producers and consumers.
//! It owns lifecycle and bookkeeping; actual codec negotiation, ICE/DTLS and
//! RTP forwarding are delegated to a pluggable engine behind the `Media*`
//! traits.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: Process-wide entry point; worker pool, room registry
//!   and event fan-out
//! - **`MediaEngine`** (and friends): Capability interface a media stack
//!   implements to plug in
//! - **`SignalEvent`**: Broadcast notifications the signaling layer forwards
//!   to clients
//!
//! ## Features
//!
//! - Round-robin placement of rooms across a fixed worker pool
//! - Lazy room creation and immediate destruction when the last peer leaves
//! - Full producer/consumer lifecycle with paused-start consumers
//! - Cascading cleanup on disconnect (consumers, producers, transports)
//! - Room events: new/closed/paused/resumed producers and peer departures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{SfuConfig, SfuManager};
//!
//! let manager = SfuManager::new(engine, SfuConfig::default()).await?;
//!
//! let mut events = manager
//!     .add_peer(room_id.clone(), user_id, connection_id.clone())
//!     .await?;
//! let join = manager.join(&room_id, &connection_id).await?;
//! ```

mod config;
mod engine;
mod error;
mod logging;
mod manager;
mod peer;
mod room;
mod signal;
#[cfg(test)]
mod test_helpers;
mod types;
mod worker_pool;

pub use config::{LoggingConfig, RtpCodec, SfuConfig, TransportConfig};
pub use engine::{
    EngineError, EngineResult, MediaConsumer, MediaEngine, MediaProducer, MediaRouter,
    MediaTransport, MediaWorker,
};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use manager::SfuManager;
pub use signal::{EventSender, SignalEvent, SignalHub};
pub use types::{
    generate_id, AppData, ConnectionId, ConsumerCreated, ConsumerId, ConsumerInfo,
    DtlsParameters, IceCandidates, IceParameters, JoinResponse, MediaKind, ProducerId,
    ProducerInfo, RoomId, RoomSnapshot, RtpCapabilities, RtpParameters, SessionSnapshot, SfuStats,
    TransportCreated, TransportId, UserId, WorkerId,
};

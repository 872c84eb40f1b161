//! Media engine capability interface
//!
//! The orchestration layer drives codec negotiation, ICE/DTLS and RTP
//! forwarding exclusively through these traits. Every call may suspend;
//! nothing here assumes the engine lives in-process.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{RtpCodec, TransportConfig};
use crate::types::{
    ConsumerId, DtlsParameters, IceCandidates, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId, WorkerId,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine operation failed: {0}")]
    Operation(String),

    #[error("Engine resource closed: {0}")]
    Closed(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Entry point of a media engine. One instance per process, handed to the
/// manager at startup.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Spawn a media worker. Called a fixed number of times at startup;
    /// workers are never recreated afterwards.
    async fn create_worker(&self) -> EngineResult<Arc<dyn MediaWorker>>;
}

/// A media-processing worker (typically a dedicated process or thread).
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// False once the worker has crashed or been closed.
    fn is_alive(&self) -> bool;

    /// Register a hook fired once if the worker dies unexpectedly.
    fn on_died(&self, hook: Box<dyn FnOnce() + Send + 'static>);

    /// Create a routing context on this worker with a fixed codec set.
    async fn create_router(&self, codecs: &[RtpCodec]) -> EngineResult<Arc<dyn MediaRouter>>;

    async fn close(&self);
}

/// Per-room routing context. All transports of a room live on its router.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    /// Capabilities clients negotiate against, fixed at router creation.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> EngineResult<Arc<dyn MediaTransport>>;

    /// Whether `capabilities` suffice to receive the given producer.
    async fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn close(&self);
}

/// An ICE/DTLS transport between one client and the router.
///
/// Closing a transport closes every producer and consumer created on it.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> IceCandidates;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// Complete the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    /// Create a consumer fed by `producer_id`. Consumers start paused; the
    /// orchestration layer resumes them on client request.
    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: RtpCapabilities,
    ) -> EngineResult<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

/// An inbound media stream owned by one transport.
///
/// Closing a producer closes every consumer fed by it.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}

/// An outbound media stream mirroring one producer toward one transport.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    /// Parameters the receiving client applies, minted at creation.
    fn rtp_parameters(&self) -> RtpParameters;

    async fn pause(&self) -> EngineResult<()>;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);
}

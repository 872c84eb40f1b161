//! In-memory media engine fake for tests
//!
//! Implements the engine traits over shared registries so tests can drive the
//! orchestration layer without a real media stack and inspect afterwards what
//! happened to every engine object. Closed objects stay in the registries with
//! a closed flag; every close call lands in an operation log whose order can
//! be asserted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;

use crate::config::{RtpCodec, TransportConfig};
use crate::engine::{
    EngineError, EngineResult, MediaConsumer, MediaEngine, MediaProducer, MediaRouter,
    MediaTransport, MediaWorker,
};
use crate::types::{
    ConsumerId, DtlsParameters, IceCandidates, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId, WorkerId,
};

fn fake_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Client capabilities that negotiate successfully against the default codec
/// set, for both audio and video producers.
pub fn compatible_caps() -> RtpCapabilities {
    RtpCapabilities(json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
        ]
    }))
}

struct WorkerEntry {
    alive: bool,
}

struct RouterEntry {
    codecs: Vec<RtpCodec>,
    closed: bool,
}

struct TransportEntry {
    router_id: String,
    connected: bool,
    closed: bool,
}

struct ProducerEntry {
    transport_id: TransportId,
    kind: MediaKind,
    paused: bool,
    closed: bool,
}

struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    kind: MediaKind,
    paused: bool,
    closed: bool,
}

#[derive(Default)]
struct FakeInner {
    workers: DashMap<WorkerId, WorkerEntry>,
    routers: DashMap<String, RouterEntry>,
    transports: DashMap<TransportId, TransportEntry>,
    producers: DashMap<ProducerId, ProducerEntry>,
    consumers: DashMap<ConsumerId, ConsumerEntry>,
    died_hooks: Mutex<HashMap<WorkerId, Vec<Box<dyn FnOnce() + Send>>>>,
    op_log: Mutex<Vec<String>>,
    fail_transport_creation: AtomicBool,
    fail_produce: AtomicBool,
}

impl FakeInner {
    fn log(&self, entry: String) {
        self.op_log.lock().push(entry);
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        {
            let Some(mut entry) = self.consumers.get_mut(consumer_id) else {
                return;
            };
            if entry.closed {
                return;
            }
            entry.closed = true;
        }
        self.log(format!("close_consumer {consumer_id}"));
    }

    fn close_producer(&self, producer_id: &ProducerId) {
        {
            let Some(mut entry) = self.producers.get_mut(producer_id) else {
                return;
            };
            if entry.closed {
                return;
            }
            entry.closed = true;
        }
        self.log(format!("close_producer {producer_id}"));

        // Consumers fed by this producer go down with it
        let fed: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|entry| entry.producer_id == *producer_id && !entry.closed)
            .map(|entry| entry.key().clone())
            .collect();
        for consumer_id in fed {
            self.close_consumer(&consumer_id);
        }
    }

    fn close_transport(&self, transport_id: &TransportId) {
        {
            let Some(mut entry) = self.transports.get_mut(transport_id) else {
                return;
            };
            if entry.closed {
                return;
            }
            entry.closed = true;
        }
        self.log(format!("close_transport {transport_id}"));

        let owned_producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|entry| entry.transport_id == *transport_id && !entry.closed)
            .map(|entry| entry.key().clone())
            .collect();
        for producer_id in owned_producers {
            self.close_producer(&producer_id);
        }
        let owned_consumers: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|entry| entry.transport_id == *transport_id && !entry.closed)
            .map(|entry| entry.key().clone())
            .collect();
        for consumer_id in owned_consumers {
            self.close_consumer(&consumer_id);
        }
    }

    fn close_router(&self, router_id: &str) {
        {
            let Some(mut entry) = self.routers.get_mut(router_id) else {
                return;
            };
            if entry.closed {
                return;
            }
            entry.closed = true;
        }
        self.log(format!("close_router {router_id}"));

        let owned: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|entry| entry.router_id == router_id && !entry.closed)
            .map(|entry| entry.key().clone())
            .collect();
        for transport_id in owned {
            self.close_transport(&transport_id);
        }
    }
}

/// Fake engine root. All objects it creates share the same registries, so a
/// single instance observes everything a test does.
pub struct FakeEngine {
    inner: Arc<FakeInner>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(FakeInner::default()),
        })
    }

    /// Simulate an unexpected worker crash: marks it dead and fires its
    /// death hooks.
    pub fn kill_worker(&self, worker_id: &WorkerId) {
        if let Some(mut entry) = self.inner.workers.get_mut(worker_id) {
            entry.alive = false;
        }
        let hooks = self
            .inner
            .died_hooks
            .lock()
            .remove(worker_id)
            .unwrap_or_default();
        for hook in hooks {
            hook();
        }
    }

    /// Make the next produce calls fail with an engine error.
    pub fn set_fail_produce(&self, fail: bool) {
        self.inner.fail_produce.store(fail, Ordering::SeqCst);
    }

    /// Make the next transport creations fail with an engine error.
    pub fn set_fail_transport_creation(&self, fail: bool) {
        self.inner.fail_transport_creation.store(fail, Ordering::SeqCst);
    }

    pub fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.inner.consumers.get(consumer_id).map(|entry| entry.paused)
    }

    pub fn consumer_closed(&self, consumer_id: &ConsumerId) -> bool {
        self.inner
            .consumers
            .get(consumer_id)
            .is_some_and(|entry| entry.closed)
    }

    pub fn producer_paused(&self, producer_id: &ProducerId) -> Option<bool> {
        self.inner.producers.get(producer_id).map(|entry| entry.paused)
    }

    pub fn producer_closed(&self, producer_id: &ProducerId) -> bool {
        self.inner
            .producers
            .get(producer_id)
            .is_some_and(|entry| entry.closed)
    }

    pub fn transport_closed(&self, transport_id: &TransportId) -> bool {
        self.inner
            .transports
            .get(transport_id)
            .is_some_and(|entry| entry.closed)
    }

    pub fn live_router_count(&self) -> usize {
        self.inner.routers.iter().filter(|entry| !entry.closed).count()
    }

    pub fn live_worker_count(&self) -> usize {
        self.inner.workers.iter().filter(|entry| entry.alive).count()
    }

    /// Every close call, in the order the engine received them.
    pub fn op_log(&self) -> Vec<String> {
        self.inner.op_log.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_worker(&self) -> EngineResult<Arc<dyn MediaWorker>> {
        let id = WorkerId::new(fake_id());
        self.inner
            .workers
            .insert(id.clone(), WorkerEntry { alive: true });
        Ok(Arc::new(FakeWorker {
            inner: Arc::clone(&self.inner),
            id,
        }))
    }
}

struct FakeWorker {
    inner: Arc<FakeInner>,
    id: WorkerId,
}

#[async_trait]
impl MediaWorker for FakeWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn is_alive(&self) -> bool {
        self.inner
            .workers
            .get(&self.id)
            .is_some_and(|entry| entry.alive)
    }

    fn on_died(&self, hook: Box<dyn FnOnce() + Send + 'static>) {
        if !self.is_alive() {
            hook();
            return;
        }
        self.inner
            .died_hooks
            .lock()
            .entry(self.id.clone())
            .or_default()
            .push(hook);
    }

    async fn create_router(&self, codecs: &[RtpCodec]) -> EngineResult<Arc<dyn MediaRouter>> {
        if !self.is_alive() {
            return Err(EngineError::Closed(format!("worker {} is dead", self.id)));
        }
        let id = fake_id();
        self.inner.routers.insert(
            id.clone(),
            RouterEntry {
                codecs: codecs.to_vec(),
                closed: false,
            },
        );
        Ok(Arc::new(FakeRouter {
            inner: Arc::clone(&self.inner),
            id,
        }))
    }

    // Orderly shutdown does not fire the death hooks
    async fn close(&self) {
        if let Some(mut entry) = self.inner.workers.get_mut(&self.id) {
            entry.alive = false;
        }
    }
}

struct FakeRouter {
    inner: Arc<FakeInner>,
    id: String,
}

#[async_trait]
impl MediaRouter for FakeRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        let codecs: Vec<serde_json::Value> = self
            .inner
            .routers
            .get(&self.id)
            .map(|entry| {
                entry
                    .codecs
                    .iter()
                    .map(|codec| {
                        json!({
                            "kind": codec.kind.as_str(),
                            "mimeType": codec.mime_type,
                            "clockRate": codec.clock_rate,
                            "channels": codec.channels,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        RtpCapabilities(json!({ "codecs": codecs }))
    }

    async fn create_transport(
        &self,
        _config: &TransportConfig,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        if self.inner.fail_transport_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Operation("transport creation failed".to_string()));
        }
        if self.inner.routers.get(&self.id).map_or(true, |entry| entry.closed) {
            return Err(EngineError::Closed(format!("router {} is closed", self.id)));
        }
        let id = TransportId::new(fake_id());
        self.inner.transports.insert(
            id.clone(),
            TransportEntry {
                router_id: self.id.clone(),
                connected: false,
                closed: false,
            },
        );
        Ok(Arc::new(FakeTransport {
            inner: Arc::clone(&self.inner),
            id,
        }))
    }

    async fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        let Some(kind) = self
            .inner
            .producers
            .get(producer_id)
            .and_then(|entry| (!entry.closed).then_some(entry.kind))
        else {
            return false;
        };
        let router_mimes: Vec<String> = self
            .inner
            .routers
            .get(&self.id)
            .map(|entry| {
                entry
                    .codecs
                    .iter()
                    .filter(|codec| codec.kind == kind)
                    .map(|codec| codec.mime_type.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        capabilities
            .0
            .get("codecs")
            .and_then(|value| value.as_array())
            .map_or(false, |codecs| {
                codecs.iter().any(|codec| {
                    codec
                        .get("mimeType")
                        .and_then(|mime| mime.as_str())
                        .map_or(false, |mime| router_mimes.contains(&mime.to_lowercase()))
                })
            })
    }

    async fn close(&self) {
        self.inner.close_router(&self.id);
    }
}

struct FakeTransport {
    inner: Arc<FakeInner>,
    id: TransportId,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        IceParameters(json!({
            "usernameFragment": fake_id(),
            "password": fake_id(),
            "iceLite": true,
        }))
    }

    fn ice_candidates(&self) -> IceCandidates {
        IceCandidates(json!([{
            "foundation": "udpcandidate",
            "ip": "127.0.0.1",
            "port": 40000,
            "priority": 1076302079,
            "protocol": "udp",
            "type": "host",
        }]))
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        DtlsParameters(json!({
            "role": "auto",
            "fingerprints": [{ "algorithm": "sha-256", "value": fake_id() }],
        }))
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> EngineResult<()> {
        let Some(mut entry) = self.inner.transports.get_mut(&self.id) else {
            return Err(EngineError::Closed(format!(
                "transport {} not found",
                self.id
            )));
        };
        if entry.closed {
            return Err(EngineError::Closed(format!(
                "transport {} is closed",
                self.id
            )));
        }
        entry.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        if self.inner.fail_produce.load(Ordering::SeqCst) {
            return Err(EngineError::Operation("produce failed".to_string()));
        }
        if self.inner.transports.get(&self.id).map_or(true, |entry| entry.closed) {
            return Err(EngineError::Closed(format!(
                "transport {} is closed",
                self.id
            )));
        }
        let id = ProducerId::new(fake_id());
        self.inner.producers.insert(
            id.clone(),
            ProducerEntry {
                transport_id: self.id.clone(),
                kind,
                paused: false,
                closed: false,
            },
        );
        Ok(Arc::new(FakeProducer {
            inner: Arc::clone(&self.inner),
            id,
            kind,
        }))
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        _capabilities: RtpCapabilities,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        if self.inner.transports.get(&self.id).map_or(true, |entry| entry.closed) {
            return Err(EngineError::Closed(format!(
                "transport {} is closed",
                self.id
            )));
        }
        let kind = self
            .inner
            .producers
            .get(&producer_id)
            .and_then(|entry| (!entry.closed).then_some(entry.kind))
            .ok_or_else(|| {
                EngineError::Operation(format!("producer {producer_id} not found"))
            })?;
        let id = ConsumerId::new(fake_id());
        self.inner.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport_id: self.id.clone(),
                producer_id: producer_id.clone(),
                kind,
                paused: true,
                closed: false,
            },
        );
        Ok(Arc::new(FakeConsumer {
            inner: Arc::clone(&self.inner),
            id,
            producer_id,
            kind,
        }))
    }

    async fn close(&self) {
        self.inner.close_transport(&self.id);
    }
}

struct FakeProducer {
    inner: Arc<FakeInner>,
    id: ProducerId,
    kind: MediaKind,
}

impl FakeProducer {
    fn set_paused(&self, paused: bool) -> EngineResult<()> {
        let Some(mut entry) = self.inner.producers.get_mut(&self.id) else {
            return Err(EngineError::Closed(format!(
                "producer {} not found",
                self.id
            )));
        };
        if entry.closed {
            return Err(EngineError::Closed(format!(
                "producer {} is closed",
                self.id
            )));
        }
        entry.paused = paused;
        Ok(())
    }
}

#[async_trait]
impl MediaProducer for FakeProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> EngineResult<()> {
        self.set_paused(true)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.set_paused(false)
    }

    async fn close(&self) {
        self.inner.close_producer(&self.id);
    }
}

struct FakeConsumer {
    inner: Arc<FakeInner>,
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
}

impl FakeConsumer {
    fn set_paused(&self, paused: bool) -> EngineResult<()> {
        let Some(mut entry) = self.inner.consumers.get_mut(&self.id) else {
            return Err(EngineError::Closed(format!(
                "consumer {} not found",
                self.id
            )));
        };
        if entry.closed {
            return Err(EngineError::Closed(format!(
                "consumer {} is closed",
                self.id
            )));
        }
        entry.paused = paused;
        Ok(())
    }
}

#[async_trait]
impl MediaConsumer for FakeConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        RtpParameters(json!({
            "codecs": [],
            "encodings": [],
        }))
    }

    async fn pause(&self) -> EngineResult<()> {
        self.set_paused(true)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.set_paused(false)
    }

    async fn close(&self) {
        self.inner.close_consumer(&self.id);
    }
}

//! Top-level orchestration for multi-room SFU management
//!
//! This module provides:
//! - Lazy room creation with round-robin worker placement
//! - Peer session lifecycle tied to signaling connections
//! - The transport/produce/consume request surface
//! - Immediate destruction of rooms that become empty
//! - Aggregate statistics and graceful shutdown
//!
//! Lock order is always registry then room. Nothing takes the registry lock
//! while holding a room lock, so the two never deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::room::{AddSessionOutcome, SfuRoom};
use crate::signal::{SignalEvent, SignalHub};
use crate::types::{
    AppData, ConnectionId, ConsumerCreated, ConsumerId, DtlsParameters, JoinResponse, MediaKind,
    ProducerId, RoomId, RoomSnapshot, RtpCapabilities, RtpParameters, SfuStats, TransportCreated,
    TransportId, UserId, WorkerId,
};
use crate::worker_pool::WorkerPool;

/// One instance per process (or per test). Owns the worker pool, the room
/// registry and the signaling hub; every signaling request lands here.
pub struct SfuManager {
    config: SfuConfig,
    workers: WorkerPool,
    /// Held across room creation so concurrent joins to a fresh room id
    /// produce exactly one room
    rooms: Mutex<HashMap<RoomId, Arc<SfuRoom>>>,
    hub: SignalHub,
}

impl SfuManager {
    /// Spawn the worker pool and stand up an empty registry.
    pub async fn new(engine: Arc<dyn MediaEngine>, config: SfuConfig) -> Result<Arc<Self>> {
        let workers = WorkerPool::new(&engine, config.effective_num_workers()).await?;

        info!(
            worker_count = workers.worker_count(),
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            "SFU manager initialized"
        );

        Ok(Arc::new(Self {
            config,
            workers,
            rooms: Mutex::new(HashMap::new()),
            hub: SignalHub::new(),
        }))
    }

    /// Take the dead-worker notification receiver (once). The host watches
    /// it to decide whether to terminate the process.
    pub fn take_worker_fatal(&self) -> Option<mpsc::UnboundedReceiver<WorkerId>> {
        self.workers.take_fatal_receiver()
    }

    /// Register a peer in a room, creating the room if needed. Returns the
    /// receiver the signaling layer forwards room events from. Calling again
    /// for a live connection keeps its session and replaces the receiver.
    pub async fn add_peer(
        &self,
        room_id: RoomId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalEvent>> {
        loop {
            let room = self.ensure_room(&room_id).await?;
            match room
                .try_add_session(connection_id.clone(), user_id.clone())
                .await
            {
                AddSessionOutcome::Added => {
                    let rx =
                        self.hub
                            .subscribe(room_id.clone(), user_id.clone(), connection_id.clone());
                    return Ok(rx);
                }
                AddSessionOutcome::RoomFull => {
                    return Err(Error::RoomFull { room_id });
                }
                AddSessionOutcome::RoomClosed => {
                    // Lost the race against empty-room finalization; the
                    // registry entry is gone or about to be. Resolve again.
                    debug!(room_id = %room_id, "Room closed during join, retrying");
                }
            }
        }
    }

    /// Tear down a peer's session and everything it owns. Safe to call for
    /// connections that never joined and safe to call more than once; both
    /// signaling leave and abrupt disconnect land here.
    pub async fn remove_peer(&self, room_id: &RoomId, connection_id: &ConnectionId) {
        let room = { self.rooms.lock().await.get(room_id).cloned() };
        let Some(room) = room else {
            // The room can be gone while a subscription lingers when a join
            // raced a close_room; drop the hub entry either way.
            self.hub.unsubscribe(connection_id);
            debug!(
                room_id = %room_id,
                connection_id = %connection_id,
                "Room not found when removing peer"
            );
            return;
        };

        let Some(removed) = room.remove_session(connection_id).await else {
            self.hub.unsubscribe(connection_id);
            return;
        };

        self.hub.unsubscribe(connection_id);
        self.hub.broadcast(
            room_id,
            SignalEvent::PeerLeft {
                room_id: room_id.clone(),
                user_id: removed.user_id,
                timestamp: Utc::now(),
            },
        );

        if removed.now_empty {
            self.finalize_room_if_empty(room_id, &room).await;
        }
    }

    /// Router capabilities plus the producers already in the room.
    pub async fn join(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Result<JoinResponse> {
        let room = self.get_room(room_id).await?;
        room.join_info(connection_id).await
    }

    pub async fn create_transport(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Result<TransportCreated> {
        let room = self.get_room(room_id).await?;
        room.create_transport(connection_id).await
    }

    pub async fn connect_transport(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let room = self.get_room(room_id).await?;
        room.connect_transport(connection_id, transport_id, dtls_parameters)
            .await
    }

    /// Create a producer and announce it to every other peer in the room.
    pub async fn produce(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerId> {
        let room = self.get_room(room_id).await?;
        let (producer_id, user_id) = room
            .produce(
                connection_id,
                transport_id,
                kind,
                rtp_parameters,
                app_data.clone(),
            )
            .await?;

        self.hub.broadcast_except(
            room_id,
            connection_id,
            SignalEvent::NewProducer {
                room_id: room_id.clone(),
                producer_id: producer_id.clone(),
                kind,
                user_id,
                app_data,
                timestamp: Utc::now(),
            },
        );
        Ok(producer_id)
    }

    pub async fn consume(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: RtpCapabilities,
    ) -> Result<ConsumerCreated> {
        let room = self.get_room(room_id).await?;
        room.consume(connection_id, transport_id, producer_id, capabilities)
            .await
    }

    pub async fn resume_consumer(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Result<()> {
        let room = self.get_room(room_id).await?;
        room.resume_consumer(connection_id, consumer_id).await
    }

    pub async fn pause_consumer(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Result<()> {
        let room = self.get_room(room_id).await?;
        room.pause_consumer(connection_id, consumer_id).await
    }

    /// Mute a producer and tell the rest of the room.
    pub async fn pause_producer(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let room = self.get_room(room_id).await?;
        let user_id = room.pause_producer(connection_id, producer_id).await?;
        self.hub.broadcast_except(
            room_id,
            connection_id,
            SignalEvent::ProducerPaused {
                room_id: room_id.clone(),
                producer_id: producer_id.clone(),
                user_id,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    /// Unmute a producer and tell the rest of the room.
    pub async fn resume_producer(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let room = self.get_room(room_id).await?;
        let user_id = room.resume_producer(connection_id, producer_id).await?;
        self.hub.broadcast_except(
            room_id,
            connection_id,
            SignalEvent::ProducerResumed {
                room_id: room_id.clone(),
                producer_id: producer_id.clone(),
                user_id,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    /// Close a producer, its dependent consumers across the room, and
    /// announce the closure.
    pub async fn close_producer(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let room = self.get_room(room_id).await?;
        room.close_producer(connection_id, producer_id).await?;
        self.hub.broadcast_except(
            room_id,
            connection_id,
            SignalEvent::ProducerClosed {
                room_id: room_id.clone(),
                producer_id: producer_id.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    /// Administrative room teardown. Remaining sessions are closed without
    /// any synthetic leave or producer events.
    pub async fn close_room(&self, room_id: &RoomId) -> Result<()> {
        let room = {
            let mut rooms = self.rooms.lock().await;
            rooms
                .remove(room_id)
                .ok_or_else(|| Error::RoomNotFound {
                    room_id: room_id.clone(),
                })?
        };

        let connection_ids = room.close_all().await;
        for connection_id in &connection_ids {
            self.hub.unsubscribe(connection_id);
        }
        room.router.close().await;
        info!(
            room_id = %room_id,
            closed_sessions = connection_ids.len(),
            "Room closed"
        );
        Ok(())
    }

    pub async fn room_snapshot(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        let room = { self.rooms.lock().await.get(room_id).cloned() }?;
        Some(room.snapshot().await)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.lock().await.keys().cloned().collect()
    }

    /// Aggregate counters across all rooms, computed on demand.
    pub async fn stats(&self) -> SfuStats {
        let rooms: Vec<Arc<SfuRoom>> =
            { self.rooms.lock().await.values().cloned().collect() };
        let mut stats = SfuStats {
            rooms: rooms.len(),
            ..SfuStats::default()
        };
        for room in rooms {
            let snapshot = room.snapshot().await;
            stats.peers += snapshot.sessions.len();
            for session in &snapshot.sessions {
                stats.transports += session.transport_ids.len();
                stats.producers += session.producers.len();
                stats.consumers += session.consumers.len();
            }
        }
        stats
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    /// Close every room concurrently, then the worker pool.
    pub async fn shutdown(&self) {
        let rooms: Vec<(RoomId, Arc<SfuRoom>)> =
            { self.rooms.lock().await.drain().collect() };
        let room_count = rooms.len();

        let closes = rooms.iter().map(|(_, room)| {
            let hub = &self.hub;
            async move {
                let connection_ids = room.close_all().await;
                for connection_id in &connection_ids {
                    hub.unsubscribe(connection_id);
                }
                room.router.close().await;
            }
        });
        futures::future::join_all(closes).await;

        self.workers.close().await;
        info!(closed_rooms = room_count, "SFU manager shut down");
    }

    /// Return the room for an id, creating it on a round-robin worker if
    /// absent. The registry lock is held across router creation, which makes
    /// concurrent creates for the same id collapse into one.
    async fn ensure_room(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(room_id) {
            return Ok(Arc::clone(room));
        }

        if self.config.max_rooms > 0 && rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(Error::RoomLimitReached);
        }

        let worker = self.workers.assign_worker()?;
        let router = worker.create_router(&self.config.media_codecs).await?;
        let room = Arc::new(SfuRoom::new(
            room_id.clone(),
            worker.id(),
            router,
            self.config.transport.clone(),
            self.config.max_peers_per_room,
        ));
        rooms.insert(room_id.clone(), Arc::clone(&room));

        info!(
            room_id = %room_id,
            worker_id = %room.worker_id,
            total_rooms = rooms.len(),
            "Created new room"
        );
        Ok(room)
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| Error::RoomNotFound {
                room_id: room_id.clone(),
            })
    }

    /// Destroy a room that just became empty. Registry lock first, then the
    /// room's closed flag; the flag only flips while we hold the registry
    /// lock, so no join can slip into the instance being removed.
    async fn finalize_room_if_empty(&self, room_id: &RoomId, room: &Arc<SfuRoom>) {
        let mut rooms = self.rooms.lock().await;
        if room.mark_closed_if_empty().await {
            if let Some(current) = rooms.get(room_id) {
                if Arc::ptr_eq(current, room) {
                    rooms.remove(room_id);
                }
            }
            drop(rooms);
            room.router.close().await;
            info!(room_id = %room_id, "Room destroyed (empty)");
        }
    }
}

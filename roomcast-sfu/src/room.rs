//! Room state and media graph operations
//!
//! A room pins one router on one worker and owns every peer session inside
//! it. All graph mutation goes through `state`, a single async mutex held
//! across the engine awaits of the operation. That lock is the room's
//! serialization point: two requests for the same room never interleave,
//! requests for different rooms never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::engine::MediaRouter;
use crate::error::{Error, Result};
use crate::peer::PeerSession;
use crate::types::{
    AppData, ConnectionId, ConsumerCreated, ConsumerId, DtlsParameters, JoinResponse, MediaKind,
    ProducerId, ProducerInfo, RoomId, RoomSnapshot, RtpCapabilities, RtpParameters,
    TransportCreated, TransportId, UserId, WorkerId,
};

pub(crate) struct RoomState {
    pub sessions: HashMap<ConnectionId, PeerSession>,
    /// Set once the room has been finalized; sessions can no longer be added
    /// and the registry entry is gone or about to be
    pub closed: bool,
}

/// Outcome of trying to register a session in a room
pub(crate) enum AddSessionOutcome {
    Added,
    /// Room was finalized between registry lookup and the room lock; the
    /// caller re-resolves the registry and retries
    RoomClosed,
    RoomFull,
}

/// Result of removing a session, for the caller's event fan-out
pub(crate) struct RemovedPeer {
    pub user_id: UserId,
    pub now_empty: bool,
}

pub struct SfuRoom {
    pub(crate) id: RoomId,
    pub(crate) worker_id: WorkerId,
    pub(crate) router: Arc<dyn MediaRouter>,
    transport_config: TransportConfig,
    /// 0 = unlimited
    max_peers: usize,
    state: Mutex<RoomState>,
}

impl SfuRoom {
    pub(crate) fn new(
        id: RoomId,
        worker_id: WorkerId,
        router: Arc<dyn MediaRouter>,
        transport_config: TransportConfig,
        max_peers: usize,
    ) -> Self {
        Self {
            id,
            worker_id,
            router,
            transport_config,
            max_peers,
            state: Mutex::new(RoomState {
                sessions: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register an empty session for a connection. Repeating the call for a
    /// live connection keeps the existing session and its resources.
    pub(crate) async fn try_add_session(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> AddSessionOutcome {
        let mut state = self.state.lock().await;
        if state.closed {
            return AddSessionOutcome::RoomClosed;
        }
        if state.sessions.contains_key(&connection_id) {
            return AddSessionOutcome::Added;
        }
        if self.max_peers > 0 && state.sessions.len() >= self.max_peers {
            return AddSessionOutcome::RoomFull;
        }

        info!(
            room_id = %self.id,
            user_id = %user_id,
            connection_id = %connection_id,
            "Peer session added"
        );
        state
            .sessions
            .insert(connection_id.clone(), PeerSession::new(connection_id, user_id));
        AddSessionOutcome::Added
    }

    /// Router capabilities plus every other peer's producers
    pub(crate) async fn join_info(&self, connection_id: &ConnectionId) -> Result<JoinResponse> {
        let state = self.state.lock().await;
        if !state.sessions.contains_key(connection_id) {
            return Err(Error::PeerNotFound {
                connection_id: connection_id.clone(),
            });
        }
        let producers: Vec<ProducerInfo> = state
            .sessions
            .values()
            .filter(|session| session.connection_id != *connection_id)
            .flat_map(PeerSession::producer_infos)
            .collect();
        Ok(JoinResponse {
            rtp_capabilities: self.router.rtp_capabilities(),
            producers,
        })
    }

    pub(crate) async fn create_transport(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<TransportCreated> {
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(connection_id) {
            return Err(Error::PeerNotFound {
                connection_id: connection_id.clone(),
            });
        }

        let transport = self.router.create_transport(&self.transport_config).await?;
        let created = TransportCreated {
            transport_id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        };
        debug!(
            room_id = %self.id,
            connection_id = %connection_id,
            transport_id = %created.transport_id,
            "Transport created"
        );
        if let Some(session) = state.sessions.get_mut(connection_id) {
            session.insert_transport(transport);
        }
        Ok(created)
    }

    pub(crate) async fn connect_transport(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let transport = {
            let session = state.sessions.get(connection_id).ok_or_else(|| {
                Error::PeerNotFound {
                    connection_id: connection_id.clone(),
                }
            })?;
            let record = session.transports.get(transport_id).ok_or_else(|| {
                Error::TransportNotFound {
                    transport_id: transport_id.clone(),
                }
            })?;
            Arc::clone(&record.transport)
        };

        transport.connect(dtls_parameters).await?;

        if let Some(session) = state.sessions.get_mut(connection_id) {
            if let Some(record) = session.transports.get_mut(transport_id) {
                record.connected = true;
            }
        }
        debug!(
            room_id = %self.id,
            connection_id = %connection_id,
            transport_id = %transport_id,
            "Transport connected"
        );
        Ok(())
    }

    /// Create a producer on a connected transport. Returns the producer id
    /// and the owner's user id for the caller's broadcast.
    pub(crate) async fn produce(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<(ProducerId, UserId)> {
        let mut state = self.state.lock().await;
        let (transport, user_id) = {
            let session = state.sessions.get(connection_id).ok_or_else(|| {
                Error::PeerNotFound {
                    connection_id: connection_id.clone(),
                }
            })?;
            let record = session.transports.get(transport_id).ok_or_else(|| {
                Error::TransportNotFound {
                    transport_id: transport_id.clone(),
                }
            })?;
            if !record.connected {
                return Err(Error::TransportNotConnected {
                    transport_id: transport_id.clone(),
                });
            }
            (Arc::clone(&record.transport), session.user_id.clone())
        };

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();
        info!(
            room_id = %self.id,
            user_id = %user_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        if let Some(session) = state.sessions.get_mut(connection_id) {
            session.insert_producer(producer, transport_id.clone(), app_data);
        }
        Ok((producer_id, user_id))
    }

    /// Create a consumer of an existing producer on one of the caller's
    /// transports. The transport does not have to be connected yet; receive
    /// transports usually finish DTLS after the first consumer exists.
    pub(crate) async fn consume(
        &self,
        connection_id: &ConnectionId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: RtpCapabilities,
    ) -> Result<ConsumerCreated> {
        let mut state = self.state.lock().await;
        let transport = {
            let session = state.sessions.get(connection_id).ok_or_else(|| {
                Error::PeerNotFound {
                    connection_id: connection_id.clone(),
                }
            })?;
            let record = session.transports.get(transport_id).ok_or_else(|| {
                Error::TransportNotFound {
                    transport_id: transport_id.clone(),
                }
            })?;
            Arc::clone(&record.transport)
        };
        let producer_user_id = state
            .sessions
            .values()
            .find(|session| session.producers.contains_key(producer_id))
            .map(|session| session.user_id.clone())
            .ok_or_else(|| Error::ProducerNotFound {
                producer_id: producer_id.clone(),
            })?;

        if !self.router.can_consume(producer_id, &capabilities).await {
            return Err(Error::IncompatibleCapabilities {
                producer_id: producer_id.clone(),
            });
        }

        let consumer = transport
            .consume(producer_id.clone(), capabilities)
            .await?;
        let created = ConsumerCreated {
            consumer_id: consumer.id(),
            producer_id: consumer.producer_id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            producer_user_id: producer_user_id.clone(),
        };
        debug!(
            room_id = %self.id,
            connection_id = %connection_id,
            consumer_id = %created.consumer_id,
            producer_id = %producer_id,
            "Consumer created (paused)"
        );
        if let Some(session) = state.sessions.get_mut(connection_id) {
            session.insert_consumer(consumer, producer_user_id, transport_id.clone());
        }
        Ok(created)
    }

    /// Resume a consumer owned by the caller. A consumer id not present in
    /// the caller's session is a no-op: it is either already gone or belongs
    /// to someone else, and neither case may touch another peer's state.
    pub(crate) async fn resume_consumer(
        &self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Result<()> {
        self.set_consumer_paused(connection_id, consumer_id, false)
            .await
    }

    /// Pause a consumer owned by the caller; same tolerance as resume.
    pub(crate) async fn pause_consumer(
        &self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Result<()> {
        self.set_consumer_paused(connection_id, consumer_id, true)
            .await
    }

    async fn set_consumer_paused(
        &self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
        paused: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let consumer = {
            let session = state.sessions.get(connection_id).ok_or_else(|| {
                Error::PeerNotFound {
                    connection_id: connection_id.clone(),
                }
            })?;
            match session.consumers.get(consumer_id) {
                Some(record) => Arc::clone(&record.consumer),
                None => return Ok(()),
            }
        };

        if paused {
            consumer.pause().await?;
        } else {
            consumer.resume().await?;
        }

        if let Some(session) = state.sessions.get_mut(connection_id) {
            if let Some(record) = session.consumers.get_mut(consumer_id) {
                record.paused = paused;
            }
        }
        Ok(())
    }

    /// Pause (mute) a producer owned by the caller. Returns the owner's user
    /// id for the caller's broadcast.
    pub(crate) async fn pause_producer(
        &self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<UserId> {
        self.set_producer_paused(connection_id, producer_id, true)
            .await
    }

    /// Resume (unmute) a producer owned by the caller.
    pub(crate) async fn resume_producer(
        &self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<UserId> {
        self.set_producer_paused(connection_id, producer_id, false)
            .await
    }

    async fn set_producer_paused(
        &self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<UserId> {
        let mut state = self.state.lock().await;
        let (producer, user_id) = {
            let session = state.sessions.get(connection_id).ok_or_else(|| {
                Error::PeerNotFound {
                    connection_id: connection_id.clone(),
                }
            })?;
            let record = session.producers.get(producer_id).ok_or_else(|| {
                Error::ProducerNotFound {
                    producer_id: producer_id.clone(),
                }
            })?;
            (Arc::clone(&record.producer), session.user_id.clone())
        };

        if paused {
            producer.pause().await?;
        } else {
            producer.resume().await?;
        }

        if let Some(session) = state.sessions.get_mut(connection_id) {
            if let Some(record) = session.producers.get_mut(producer_id) {
                record.paused = paused;
            }
        }
        Ok(user_id)
    }

    /// Close a producer owned by the caller. Every consumer in the room fed
    /// by it is closed and unregistered first, so no session keeps a record
    /// for a producer that no longer exists.
    pub(crate) async fn close_producer(
        &self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        {
            let session = state.sessions.get(connection_id).ok_or_else(|| {
                Error::PeerNotFound {
                    connection_id: connection_id.clone(),
                }
            })?;
            if !session.producers.contains_key(producer_id) {
                return Err(Error::ProducerNotFound {
                    producer_id: producer_id.clone(),
                });
            }
        }

        let mut dependent_consumers = Vec::new();
        for session in state.sessions.values_mut() {
            for consumer_id in session.consumers_of(producer_id) {
                if let Some(record) = session.consumers.remove(&consumer_id) {
                    debug!(
                        room_id = %self.id,
                        consumer_id = %consumer_id,
                        transport_id = %record.transport_id,
                        "Closing consumer of closed producer"
                    );
                    dependent_consumers.push(record.consumer);
                }
            }
        }
        for consumer in dependent_consumers {
            consumer.close().await;
        }

        if let Some(session) = state.sessions.get_mut(connection_id) {
            if let Some(record) = session.producers.remove(producer_id) {
                record.producer.close().await;
                info!(
                    room_id = %self.id,
                    connection_id = %connection_id,
                    producer_id = %producer_id,
                    transport_id = %record.transport_id,
                    "Producer closed"
                );
            }
        }
        Ok(())
    }

    /// Tear down a session and everything it owns: its consumers first, then
    /// other sessions' consumers of its producers, then its producers, then
    /// its transports. Returns None if the connection has no session here.
    pub(crate) async fn remove_session(
        &self,
        connection_id: &ConnectionId,
    ) -> Option<RemovedPeer> {
        let mut state = self.state.lock().await;
        let mut session = state.sessions.remove(connection_id)?;
        let user_id = session.user_id.clone();
        let drained = session.drain_resources();

        let producer_ids: Vec<ProducerId> =
            drained.producers.iter().map(|(id, _)| id.clone()).collect();
        let mut dependent_consumers = Vec::new();
        for other in state.sessions.values_mut() {
            for producer_id in &producer_ids {
                for consumer_id in other.consumers_of(producer_id) {
                    if let Some(record) = other.consumers.remove(&consumer_id) {
                        dependent_consumers.push(record.consumer);
                    }
                }
            }
        }

        for consumer in drained.consumers {
            consumer.close().await;
        }
        for consumer in dependent_consumers {
            consumer.close().await;
        }
        for (_, producer) in drained.producers {
            producer.close().await;
        }
        for transport in drained.transports {
            transport.close().await;
        }

        let now_empty = state.sessions.is_empty();
        info!(
            room_id = %self.id,
            user_id = %user_id,
            connection_id = %connection_id,
            now_empty = now_empty,
            "Peer session removed"
        );
        Some(RemovedPeer { user_id, now_empty })
    }

    /// Flip the closed flag if the room is empty. Callers hold the registry
    /// lock, so a true result means the registry entry can be removed without
    /// a join slipping in between.
    pub(crate) async fn mark_closed_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.sessions.is_empty() && !state.closed {
            state.closed = true;
            true
        } else {
            false
        }
    }

    /// Forced teardown of every remaining session. Closes all consumers in
    /// the room, then all producers, then all transports; emits no events.
    /// Returns the connection ids that were torn down.
    pub(crate) async fn close_all(&self) -> Vec<ConnectionId> {
        let mut state = self.state.lock().await;
        state.closed = true;
        let mut sessions: Vec<PeerSession> =
            state.sessions.drain().map(|(_, session)| session).collect();
        let connection_ids: Vec<ConnectionId> = sessions
            .iter()
            .map(|session| session.connection_id.clone())
            .collect();

        let mut consumers = Vec::new();
        let mut producers = Vec::new();
        let mut transports = Vec::new();
        for session in &mut sessions {
            let drained = session.drain_resources();
            consumers.extend(drained.consumers);
            producers.extend(drained.producers.into_iter().map(|(_, p)| p));
            transports.extend(drained.transports);
        }

        for consumer in consumers {
            consumer.close().await;
        }
        for producer in producers {
            producer.close().await;
        }
        for transport in transports {
            transport.close().await;
        }
        connection_ids
    }

    pub(crate) async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        RoomSnapshot {
            room_id: self.id.clone(),
            worker_id: self.worker_id.clone(),
            sessions: state.sessions.values().map(PeerSession::snapshot).collect(),
        }
    }
}

//! Peer session bookkeeping
//!
//! One `PeerSession` per (room, signaling connection). The session owns the
//! engine handles created on behalf of that connection; all access goes
//! through the room's state lock, so nothing here needs its own locking.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::engine::{MediaConsumer, MediaProducer, MediaTransport};
use crate::types::{
    AppData, ConnectionId, ConsumerId, ConsumerInfo, ProducerId, ProducerInfo, SessionSnapshot,
    TransportId, UserId,
};

/// A transport owned by a session
pub(crate) struct TransportRecord {
    pub transport: Arc<dyn MediaTransport>,
    /// Set once connect_transport completed the DTLS handshake
    pub connected: bool,
}

/// A producer owned by a session
pub(crate) struct ProducerRecord {
    pub producer: Arc<dyn MediaProducer>,
    pub transport_id: TransportId,
    pub app_data: AppData,
    pub paused: bool,
}

/// A consumer owned by a session
pub(crate) struct ConsumerRecord {
    pub consumer: Arc<dyn MediaConsumer>,
    pub producer_id: ProducerId,
    pub producer_user_id: UserId,
    pub transport_id: TransportId,
    pub paused: bool,
}

/// Resources drained from a session for teardown, already in close order:
/// consumers first, then producers, then transports.
pub(crate) struct DrainedResources {
    pub consumers: Vec<Arc<dyn MediaConsumer>>,
    pub producers: Vec<(ProducerId, Arc<dyn MediaProducer>)>,
    pub transports: Vec<Arc<dyn MediaTransport>>,
}

/// Per-connection state inside a room
pub(crate) struct PeerSession {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub transports: HashMap<TransportId, TransportRecord>,
    pub producers: HashMap<ProducerId, ProducerRecord>,
    pub consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl PeerSession {
    pub fn new(connection_id: ConnectionId, user_id: UserId) -> Self {
        Self {
            connection_id,
            user_id,
            joined_at: Utc::now(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn insert_transport(&mut self, transport: Arc<dyn MediaTransport>) {
        let id = transport.id();
        self.transports.insert(
            id,
            TransportRecord {
                transport,
                connected: false,
            },
        );
    }

    pub fn insert_producer(
        &mut self,
        producer: Arc<dyn MediaProducer>,
        transport_id: TransportId,
        app_data: AppData,
    ) {
        let id = producer.id();
        self.producers.insert(
            id,
            ProducerRecord {
                producer,
                transport_id,
                app_data,
                paused: false,
            },
        );
    }

    pub fn insert_consumer(
        &mut self,
        consumer: Arc<dyn MediaConsumer>,
        producer_user_id: UserId,
        transport_id: TransportId,
    ) {
        let id = consumer.id();
        let producer_id = consumer.producer_id();
        self.consumers.insert(
            id,
            ConsumerRecord {
                consumer,
                producer_id,
                producer_user_id,
                transport_id,
                paused: true,
            },
        );
    }

    /// Consumer ids in this session fed by the given producer
    pub fn consumers_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.consumers
            .iter()
            .filter(|(_, record)| record.producer_id == *producer_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// What other peers see of this session's producers
    pub fn producer_infos(&self) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .map(|(id, record)| ProducerInfo {
                producer_id: id.clone(),
                kind: record.producer.kind(),
                user_id: self.user_id.clone(),
                app_data: record.app_data.clone(),
                paused: record.paused,
            })
            .collect()
    }

    fn consumer_infos(&self) -> Vec<ConsumerInfo> {
        self.consumers
            .iter()
            .map(|(id, record)| ConsumerInfo {
                consumer_id: id.clone(),
                producer_id: record.producer_id.clone(),
                producer_user_id: record.producer_user_id.clone(),
                paused: record.paused,
            })
            .collect()
    }

    /// Empty the session, handing back every owned handle in teardown order.
    /// The caller closes them; record state is already gone.
    pub fn drain_resources(&mut self) -> DrainedResources {
        let consumers = self
            .consumers
            .drain()
            .map(|(_, record)| record.consumer)
            .collect();
        let producers = self
            .producers
            .drain()
            .map(|(id, record)| (id, record.producer))
            .collect();
        let transports = self
            .transports
            .drain()
            .map(|(_, record)| record.transport)
            .collect();
        DrainedResources {
            consumers,
            producers,
            transports,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            joined_at: self.joined_at,
            transport_ids: self.transports.keys().cloned().collect(),
            producers: self.producer_infos(),
            consumers: self.consumer_infos(),
        }
    }
}

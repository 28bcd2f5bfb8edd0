use std::sync::atomic::{AtomicU64, Ordering};

use bytestring::ByteString;

use rjms_utils::{timestamp_millis, TimestampMillis};

use crate::types::{ConnectionId, DashMap};

#[derive(Clone, Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub client_id: Option<ByteString>,
    pub created: TimestampMillis,
}

/// Connection liveness, consulted when deciding whether temporary
/// destinations can be dropped.
pub trait ConnectionManager: Sync + Send {
    fn get_connection(&self, id: ConnectionId) -> Option<Connection>;

    #[inline]
    fn is_alive(&self, id: ConnectionId) -> bool {
        self.get_connection(id).is_some()
    }
}

pub struct DefaultConnectionManager {
    conns: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
}

impl Default for DefaultConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultConnectionManager {
    #[inline]
    pub fn new() -> Self {
        Self { conns: DashMap::default(), next_id: AtomicU64::new(1) }
    }

    pub fn open(&self, client_id: Option<ByteString>) -> Connection {
        let conn = Connection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            client_id,
            created: timestamp_millis(),
        };
        log::debug!("connection opened, {:?}", conn);
        self.conns.insert(conn.id, conn.clone());
        conn
    }

    #[inline]
    pub fn close(&self, id: ConnectionId) -> Option<Connection> {
        self.conns.remove(&id).map(|(_, c)| c)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl ConnectionManager for DefaultConnectionManager {
    #[inline]
    fn get_connection(&self, id: ConnectionId) -> Option<Connection> {
        self.conns.get(&id).map(|c| c.value().clone())
    }
}

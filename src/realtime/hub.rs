use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::ServerEvent;
use crate::error::AppError;
use crate::observability::metrics::Metrics;

pub type ConnectionId = u64;

#[derive(Debug)]
enum HubCommand {
    Register {
        conn: ConnectionId,
        user_id: Uuid,
        outbound: mpsc::Sender<String>,
    },
    Unregister {
        conn: ConnectionId,
    },
    SendToUser {
        user_id: Uuid,
        message: String,
    },
    SendToConnection {
        conn: ConnectionId,
        message: String,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
}

struct Connection {
    user_id: Uuid,
    outbound: mpsc::Sender<String>,
}

/// Registry of live connections. Owned by a single task; everything else
/// talks to it through a [`HubHandle`].
pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<Uuid, HashSet<ConnectionId>>,
    metrics: Metrics,
}

#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    next_conn: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(buffer: usize, metrics: Metrics) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        let hub = Self {
            commands: rx,
            connections: HashMap::new(),
            by_user: HashMap::new(),
            metrics,
        };
        let handle = HubHandle {
            commands: tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    pub async fn run(mut self) {
        info!("realtime hub started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        info!(connections = self.connections.len(), "realtime hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                conn,
                user_id,
                outbound,
            } => {
                self.connections.insert(conn, Connection { user_id, outbound });
                self.by_user.entry(user_id).or_default().insert(conn);
                self.metrics.ws_connections.inc();
                debug!(conn, %user_id, "connection registered");
            }
            HubCommand::Unregister { conn } => {
                self.remove(conn);
            }
            HubCommand::SendToUser { user_id, message } => {
                let targets: Vec<ConnectionId> = self
                    .by_user
                    .get(&user_id)
                    .map(|conns| conns.iter().copied().collect())
                    .unwrap_or_default();
                for conn in targets {
                    self.deliver(conn, message.clone());
                }
            }
            HubCommand::SendToConnection { conn, message } => {
                self.deliver(conn, message);
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    connections: self.connections.len(),
                    users: self.by_user.len(),
                });
            }
        }
    }

    /// Non-blocking enqueue. A connection whose buffer is full is dropped
    /// rather than allowed to stall the hub.
    fn deliver(&mut self, conn: ConnectionId, message: String) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        match connection.outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(conn, user_id = %connection.user_id, "send buffer full, dropping connection");
                self.metrics.ws_dropped_connections_total.inc();
                self.remove(conn);
            }
            Err(TrySendError::Closed(_)) => {
                self.remove(conn);
            }
        }
    }

    /// Dropping the stored sender closes the connection's outbound channel.
    fn remove(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        if let Some(conns) = self.by_user.get_mut(&connection.user_id) {
            conns.remove(&conn);
            if conns.is_empty() {
                self.by_user.remove(&connection.user_id);
            }
        }
        self.metrics.ws_connections.dec();
        debug!(conn, user_id = %connection.user_id, "connection unregistered");
    }
}

impl HubHandle {
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(
        &self,
        conn: ConnectionId,
        user_id: Uuid,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), AppError> {
        self.commands
            .send(HubCommand::Register {
                conn,
                user_id,
                outbound,
            })
            .await
            .map_err(|_| AppError::Internal("realtime hub is not running".to_string()))
    }

    pub async fn unregister(&self, conn: ConnectionId) {
        if self.commands.send(HubCommand::Unregister { conn }).await.is_err() {
            debug!(conn, "hub gone before unregister");
        }
    }

    /// Queues `event` for every connection `user_id` has open. Best effort:
    /// the event is dropped if the hub's own queue is full.
    pub fn send_to_user(&self, user_id: Uuid, event: &ServerEvent) {
        let Some(message) = encode(event) else {
            return;
        };
        self.enqueue(HubCommand::SendToUser { user_id, message }, event.kind());
    }

    pub fn send_to_connection(&self, conn: ConnectionId, event: &ServerEvent) {
        let Some(message) = encode(event) else {
            return;
        };
        self.enqueue(HubCommand::SendToConnection { conn, message }, event.kind());
    }

    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Stats { reply }).await.is_err() {
            return HubStats::default();
        }
        rx.await.unwrap_or_default()
    }

    fn enqueue(&self, command: HubCommand, kind: &'static str) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(event = kind, "hub queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(event = kind, "hub stopped, dropping event");
            }
        }
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match event.to_text() {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(error = %err, event = event.kind(), "failed to serialize event");
            None
        }
    }
}

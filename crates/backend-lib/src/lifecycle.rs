// ============================
// crates/backend-lib/src/lifecycle.rs
// ============================
//! Connection lifecycle manager.
//!
//! Each physical connection moves through
//! `Connecting → Identified → Active → Closed`. A connection becomes
//! reachable (bound in the [`IdentityDirectory`]) only once it is Active and
//! stops being reachable the moment it is closed. Connections that never
//! identify stay open but inert: nothing is ever delivered to them.
//!
//! The manager is transport-agnostic; `ws_router` feeds it decoded frames
//! and drains each connection's outbound queue into its socket.
use crate::config::{LimitSettings, Settings};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::delivery::DeliveryEngine;
use crate::directory::IdentityDirectory;
use crate::error::AppError;
use crate::storage::Storage;
use crate::validation;
use chat_relay_common::{
    ClientToServer, MessageDraft, MessageKind, MessageScope, ServerToClient, UserId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Where a connection is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, no identity yet
    Connecting,
    /// Identity accepted, not yet bound
    Identified,
    /// Bound in the directory; receives deliveries
    Active,
    /// Transport gone; never delivered to again
    Closed,
}

/// Turns the identity claimed at connection time into an accepted one.
///
/// The auth collaborator is outside this service; implementations decide how
/// much of the claim to trust.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, claimed: &str) -> Result<UserId, AppError>;
}

/// Accepts any well-formed claimed identity as-is
pub struct TrustClaimed {
    limits: LimitSettings,
}

impl TrustClaimed {
    pub fn new(limits: LimitSettings) -> Self {
        Self { limits }
    }
}

impl IdentityResolver for TrustClaimed {
    fn resolve(&self, claimed: &str) -> Result<UserId, AppError> {
        let claimed = claimed.trim();
        validation::validate_identity(claimed, &self.limits)?;
        Ok(claimed.to_string())
    }
}

/// Bookkeeping for one live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub identity: Option<UserId>,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

/// One physical connection, owned by its socket task
pub struct Connection {
    handle: ConnectionHandle,
    outbound: Option<mpsc::Receiver<ServerToClient>>,
    identity: Option<UserId>,
    state: ConnectionState,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Shutdown flag as seen since this connection was opened.
    ///
    /// Check the current value before waiting on `changed()`: a shutdown
    /// that started before the connection opened never reports a change.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Receiver for the socket writer; can be taken once
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<ServerToClient>> {
        self.outbound.take()
    }
}

pub struct ConnectionManager<S> {
    engine: Arc<DeliveryEngine<S>>,
    directory: Arc<IdentityDirectory>,
    resolver: Arc<dyn IdentityResolver>,
    connections: DashMap<ConnectionId, ConnectionInfo>,
    outbound_buffer: usize,
    push_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl<S: Storage + Clone + 'static> ConnectionManager<S> {
    pub fn new(
        engine: Arc<DeliveryEngine<S>>,
        resolver: Arc<dyn IdentityResolver>,
        settings: &Settings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            directory: engine.directory().clone(),
            engine,
            resolver,
            connections: DashMap::new(),
            outbound_buffer: settings.delivery.outbound_buffer,
            push_timeout: settings.delivery.push_timeout(),
            shutdown,
        }
    }

    /// Register a freshly accepted transport connection
    pub fn open(&self) -> Connection {
        let (handle, outbound) = ConnectionHandle::channel(self.outbound_buffer);
        self.connections.insert(
            handle.id(),
            ConnectionInfo {
                identity: None,
                state: ConnectionState::Connecting,
                connected_at: Utc::now(),
            },
        );

        counter!(crate::metrics::WS_CONNECTION).increment(1);
        gauge!(crate::metrics::WS_ACTIVE).set(self.connections.len() as f64);
        tracing::debug!("Connection {} opened", handle.id());

        Connection {
            handle,
            outbound: Some(outbound),
            identity: None,
            state: ConnectionState::Connecting,
            shutdown: self.shutdown.subscribe(),
        }
    }

    /// Accept `claimed` as this connection's identity and bind it.
    ///
    /// A rejected claim leaves the connection in its current state. An
    /// already active connection may switch identity; its old entry is
    /// released.
    pub fn identify(&self, conn: &mut Connection, claimed: &str) -> Result<UserId, AppError> {
        if conn.state == ConnectionState::Closed {
            return Err(AppError::Internal(format!(
                "connection {} is already closed",
                conn.id()
            )));
        }

        let identity = self.resolver.resolve(claimed).inspect_err(|e| {
            tracing::warn!("Connection {} failed to identify: {e}", conn.id());
        })?;
        if let Some(previous) = self.directory.identity_of(conn.id()) {
            if previous != identity {
                tracing::info!("Connection {} switches from {previous} to {identity}", conn.id());
            }
        }
        self.set_state(conn, ConnectionState::Identified, Some(&identity));

        if let Some(replaced) = self.directory.bind(&identity, conn.handle.clone()) {
            if replaced != conn.handle {
                tracing::info!(
                    "{identity} reconnected; connection {} replaces {}",
                    conn.id(),
                    replaced.id()
                );
            }
        }
        self.set_state(conn, ConnectionState::Active, Some(&identity));
        tracing::info!("Connection {} active as {identity}", conn.id());

        Ok(identity)
    }

    /// Tear down a connection. Safe to call more than once.
    pub fn close(&self, conn: &mut Connection) {
        if conn.state == ConnectionState::Closed {
            return;
        }
        if let Some(identity) = self.directory.unbind(&conn.handle) {
            tracing::info!("{identity} went offline (connection {})", conn.id());
        }
        conn.state = ConnectionState::Closed;
        conn.outbound = None;
        let removed = self.connections.remove(&conn.id());

        counter!(crate::metrics::WS_DISCONNECTION).increment(1);
        gauge!(crate::metrics::WS_ACTIVE).set(self.connections.len() as f64);
        if let Some((_, info)) = removed {
            let lifetime = Utc::now() - info.connected_at;
            tracing::debug!(
                "Connection {} closed after {}s",
                conn.id(),
                lifetime.num_seconds()
            );
        }
    }

    /// Process one decoded client event.
    ///
    /// Returns the reply meant for this connection only, if any. Delivered
    /// messages reach the sender through the directory like every other
    /// recipient, so a successful send has no direct reply.
    pub async fn handle_client_message(
        &self,
        conn: &mut Connection,
        msg: ClientToServer,
    ) -> Option<ServerToClient> {
        match msg {
            ClientToServer::Identify { identity } => match self.identify(conn, &identity) {
                Ok(identity) => Some(ServerToClient::Identified { identity }),
                Err(e) => Some(e.to_server_message()),
            },

            ClientToServer::SendMessage {
                receiver,
                kind,
                content,
                attachment,
            } => {
                let Some(sender) = conn.identity.clone() else {
                    return Some(AppError::Unidentified.to_send_failed());
                };
                let draft = make_draft(sender, MessageScope::Direct { receiver }, kind, content, attachment);
                self.engine
                    .deliver_direct(draft)
                    .await
                    .err()
                    .map(|e| e.to_send_failed())
            },

            ClientToServer::SendMessageOnChannel {
                channel_id,
                kind,
                content,
                attachment,
            } => {
                let Some(sender) = conn.identity.clone() else {
                    return Some(AppError::Unidentified.to_send_failed());
                };
                let draft = make_draft(sender, MessageScope::Channel { channel_id }, kind, content, attachment);
                self.engine
                    .deliver_channel(draft)
                    .await
                    .err()
                    .map(|e| e.to_send_failed())
            },

            ClientToServer::FetchConversation { peer } => {
                let Some(requester) = conn.identity.as_deref() else {
                    return Some(AppError::Unidentified.to_server_message());
                };
                match self.engine.conversation_history(requester, &peer).await {
                    Ok(messages) => Some(ServerToClient::ConversationHistory { peer, messages }),
                    Err(e) => Some(e.to_server_message()),
                }
            },

            ClientToServer::FetchChannelHistory { channel_id } => {
                let Some(requester) = conn.identity.as_deref() else {
                    return Some(AppError::Unidentified.to_server_message());
                };
                match self.engine.channel_history(requester, &channel_id).await {
                    Ok(messages) => Some(ServerToClient::ChannelHistory {
                        channel_id,
                        messages,
                    }),
                    Err(e) => Some(e.to_server_message()),
                }
            },
        }
    }

    /// Queue a reply on the connection's own outbound queue
    pub async fn reply(&self, conn: &Connection, event: ServerToClient) {
        if let Err(e) = conn.handle.push(event, self.push_timeout).await {
            tracing::warn!("Reply dropped: {e}");
        }
    }

    /// Number of open connections, identified or not
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Ask every connection task to close its transport
    pub fn shutdown(&self) {
        tracing::info!(
            "Closing {} open connections for shutdown",
            self.connections.len()
        );
        self.shutdown.send_replace(true);
    }

    fn set_state(&self, conn: &mut Connection, state: ConnectionState, identity: Option<&str>) {
        conn.state = state;
        conn.identity = identity.map(str::to_string);
        if let Some(mut info) = self.connections.get_mut(&conn.id()) {
            info.state = state;
            info.identity = conn.identity.clone();
        }
    }
}

fn make_draft(
    sender: UserId,
    scope: MessageScope,
    kind: MessageKind,
    content: Option<String>,
    attachment: Option<String>,
) -> MessageDraft {
    MessageDraft {
        sender,
        scope,
        kind,
        content,
        attachment,
    }
}

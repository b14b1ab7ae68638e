//! Connection registry and group membership.
//!
//! Join and leave run their critical section on a dedicated task that the
//! caller awaits. Dropping the caller (for example a session torn down
//! mid-command) never abandons a group half-way through a subscription
//! transition.

use std::collections::HashMap;
use std::sync::Arc;

use groupcast_core::protocol::validate_group_name;
use groupcast_core::{ConnectionId, GroupError};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::bridge::PubSubBridge;
use crate::metrics::{GROUP_JOINS_TOTAL, GROUP_LEAVES_TOTAL};
use crate::websocket::connection::{ClientConnection, CloseReason};

/// Live connections indexed by ID, plus the membership operations on them.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    bridge: Arc<PubSubBridge>,
}

impl ConnectionRegistry {
    /// Create an empty registry over `bridge`.
    pub fn new(bridge: Arc<PubSubBridge>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            bridge,
        }
    }

    /// The bridge memberships are mirrored onto.
    pub fn bridge(&self) -> &Arc<PubSubBridge> {
        &self.bridge
    }

    /// Add a connection.
    pub async fn register(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.write().await.remove(id)
    }

    /// Look up a connection.
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Ask every connection to close.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            conn.close(reason);
        }
        conns.len()
    }

    /// Add `id` to `group`.
    ///
    /// Returns `Ok(false)` if it was already a member. On success the group's
    /// broker subscription is confirmed, so the connection receives every
    /// message published after this returns. While the group's topic is
    /// being re-opened after a broker loss the join fails with
    /// `SubscriptionFailed`. On failure nothing changed.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn join(&self, id: &ConnectionId, group: &str) -> Result<bool, GroupError> {
        validate_group_name(group)?;
        let conn = self
            .get(id)
            .await
            .ok_or_else(|| GroupError::InvalidConnection(id.clone()))?;

        let bridge = Arc::clone(&self.bridge);
        let group = group.to_owned();
        let joined = tokio::spawn(async move {
            let mut guard = bridge.lock_group(&group).await;
            if guard.members.contains_key(&conn.id) {
                return Ok(false);
            }

            if let Err(e) = bridge.subscribe_locked(&mut guard).await {
                let _ = bridge.arena().collect(&mut guard);
                return Err(e);
            }
            if let Err(e) = conn.add_group(&group) {
                if let Err(rollback) = bridge.unsubscribe_locked(&mut guard).await {
                    warn!(group, error = %rollback, "rollback unsubscribe failed");
                }
                let _ = bridge.arena().collect(&mut guard);
                return Err(e);
            }
            let _ = guard.members.insert(conn.id.clone(), Arc::clone(&conn));
            Ok(true)
        })
        .await
        .map_err(|e| GroupError::Internal(format!("join task failed: {e}")))??;

        if joined {
            counter!(GROUP_JOINS_TOTAL).increment(1);
            debug!("joined group");
        }
        Ok(joined)
    }

    /// Remove `id` from `group`.
    ///
    /// Returns `Ok(false)` if it was not a member. Membership is gone even if
    /// the broker unsubscribe that follows fails.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn leave(&self, id: &ConnectionId, group: &str) -> Result<bool, GroupError> {
        validate_group_name(group)?;
        let conn = self
            .get(id)
            .await
            .ok_or_else(|| GroupError::InvalidConnection(id.clone()))?;
        self.leave_connection(&conn, group).await
    }

    /// Remove `conn` from `group` whether or not it is still registered.
    pub(crate) async fn leave_connection(
        &self,
        conn: &Arc<ClientConnection>,
        group: &str,
    ) -> Result<bool, GroupError> {
        let bridge = Arc::clone(&self.bridge);
        let conn = Arc::clone(conn);
        let group = group.to_owned();
        let task_conn = Arc::clone(&conn);
        let task_group = group.clone();
        let left = tokio::spawn(async move {
            let conn = task_conn;
            let group = task_group;
            let Some(mut guard) = bridge.arena().lock_existing(&group).await else {
                let _ = conn.remove_group(&group);
                return Ok(false);
            };
            let removed = guard.members.remove(&conn.id).is_some();
            let _ = conn.remove_group(&group);
            let result = if removed {
                bridge.unsubscribe_locked(&mut guard).await
            } else {
                Ok(())
            };
            let _ = bridge.arena().collect(&mut guard);
            if let Err(e) = &result {
                warn!(group, error = %e, "unsubscribe after leave failed");
            }
            Ok::<_, GroupError>(removed)
        })
        .await
        .map_err(|e| GroupError::Internal(format!("leave task failed: {e}")))??;

        if left {
            counter!(GROUP_LEAVES_TOTAL).increment(1);
            debug!(connection_id = %conn.id, group, "left group");
        }
        Ok(left)
    }

    /// Members of `group` at this instant, sorted.
    pub async fn members(&self, group: &str) -> Vec<ConnectionId> {
        let Some(guard) = self.bridge.arena().lock_existing(group).await else {
            return Vec::new();
        };
        let mut members: Vec<ConnectionId> = guard.members.keys().cloned().collect();
        members.sort();
        members
    }
}

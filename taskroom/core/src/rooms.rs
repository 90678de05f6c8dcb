//! Room Coordinator
//!
//! Per-task membership on top of the shared connection. A room must be
//! joined (and confirmed) before the server's agent events for that task
//! reach this client.
//!
//! Missing acknowledgments are tolerated by default: servers that never
//! answer `join_task` and servers that are merely slow look the same from
//! here, and the join is treated as having worked. Strict mode turns a
//! missing ack into an error instead.
//!
//! Membership is counted per task: several sessions may follow the same
//! task, and `leave_task` only tells the server once the last one leaves.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::connection::{ConnectionError, ConnectionManager};
use crate::events::{RoomRequest, CONFIRM_ROOM, JOINED, JOIN_TASK, LEAVE_TASK, ROOM_CONFIRMED};
use crate::pending::{AckKind, PendingOutcome, PendingRequest};
use crate::tasks::TaskId;

/// Treat a missing join/confirm ack as success
pub const ACK_TOLERANT: bool = true;

/// Room timing and ack policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomConfig {
    /// How long to wait for `joined`
    pub join_ack_timeout: Duration,
    /// How long to wait for `room_confirmed`
    pub confirm_ack_timeout: Duration,
    /// Whether a missing ack counts as success
    pub ack_tolerant: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            join_ack_timeout: Duration::from_secs(2),
            confirm_ack_timeout: Duration::from_secs(1),
            ack_tolerant: ACK_TOLERANT,
        }
    }
}

/// Errors from room operations
#[derive(Debug, Error)]
pub enum RoomError {
    /// The connection is not established
    #[error("Not connected")]
    NotConnected,
    /// Strict mode only: the server did not acknowledge in time
    #[error("No {event} ack for task {task_id} within {timeout:?}")]
    AckTimeout {
        /// Task the request was for
        task_id: TaskId,
        /// Ack event that never came
        event: &'static str,
        /// How long we waited
        timeout: Duration,
    },
    /// Sending the request failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Joins, confirms and leaves task rooms
#[derive(Clone)]
pub struct RoomCoordinator {
    connection: ConnectionManager,
    config: RoomConfig,
    /// Joined rooms and how many holders each has
    rooms: Arc<DashMap<TaskId, usize>>,
}

impl RoomCoordinator {
    /// Create a coordinator on `connection`
    #[must_use]
    pub fn new(connection: ConnectionManager, config: RoomConfig) -> Self {
        Self {
            connection,
            config,
            rooms: Arc::new(DashMap::new()),
        }
    }

    /// Room policy in use
    #[must_use]
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Join the room for `task_id`
    ///
    /// Emits `join_task` and waits up to the join timeout for `joined`.
    /// Every successful join must be matched by one [`Self::leave_task`].
    ///
    /// # Errors
    ///
    /// Fails fast with `RoomError::NotConnected` without a connection. A
    /// missing ack is only an error in strict mode.
    pub async fn join_task(&self, task_id: &TaskId) -> Result<(), RoomError> {
        self.exchange(task_id, JOIN_TASK, JOINED, self.config.join_ack_timeout)
            .await?;
        let members = {
            let mut members = self.rooms.entry(task_id.clone()).or_insert(0);
            *members += 1;
            *members
        };
        tracing::info!(task_id = %task_id, members, "Joined task room");
        Ok(())
    }

    /// Confirm membership of the room for `task_id`
    ///
    /// Same exchange as [`Self::join_task`] with `confirm_room` and the
    /// shorter confirm timeout.
    ///
    /// # Errors
    ///
    /// As [`Self::join_task`].
    pub async fn confirm_room(&self, task_id: &TaskId) -> Result<(), RoomError> {
        self.exchange(
            task_id,
            CONFIRM_ROOM,
            ROOM_CONFIRMED,
            self.config.confirm_ack_timeout,
        )
        .await?;
        tracing::debug!(task_id = %task_id, "Room confirmed");
        Ok(())
    }

    /// Leave the room for `task_id`
    ///
    /// Drops one holder. `leave_task` goes out only when the last holder
    /// leaves. Fire-and-forget: no ack is awaited and nothing is sent when
    /// detached.
    pub async fn leave_task(&self, task_id: &TaskId) {
        let remaining = self.rooms.get_mut(task_id).map(|mut members| {
            *members = members.saturating_sub(1);
            *members
        });
        if let Some(remaining) = remaining.filter(|n| *n > 0) {
            tracing::debug!(task_id = %task_id, remaining, "Room still in use");
            return;
        }
        if self.rooms.remove_if(task_id, |_, members| *members == 0).is_none()
            && self.rooms.contains_key(task_id)
        {
            // Joined again in the meantime
            return;
        }
        if !self.connection.is_connected() {
            return;
        }

        let request = RoomRequest {
            task_id: task_id.clone(),
        };
        match self.connection.emit_json(LEAVE_TASK, &request).await {
            Ok(()) => tracing::info!(task_id = %task_id, "Left task room"),
            Err(e) => tracing::debug!(task_id = %task_id, error = %e, "Leave not sent"),
        }
    }

    /// Rooms currently joined
    #[must_use]
    pub fn active_rooms(&self) -> Vec<TaskId> {
        let mut rooms: Vec<_> = self.rooms.iter().map(|r| r.key().clone()).collect();
        rooms.sort();
        rooms
    }

    /// Whether the room for `task_id` is joined
    #[must_use]
    pub fn is_joined(&self, task_id: &TaskId) -> bool {
        self.rooms.contains_key(task_id)
    }

    /// How many holders the room for `task_id` has
    #[must_use]
    pub fn members(&self, task_id: &TaskId) -> usize {
        self.rooms.get(task_id).map_or(0, |members| *members)
    }

    /// Join every active room again, e.g. after a reconnect
    ///
    /// Returns how many rooms were re-joined. Holder counts are left as
    /// they are. Failures are logged and the room stays in the active set
    /// for the next attempt.
    pub async fn rejoin_all(&self) -> usize {
        let mut rejoined = 0;
        for task_id in self.active_rooms() {
            let joined = self
                .exchange(&task_id, JOIN_TASK, JOINED, self.config.join_ack_timeout)
                .await;
            match joined {
                Ok(()) => rejoined += 1,
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Rejoin failed"),
            }
        }
        rejoined
    }

    async fn exchange(
        &self,
        task_id: &TaskId,
        request_event: &str,
        ack_event: &'static str,
        timeout: Duration,
    ) -> Result<(), RoomError> {
        if !self.connection.is_connected() {
            return Err(RoomError::NotConnected);
        }

        let pending = PendingRequest::new(self.connection.listeners(), task_id.clone(), timeout)
            .watch(ack_event, AckKind::Success);

        let request = RoomRequest {
            task_id: task_id.clone(),
        };
        self.connection.emit_json(request_event, &request).await?;

        match pending.wait().await {
            PendingOutcome::Resolved { .. } => Ok(()),
            PendingOutcome::TimedOut if self.config.ack_tolerant => {
                tracing::warn!(task_id = %task_id, ack = ack_event, ?timeout, "No ack, continuing");
                Ok(())
            }
            PendingOutcome::TimedOut => Err(RoomError::AckTimeout {
                task_id: task_id.clone(),
                event: ack_event,
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessServer, InProcessTransport, TransportConfig};
    use serde_json::json;
    use tokio::time::Instant;

    async fn connected(config: RoomConfig) -> (RoomCoordinator, InProcessServer) {
        let (transport, server) = InProcessTransport::new_pair();
        let connection =
            ConnectionManager::new(TransportConfig::with_url("memory://"), Box::new(transport));
        connection.connect().await.unwrap();
        (RoomCoordinator::new(connection, config), server)
    }

    #[tokio::test]
    async fn test_join_requires_connection() {
        let (transport, _server) = InProcessTransport::new_pair();
        let connection =
            ConnectionManager::new(TransportConfig::with_url("memory://"), Box::new(transport));
        let rooms = RoomCoordinator::new(connection, RoomConfig::default());

        let err = rooms.join_task(&TaskId::new("t1")).await.unwrap_err();
        assert!(matches!(err, RoomError::NotConnected));
        assert!(!rooms.is_joined(&TaskId::new("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_resolves_on_ack() {
        let (rooms, server) = connected(RoomConfig::default()).await;
        let responder = tokio::spawn({
            let server = server.clone();
            async move {
                let request = server.expect_emit(JOIN_TASK).await.unwrap();
                server.emit(JOINED, json!({"task_id": request["task_id"], "status": "ok"}));
            }
        });

        let started = Instant::now();
        rooms.join_task(&TaskId::new("t1")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(rooms.active_rooms(), vec![TaskId::new("t1")]);
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_without_ack_succeeds_after_timeout() {
        let (rooms, server) = connected(RoomConfig::default()).await;

        let started = Instant::now();
        rooms.join_task(&TaskId::new("t1")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(
            server.try_next_emit(),
            Some((JOIN_TASK.to_string(), json!({"task_id": "t1"})))
        );
        assert!(rooms.is_joined(&TaskId::new("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_without_ack_succeeds_after_one_second() {
        let (rooms, _server) = connected(RoomConfig::default()).await;
        let started = Instant::now();
        rooms.confirm_room(&TaskId::new("t1")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_mode_reports_missing_ack() {
        let config = RoomConfig {
            ack_tolerant: false,
            ..Default::default()
        };
        let (rooms, _server) = connected(config).await;

        let err = rooms.join_task(&TaskId::new("t1")).await.unwrap_err();
        assert!(matches!(err, RoomError::AckTimeout { event: JOINED, .. }));
        assert!(!rooms.is_joined(&TaskId::new("t1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_other_room_is_ignored() {
        let config = RoomConfig {
            ack_tolerant: false,
            ..Default::default()
        };
        let (rooms, server) = connected(config).await;
        tokio::spawn({
            let server = server.clone();
            async move {
                server.expect_emit(JOIN_TASK).await;
                server.emit(JOINED, json!({"task_id": "someone-else"}));
            }
        });

        assert!(rooms.join_task(&TaskId::new("t1")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_is_fire_and_forget() {
        let (rooms, server) = connected(RoomConfig::default()).await;
        rooms.join_task(&TaskId::new("t1")).await.unwrap();
        server.try_next_emit();

        rooms.leave_task(&TaskId::new("t1")).await;
        assert_eq!(
            server.try_next_emit(),
            Some((LEAVE_TASK.to_string(), json!({"task_id": "t1"})))
        );
        assert!(rooms.active_rooms().is_empty());
    }

    #[tokio::test]
    async fn test_leave_when_detached_is_noop() {
        let (rooms, server) = connected(RoomConfig::default()).await;
        server.close(crate::transport::DisconnectReason::ServerInitiated);
        while rooms.connection.is_connected() {
            tokio::task::yield_now().await;
        }

        rooms.leave_task(&TaskId::new("t1")).await;
        assert_eq!(server.try_next_emit(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_all_replays_membership() {
        let (rooms, server) = connected(RoomConfig::default()).await;
        rooms.join_task(&TaskId::new("a")).await.unwrap();
        rooms.join_task(&TaskId::new("b")).await.unwrap();
        while server.try_next_emit().is_some() {}

        assert_eq!(rooms.rejoin_all().await, 2);
        assert_eq!(
            server.try_next_emit(),
            Some((JOIN_TASK.to_string(), json!({"task_id": "a"})))
        );
        assert_eq!(
            server.try_next_emit(),
            Some((JOIN_TASK.to_string(), json!({"task_id": "b"})))
        );
        assert_eq!(rooms.members(&TaskId::new("a")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_room_left_only_by_last_holder() {
        let (rooms, server) = connected(RoomConfig::default()).await;
        let task = TaskId::new("t1");
        rooms.join_task(&task).await.unwrap();
        rooms.join_task(&task).await.unwrap();
        while server.try_next_emit().is_some() {}
        assert_eq!(rooms.members(&task), 2);

        rooms.leave_task(&task).await;
        assert_eq!(server.try_next_emit(), None);
        assert!(rooms.is_joined(&task));
        assert_eq!(rooms.members(&task), 1);

        rooms.leave_task(&task).await;
        assert_eq!(
            server.try_next_emit(),
            Some((LEAVE_TASK.to_string(), json!({"task_id": "t1"})))
        );
        assert!(!rooms.is_joined(&task));
        assert_eq!(rooms.members(&task), 0);
    }
}

//! Reconnect Supervisor
//!
//! Watches the connection's lifecycle and keeps room membership valid
//! across losses.
//!
//! # State Machine
//!
//! ```text
//!            Connected ◄──────────────────────────┐
//!                │ server disconnect              │ connect + rejoin ok
//!                ▼                                │
//!   Reconnecting{1} ─► Reconnecting{2} ─► ... ────┘
//!          │                          │ max attempts
//!          │ abandoned                ▼
//!          ▼                        Failed
//!        Idle
//! ```
//!
//! Transport blips are retried by the connection itself; the supervisor only
//! re-joins rooms once that succeeds. A client-initiated disconnect parks the
//! supervisor in `Idle`. Recovery is abandoned, also landing in `Idle`, once
//! no consumer holds the connection or the client has closed it.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionError, ConnectionEvent, ConnectionManager};
use crate::rooms::RoomCoordinator;
use crate::transport::DisconnectReason;

/// Supervisor retry policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Whether the supervisor runs at all
    pub enabled: bool,
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Wait before each attempt
    pub delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Observable supervisor state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectState {
    /// Not connected and not trying
    Idle,
    /// Connected with rooms in place
    Connected,
    /// Trying to get back
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Gave up; a manual `connect()` is required
    Failed,
}

/// Drives reconnection and room replay
pub struct ReconnectSupervisor {
    connection: ConnectionManager,
    rooms: RoomCoordinator,
    config: SupervisorConfig,
    state: watch::Sender<ReconnectState>,
}

/// Running supervisor; stops it when dropped
pub struct SupervisorHandle {
    state: watch::Receiver<ReconnectState>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Current state
    #[must_use]
    pub fn state(&self) -> ReconnectState {
        *self.state.borrow()
    }

    /// Observe state changes
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ReconnectState> {
        self.state.clone()
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ReconnectSupervisor {
    /// Create a supervisor for `connection` and its rooms
    #[must_use]
    pub fn new(
        connection: ConnectionManager,
        rooms: RoomCoordinator,
        config: SupervisorConfig,
    ) -> Self {
        let initial = if connection.is_connected() {
            ReconnectState::Connected
        } else {
            ReconnectState::Idle
        };
        let (state, _) = watch::channel(initial);
        Self {
            connection,
            rooms,
            config,
            state,
        }
    }

    /// Start supervising on the current runtime
    #[must_use]
    pub fn spawn(self) -> SupervisorHandle {
        // Subscribe before spawning so no event published meanwhile is lost
        let events = self.connection.subscribe();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(events));
        SupervisorHandle { state, task }
    }

    fn set(&self, state: ReconnectState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Supervisor state");
        }
    }

    async fn run(self, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Supervisor lagged behind connection events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                ConnectionEvent::Connected => self.set(ReconnectState::Connected),
                ConnectionEvent::Disconnected(DisconnectReason::ClientInitiated) => {
                    self.set(ReconnectState::Idle);
                }
                ConnectionEvent::Disconnected(DisconnectReason::ServerInitiated) => {
                    self.recover().await;
                }
                ConnectionEvent::Disconnected(_) => {
                    if self.connection.config().reconnect_attempts == 0 {
                        self.recover().await;
                    }
                }
                ConnectionEvent::Reconnecting { attempt } => {
                    self.set(ReconnectState::Reconnecting { attempt });
                }
                ConnectionEvent::Reconnected { attempt } => {
                    let rejoined = self.rooms.rejoin_all().await;
                    tracing::info!(attempt, rejoined, "Rooms restored after reconnect");
                    self.set(ReconnectState::Connected);
                }
                ConnectionEvent::ReconnectFailed { attempts } => {
                    tracing::warn!(attempts, "Connection could not be restored");
                    self.set(ReconnectState::Failed);
                }
            }
        }
    }

    /// Nobody wants the connection back
    fn abandoned(&self) -> bool {
        self.connection.is_closed() || self.connection.ref_count() == 0
    }

    fn stand_down(&self, attempt: u32) {
        tracing::info!(attempt, "Connection no longer wanted, reconnection abandoned");
        self.set(ReconnectState::Idle);
    }

    async fn recover(&self) {
        for attempt in 1..=self.config.max_attempts {
            if self.abandoned() {
                self.stand_down(attempt);
                return;
            }
            self.set(ReconnectState::Reconnecting { attempt });
            tokio::time::sleep(self.config.delay).await;
            if self.abandoned() {
                self.stand_down(attempt);
                return;
            }

            match self.connection.reconnect().await {
                Ok(()) => {
                    let rejoined = self.rooms.rejoin_all().await;
                    tracing::info!(attempt, rejoined, "Reconnected after server disconnect");
                    self.set(ReconnectState::Connected);
                    return;
                }
                Err(ConnectionError::Closed) => {
                    self.stand_down(attempt);
                    return;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        tracing::warn!(
            attempts = self.config.max_attempts,
            "Giving up on reconnection"
        );
        self.set(ReconnectState::Failed);
    }
}

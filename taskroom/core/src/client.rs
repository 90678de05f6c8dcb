//! Client Service
//!
//! One `Client` per process owns the shared connection and the services
//! built on it. UI contexts borrow it to open [`TaskSession`]s.

use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::instructions::InstructionChannel;
use crate::reconnect::{ReconnectState, ReconnectSupervisor, SupervisorHandle};
use crate::rooms::RoomCoordinator;
use crate::session::{SessionError, TaskSession};
use crate::tasks::TaskId;
use crate::transport::{create_transport, EventTransport, TransportError};

/// The shared connection and its services
pub struct Client {
    config: ClientConfig,
    connection: ConnectionManager,
    rooms: RoomCoordinator,
    instructions: InstructionChannel,
    supervisor: Option<SupervisorHandle>,
}

impl Client {
    /// Build the client over `transport`
    ///
    /// The reconnect supervisor is started when enabled and a Tokio runtime
    /// is available.
    #[must_use]
    pub fn new(config: ClientConfig, transport: Box<dyn EventTransport>) -> Self {
        let connection = ConnectionManager::new(config.transport.clone(), transport);
        let rooms = RoomCoordinator::new(connection.clone(), config.rooms.clone());
        let instructions = InstructionChannel::new(connection.clone(), config.instruction_timeout);

        let supervisor = if !config.supervisor.enabled {
            None
        } else if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No runtime, reconnect supervisor not started");
            None
        } else {
            let supervisor = ReconnectSupervisor::new(
                connection.clone(),
                rooms.clone(),
                config.supervisor.clone(),
            );
            Some(supervisor.spawn())
        };

        Self {
            config,
            connection,
            rooms,
            instructions,
            supervisor,
        }
    }

    /// Build the client with the transport the configuration calls for
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when no transport can serve the target.
    pub fn from_config(config: ClientConfig) -> Result<Self, TransportError> {
        let transport = create_transport(&config.transport)?;
        Ok(Self::new(config, transport))
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The shared connection
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Room membership
    #[must_use]
    pub fn rooms(&self) -> &RoomCoordinator {
        &self.rooms
    }

    /// Mid-task instructions
    #[must_use]
    pub fn instructions(&self) -> &InstructionChannel {
        &self.instructions
    }

    /// Reconnect supervisor state, when it runs
    #[must_use]
    pub fn supervisor_state(&self) -> Option<ReconnectState> {
        self.supervisor.as_ref().map(SupervisorHandle::state)
    }

    /// Observe reconnect supervisor state, when it runs
    #[must_use]
    pub fn watch_supervisor(&self) -> Option<watch::Receiver<ReconnectState>> {
        self.supervisor.as_ref().map(SupervisorHandle::watch)
    }

    /// Connect to the configured target
    ///
    /// # Errors
    ///
    /// As [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    /// Open a session on `task_id`
    ///
    /// # Errors
    ///
    /// As [`TaskSession::open`].
    pub async fn open_session(
        &self,
        task_id: impl Into<TaskId>,
    ) -> Result<TaskSession, SessionError> {
        TaskSession::open(self, task_id.into()).await
    }
}

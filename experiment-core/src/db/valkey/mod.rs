mod shared_state;

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use tokio::time::timeout;

use crate::db::HealthCheckable;
use crate::error::{Error, ErrorDetails};

/// Connection info for the Valkey (Redis-compatible) shared-state backend.
///
/// `ConnectionManager` reconnects on connection loss and multiplexes commands,
/// so the handle is cheap to clone into every call.
#[derive(Clone)]
pub enum ValkeyConnectionInfo {
    Enabled { connection: Box<ConnectionManager> },
    Disabled,
}

fn connection_error(message: String) -> Error {
    Error::new(ErrorDetails::ValkeyConnection { message })
}

impl ValkeyConnectionInfo {
    /// Connects and installs the engine's function library.
    pub async fn new(valkey_url: &str) -> Result<Self, Error> {
        let client = Client::open(valkey_url)
            .map_err(|e| connection_error(format!("Invalid Valkey URL: {e}")))?;
        let mut connection = ConnectionManager::new(client)
            .await
            .map_err(|e| connection_error(format!("Failed to connect to Valkey: {e}")))?;
        install_functions(&mut connection).await?;
        tracing::info!("Connected to Valkey shared state");
        Ok(Self::Enabled {
            connection: Box::new(connection),
        })
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    fn connection(&self) -> Result<ConnectionManager, Error> {
        match self {
            Self::Enabled { connection } => Ok(connection.as_ref().clone()),
            Self::Disabled => Err(connection_error("Valkey shared state is disabled".to_string())),
        }
    }
}

/// Installs the `expt_engine` library, replacing an older copy left by a previous deploy.
async fn install_functions(connection: &mut ConnectionManager) -> Result<(), Error> {
    let installed: RedisResult<String> = redis::cmd("FUNCTION")
        .arg("LOAD")
        .arg("REPLACE")
        .arg(include_str!("lua/expt_engine.lua"))
        .query_async(connection)
        .await;
    let library = installed.map_err(|e| {
        Error::new(ErrorDetails::ValkeyQuery {
            message: format!("Failed to install the expt_engine function library: {e}"),
        })
    })?;
    tracing::debug!(%library, "Installed Valkey function library");
    Ok(())
}

const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait]
impl HealthCheckable for ValkeyConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        if matches!(self, Self::Disabled) {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let pong: RedisResult<String> = match timeout(PING_TIMEOUT, conn.ping()).await {
            Ok(pong) => pong,
            Err(_) => {
                return Err(connection_error("Valkey health check timed out".to_string()));
            }
        };
        pong.map(|_| ())
            .map_err(|e| connection_error(format!("Valkey health check failed: {e}")))
    }
}

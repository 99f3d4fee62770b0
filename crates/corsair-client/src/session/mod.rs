//! Client-side session cache.
//!
//! The server owns session truth; [`SessionRegistry`] is a read-through cache
//! whose entries keep their identity across refreshes so that anything holding
//! an `Arc<Session>` observes updates.

mod log;
mod registry;

pub use log::{LogLevel, LogLine, SessionLog};
pub use registry::SessionRegistry;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use corsair_proto::v1::Session as SessionMessage;

/// One implant session as seen by this client.
#[derive(Debug)]
pub struct Session {
    id: String,
    info: RwLock<SessionMessage>,
    log: SessionLog,
    scope: CancellationToken,
}

impl Session {
    pub(crate) fn new(info: SessionMessage, scope: CancellationToken) -> Self {
        Self {
            id: info.session_id.clone(),
            log: SessionLog::new(info.session_id.clone()),
            info: RwLock::new(info),
            scope,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the latest snapshot.
    pub async fn snapshot(&self) -> SessionMessage {
        self.info.read().await.clone()
    }

    pub async fn is_alive(&self) -> bool {
        self.info.read().await.is_alive
    }

    /// Whether the implant reports `module` among its loaded modules or addons.
    pub async fn has_module(&self, module: &str) -> bool {
        let info = self.info.read().await;
        info.modules.iter().any(|m| m == module) || info.addons.iter().any(|a| a == module)
    }

    /// Observer log for this session.
    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Cancelled when the session is removed from the registry.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub(crate) async fn replace(&self, snapshot: SessionMessage) {
        *self.info.write().await = snapshot;
    }

    /// One-line summary for listings.
    pub async fn summary(&self) -> String {
        let info = self.info.read().await;
        format!(
            "{:<12} {:<16} {:<20} {:<8} {}",
            info.session_id,
            if info.name.is_empty() { "-" } else { info.name.as_str() },
            format!("{}@{}", info.username, info.hostname),
            if info.is_alive { "alive" } else { "dead" },
            info.group,
        )
    }
}

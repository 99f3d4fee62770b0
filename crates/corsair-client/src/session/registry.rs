//! Session registry shared by the command tasks and the event stream task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use corsair_proto::v1::Session as SessionMessage;

use super::{Session, SessionLog};
use crate::error::{ClientError, Result};
use crate::rpc::ServerRpc;

/// Authoritative client-side cache of sessions.
pub struct SessionRegistry {
    rpc: Arc<dyn ServerRpc>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    active: RwLock<Option<Arc<Session>>>,
    active_sink: watch::Sender<Option<SessionLog>>,
    root: CancellationToken,
}

impl SessionRegistry {
    /// Create an empty registry. Session scopes are children of `root`.
    pub fn new(rpc: Arc<dyn ServerRpc>, root: CancellationToken) -> Self {
        let (active_sink, _) = watch::channel(None);
        Self {
            rpc,
            sessions: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            active_sink,
            root,
        }
    }

    /// Cached lookup.
    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ClientError::SessionNotFound(session_id.to_string()))
    }

    /// Cached lookup, falling back to the server on a miss.
    pub async fn get_or_fetch(&self, session_id: &str) -> Result<Arc<Session>> {
        if let Ok(session) = self.get(session_id).await {
            return Ok(session);
        }
        debug!(session_id, "Session cache miss, fetching from server");
        let snapshot = self
            .rpc
            .get_session(session_id)
            .await
            .map_err(|e| match e.status_code() {
                Some(tonic::Code::NotFound) => ClientError::SessionNotFound(session_id.to_string()),
                _ => e,
            })?;
        Ok(self.upsert(snapshot).await)
    }

    /// Insert a new session or refresh an existing one in place.
    ///
    /// The returned `Arc` is the same object for every call with the same id.
    pub async fn upsert(&self, snapshot: SessionMessage) -> Arc<Session> {
        let existing = self.sessions.read().await.get(&snapshot.session_id).cloned();
        if let Some(session) = existing {
            session.replace(snapshot).await;
            return session;
        }

        let mut sessions = self.sessions.write().await;
        // Another task may have inserted while the read lock was released.
        if let Some(session) = sessions.get(&snapshot.session_id).cloned() {
            drop(sessions);
            session.replace(snapshot).await;
            return session;
        }
        let session_id = snapshot.session_id.clone();
        let session = Arc::new(Session::new(snapshot, self.root.child_token()));
        sessions.insert(session_id.clone(), Arc::clone(&session));
        drop(sessions);
        info!(session_id, "Session registered");
        session
    }

    /// Drop a session and cancel everything scoped to it.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id)?;
        removed.scope().cancel();

        let mut active = self.active.write().await;
        if active.as_ref().is_some_and(|a| a.id() == session_id) {
            *active = None;
            self.active_sink.send_replace(None);
        }
        drop(active);

        info!(session_id, "Session removed");
        Some(removed)
    }

    /// Make `session` the interactive target and rebind the active log sink.
    pub async fn set_active(&self, session: Arc<Session>) {
        self.active_sink.send_replace(Some(session.log().clone()));
        info!(session_id = session.id(), "Active session changed");
        *self.active.write().await = Some(session);
    }

    /// Clear the interactive target.
    pub async fn clear_active(&self) {
        *self.active.write().await = None;
        self.active_sink.send_replace(None);
    }

    pub async fn active(&self) -> Option<Arc<Session>> {
        self.active.read().await.clone()
    }

    /// Follow changes of the active log sink.
    pub fn watch_active_sink(&self) -> watch::Receiver<Option<SessionLog>> {
        self.active_sink.subscribe()
    }

    /// Every cached session, ordered by id.
    pub async fn all(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Cached sessions whose implant is alive, ordered by id.
    pub async fn list_alive(&self) -> Vec<Arc<Session>> {
        let mut alive = Vec::new();
        for session in self.all().await {
            if session.is_alive().await {
                alive.push(session);
            }
        }
        alive
    }

    /// Re-list every session from the server and upsert it.
    pub async fn refresh(&self) -> Result<usize> {
        let snapshots = self.rpc.list_sessions().await?;
        let count = snapshots.len();
        for snapshot in snapshots {
            self.upsert(snapshot).await;
        }
        debug!(count, "Session registry refreshed");
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tests::harness::{FakeRpc, session_message};

    fn registry(fake: &Arc<FakeRpc>) -> SessionRegistry {
        SessionRegistry::new(fake.clone(), CancellationToken::new())
    }

    #[tokio::test]
    async fn get_unknown_session_is_lookup_error() {
        let fake = Arc::new(FakeRpc::new());
        let reg = registry(&fake);
        assert!(matches!(
            reg.get("nope").await,
            Err(ClientError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn upsert_preserves_identity_and_updates_fields() {
        let fake = Arc::new(FakeRpc::new());
        let reg = registry(&fake);

        let first = reg.upsert(session_message("S1", true)).await;
        let mut changed = session_message("S1", true);
        changed.note = "domain controller".into();
        let second = reg.upsert(changed).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.snapshot().await.note, "domain controller");
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let fake = Arc::new(FakeRpc::new());
        let reg = registry(&fake);
        let a = reg.upsert(session_message("S1", true)).await;
        let b = reg.upsert(session_message("S1", true)).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.snapshot().await, session_message("S1", true));
    }

    #[tokio::test]
    async fn get_or_fetch_caches_server_result() {
        let fake = Arc::new(FakeRpc::new());
        fake.add_server_session(session_message("S9", true)).await;
        let reg = registry(&fake);

        let fetched = reg.get_or_fetch("S9").await.unwrap();
        let again = reg.get_or_fetch("S9").await.unwrap();
        assert!(Arc::ptr_eq(&fetched, &again));
        assert_eq!(fake.calls().get_session, 1);
    }

    #[tokio::test]
    async fn get_or_fetch_unknown_on_server_is_lookup_error() {
        let fake = Arc::new(FakeRpc::new());
        let reg = registry(&fake);
        assert!(matches!(
            reg.get_or_fetch("ghost").await,
            Err(ClientError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_alive_filters_dead_sessions() {
        let fake = Arc::new(FakeRpc::new());
        let reg = registry(&fake);
        reg.upsert(session_message("S1", true)).await;
        reg.upsert(session_message("S2", false)).await;
        reg.upsert(session_message("S3", true)).await;

        let ids: Vec<_> = reg
            .list_alive()
            .await
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, ["S1", "S3"]);
    }

    #[tokio::test]
    async fn set_active_rebinds_sink() {
        let fake = Arc::new(FakeRpc::new());
        let reg = registry(&fake);
        let mut sink = reg.watch_active_sink();
        assert!(sink.borrow().is_none());

        let s1 = reg.upsert(session_message("S1", true)).await;
        reg.set_active(s1).await;
        sink.changed().await.unwrap();
        assert_eq!(sink.borrow().as_ref().unwrap().source(), "S1");
        assert_eq!(reg.active().await.unwrap().id(), "S1");
    }

    #[tokio::test]
    async fn remove_cancels_scope_and_clears_active() {
        let fake = Arc::new(FakeRpc::new());
        let reg = registry(&fake);
        let s1 = reg.upsert(session_message("S1", true)).await;
        reg.set_active(Arc::clone(&s1)).await;

        reg.remove("S1").await.unwrap();
        assert!(s1.scope().is_cancelled());
        assert!(reg.active().await.is_none());
        assert!(reg.get("S1").await.is_err());
    }

    #[tokio::test]
    async fn refresh_upserts_every_server_session() {
        let fake = Arc::new(FakeRpc::new());
        fake.add_server_session(session_message("S1", true)).await;
        fake.add_server_session(session_message("S2", false)).await;
        let reg = registry(&fake);

        assert_eq!(reg.refresh().await.unwrap(), 2);
        assert_eq!(reg.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_upserts_share_one_object() {
        let fake = Arc::new(FakeRpc::new());
        let reg = Arc::new(registry(&fake));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.upsert(session_message("S1", true)).await
            }));
        }
        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}

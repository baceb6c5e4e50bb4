use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::{ConnectionStatus, PeerCommand};
use crate::errors::PeerError;
use crate::peer::{PeerConnection, SignalingState};

/// One remote participant's connection: the platform peer connection plus
/// the task that serializes every negotiation step for it.
pub struct ParticipantConnection {
    participant_id: String,
    connection_id: Uuid,
    peer: Arc<dyn PeerConnection>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    task: JoinHandle<()>,
}

impl ParticipantConnection {
    pub(crate) fn new(
        participant_id: String,
        connection_id: Uuid,
        peer: Arc<dyn PeerConnection>,
        commands: mpsc::UnboundedSender<PeerCommand>,
        status: Arc<watch::Sender<ConnectionStatus>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            participant_id,
            connection_id,
            peer,
            commands,
            status,
            task,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Distinguishes successive connections to the same participant.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Append a command to this connection's queue. Returns `false` once the
    /// connection task has stopped.
    pub(crate) fn enqueue(&self, command: PeerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Mark closed and cancel in-flight negotiation. The platform connection
    /// is released on its own task; the handle resolves once it is closed.
    fn close(self) -> JoinHandle<()> {
        self.status
            .send_modify(|status| status.signaling = SignalingState::Closed);
        self.task.abort();
        let Self {
            participant_id,
            peer,
            ..
        } = self;
        tokio::spawn(async move {
            if let Err(e) = peer.close().await {
                tracing::warn!(participant = %participant_id, "error closing peer connection: {e}");
            }
            tracing::debug!(participant = %participant_id, "participant connection closed");
        })
    }
}

/// Maps remote participant id to its connection. At most one connection
/// per participant.
#[derive(Default)]
pub struct SessionDirectory {
    connections: HashMap<String, ParticipantConnection>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, participant_id: &str) -> Option<&ParticipantConnection> {
        self.connections.get(participant_id)
    }

    /// Return the existing connection, or build one with `create`. The flag
    /// tells whether a new connection was inserted.
    pub async fn get_or_create<F, Fut>(
        &mut self,
        participant_id: &str,
        create: F,
    ) -> Result<(&ParticipantConnection, bool), PeerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ParticipantConnection, PeerError>>,
    {
        match self.connections.entry(participant_id.to_string()) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(entry) => {
                let connection = create().await?;
                Ok((entry.insert(connection), true))
            }
        }
    }

    /// Drop the connection for `participant_id` and start closing it.
    /// Returns `None` if there was no connection.
    pub fn remove(&mut self, participant_id: &str) -> Option<JoinHandle<()>> {
        self.connections
            .remove(participant_id)
            .map(ParticipantConnection::close)
    }

    /// Like [`remove`](Self::remove), but only if the stored connection is
    /// still the one identified by `connection_id`.
    pub fn remove_connection(
        &mut self,
        participant_id: &str,
        connection_id: Uuid,
    ) -> Option<JoinHandle<()>> {
        let current = self
            .connections
            .get(participant_id)
            .is_some_and(|c| c.connection_id == connection_id);
        if !current {
            return None;
        }
        self.remove(participant_id)
    }

    /// Start closing every connection. Await the handles, after releasing
    /// the directory, to wait for the platform connections to go away.
    pub fn clear(&mut self) -> Vec<JoinHandle<()>> {
        self.connections
            .drain()
            .map(|(_, connection)| connection.close())
            .collect()
    }

    /// Participant ids, sorted. A snapshot: later mutation does not affect it.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Visit every connection, iterating over a snapshot of the id set.
    pub fn for_each(&self, mut f: impl FnMut(&ParticipantConnection)) {
        for id in self.ids() {
            if let Some(connection) = self.connections.get(&id) {
                f(connection);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::NegotiationRole;
    use crate::testing::FakePeer;
    use std::time::Duration;

    fn make_connection(id: &str) -> (ParticipantConnection, Arc<FakePeer>) {
        let (events, _) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer::new(id, events));
        let (commands, _) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::new(NegotiationRole::Offerer));
        let connection = ParticipantConnection::new(
            id.to_string(),
            Uuid::new_v4(),
            peer.clone(),
            commands,
            Arc::new(status),
            tokio::spawn(async {}),
        );
        (connection, peer)
    }

    #[tokio::test]
    async fn get_or_create_inserts_once() {
        let mut directory = SessionDirectory::new();
        let (first, _) = make_connection("u2");
        let first_id = first.connection_id();

        let (connection, created) = directory
            .get_or_create("u2", move || async move { Ok(first) })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(connection.connection_id(), first_id);

        let (connection, created) = directory
            .get_or_create("u2", || async { Err(PeerError::Platform("unexpected create".into())) })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(connection.connection_id(), first_id);
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_entry() {
        let mut directory = SessionDirectory::new();
        let result = directory
            .get_or_create("u2", || async { Err(PeerError::Platform("no media stack".into())) })
            .await;
        assert!(result.is_err());
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn remove_closes_the_peer_connection() {
        let mut directory = SessionDirectory::new();
        let (connection, peer) = make_connection("u2");
        let mut status = connection.watch();
        directory
            .get_or_create("u2", move || async move { Ok(connection) })
            .await
            .unwrap();

        let closing = directory.remove("u2").unwrap();
        assert_eq!(status.borrow_and_update().signaling, SignalingState::Closed);
        assert!(directory.remove("u2").is_none());
        closing.await.unwrap();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn remove_connection_ignores_stale_ids() {
        let mut directory = SessionDirectory::new();
        let (connection, peer) = make_connection("u2");
        let current = connection.connection_id();
        directory
            .get_or_create("u2", move || async move { Ok(connection) })
            .await
            .unwrap();

        assert!(directory.remove_connection("u2", Uuid::new_v4()).is_none());
        assert_eq!(directory.len(), 1);
        directory
            .remove_connection("u2", current)
            .unwrap()
            .await
            .unwrap();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn for_each_visits_sorted_snapshot() {
        let mut directory = SessionDirectory::new();
        for id in ["u3", "u1", "u2"] {
            let (connection, _) = make_connection(id);
            directory
                .get_or_create(id, move || async move { Ok(connection) })
                .await
                .unwrap();
        }

        let mut visited = Vec::new();
        directory.for_each(|c| visited.push(c.participant_id().to_string()));
        assert_eq!(visited, ["u1", "u2", "u3"]);

        assert_eq!(directory.clear().len(), 3);
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn remove_returns_before_a_slow_close_finishes() {
        let mut directory = SessionDirectory::new();
        let (connection, peer) = make_connection("u2");
        peer.set_close_delay(Duration::from_millis(200));
        directory
            .get_or_create("u2", move || async move { Ok(connection) })
            .await
            .unwrap();

        let closing = directory.remove("u2").unwrap();
        assert!(directory.is_empty());
        assert!(!peer.is_closed());

        closing.await.unwrap();
        assert!(peer.is_closed());
    }
}

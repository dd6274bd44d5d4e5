//! In-memory [`IdentityStore`] reference implementation.
//!
//! Grounded in the teacher's `trefm-web/src/auth/session.rs`, which keeps
//! ephemeral per-process state in a [`DashMap`] rather than reaching for a
//! database. This adapter is what `sftp-server` wires up by default; a
//! document-database-backed adapter can implement the same trait without
//! the rest of the core knowing the difference.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{Connection, IdentityStore, NewConnection, NewUser, TransferRecord, User};
use crate::error::{CoreError, CoreResult};

/// Thread-safe, process-local [`IdentityStore`]. Data does not survive a
/// restart.
#[derive(Default)]
pub struct MemoryIdentityStore {
    users_by_id: DashMap<Uuid, User>,
    username_index: DashMap<String, Uuid>,
    connections: DashMap<Uuid, Connection>,
    transfers: Mutex<Vec<TransferRecord>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All buffered transfer records, oldest first. Exposed for tests and
    /// for an analytics read-back that the admin API would otherwise
    /// provide.
    pub fn all_transfers(&self) -> Vec<TransferRecord> {
        self.transfers.lock().unwrap().clone()
    }

    /// A single connection record by id. Exposed for tests and for the
    /// analytics read-back the admin API would otherwise provide.
    pub fn connection(&self, id: Uuid) -> Option<Connection> {
        self.connections.get(&id).map(|e| e.clone())
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_user_by_username(&self, username: &str) -> CoreResult<Option<User>> {
        let Some(id) = self.username_index.get(username).map(|e| *e) else {
            return Ok(None);
        };
        Ok(self.users_by_id.get(&id).map(|e| e.clone()))
    }

    async fn find_user_by_id(&self, id: Uuid) -> CoreResult<Option<User>> {
        Ok(self.users_by_id.get(&id).map(|e| e.clone()))
    }

    async fn update_last_login(&self, id: Uuid, when: DateTime<Utc>) -> CoreResult<()> {
        if let Some(mut user) = self.users_by_id.get_mut(&id) {
            user.last_login = Some(when);
        }
        Ok(())
    }

    async fn insert_user(&self, new_user: NewUser) -> CoreResult<User> {
        // Unique-index emulation: a duplicate username is an error, same
        // as a real store's unique-index violation.
        if self.username_index.contains_key(&new_user.username) {
            return Err(CoreError::Store(format!(
                "username {} already exists",
                new_user.username
            )));
        }
        let user = User {
            id: Uuid::new_v4(),
            username: new_user.username.clone(),
            password_hash: new_user.password_hash,
            role: new_user.role,
            active: new_user.active,
            home_dir: new_user.home_dir,
            created_at: Utc::now(),
            last_login: None,
        };
        self.username_index.insert(new_user.username, user.id);
        self.users_by_id.insert(user.id, user.clone());
        Ok(user)
    }

    async fn insert_connection(&self, record: NewConnection) -> CoreResult<Uuid> {
        let id = Uuid::new_v4();
        let connection = Connection {
            id,
            user_id: record.user_id,
            username: record.username,
            client_endpoint: record.client_endpoint,
            remote_ip: record.remote_ip,
            started_at: Utc::now(),
            ended_at: None,
            active: true,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        };
        self.connections.insert(id, connection);
        Ok(id)
    }

    async fn finalize_connection(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        bytes_uploaded: u64,
        bytes_downloaded: u64,
    ) -> CoreResult<()> {
        let mut entry = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| CoreError::Store(format!("connection {id} not found")))?;
        entry.ended_at = Some(ended_at);
        entry.active = false;
        entry.bytes_uploaded = bytes_uploaded;
        entry.bytes_downloaded = bytes_downloaded;
        Ok(())
    }

    async fn insert_transfers(&self, batch: Vec<TransferRecord>) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.transfers.lock().unwrap().extend(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.to_string(),
            password_hash: "hash".to_string(),
            role: Role::User,
            active: true,
            home_dir: name.to_string(),
        }
    }

    #[tokio::test]
    async fn insert_then_find_by_username_and_id() {
        let store = MemoryIdentityStore::new();
        let user = store.insert_user(new_user("alice")).await.unwrap();
        let by_name = store.find_user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
        let by_id = store.find_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(by_id.username, "alice");
    }

    #[tokio::test]
    async fn find_unknown_user_returns_none() {
        let store = MemoryIdentityStore::new();
        assert!(store
            .find_user_by_username("nobody")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_user_by_id(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = MemoryIdentityStore::new();
        store.insert_user(new_user("bob")).await.unwrap();
        let err = store.insert_user(new_user("bob")).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(_)));
    }

    #[tokio::test]
    async fn update_last_login_is_best_effort_on_missing_user() {
        let store = MemoryIdentityStore::new();
        // No panic, no error, even though the user doesn't exist.
        store.update_last_login(Uuid::new_v4(), Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn connection_lifecycle_accumulates_transfers() {
        let store = MemoryIdentityStore::new();
        let user = store.insert_user(new_user("carol")).await.unwrap();
        let conn_id = store
            .insert_connection(NewConnection {
                user_id: user.id,
                username: user.username.clone(),
                client_endpoint: "10.0.0.1:4000".to_string(),
                remote_ip: "10.0.0.1".to_string(),
            })
            .await
            .unwrap();

        store
            .insert_transfers(vec![TransferRecord {
                connection_id: conn_id,
                username: user.username.clone(),
                path: "/hello.txt".to_string(),
                direction: super::super::Direction::Upload,
                size: 3,
                timestamp: Utc::now(),
            }])
            .await
            .unwrap();

        store
            .finalize_connection(conn_id, Utc::now(), 3, 0)
            .await
            .unwrap();

        assert_eq!(store.all_transfers().len(), 1);
        let finalized = store.connections.get(&conn_id).unwrap();
        assert!(!finalized.active);
        assert_eq!(finalized.bytes_uploaded, 3);
    }

    #[tokio::test]
    async fn finalize_unknown_connection_errors() {
        let store = MemoryIdentityStore::new();
        let err = store
            .finalize_connection(Uuid::new_v4(), Utc::now(), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Store(_)));
    }

    #[tokio::test]
    async fn insert_empty_transfer_batch_is_a_no_op() {
        let store = MemoryIdentityStore::new();
        store.insert_transfers(Vec::new()).await.unwrap();
        assert!(store.all_transfers().is_empty());
    }
}

//! Identity Store Port — the narrow interface the core requires from the
//! persistence layer (spec §4.1).
//!
//! `sftp-core` never talks to a concrete database. Everything in the core
//! depends on the [`IdentityStore`] trait; a real deployment plugs in an
//! adapter backed by whatever document store the admin API already uses.
//! [`MemoryIdentityStore`] is the reference adapter shipped here — it is
//! enough to run the server standalone and to drive the test suite.

mod memory_store;

pub use memory_store::MemoryIdentityStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreResult;

/// A user's role. Only `Admin` and `User` exist; roles never gain
/// privileges beyond what `role` implies at the admin-API boundary, which
/// this crate does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

/// A persisted user record (spec §3 "User Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    /// Argon2 PHC string, never logged or returned to a client.
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    /// Sanitized, relative to the shared root. See `crate::jail`.
    pub home_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Fields needed to create a new [`User`]; `id`/`created_at`/`last_login`
/// are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    pub home_dir: String,
}

/// Transfer direction (spec §3 "Transfer Record").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

/// A single metered read or write, buffered in [`crate::session::SessionState`]
/// and flushed via [`IdentityStore::insert_transfers`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub connection_id: Uuid,
    pub username: String,
    /// The canonicalized virtual path at the time the handle was opened.
    pub path: String,
    pub direction: Direction,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Fields needed to start a new connection record; the store assigns `id`
/// and `started_at`.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub user_id: Uuid,
    pub username: String,
    pub client_endpoint: String,
    pub remote_ip: String,
}

/// A persisted connection record (spec §3 "Connection Record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub client_endpoint: String,
    pub remote_ip: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

/// Narrow port over the persistence layer (spec §4.1).
///
/// Every method is safe to call concurrently from independent sessions;
/// implementations are responsible for their own internal synchronization.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user_by_username(&self, username: &str) -> CoreResult<Option<User>>;
    async fn find_user_by_id(&self, id: Uuid) -> CoreResult<Option<User>>;
    async fn update_last_login(&self, id: Uuid, when: DateTime<Utc>) -> CoreResult<()>;

    /// Not part of spec §4.1's enumerated list, but required to make
    /// seeding (spec §6) possible against a port the admin API does not
    /// back in this crate. See `SPEC_FULL.md` §4.1.
    async fn insert_user(&self, user: NewUser) -> CoreResult<User>;

    async fn insert_connection(&self, record: NewConnection) -> CoreResult<Uuid>;
    async fn finalize_connection(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        bytes_uploaded: u64,
        bytes_downloaded: u64,
    ) -> CoreResult<()>;
    async fn insert_transfers(&self, batch: Vec<TransferRecord>) -> CoreResult<()>;
}

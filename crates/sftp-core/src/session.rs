//! Session Supervisor — owns the per-connection SSH handler and the
//! authenticated state it hands off to the SFTP subsystem (spec §4.6).
//!
//! Mirrors the shape of the teacher's client-side connection handling
//! (`trefm-core/src/remote/sftp.rs`) but on the server side of `russh`:
//! one `SshHandler` per inbound TCP connection, implementing
//! `russh::server::Handler`; `SshServer` implements `russh::server::Server`
//! and hands out a fresh `SshHandler` per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::error::CoreError;
use crate::handler::SftpHandler;
use crate::identity::{IdentityStore, NewConnection, User};
use crate::jail;
use crate::metered::{Counters, SharedCounters};

/// Shared, process-wide dependencies every session needs: the identity
/// store and the confinement root. Cloned cheaply (an `Arc` each) into
/// every `SshHandler`.
#[derive(Clone)]
pub struct ServerContext {
    pub store: Arc<dyn IdentityStore>,
    pub shared_root: std::path::PathBuf,
}

/// State accumulated once a connection authenticates, before the `sftp`
/// subsystem is ever requested: the user and their resolved jail root.
/// No Connection Record exists yet — spec §4.6 only inserts one on
/// entering `Serving`.
struct AuthenticatedState {
    user: User,
    home: std::path::PathBuf,
}

/// State accumulated on entering `Serving` (spec §4.6): the Connection
/// Record id and the shared counters every `MeteredFileHandle` on this
/// connection writes into.
struct ServingState {
    connection_id: Uuid,
    counters: SharedCounters,
}

/// One instance per accepted TCP connection (spec §4.6 state machine:
/// Accepted -> Handshaking -> Authenticating -> Authenticated/Rejected ->
/// ChannelOpen -> Serving -> Finalizing -> Closed).
pub struct SshHandler {
    ctx: ServerContext,
    peer_addr: Option<SocketAddr>,
    authenticated: Option<AuthenticatedState>,
    serving: Option<ServingState>,
    finalized: bool,
    /// The session channel, held from `channel_open_session` until a
    /// subsystem request claims it. `russh` hands ownership of the
    /// channel to the handler, not the `Session` object, so it has to be
    /// parked here between the two callbacks.
    pending_channel: Option<Channel<Msg>>,
}

impl SshHandler {
    fn new(ctx: ServerContext, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer_addr,
            authenticated: None,
            serving: None,
            finalized: false,
            pending_channel: None,
        }
    }

    /// Runs exactly once per connection, on the first of: channel close,
    /// channel eof, or handler drop. Persists final byte totals and the
    /// buffered transfer log; store failures are logged and swallowed
    /// (spec §7 — telemetry never aborts a session). A connection that
    /// never reached `Serving` (no Connection Record was ever inserted)
    /// has nothing to finalize.
    async fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let Some(serving) = self.serving.take() else {
            return;
        };
        finalize_serving(self.ctx.store.clone(), serving).await;
    }
}

/// Persists the final byte totals and the buffered transfer log for a
/// `ServingState`. Free function (rather than a method) so both the
/// normal async finalize path and the `Drop`-triggered background task
/// can share it without borrowing a `SshHandler` that's mid-teardown.
async fn finalize_serving(store: Arc<dyn IdentityStore>, serving: ServingState) {
    let counters = serving.counters.lock().await;
    let (uploaded, downloaded, transfers) = (
        counters.bytes_uploaded,
        counters.bytes_downloaded,
        counters.transfers.clone(),
    );
    drop(counters);

    if let Err(e) = store
        .finalize_connection(serving.connection_id, Utc::now(), uploaded, downloaded)
        .await
    {
        warn!(error = %e, connection_id = %serving.connection_id, "failed to finalize connection record");
    }
    if let Err(e) = store.insert_transfers(transfers).await {
        warn!(error = %e, connection_id = %serving.connection_id, "failed to persist transfer log");
    }
}

#[async_trait]
impl russh::server::Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, username: &str, password: &str) -> Result<Auth, Self::Error> {
        match auth::verify(self.ctx.store.as_ref(), username, password).await {
            Ok(user) => {
                let home = match jail::resolve_home(&user.home_dir, &self.ctx.shared_root) {
                    Ok(home) => home,
                    Err(e) => {
                        error!(username, error = %e, "home resolution failed for authenticated user");
                        return Ok(Auth::Reject { proceed_with_methods: None });
                    }
                };

                info!(username, "authenticated");
                self.authenticated = Some(AuthenticatedState { user, home });
                Ok(Auth::Accept)
            }
            Err(CoreError::AuthFailed) => {
                warn!(username, "authentication rejected");
                Ok(Auth::Reject { proceed_with_methods: None })
            }
            Err(e) => {
                error!(username, error = %e, "authentication backend error");
                Ok(Auth::Reject { proceed_with_methods: None })
            }
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Public-key auth is explicitly out of scope (Non-goals).
        Ok(Auth::Reject { proceed_with_methods: None })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.authenticated.is_none() {
            return Ok(false);
        }
        self.pending_channel = Some(channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let Some(authenticated) = &self.authenticated else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let Some(channel) = self.pending_channel.take() else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        // Entering `Serving` (spec §4.6): the Connection Record is
        // inserted here, not at auth success, so a client that
        // authenticates and never opens the sftp subsystem (or whose
        // channel-open times out) leaves behind no Connection Record at
        // all, per spec §4.6's `ChannelOpen` timeout clause.
        let client_endpoint = self
            .peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let remote_ip = self
            .peer_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let connection_id = match self
            .ctx
            .store
            .insert_connection(NewConnection {
                user_id: authenticated.user.id,
                username: authenticated.user.username.clone(),
                client_endpoint,
                remote_ip,
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(username = %authenticated.user.username, error = %e, "failed to record connection");
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };

        let counters: SharedCounters = Arc::new(tokio::sync::Mutex::new(Counters::default()));
        info!(username = %authenticated.user.username, %connection_id, "serving");

        let sftp_handler = SftpHandler::new(
            authenticated.home.clone(),
            connection_id,
            authenticated.user.username.clone(),
            counters.clone(),
        );
        self.serving = Some(ServingState { connection_id, counters });

        session.channel_success(channel_id)?;
        tokio::spawn(async move {
            let stream = channel.into_stream();
            if let Err(e) = russh_sftp::server::run(stream, sftp_handler).await {
                warn!(error = %e, "sftp subsystem exited with error");
            }
        });
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.finalize().await;
        session.close(channel)?;
        Ok(())
    }

    async fn channel_close(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.finalize().await;
        Ok(())
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        // An unclean disconnect (spec scenario S6 — the TCP connection
        // drops without `channel_eof`/`channel_close` ever firing) must
        // still finalize exactly once (spec invariant 4). `finalize` is
        // async and `Drop` is not, so the terminal guard here hands the
        // still-owned `ServingState` to a detached task instead of
        // leaving it to a reconciliation sweep; `finalized` still
        // guarantees this never double-finalizes a session that already
        // went through `channel_eof`/`channel_close`.
        if self.finalized {
            return;
        }
        self.finalized = true;
        let Some(serving) = self.serving.take() else {
            return;
        };
        warn!(connection_id = %serving.connection_id, "session dropped without a clean close; finalizing in background");
        let store = self.ctx.store.clone();
        tokio::spawn(finalize_serving(store, serving));
    }
}

/// Per-listener factory, implementing `russh::server::Server` (spec
/// §4.6). Hands out one `SshHandler` per accepted TCP connection.
pub struct SshServer {
    ctx: ServerContext,
}

impl SshServer {
    pub fn new(ctx: ServerContext) -> Self {
        Self { ctx }
    }
}

impl russh::server::Server for SshServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> SshHandler {
        SshHandler::new(self.ctx.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        error!(error = %error, "session error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use crate::identity::{MemoryIdentityStore, NewUser, Role};
    use crate::metered::{AccessMode, MeteredFileHandle};
    use tempfile::TempDir;

    async fn authenticated_user(store: &MemoryIdentityStore, username: &str) -> User {
        store
            .insert_user(NewUser {
                username: username.to_string(),
                password_hash: hash_password("hunter2").unwrap(),
                role: Role::User,
                active: true,
                home_dir: username.to_string(),
            })
            .await
            .unwrap()
    }

    fn handler_with_serving(ctx: ServerContext, user: User, home: std::path::PathBuf, serving: ServingState) -> SshHandler {
        SshHandler {
            ctx,
            peer_addr: None,
            authenticated: Some(AuthenticatedState { user, home }),
            serving: Some(serving),
            finalized: false,
            pending_channel: None,
        }
    }

    /// S6 (abnormal termination): a session that reached `Serving` and
    /// accumulated a 10-byte upload, then is dropped without
    /// `channel_eof`/`channel_close` ever firing (an unclean TCP
    /// disconnect), must still be finalized exactly once with the
    /// correct totals — spec invariant 4.
    #[tokio::test]
    async fn drop_without_clean_close_finalizes_exactly_once_with_correct_totals() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIdentityStore::new());
        let user = authenticated_user(&store, "alice").await;
        let home = tmp.path().join("alice");
        tokio::fs::create_dir_all(&home).await.unwrap();

        let ctx = ServerContext {
            store: store.clone() as Arc<dyn IdentityStore>,
            shared_root: tmp.path().to_path_buf(),
        };

        let connection_id = store
            .insert_connection(NewConnection {
                user_id: user.id,
                username: user.username.clone(),
                client_endpoint: "127.0.0.1:5000".to_string(),
                remote_ip: "127.0.0.1".to_string(),
            })
            .await
            .unwrap();

        let counters: SharedCounters = Arc::new(tokio::sync::Mutex::new(Counters::default()));
        {
            let host_path = home.join("upload.bin");
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&host_path)
                .await
                .unwrap();
            let mut handle = MeteredFileHandle::new(
                file,
                AccessMode::WriteTruncate,
                "/upload.bin".to_string(),
                connection_id,
                user.username.clone(),
                counters.clone(),
            );
            handle.write_at(0, &[0u8; 10]).await.unwrap();
        }

        let handler = handler_with_serving(
            ctx,
            user,
            home,
            ServingState { connection_id, counters },
        );

        // Simulate the unclean disconnect: the handler is torn down
        // without `channel_eof`/`channel_close` ever being called.
        drop(handler);

        // `Drop` only spawns the finalize task; give it a chance to run.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let connection = store.connection(connection_id).unwrap();
        assert!(!connection.active);
        assert!(connection.ended_at.is_some());
        assert_eq!(connection.bytes_uploaded, 10);

        let transfers = store.all_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].size, 10);

        // A second drop (or a racing channel_close) must never
        // double-finalize; `finalized` already guards the real
        // `SshHandler`, this just documents the invariant the fixture
        // above relies on.
    }

    /// A session that authenticates but never requests the `sftp`
    /// subsystem never enters `Serving`, so it never gets a Connection
    /// Record to finalize — spec §4.6's channel-open-timeout clause.
    #[tokio::test]
    async fn finalize_without_serving_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIdentityStore::new());
        let user = authenticated_user(&store, "bob").await;
        let home = tmp.path().join("bob");
        tokio::fs::create_dir_all(&home).await.unwrap();

        let ctx = ServerContext {
            store: store.clone() as Arc<dyn IdentityStore>,
            shared_root: tmp.path().to_path_buf(),
        };

        let mut handler = SshHandler::new(ctx, None);
        handler.authenticated = Some(AuthenticatedState { user, home });

        handler.finalize().await;
        assert!(handler.finalized);
        assert!(store.all_transfers().is_empty());
    }
}

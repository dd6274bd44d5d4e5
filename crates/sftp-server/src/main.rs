//! Composition root: loads configuration, loads/generates the host key,
//! seeds the default admin, and runs the `russh` server accept loop.

mod config;
mod hostkey;

use std::sync::Arc;

use anyhow::{Context, Result};
use russh::server::{Config as RusshConfig, Server as _};
use sftp_core::identity::MemoryIdentityStore;
use sftp_core::seed::seed_default_admin;
use sftp_core::session::{ServerContext, SshServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::ServerConfig::load().context("loading server configuration")?;
    info!(bind_addr = %config.bind_addr, root = %config.shared_root.display(), "starting sftp-server");

    tokio::fs::create_dir_all(&config.shared_root)
        .await
        .with_context(|| format!("creating shared root at {}", config.shared_root.display()))?;

    let key = hostkey::load_or_generate(&config.host_key_path)
        .await
        .context("loading or generating host key")?;

    let store: Arc<dyn sftp_core::identity::IdentityStore> = Arc::new(MemoryIdentityStore::new());
    seed_default_admin(
        store.as_ref(),
        &config.shared_root,
        &config.admin_default_username,
        &config.admin_default_password,
    )
    .await
    .context("seeding default admin user")?;

    let ctx = ServerContext {
        store,
        shared_root: config.shared_root.clone(),
    };

    let russh_config = Arc::new(RusshConfig {
        keys: vec![key],
        channel_open_timeout: Some(std::time::Duration::from_secs(
            config::CHANNEL_OPEN_TIMEOUT_SECS,
        )),
        ..Default::default()
    });

    let server = SshServer::new(ctx);
    server
        .run_on_address(russh_config, config.bind_addr.clone())
        .await
        .with_context(|| format!("running sftp-server on {}", config.bind_addr))?;

    Ok(())
}

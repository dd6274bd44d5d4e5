//! Server configuration — environment-variable overlay on defaults,
//! mirroring the teacher's `trefm-web/src/config.rs` `ServerConfig::load()`
//! pattern (spec §6).

use std::path::PathBuf;

use anyhow::{Context, Result};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2222";
const DEFAULT_HOST_KEY_PATH: &str = "./ssh_host_rsa_key";
const DEFAULT_SHARED_ROOT: &str = "./sftp_root";
const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_PASSWORD: &str = "ChangeMe123!";

/// Time a client has to open the "sftp" subsystem channel after session
/// auth before the server gives up on it (spec §6).
pub const CHANNEL_OPEN_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub host_key_path: PathBuf,
    pub shared_root: PathBuf,
    pub admin_default_username: String,
    pub admin_default_password: String,
}

impl ServerConfig {
    /// Loads configuration from the environment, falling back to the
    /// documented defaults for anything unset.
    pub fn load() -> Result<Self> {
        let bind_addr = env_or("SFTP_BIND_ADDR", DEFAULT_BIND_ADDR);
        let host_key_path = PathBuf::from(env_or("SFTP_HOST_KEY_PATH", DEFAULT_HOST_KEY_PATH));
        let shared_root = PathBuf::from(env_or("SFTP_ROOT", DEFAULT_SHARED_ROOT));
        let admin_default_username = env_or("SFTP_ADMIN_USERNAME", DEFAULT_ADMIN_USERNAME);
        let admin_default_password = env_or("SFTP_ADMIN_PASSWORD", DEFAULT_ADMIN_PASSWORD);

        bind_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("SFTP_BIND_ADDR is not a valid socket address: {bind_addr}"))?;

        Ok(Self {
            bind_addr,
            host_key_path,
            shared_root,
            admin_default_username,
            admin_default_password,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

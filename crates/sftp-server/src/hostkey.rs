//! Host key load-or-generate — RSA 2048 PKCS8 PEM on disk, 0600 on Unix
//! (spec §6). `russh-keys`'s own generators only cover Ed25519/ECDSA, so
//! key material is generated with the `rsa` crate and handed to
//! `russh::keys::decode_secret_key` for everything downstream.

use std::path::Path;

use anyhow::{Context, Result};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tracing::info;

const RSA_BITS: usize = 2048;

/// Loads the host key at `path`, generating and persisting a fresh RSA
/// 2048 key if nothing exists there yet.
pub async fn load_or_generate(path: &Path) -> Result<russh::keys::PrivateKey> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let pem = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading host key at {}", path.display()))?;
        let key = russh::keys::decode_secret_key(&pem, None)
            .with_context(|| format!("decoding host key at {}", path.display()))?;
        info!(path = %path.display(), "loaded existing host key");
        return Ok(key);
    }

    info!(path = %path.display(), bits = RSA_BITS, "generating new RSA host key");
    let pem = generate_rsa_pem()?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, pem.as_bytes())
        .await
        .with_context(|| format!("writing host key to {}", path.display()))?;
    set_owner_only_permissions(path).await?;

    let key = russh::keys::decode_secret_key(&pem, None)
        .context("decoding freshly generated host key")?;
    Ok(key)
}

fn generate_rsa_pem() -> Result<String> {
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, RSA_BITS).context("generating RSA private key")?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("encoding RSA private key as PKCS8 PEM")?;
    Ok(pem.to_string())
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

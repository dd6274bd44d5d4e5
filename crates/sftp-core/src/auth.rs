//! Credential Verifier — checks a username/password pair against the
//! [`IdentityStore`](crate::identity::IdentityStore) (spec §4.2).
//!
//! Mirrors the teacher's `trefm-web/src/auth/password.rs` hashing scheme
//! (argon2, default params) but collapses every failure mode — unknown
//! user, inactive user, malformed hash, wrong password — into a single
//! opaque [`CoreError::AuthFailed`] so a client can never distinguish "no
//! such user" from "wrong password".

use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use chrono::Utc;

use crate::error::{CoreError, CoreResult};
use crate::identity::{IdentityStore, User};

/// Hashes a plaintext password into an argon2 PHC string, for use by the
/// seeding routine and any future user-provisioning path.
pub fn hash_password(plaintext: &str) -> CoreResult<String> {
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CoreError::Config(format!("failed to hash password: {e}")))
}

/// Verifies `username`/`password` against the store. On success, records
/// `last_login` best-effort and returns the full [`User`]. On any failure
/// — unknown user, inactive account, malformed stored hash, or mismatch —
/// returns [`CoreError::AuthFailed`] without revealing which.
pub async fn verify(
    store: &dyn IdentityStore,
    username: &str,
    password: &str,
) -> CoreResult<User> {
    let user = store
        .find_user_by_username(username)
        .await?
        .ok_or(CoreError::AuthFailed)?;

    if !user.active {
        return Err(CoreError::AuthFailed);
    }

    let parsed_hash =
        PasswordHash::new(&user.password_hash).map_err(|_| CoreError::AuthFailed)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| CoreError::AuthFailed)?;

    // Best-effort: a store failure here must not fail the login itself.
    let _ = store.update_last_login(user.id, Utc::now()).await;

    Ok(user)
}

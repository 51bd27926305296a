//! User authorization
//!
//! PBKDF2-hashed password records, IP-bound tokens and temporary blocking
//! after repeated failed logins.

use std::sync::Arc;

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::AuthorizationDefaults;
use crate::database::{self, Database, UserRecord};
use crate::secrets::generate_secret;

const PBKDF2_ITERATIONS: u32 = 100_000;
const DERIVED_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// A successfully authenticated user.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub username: String,
    pub is_admin: bool,
}

pub struct Authorize {
    db: Arc<Database>,
    defaults: AuthorizationDefaults,
}

impl Authorize {
    pub fn new(db: Arc<Database>, defaults: AuthorizationDefaults) -> Self {
        Self { db, defaults }
    }

    /// Create or replace a user record.
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> database::DatabaseResult<()> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let derived = derive_key(password, &salt);

        let user = UserRecord {
            username: username.to_string(),
            password: hex::encode(derived),
            salt: hex::encode(salt),
            hash_function: "SHA256".to_string(),
            is_admin,
        };

        let conn = self.db.lock().await;
        database::upsert_user(&conn, &user)
    }

    /// Verify HTTP Basic credentials.
    ///
    /// The password field may carry a token instead of the password when
    /// `require_credentials` is false. Failed verifications add a block
    /// entry; a user with more than `num_login_attempts` live entries is
    /// rejected outright.
    pub async fn verify_user(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        require_admin: bool,
        require_credentials: bool,
    ) -> Option<AuthenticatedUser> {
        let conn = self.db.lock().await;

        let user = database::get_user(&conn, username).ok().flatten()?;

        let mut verified = false;

        if !require_credentials {
            verified = self.verify_token(&conn, username, password, ip);
        }

        if !verified && self.is_blocked_temporarily(&conn, username) {
            return None;
        }

        if !verified {
            verified = verify_password(&user, password);
        }

        if !verified {
            self.add_block_entry(&conn, username);
            return None;
        }

        if require_admin && !user.is_admin {
            return None;
        }

        Some(AuthenticatedUser {
            username: user.username,
            is_admin: user.is_admin,
        })
    }

    /// Issue a token bound to the requesting client's IP.
    pub async fn issue_token(&self, username: &str, ip: &str) -> database::DatabaseResult<String> {
        let token = generate_secret();
        let conn = self.db.lock().await;
        database::insert_token(&conn, username, ip, &token, now())?;
        Ok(token)
    }

    pub fn tokens_valid_for_seconds(&self) -> i64 {
        self.defaults.tokens_valid_for_seconds
    }

    fn verify_token(
        &self,
        conn: &rusqlite::Connection,
        username: &str,
        token: &str,
        ip: &str,
    ) -> bool {
        let cutoff = now() - self.defaults.tokens_valid_for_seconds as f64;
        let _ = database::purge_tokens_older_than(conn, cutoff);
        database::token_exists(conn, username, ip, token).unwrap_or(false)
    }

    fn is_blocked_temporarily(&self, conn: &rusqlite::Connection, username: &str) -> bool {
        let cutoff = now() - self.defaults.block_for_seconds as f64;
        let _ = database::purge_block_entries_older_than(conn, cutoff);
        let entries = database::count_block_entries(conn, username).unwrap_or(0);
        entries > self.defaults.num_login_attempts
    }

    fn add_block_entry(&self, conn: &rusqlite::Connection, username: &str) {
        if let Err(e) = database::insert_block_entry(conn, username, now()) {
            warn!("Could not record failed login for {}: {}", username, e);
        }
        warn!("Unverified login attempt for user {}", username);
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; DERIVED_KEY_LEN] {
    let mut derived = [0u8; DERIVED_KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut derived);
    derived
}

fn verify_password(user: &UserRecord, password: &str) -> bool {
    let Ok(salt) = hex::decode(&user.salt) else {
        return false;
    };
    let Ok(stored) = hex::decode(&user.password) else {
        return false;
    };
    let derived = derive_key(password, &salt);
    derived.as_slice().ct_eq(&stored).into()
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

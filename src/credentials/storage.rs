//! Encrypted credential storage using SQLite.
//!
//! All rows are reached through [`SubjectCredentials`], a handle bound to one
//! subject. Every statement binds that subject, so one subject's handle has
//! no way to name another subject's rows.

use super::{Credential, Envelope, Provider, SubjectId};
use crate::error::{OAuthError, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A decrypted credential plus its bookkeeping timestamps.
#[derive(Clone, Debug)]
pub struct StoredCredential {
    pub credential: Credential,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     subject_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token_ciphertext TEXT NOT NULL,
///     refresh_token_ciphertext TEXT,     -- optional
///     token_type TEXT NOT NULL,
///     scope TEXT NOT NULL,
///     expires_at TEXT NOT NULL,          -- RFC 3339
///     created_at TEXT NOT NULL,          -- RFC 3339
///     updated_at TEXT NOT NULL,          -- RFC 3339
///     UNIQUE(subject_id, provider)
/// );
/// ```
///
/// # Thread Safety
/// The connection sits behind a `Mutex`, so writes to the same
/// (subject, provider) are serialized and the last one wins.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    envelope: Envelope,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`":memory:"` for tests)
    /// * `envelope` - Encryption envelope built from the configured keys
    pub fn new<P: AsRef<Path>>(db_path: P, envelope: Envelope) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credential database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                subject_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token_ciphertext TEXT NOT NULL,
                refresh_token_ciphertext TEXT,
                token_type TEXT NOT NULL,
                scope TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(subject_id, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_subject_provider
                ON credentials(subject_id, provider);
            "#,
        )
        .context("Failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            envelope,
        })
    }

    /// Returns a handle scoped to one subject's credentials.
    pub fn for_subject<'a>(&'a self, subject: &'a SubjectId) -> SubjectCredentials<'a> {
        SubjectCredentials {
            store: self,
            subject,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OAuthError::Storage("credential store lock poisoned".to_string()))
    }

    fn seal_optional(&self, token: Option<&str>) -> Result<Option<String>> {
        token.map(|t| self.envelope.seal(t)).transpose()
    }
}

/// One subject's view of the credential store.
pub struct SubjectCredentials<'a> {
    store: &'a CredentialStore,
    subject: &'a SubjectId,
}

impl SubjectCredentials<'_> {
    pub fn subject(&self) -> &SubjectId {
        self.subject
    }

    /// Stores a credential, replacing any existing one for this provider.
    ///
    /// `created_at` of an existing row is preserved.
    pub fn put(&self, provider: &Provider, credential: &Credential) -> Result<()> {
        let access = self.store.envelope.seal(&credential.access_token)?;
        let refresh = self
            .store
            .seal_optional(credential.refresh_token.as_deref())?;
        let expires_at = credential.expires_at.to_rfc3339();
        let now = Utc::now().to_rfc3339();

        self.store.lock()?.execute(
            r#"
            INSERT INTO credentials (
                subject_id, provider,
                access_token_ciphertext, refresh_token_ciphertext,
                token_type, scope, expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(subject_id, provider) DO UPDATE SET
                access_token_ciphertext = excluded.access_token_ciphertext,
                refresh_token_ciphertext = excluded.refresh_token_ciphertext,
                token_type = excluded.token_type,
                scope = excluded.scope,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                self.subject.as_str(),
                provider.as_str(),
                access,
                refresh,
                credential.token_type,
                credential.scope,
                expires_at,
                now,
                now,
            ],
        )?;

        Ok(())
    }

    /// Retrieves and decrypts the credential for this provider.
    ///
    /// # Returns
    /// * `Ok(Some(..))` - Credential found and decrypted
    /// * `Ok(None)` - No credential stored
    /// * `Err(OAuthError::Integrity)` - Ciphertext failed authentication
    pub fn get(&self, provider: &Provider) -> Result<Option<StoredCredential>> {
        let row = self
            .store
            .lock()?
            .query_row(
                r#"
                SELECT access_token_ciphertext, refresh_token_ciphertext,
                       token_type, scope, expires_at, created_at, updated_at
                FROM credentials
                WHERE subject_id = ?1 AND provider = ?2
                "#,
                params![self.subject.as_str(), provider.as_str()],
                |row| {
                    Ok(RawRow {
                        access: row.get(0)?,
                        refresh: row.get(1)?,
                        token_type: row.get(2)?,
                        scope: row.get(3)?,
                        expires_at: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;

        let Some(raw) = row else {
            return Ok(None);
        };

        let envelope = &self.store.envelope;
        let access_token = envelope.open(&raw.access).inspect_err(|_| {
            tracing::error!(
                subject = %self.subject,
                provider = %provider,
                "Stored access token failed integrity check"
            );
        })?;
        let refresh_token = raw
            .refresh
            .as_deref()
            .map(|sealed| envelope.open(sealed))
            .transpose()
            .inspect_err(|_| {
                tracing::error!(
                    subject = %self.subject,
                    provider = %provider,
                    "Stored refresh token failed integrity check"
                );
            })?;

        Ok(Some(StoredCredential {
            credential: Credential {
                access_token,
                refresh_token,
                token_type: raw.token_type,
                scope: raw.scope,
                expires_at: parse_timestamp(&raw.expires_at)?,
            },
            created_at: parse_timestamp(&raw.created_at)?,
            updated_at: parse_timestamp(&raw.updated_at)?,
        }))
    }

    /// Replaces the access token and expiry of an existing credential.
    ///
    /// The stored refresh token and scope are kept unless new ones are given.
    /// Returns `false` when no row exists, so a refresh racing a disconnect
    /// never re-creates the credential.
    pub fn update_access_token(
        &self,
        provider: &Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        scope: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let access = self.store.envelope.seal(access_token)?;
        let refresh = self.store.seal_optional(refresh_token)?;

        let rows = self.store.lock()?.execute(
            r#"
            UPDATE credentials SET
                access_token_ciphertext = ?3,
                refresh_token_ciphertext = COALESCE(?4, refresh_token_ciphertext),
                scope = COALESCE(?5, scope),
                expires_at = ?6,
                updated_at = ?7
            WHERE subject_id = ?1 AND provider = ?2
            "#,
            params![
                self.subject.as_str(),
                provider.as_str(),
                access,
                refresh,
                scope,
                expires_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(rows > 0)
    }

    /// Deletes the credential only if it still holds the tokens of `expected`.
    ///
    /// Returns `false` when the row is gone or was rewritten after `expected`
    /// was read, so a stale refresh never removes a newer grant.
    pub fn delete_if_unchanged(&self, provider: &Provider, expected: &Credential) -> Result<bool> {
        let conn = self.store.lock()?;
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                r#"
                SELECT access_token_ciphertext, refresh_token_ciphertext
                FROM credentials
                WHERE subject_id = ?1 AND provider = ?2
                "#,
                params![self.subject.as_str(), provider.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((access, refresh)) = row else {
            return Ok(false);
        };

        let envelope = &self.store.envelope;
        let refresh_token = refresh
            .as_deref()
            .map(|sealed| envelope.open(sealed))
            .transpose()?;
        if envelope.open(&access)? != expected.access_token
            || refresh_token != expected.refresh_token
        {
            return Ok(false);
        }

        let rows = conn.execute(
            "DELETE FROM credentials WHERE subject_id = ?1 AND provider = ?2",
            params![self.subject.as_str(), provider.as_str()],
        )?;

        Ok(rows > 0)
    }

    /// Deletes the credential for this provider.
    ///
    /// # Returns
    /// * `Ok(true)` - Credential deleted
    /// * `Ok(false)` - Nothing was stored
    pub fn delete(&self, provider: &Provider) -> Result<bool> {
        let rows = self.store.lock()?.execute(
            "DELETE FROM credentials WHERE subject_id = ?1 AND provider = ?2",
            params![self.subject.as_str(), provider.as_str()],
        )?;

        Ok(rows > 0)
    }

    /// Whether a credential exists, without decrypting anything.
    pub fn contains(&self, provider: &Provider) -> Result<bool> {
        let exists: bool = self.store.lock()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM credentials WHERE subject_id = ?1 AND provider = ?2)",
            params![self.subject.as_str(), provider.as_str()],
            |row| row.get(0),
        )?;

        Ok(exists)
    }

    /// Lists the providers this subject has credentials for.
    pub fn list_providers(&self) -> Result<Vec<Provider>> {
        let conn = self.store.lock()?;
        let mut stmt = conn
            .prepare("SELECT provider FROM credentials WHERE subject_id = ?1 ORDER BY provider")?;

        let names = stmt
            .query_map(params![self.subject.as_str()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        names
            .into_iter()
            .map(|name| {
                Provider::new(name)
                    .map_err(|e| OAuthError::Storage(format!("Invalid provider in store: {}", e)))
            })
            .collect()
    }
}

struct RawRow {
    access: String,
    refresh: Option<String>,
    token_type: String,
    scope: String,
    expires_at: String,
    created_at: String,
    updated_at: String,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OAuthError::Storage(format!("Failed to parse timestamp: {}", e)))
}

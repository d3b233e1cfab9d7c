//! SQLite-backed credential storage with secrets sealed at rest.
//!
//! # Schema
//! ```sql
//! CREATE TABLE credentials (
//!     id TEXT PRIMARY KEY,              -- UUID
//!     user_id TEXT NOT NULL,
//!     provider TEXT NOT NULL,           -- "google", "spotify", "twitch", ...
//!     credential_type TEXT NOT NULL,    -- "oauth2" | "api_key"
//!     display_name TEXT,
//!     client_id TEXT,
//!     client_secret TEXT,               -- sealed
//!     access_token TEXT,                -- sealed
//!     refresh_token TEXT,               -- sealed
//!     expires_at TEXT,                  -- ISO 8601
//!     scope TEXT,
//!     is_valid INTEGER NOT NULL,
//!     cursor TEXT,                      -- opaque provider sync token
//!     created_at TEXT NOT NULL,         -- ISO 8601
//!     updated_at TEXT NOT NULL          -- ISO 8601
//! );
//! ```
//!
//! # Thread safety
//! The connection is wrapped in a `Mutex`; SQLite's own serialized mode
//! handles the rest. Critical sections are short, so the polling engine's
//! fan-out never holds the lock across an await point.

use super::{encryption, Credential, CredentialType, TokenUpdate};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

const CREDENTIAL_COLUMNS: &str = "id, user_id, provider, credential_type, display_name, \
     client_id, client_secret, access_token, refresh_token, \
     expires_at, scope, is_valid, cursor, created_at, updated_at";

/// Credential storage backed by SQLite.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    key: Vec<u8>,
}

/// Raw row before secret columns are opened. Keeps the `query_map` closure
/// free of fallible decryption.
struct RawRow {
    id: String,
    user_id: String,
    provider: String,
    credential_type: String,
    display_name: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<String>,
    scope: Option<String>,
    is_valid: bool,
    cursor: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        credential_type: row.get(3)?,
        display_name: row.get(4)?,
        client_id: row.get(5)?,
        client_secret: row.get(6)?,
        access_token: row.get(7)?,
        refresh_token: row.get(8)?,
        expires_at: row.get(9)?,
        scope: row.get(10)?,
        is_valid: row.get(11)?,
        cursor: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .context("Failed to parse stored timestamp")
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file (`:memory:` in tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key = encryption::validate_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                credential_type TEXT NOT NULL,
                display_name TEXT,
                client_id TEXT,
                client_secret TEXT,
                access_token TEXT,
                refresh_token TEXT,
                expires_at TEXT,
                scope TEXT,
                is_valid INTEGER NOT NULL DEFAULT 0,
                cursor TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_credentials_user ON credentials(user_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    fn seal_opt(&self, value: Option<&str>) -> Result<Option<String>> {
        value.map(|v| encryption::seal(v, &self.key)).transpose()
    }

    fn open_opt(&self, value: Option<&str>) -> Result<Option<String>> {
        value.map(|v| encryption::open(v, &self.key)).transpose()
    }

    fn decode(&self, raw: RawRow) -> Result<Credential> {
        let credential_type = CredentialType::parse(&raw.credential_type).ok_or_else(|| {
            anyhow!("Unknown credential type in store: {}", raw.credential_type)
        })?;

        Ok(Credential {
            id: Uuid::parse_str(&raw.id).context("Invalid credential id in store")?,
            user_id: raw.user_id,
            provider: raw.provider,
            credential_type,
            display_name: raw.display_name,
            client_id: raw.client_id,
            client_secret: self.open_opt(raw.client_secret.as_deref())?,
            access_token: self.open_opt(raw.access_token.as_deref())?,
            refresh_token: self.open_opt(raw.refresh_token.as_deref())?,
            expires_at: raw
                .expires_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            scope: raw.scope,
            is_valid: raw.is_valid,
            cursor: raw.cursor,
            created_at: parse_timestamp(&raw.created_at)?,
            updated_at: parse_timestamp(&raw.updated_at)?,
        })
    }

    /// Inserts a new credential row.
    pub fn insert(&self, credential: &Credential) -> Result<()> {
        let client_secret = self.seal_opt(credential.client_secret.as_deref())?;
        let access_token = self.seal_opt(credential.access_token.as_deref())?;
        let refresh_token = self.seal_opt(credential.refresh_token.as_deref())?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    id, user_id, provider, credential_type, display_name,
                    client_id, client_secret, access_token, refresh_token,
                    expires_at, scope, is_valid, cursor, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    credential.id.to_string(),
                    credential.user_id,
                    credential.provider,
                    credential.credential_type.as_str(),
                    credential.display_name,
                    credential.client_id,
                    client_secret,
                    access_token,
                    refresh_token,
                    credential.expires_at.map(|dt| dt.to_rfc3339()),
                    credential.scope,
                    credential.is_valid,
                    credential.cursor,
                    credential.created_at.to_rfc3339(),
                    credential.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert credential")?;

        Ok(())
    }

    /// Retrieves a credential by id.
    pub fn get(&self, id: Uuid) -> Result<Option<Credential>> {
        let raw = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM credentials WHERE id = ?1",
                    CREDENTIAL_COLUMNS
                ))
                .context("Failed to prepare query")?;

            let mut rows = stmt
                .query_map(params![id.to_string()], read_row)
                .context("Failed to execute query")?;

            rows.next().transpose().context("Failed to read row")?
        };

        raw.map(|r| self.decode(r)).transpose()
    }

    /// Retrieves a credential by id, scoped to its owning user.
    ///
    /// Returns `None` when the row exists but belongs to a different user:
    /// ownership is enforced at the query level, not by the caller.
    pub fn get_for_user(&self, id: Uuid, user_id: &str) -> Result<Option<Credential>> {
        let raw = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM credentials WHERE id = ?1 AND user_id = ?2",
                    CREDENTIAL_COLUMNS
                ))
                .context("Failed to prepare query")?;

            let mut rows = stmt
                .query_map(params![id.to_string(), user_id], read_row)
                .context("Failed to execute query")?;

            rows.next().transpose().context("Failed to read row")?
        };

        raw.map(|r| self.decode(r)).transpose()
    }

    /// Batch-loads credentials by id. Ids with no row are silently absent
    /// from the result; the polling engine treats those as stale
    /// registrations.
    pub fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Credential>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT {} FROM credentials WHERE id IN ({})",
            CREDENTIAL_COLUMNS, placeholders
        );
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();

        let raws: Vec<RawRow> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(id_strings.iter()), read_row)
                .context("Failed to execute query")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read rows")?;
            rows
        };

        raws.into_iter().map(|r| self.decode(r)).collect()
    }

    /// Lists all credentials owned by a user (controller-facing surface).
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<Credential>> {
        let raws: Vec<RawRow> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM credentials WHERE user_id = ?1 ORDER BY created_at",
                    CREDENTIAL_COLUMNS
                ))
                .context("Failed to prepare query")?;
            let rows = stmt
                .query_map(params![user_id], read_row)
                .context("Failed to execute query")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read rows")?;
            rows
        };

        raws.into_iter().map(|r| self.decode(r)).collect()
    }

    /// Persists token material after a successful exchange or refresh and
    /// marks the credential valid.
    ///
    /// `expires_at` always describes the access token just written: a
    /// response without a lifetime leaves the new token non-expiring, it is
    /// never pinned to the replaced token's expiry. Refresh token and scope
    /// keep their previous values when the response omits them.
    pub fn store_tokens(&self, id: Uuid, update: &TokenUpdate) -> Result<()> {
        let access_token = encryption::seal(&update.access_token, &self.key)?;
        let refresh_token = self.seal_opt(update.refresh_token.as_deref())?;

        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE credentials SET
                    access_token = ?2,
                    refresh_token = COALESCE(?3, refresh_token),
                    expires_at = ?4,
                    scope = COALESCE(?5, scope),
                    is_valid = 1,
                    updated_at = ?6
                WHERE id = ?1
                "#,
                params![
                    id.to_string(),
                    access_token,
                    refresh_token,
                    update.expires_at.map(|dt| dt.to_rfc3339()),
                    update.scope,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to store tokens")?;

        if changed == 0 {
            return Err(anyhow!("Credential {} not found", id));
        }
        Ok(())
    }

    /// Sets the display name derived from the provider profile.
    pub fn set_display_name(&self, id: Uuid, display_name: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE credentials SET display_name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), display_name, Utc::now().to_rfc3339()],
            )
            .context("Failed to set display name")?;
        Ok(())
    }

    /// Marks a credential invalid after a rejected refresh. Token columns are
    /// left in place; they are stale, not secret-free.
    pub fn mark_invalid(&self, id: Uuid) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE credentials SET is_valid = 0, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .context("Failed to mark credential invalid")?;
        Ok(())
    }

    /// Stores the provider sync cursor. `None` resets it, forcing a
    /// bootstrap cycle on the next poll.
    pub fn set_cursor(&self, id: Uuid, cursor: Option<&str>) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE credentials SET cursor = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), cursor, Utc::now().to_rfc3339()],
            )
            .context("Failed to store cursor")?;
        Ok(())
    }

    /// Deletes a credential, scoped to its owning user.
    pub fn delete(&self, id: Uuid, user_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id],
            )
            .context("Failed to delete credential")?;

        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        let key = BASE64.encode([0u8; 32]);
        CredentialStore::new(":memory:", &key).expect("Failed to create test store")
    }

    fn sample_credential(user_id: &str) -> Credential {
        Credential::new_oauth2(
            user_id,
            "google",
            Some("client-id-1".to_string()),
            Some("client-secret-1".to_string()),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let store = create_test_store();
        let cred = sample_credential("user1");

        store.insert(&cred).expect("Failed to insert");

        let loaded = store.get(cred.id).unwrap().expect("Credential not found");
        assert_eq!(loaded.user_id, "user1");
        assert_eq!(loaded.provider, "google");
        assert_eq!(loaded.credential_type, CredentialType::OAuth2);
        assert_eq!(loaded.client_secret, Some("client-secret-1".to_string()));
        assert!(!loaded.is_valid);
        assert!(loaded.access_token.is_none());
        assert!(loaded.cursor.is_none());
    }

    #[test]
    fn test_get_for_user_enforces_ownership() {
        let store = create_test_store();
        let cred = sample_credential("alice");
        store.insert(&cred).unwrap();

        assert!(store.get_for_user(cred.id, "alice").unwrap().is_some());
        assert!(store.get_for_user(cred.id, "bob").unwrap().is_none());
    }

    #[test]
    fn test_store_tokens_marks_valid() {
        let store = create_test_store();
        let cred = sample_credential("user1");
        store.insert(&cred).unwrap();

        let update = TokenUpdate {
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            scope: Some("calendar".to_string()),
        };
        store.store_tokens(cred.id, &update).unwrap();

        let loaded = store.get(cred.id).unwrap().unwrap();
        assert!(loaded.is_valid);
        assert_eq!(loaded.access_token, Some("access-1".to_string()));
        assert_eq!(loaded.refresh_token, Some("refresh-1".to_string()));
        assert_eq!(loaded.scope, Some("calendar".to_string()));
        assert!(loaded.expires_at.is_some());
    }

    #[test]
    fn test_store_tokens_keeps_refresh_token_when_not_rotated() {
        let store = create_test_store();
        let cred = sample_credential("user1");
        store.insert(&cred).unwrap();

        store
            .store_tokens(
                cred.id,
                &TokenUpdate {
                    access_token: "access-1".to_string(),
                    refresh_token: Some("refresh-1".to_string()),
                    expires_at: None,
                    scope: None,
                },
            )
            .unwrap();

        // Provider did not rotate the refresh token on this refresh
        store
            .store_tokens(
                cred.id,
                &TokenUpdate {
                    access_token: "access-2".to_string(),
                    refresh_token: None,
                    expires_at: None,
                    scope: None,
                },
            )
            .unwrap();

        let loaded = store.get(cred.id).unwrap().unwrap();
        assert_eq!(loaded.access_token, Some("access-2".to_string()));
        assert_eq!(loaded.refresh_token, Some("refresh-1".to_string()));
    }

    #[test]
    fn test_store_tokens_expiry_tracks_the_new_token() {
        let store = create_test_store();
        let cred = sample_credential("user1");
        store.insert(&cred).unwrap();

        store
            .store_tokens(
                cred.id,
                &TokenUpdate {
                    access_token: "access-1".to_string(),
                    refresh_token: Some("refresh-1".to_string()),
                    expires_at: Some(Utc::now() + Duration::hours(1)),
                    scope: None,
                },
            )
            .unwrap();

        // A refresh response without a lifetime: the stale expiry must not
        // survive and mis-describe the new token
        store
            .store_tokens(
                cred.id,
                &TokenUpdate {
                    access_token: "access-2".to_string(),
                    refresh_token: None,
                    expires_at: None,
                    scope: None,
                },
            )
            .unwrap();

        let loaded = store.get(cred.id).unwrap().unwrap();
        assert_eq!(loaded.access_token, Some("access-2".to_string()));
        assert!(loaded.expires_at.is_none());
    }

    #[test]
    fn test_store_tokens_unknown_credential() {
        let store = create_test_store();
        let result = store.store_tokens(
            Uuid::new_v4(),
            &TokenUpdate {
                access_token: "x".to_string(),
                refresh_token: None,
                expires_at: None,
                scope: None,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_mark_invalid() {
        let store = create_test_store();
        let cred = sample_credential("user1");
        store.insert(&cred).unwrap();
        store
            .store_tokens(
                cred.id,
                &TokenUpdate {
                    access_token: "access-1".to_string(),
                    refresh_token: Some("refresh-1".to_string()),
                    expires_at: None,
                    scope: None,
                },
            )
            .unwrap();

        store.mark_invalid(cred.id).unwrap();

        let loaded = store.get(cred.id).unwrap().unwrap();
        assert!(!loaded.is_valid);
        // Stale tokens remain in place
        assert_eq!(loaded.access_token, Some("access-1".to_string()));
    }

    #[test]
    fn test_cursor_roundtrip_and_reset() {
        let store = create_test_store();
        let cred = sample_credential("user1");
        store.insert(&cred).unwrap();

        store.set_cursor(cred.id, Some("sync-token-1")).unwrap();
        assert_eq!(
            store.get(cred.id).unwrap().unwrap().cursor,
            Some("sync-token-1".to_string())
        );

        store.set_cursor(cred.id, None).unwrap();
        assert!(store.get(cred.id).unwrap().unwrap().cursor.is_none());
    }

    #[test]
    fn test_get_many() {
        let store = create_test_store();
        let a = sample_credential("user1");
        let b = sample_credential("user2");
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        let loaded = store.get_many(&[a.id, b.id, Uuid::new_v4()]).unwrap();
        assert_eq!(loaded.len(), 2);

        let ids: Vec<Uuid> = loaded.iter().map(|c| c.id).collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));

        assert!(store.get_many(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_scoped_to_user() {
        let store = create_test_store();
        let cred = sample_credential("alice");
        store.insert(&cred).unwrap();

        assert!(!store.delete(cred.id, "bob").unwrap());
        assert!(store.get(cred.id).unwrap().is_some());

        assert!(store.delete(cred.id, "alice").unwrap());
        assert!(store.get(cred.id).unwrap().is_none());
    }

    #[test]
    fn test_persisted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("credentials.db");
        let key = BASE64.encode([7u8; 32]);

        let cred = sample_credential("user1");
        {
            let store = CredentialStore::new(&db_path, &key).unwrap();
            store.insert(&cred).unwrap();
        }

        let store = CredentialStore::new(&db_path, &key).unwrap();
        let loaded = store.get(cred.id).unwrap().unwrap();
        assert_eq!(loaded.client_secret, Some("client-secret-1".to_string()));
    }

    #[test]
    fn test_invalid_encryption_key() {
        assert!(CredentialStore::new(":memory:", "short").is_err());
        assert!(CredentialStore::new(":memory:", "not-valid-base64!@#$").is_err());
    }
}

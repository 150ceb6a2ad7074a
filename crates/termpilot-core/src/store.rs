use crate::connection::SessionData;
use crate::error::CoreError;
use crate::transport::AuthMethod;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection as DbConnection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Auth kind as persisted. Passwords themselves are never stored.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredAuth {
    Password,
    Key { private_key_path: PathBuf },
    Agent,
}

impl StoredAuth {
    pub fn as_key(&self) -> &'static str {
        match self {
            StoredAuth::Password => "password",
            StoredAuth::Key { .. } => "key",
            StoredAuth::Agent => "agent",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SavedSession {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: StoredAuth,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl SavedSession {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, username: impl Into<String>, auth: StoredAuth) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
            auth,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
        }
    }

    /// Builds a connect request. Password sessions need the secret supplied
    /// by the caller.
    pub fn to_session_data(&self, password: Option<Zeroizing<String>>) -> Result<SessionData, CoreError> {
        let auth = match &self.auth {
            StoredAuth::Password => AuthMethod::Password {
                password: password.ok_or_else(|| {
                    CoreError::Invalid(format!("session {} needs a password", self.name))
                })?,
            },
            StoredAuth::Key { private_key_path } => AuthMethod::Key {
                private_key_path: private_key_path.clone(),
                passphrase: None,
            },
            StoredAuth::Agent => AuthMethod::Agent,
        };
        Ok(SessionData {
            id: self.id.to_string(),
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth,
        })
    }
}

#[derive(Clone)]
pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    pub fn init(&self) -> Result<(), CoreError> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = self.open()?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 22,
                username TEXT NOT NULL,
                auth_method TEXT NOT NULL,
                auth_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_connected_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_name ON sessions(name);
            "#,
        )
        .map_err(|e| CoreError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn save_session(&self, session: &SavedSession) -> Result<(), CoreError> {
        let db = self.open()?;
        db.execute(
            r#"
            INSERT INTO sessions (
                id, name, host, port, username, auth_method, auth_data,
                created_at, updated_at, last_connected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                auth_method = excluded.auth_method,
                auth_data = excluded.auth_data,
                updated_at = excluded.updated_at,
                last_connected_at = excluded.last_connected_at
            "#,
            params![
                session.id.to_string(),
                session.name,
                session.host,
                session.port as i64,
                session.username,
                session.auth.as_key(),
                serde_json::to_string(&session.auth).map_err(|e| CoreError::Invalid(e.to_string()))?,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.last_connected_at.map(|v| v.to_rfc3339()),
            ],
        )
        .map_err(|e| CoreError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn get_sessions(&self) -> Result<Vec<SavedSession>, CoreError> {
        let db = self.open()?;
        let mut stmt = db
            .prepare("SELECT * FROM sessions ORDER BY name ASC")
            .map_err(|e| CoreError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], Self::row_to_session)
            .map_err(|e| CoreError::Database(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| CoreError::Database(e.to_string()))?);
        }
        Ok(out)
    }

    pub fn get_session(&self, id: Uuid) -> Result<SavedSession, CoreError> {
        let db = self.open()?;
        db.query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_session,
        )
        .optional()
        .map_err(|e| CoreError::Database(e.to_string()))?
        .ok_or(CoreError::NotFound)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<SavedSession>, CoreError> {
        let db = self.open()?;
        db.query_row(
            "SELECT * FROM sessions WHERE name = ?1 ORDER BY updated_at DESC LIMIT 1",
            params![name],
            Self::row_to_session,
        )
        .optional()
        .map_err(|e| CoreError::Database(e.to_string()))
    }

    pub fn delete_session(&self, id: Uuid) -> Result<(), CoreError> {
        let db = self.open()?;
        let removed = db
            .execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])
            .map_err(|e| CoreError::Database(e.to_string()))?;
        if removed == 0 {
            return Err(CoreError::NotFound);
        }
        Ok(())
    }

    pub fn touch_last_connected(&self, id: Uuid) -> Result<(), CoreError> {
        let db = self.open()?;
        let now = Utc::now().to_rfc3339();
        db.execute(
            "UPDATE sessions SET last_connected_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), now],
        )
        .map_err(|e| CoreError::Database(e.to_string()))?;
        Ok(())
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SavedSession, rusqlite::Error> {
        let id: String = row.get("id")?;
        let auth_data: String = row.get("auth_data")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let last_connected_at: Option<String> = row.get("last_connected_at")?;

        let auth: StoredAuth = serde_json::from_str(&auth_data).map_err(conversion_error)?;
        Ok(SavedSession {
            id: Uuid::parse_str(&id).map_err(conversion_error)?,
            name: row.get("name")?,
            host: row.get("host")?,
            port: row.get::<_, i64>("port")? as u16,
            username: row.get("username")?,
            auth,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
            last_connected_at: last_connected_at.as_deref().map(parse_time).transpose()?,
        })
    }

    fn open(&self) -> Result<DbConnection, CoreError> {
        DbConnection::open(&self.db_path).map_err(|e| CoreError::Database(e.to_string()))
    }
}

fn conversion_error<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|v| v.with_timezone(&Utc))
        .map_err(conversion_error)
}

//! Durable per-sender ring assignments
//!
//! The authoritative copy lives in a local SQLite table; an in-memory mirror
//! serves hot reads on the fan-out path. Writes persist first and update the
//! mirror only on success, so a failed write leaves the mirror untouched.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::info;

/// A logical deployment environment used to partition traffic by sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ring {
    Prod,
    Ppe,
}

impl Ring {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ring::Prod => "prod",
            Ring::Ppe => "ppe",
        }
    }
}

impl std::fmt::Display for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("ring must be 'prod' or 'ppe'")]
pub struct InvalidRing;

impl FromStr for Ring {
    type Err = InvalidRing;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prod" => Ok(Ring::Prod),
            "ppe" => Ok(Ring::Ppe),
            _ => Err(InvalidRing),
        }
    }
}

#[derive(Debug, Error)]
pub enum AllowlistError {
    /// Reassignment is rejected even when the target ring matches
    #[error("number {number} is already assigned to ring {ring}")]
    AlreadyAssigned { number: String, ring: Ring },

    #[error("invalid ring '{0}' in database")]
    CorruptRing(String),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

/// Durable phone-number to ring mapping with an in-memory mirror
pub struct AllowlistStore {
    conn: Mutex<Connection>,
    mirror: RwLock<HashMap<String, Ring>>,
}

impl AllowlistStore {
    /// Open or create the allowlist database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AllowlistError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self::from_connection(conn)?;
        info!(
            path = %path.display(),
            numbers = store.mirror.read().unwrap().len(),
            "Allowlist opened"
        );
        Ok(store)
    }

    /// Open an in-memory allowlist (for testing)
    pub fn open_in_memory() -> Result<Self, AllowlistError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AllowlistError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS allowed_numbers (
                phone_number TEXT PRIMARY KEY,
                ring TEXT NOT NULL
            )",
            [],
        )?;

        let mut mirror = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT phone_number, ring FROM allowed_numbers")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (number, ring) = row?;
                let ring = Ring::from_str(&ring).map_err(|_| AllowlistError::CorruptRing(ring))?;
                mirror.insert(number, ring);
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            mirror: RwLock::new(mirror),
        })
    }

    /// Assign a number to a ring. Fails if the number is present at all;
    /// reassignment must go through an explicit remove.
    pub fn add(&self, number: &str, ring: Ring) -> Result<(), AllowlistError> {
        let conn = self.conn.lock().unwrap();

        if let Some(existing) = self.mirror.read().unwrap().get(number) {
            return Err(AllowlistError::AlreadyAssigned {
                number: number.to_string(),
                ring: *existing,
            });
        }

        conn.execute(
            "INSERT INTO allowed_numbers (phone_number, ring) VALUES (?1, ?2)",
            params![number, ring.as_str()],
        )?;

        self.mirror
            .write()
            .unwrap()
            .insert(number.to_string(), ring);
        info!(number, ring = %ring, "Allowlist entry added");
        Ok(())
    }

    /// Remove a number; succeeds whether or not it was present
    pub fn remove(&self, number: &str) -> Result<(), AllowlistError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "DELETE FROM allowed_numbers WHERE phone_number = ?1",
            params![number],
        )?;

        self.mirror.write().unwrap().remove(number);
        info!(number, "Allowlist entry removed");
        Ok(())
    }

    /// The ring a number routes to, or None when the sender is not allowlisted
    pub fn ring_of(&self, number: &str) -> Option<Ring> {
        self.mirror.read().unwrap().get(number).copied()
    }

    /// Snapshot copy of the full mapping
    pub fn all(&self) -> HashMap<String, Ring> {
        self.mirror.read().unwrap().clone()
    }

    /// Numbers assigned to the given ring
    pub fn numbers_in(&self, ring: Ring) -> Vec<String> {
        self.mirror
            .read()
            .unwrap()
            .iter()
            .filter(|(_, r)| **r == ring)
            .map(|(number, _)| number.clone())
            .collect()
    }
}

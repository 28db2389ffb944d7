//! SQLite persistence for wgmint state
//!
//! Three entity tables (devices, accounts, peers) plus a small kv_store for
//! singleton state such as the master account id. Identifiers are SQLite
//! rowids and double as allocation ordinals, so rows are never reused.

use crate::types::{Account, Device, Peer};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- WireGuard devices; ids are allocation ordinals, never reused
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                comment TEXT NOT NULL DEFAULT '',
                ipv4_base TEXT NOT NULL,
                ipv6_base TEXT NOT NULL,
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                listen_port INTEGER NOT NULL
            );

            -- Authorization principals
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                peers_max INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                valid_until INTEGER NOT NULL,
                comment TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_code ON accounts(code);

            -- Registered tunnel endpoints
            CREATE TABLE IF NOT EXISTS peers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                public_key TEXT NOT NULL UNIQUE,
                device_id INTEGER NOT NULL REFERENCES devices(id)
            );
            CREATE INDEX IF NOT EXISTS idx_peers_account ON peers(account_id);

            -- Key-value store for misc state
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Device operations
    // ========================================================================

    pub fn create_device(
        &self,
        comment: &str,
        ipv4_base: Ipv4Addr,
        ipv6_base: Ipv6Addr,
        private_key: &str,
        public_key: &str,
        listen_port: u16,
    ) -> Result<Device> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (comment, ipv4_base, ipv6_base, private_key, public_key, listen_port)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                comment,
                ipv4_base.to_string(),
                ipv6_base.to_string(),
                private_key,
                public_key,
                listen_port,
            ],
        )?;
        let id = conn.last_insert_rowid();

        debug!("Created device {}", id);
        Ok(Device {
            id,
            comment: comment.to_string(),
            ipv4_base,
            ipv6_base,
            private_key: private_key.to_string(),
            public_key: public_key.to_string(),
            listen_port,
        })
    }

    /// All devices in id order; reconciliation depends on this ordering.
    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, comment, ipv4_base, ipv6_base, private_key, public_key, listen_port
             FROM devices ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawDevice {
                id: row.get(0)?,
                comment: row.get(1)?,
                ipv4_base: row.get(2)?,
                ipv6_base: row.get(3)?,
                private_key: row.get(4)?,
                public_key: row.get(5)?,
                listen_port: row.get(6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }

    pub fn count_devices(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // Account operations
    // ========================================================================

    pub fn create_account(
        &self,
        code: &str,
        peers_max: i64,
        created_at: i64,
        valid_until: i64,
        comment: &str,
    ) -> Result<Account> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (code, peers_max, created_at, valid_until, comment)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![code, peers_max, created_at, valid_until, comment],
        )?;
        let id = conn.last_insert_rowid();

        debug!("Created account {}", id);
        Ok(Account {
            id,
            code: code.to_string(),
            peers_max,
            created_at,
            valid_until,
            comment: comment.to_string(),
        })
    }

    pub fn account_by_code(&self, code: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let account = conn
            .query_row(
                "SELECT id, code, peers_max, created_at, valid_until, comment
                 FROM accounts WHERE code = ?1",
                params![code],
                map_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn account_by_id(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let account = conn
            .query_row(
                "SELECT id, code, peers_max, created_at, valid_until, comment
                 FROM accounts WHERE id = ?1",
                params![id],
                map_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn count_accounts(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // Peer operations
    // ========================================================================

    pub fn create_peer(&self, account_id: i64, public_key: &str, device_id: i64) -> Result<Peer> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (account_id, public_key, device_id) VALUES (?1, ?2, ?3)",
            params![account_id, public_key, device_id],
        )?;
        let id = conn.last_insert_rowid();

        debug!("Created peer {} for account {}", id, account_id);
        Ok(Peer {
            id,
            account_id,
            public_key: public_key.to_string(),
            device_id,
        })
    }

    pub fn peer_by_pubkey(&self, public_key: &str) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                "SELECT id, account_id, public_key, device_id FROM peers WHERE public_key = ?1",
                params![public_key],
                map_peer,
            )
            .optional()?;
        Ok(peer)
    }

    /// All peers in id order; startup replay depends on this ordering.
    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, account_id, public_key, device_id FROM peers ORDER BY id")?;
        let rows = stmt.query_map([], map_peer)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn list_peers_for_account(&self, account_id: i64) -> Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, public_key, device_id FROM peers
             WHERE account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![account_id], map_peer)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_peers_for_account(&self, account_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM peers WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Key-value store
    // ========================================================================

    /// Set a key-value pair
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;

        Ok(())
    }

    /// Get a value by key
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }
}

fn map_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        code: row.get(1)?,
        peers_max: row.get(2)?,
        created_at: row.get(3)?,
        valid_until: row.get(4)?,
        comment: row.get(5)?,
    })
}

fn map_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: row.get(0)?,
        account_id: row.get(1)?,
        public_key: row.get(2)?,
        device_id: row.get(3)?,
    })
}

/// Device row before address parsing
struct RawDevice {
    id: i64,
    comment: String,
    ipv4_base: String,
    ipv6_base: String,
    private_key: String,
    public_key: String,
    listen_port: u16,
}

impl RawDevice {
    fn parse(self) -> Result<Device> {
        let ipv4_base = self
            .ipv4_base
            .parse()
            .map_err(|_| Error::Internal(format!("corrupt ipv4_base on device {}", self.id)))?;
        let ipv6_base = self
            .ipv6_base
            .parse()
            .map_err(|_| Error::Internal(format!("corrupt ipv6_base on device {}", self.id)))?;
        Ok(Device {
            id: self.id,
            comment: self.comment,
            ipv4_base,
            ipv6_base,
            private_key: self.private_key,
            public_key: self.public_key,
            listen_port: self.listen_port,
        })
    }
}

//! SQLite-backed fake-IP store
//!
//! Two tables hold the mapping in each direction:
//!
//! ```text
//! fakeip_host (host TEXT PRIMARY KEY, ip BLOB)   -- also holds reserved keys
//! fakeip_ip   (ip BLOB PRIMARY KEY, host TEXT)
//! ```
//!
//! Addresses are stored as 4 or 16 raw bytes. Write failures are logged and
//! swallowed: a lost mapping only costs a fresh allocation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::FakeIpError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS fakeip_host (
        host TEXT PRIMARY KEY,
        ip   BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS fakeip_ip (
        ip   BLOB PRIMARY KEY,
        host TEXT NOT NULL
    );
";

pub(crate) fn ip_to_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

/// Durable host ↔ address store
pub struct PersistentStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PersistentStore {
    /// Open (creating if needed) the store at `path`
    ///
    /// # Errors
    ///
    /// Returns `FakeIpError::Store` if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FakeIpError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn warn_write(&self, op: &str, err: &rusqlite::Error) {
        warn!(path = %self.path.display(), op, error = %err, "write fake-ip cache failed");
    }

    pub fn get_by_host(&self, host: &str) -> Option<IpAddr> {
        let conn = self.conn.lock();
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT ip FROM fakeip_host WHERE host = ?1",
                params![host],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten();
        bytes.as_deref().and_then(ip_from_bytes)
    }

    pub fn put_by_host(&self, host: &str, ip: IpAddr) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO fakeip_host (host, ip) VALUES (?1, ?2)",
            params![host, ip_to_bytes(ip)],
        ) {
            self.warn_write("put_by_host", &e);
        }
    }

    pub fn get_by_ip(&self, ip: IpAddr) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT host FROM fakeip_ip WHERE ip = ?1",
            params![ip_to_bytes(ip)],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    pub fn put_by_ip(&self, ip: IpAddr, host: &str) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO fakeip_ip (ip, host) VALUES (?1, ?2)",
            params![ip_to_bytes(ip), host],
        ) {
            self.warn_write("put_by_ip", &e);
        }
    }

    /// Delete the address and the host that pointed at it
    pub fn del_by_ip(&self, ip: IpAddr) {
        let mut conn = self.conn.lock();
        let addr = ip_to_bytes(ip);
        let result = (|| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            let host: Option<String> = tx
                .query_row(
                    "SELECT host FROM fakeip_ip WHERE ip = ?1",
                    params![addr],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute("DELETE FROM fakeip_ip WHERE ip = ?1", params![addr])?;
            if let Some(host) = host.filter(|h| !h.is_empty()) {
                tx.execute("DELETE FROM fakeip_host WHERE host = ?1", params![host])?;
            }
            tx.commit()
        })();
        if let Err(e) = result {
            self.warn_write("del_by_ip", &e);
        }
    }

    pub fn exist(&self, ip: IpAddr) -> bool {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM fakeip_ip WHERE ip = ?1",
            params![ip_to_bytes(ip)],
            |_| Ok(()),
        )
        .optional()
        .ok()
        .flatten()
        .is_some()
    }

    /// Remove every mapping and reserved key
    ///
    /// # Errors
    ///
    /// Returns `FakeIpError::Store` if the tables cannot be cleared.
    pub fn flush(&self) -> Result<(), FakeIpError> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM fakeip_ip; DELETE FROM fakeip_host;")?;
        Ok(())
    }
}

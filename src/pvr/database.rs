//! Database connection pool for the recording catalog
//!
//! Connections are handed out exclusively through `PooledConnection` guards
//! and return to the pool when the guard drops. The pool grows instead of
//! making callers wait. Every connection runs in WAL mode with a 30 second
//! busy timeout so the discovery writer and host readers can overlap.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use camino::Utf8Path;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::pvr::error::Result;

/// How long a connection waits on a locked database before failing
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS recording (
    recording_id TEXT PRIMARY KEY NOT NULL COLLATE NOCASE,
    title TEXT,
    episode_name TEXT,
    series_number INTEGER,
    episode_number INTEGER,
    year INTEGER,
    stream_url TEXT,
    directory TEXT,
    plot TEXT,
    channel_name TEXT,
    recording_time INTEGER,
    duration INTEGER
)";

/// Flags used for every catalog connection
pub fn default_open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

/// Build a `file:` URI for a database path
pub fn database_uri(path: &Utf8Path) -> String {
    let mut escaped = String::with_capacity(path.as_str().len());
    for c in path.as_str().chars() {
        match c {
            '\\' => escaped.push('/'),
            '%' => escaped.push_str("%25"),
            '?' => escaped.push_str("%3f"),
            '#' => escaped.push_str("%23"),
            _ => escaped.push(c),
        }
    }

    let bytes = escaped.as_bytes();
    if escaped.starts_with('/') {
        format!("file://{}", escaped)
    } else if bytes.len() > 1 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        format!("file:///{}", escaped)
    } else {
        format!("file:{}", escaped)
    }
}

/// Open and configure one connection; `initialize` also creates the schema
pub fn open_database(connstr: &str, flags: OpenFlags, initialize: bool) -> Result<Connection> {
    // rusqlite enables extended result codes on every connection it opens
    let conn = Connection::open_with_flags(connstr, flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // PRAGMA journal_mode returns the new mode, so we use query_row
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        warn!("WAL mode not enabled, got: {}", journal_mode);
    }

    // Staging tables never touch disk
    conn.execute_batch("PRAGMA temp_store = MEMORY")?;

    // Only one connection may create the schema, otherwise locking issues can occur
    if initialize {
        conn.execute_batch(SCHEMA)?;
        debug!("Database schema initialized");
    }

    Ok(conn)
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<(u64, Connection)>,
    checked_out: HashSet<u64>,
    next_id: u64,
}

/// Growable pool of connections to one database
pub struct ConnectionPool {
    connstr: String,
    flags: OpenFlags,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Create the pool, opening and initializing the first connection now so
    /// schema or connection errors surface to the caller
    pub fn new(connstr: &str, flags: OpenFlags) -> Result<Self> {
        info!("Opening recording database: {}", connstr);
        let conn = open_database(connstr, flags, true)?;

        let mut state = PoolState::default();
        state.idle.push_back((0, conn));
        state.next_id = 1;

        Ok(Self {
            connstr: connstr.to_string(),
            flags,
            state: Mutex::new(state),
        })
    }

    /// Check out a connection, opening a new one if none is idle
    pub fn acquire(&self) -> Result<PooledConnection<'_>> {
        let id = {
            let mut state = self.state.lock();
            if let Some((id, conn)) = state.idle.pop_front() {
                state.checked_out.insert(id);
                return Ok(PooledConnection {
                    pool: self,
                    id,
                    conn: Some(conn),
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            id
        };

        // Opened outside the lock; a failed open leaves nothing registered
        let conn = open_database(&self.connstr, self.flags, false)?;
        self.state.lock().checked_out.insert(id);
        debug!("Opened pooled database connection {}", id);

        Ok(PooledConnection {
            pool: self,
            id,
            conn: Some(conn),
        })
    }

    fn release(&self, id: u64, conn: Connection) {
        let mut state = self.state.lock();
        assert!(
            state.checked_out.remove(&id),
            "connection {} released to a pool that does not own it",
            id
        );
        state.idle.push_back((id, conn));
    }

    /// Total number of connections owned by the pool
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.idle.len() + state.checked_out.len()
    }

    /// Number of connections ready to be handed out
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }
}

/// Exclusive checkout of a pooled connection; released on drop
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    id: u64,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is only taken on drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is only taken on drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.id, conn);
        }
    }
}

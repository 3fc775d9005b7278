//! SQLite persistence for the relay.
//!
//! The database never sees plaintext: friend-request packets and queued
//! events are opaque ciphertext or already-redacted frames, and users
//! appear only as email hashes. SQLite is the durable side of the
//! identity triple: devices and friendships are stable, while socket
//! rows mirror live connections and are wiped on startup.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Devices, friend requests, and queued notifications untouched for
/// this long are purged, both at startup and by the monthly worker.
pub const RETENTION_DAYS: i64 = 30;

/// A registered device of a user.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub public_key: String,
    /// Unix milliseconds.
    pub last_active: i64,
    pub is_master: bool,
    pub status: String,
}

/// A pending friend request addressed to a user.
#[derive(Debug, Clone)]
pub struct FriendRequestRecord {
    pub sender_hash: String,
    pub encrypted_packet: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// A friendship row. Hashes are stored in lexicographic order.
#[derive(Debug, Clone)]
pub struct FriendshipRecord {
    pub sid: String,
    pub user1_hash: String,
    pub user2_hash: String,
}

/// Persistent storage backed by SQLite.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let storage = Self::initialize(conn)?;
        info!("database opened: {}", path.display());
        Ok(storage)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                email_hash  TEXT NOT NULL,
                public_key  TEXT NOT NULL,
                last_active INTEGER NOT NULL,
                is_master   INTEGER NOT NULL DEFAULT 0,
                status      TEXT NOT NULL DEFAULT 'pending',
                PRIMARY KEY (email_hash, public_key)
            );

            -- At most one trust anchor per user.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_one_master
                ON devices(email_hash) WHERE is_master = 1;

            CREATE TABLE IF NOT EXISTS requests (
                sender_hash      TEXT NOT NULL,
                target_hash      TEXT NOT NULL,
                encrypted_packet TEXT NOT NULL,
                timestamp        INTEGER NOT NULL,
                PRIMARY KEY (sender_hash, target_hash)
            );

            CREATE TABLE IF NOT EXISTS friends (
                user1_hash TEXT NOT NULL,
                user2_hash TEXT NOT NULL,
                since      INTEGER NOT NULL,
                sid        TEXT,
                PRIMARY KEY (user1_hash, user2_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_friends_sid ON friends(sid);

            CREATE TABLE IF NOT EXISTS sockets (
                email_hash TEXT NOT NULL,
                socket_id  TEXT NOT NULL,
                public_key TEXT,
                PRIMARY KEY (email_hash, socket_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sockets_socket ON sockets(socket_id);
            CREATE INDEX IF NOT EXISTS idx_sockets_key ON sockets(public_key);

            CREATE TABLE IF NOT EXISTS offline_notifications (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                email_hash TEXT NOT NULL,
                event_data TEXT NOT NULL,
                timestamp  INTEGER NOT NULL
            );",
        )?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let cutoff = now - RETENTION_DAYS * 24 * 60 * 60 * 1000;
        conn.execute("DELETE FROM devices WHERE last_active < ?1", params![cutoff])?;
        conn.execute("DELETE FROM requests WHERE timestamp < ?1", params![cutoff])?;
        conn.execute(
            "DELETE FROM offline_notifications WHERE timestamp < ?1",
            params![cutoff],
        )?;

        // Socket rows describe live connections only; any survivor from
        // a previous process is stale by construction.
        conn.execute("DELETE FROM sockets", [])?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Devices ──

    pub fn device_count(&self, email_hash: &str) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE email_hash = ?1",
            params![email_hash],
            |row| row.get(0),
        )
    }

    /// Status and master flag of one device, or None if unregistered.
    pub fn device_auth(
        &self,
        email_hash: &str,
        public_key: &str,
    ) -> Result<Option<(String, bool)>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT status, is_master FROM devices WHERE email_hash = ?1 AND public_key = ?2",
            params![email_hash, public_key],
            |row| {
                let is_master: i64 = row.get(1)?;
                Ok((row.get(0)?, is_master != 0))
            },
        )
        .optional()
    }

    pub fn insert_device(
        &self,
        email_hash: &str,
        public_key: &str,
        last_active: i64,
        is_master: bool,
        status: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (email_hash, public_key, last_active, is_master, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![email_hash, public_key, last_active, is_master as i64, status],
        )?;
        Ok(())
    }

    pub fn touch_device(
        &self,
        email_hash: &str,
        public_key: &str,
        last_active: i64,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET last_active = ?1 WHERE email_hash = ?2 AND public_key = ?3",
            params![last_active, email_hash, public_key],
        )?;
        Ok(())
    }

    pub fn approve_device(
        &self,
        email_hash: &str,
        public_key: &str,
    ) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET status = 'approved' WHERE email_hash = ?1 AND public_key = ?2",
            params![email_hash, public_key],
        )
    }

    pub fn delete_device(
        &self,
        email_hash: &str,
        public_key: &str,
    ) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM devices WHERE email_hash = ?1 AND public_key = ?2",
            params![email_hash, public_key],
        )
    }

    /// Rotate a device to a new public key, rewriting the socket row
    /// that pointed at the old key.
    pub fn rotate_device_key(
        &self,
        email_hash: &str,
        old_key: &str,
        new_key: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET public_key = ?1 WHERE email_hash = ?2 AND public_key = ?3",
            params![new_key, email_hash, old_key],
        )?;
        conn.execute(
            "UPDATE sockets SET public_key = ?1 WHERE email_hash = ?2 AND public_key = ?3",
            params![new_key, email_hash, old_key],
        )?;
        Ok(())
    }

    /// Public key of the user's trust anchor.
    pub fn master_public_key(&self, email_hash: &str) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT public_key FROM devices WHERE email_hash = ?1 AND is_master = 1 LIMIT 1",
            params![email_hash],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn list_devices(&self, email_hash: &str) -> Result<Vec<DeviceRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT public_key, last_active, is_master, status FROM devices WHERE email_hash = ?1",
        )?;
        let devices = stmt
            .query_map(params![email_hash], |row| {
                let is_master: i64 = row.get(2)?;
                Ok(DeviceRecord {
                    public_key: row.get(0)?,
                    last_active: row.get(1)?,
                    is_master: is_master != 0,
                    status: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(devices)
    }

    /// Status of the device currently attached through `socket_id`.
    pub fn device_status_for_socket(
        &self,
        socket_id: &str,
    ) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT d.status FROM devices d
             JOIN sockets s ON d.public_key = s.public_key AND d.email_hash = s.email_hash
             WHERE s.socket_id = ?1",
            params![socket_id],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn delete_devices_for(&self, email_hash: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM devices WHERE email_hash = ?1",
            params![email_hash],
        )
    }

    // ── Sockets ──

    pub fn insert_socket(
        &self,
        email_hash: &str,
        socket_id: &str,
        public_key: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sockets (email_hash, socket_id, public_key) VALUES (?1, ?2, ?3)",
            params![email_hash, socket_id, public_key],
        )?;
        Ok(())
    }

    pub fn delete_socket(&self, socket_id: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sockets WHERE socket_id = ?1",
            params![socket_id],
        )
    }

    pub fn delete_sockets_for(&self, email_hash: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sockets WHERE email_hash = ?1",
            params![email_hash],
        )
    }

    /// Public key the given live socket authenticated with.
    pub fn socket_public_key(&self, socket_id: &str) -> Result<Option<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT public_key FROM sockets WHERE socket_id = ?1",
            params![socket_id],
            |row| row.get(0),
        )
        .optional()
    }

    /// Socket ids of one user's device.
    pub fn socket_ids_for_key(
        &self,
        email_hash: &str,
        public_key: &str,
    ) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT socket_id FROM sockets WHERE email_hash = ?1 AND public_key = ?2")?;
        let ids = stmt
            .query_map(params![email_hash, public_key], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// All socket ids of a user.
    pub fn socket_ids_for_user(&self, email_hash: &str) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT socket_id FROM sockets WHERE email_hash = ?1")?;
        let ids = stmt
            .query_map(params![email_hash], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Socket ids currently attached with a given public key, across
    /// all users. Used for directed signaling.
    pub fn socket_ids_for_public_key(
        &self,
        public_key: &str,
    ) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT socket_id FROM sockets WHERE public_key = ?1")?;
        let ids = stmt
            .query_map(params![public_key], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Distinct public keys the user is currently connected with.
    pub fn connected_public_keys(&self, email_hash: &str) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT public_key FROM sockets
             WHERE email_hash = ?1 AND public_key IS NOT NULL AND public_key != ''",
        )?;
        let keys = stmt
            .query_map(params![email_hash], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(keys)
    }

    /// Like [`Self::connected_public_keys`] but restricted to approved
    /// devices.
    pub fn connected_approved_keys(
        &self,
        email_hash: &str,
    ) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.public_key FROM sockets s
             JOIN devices d ON s.public_key = d.public_key AND s.email_hash = d.email_hash
             WHERE s.email_hash = ?1 AND s.public_key IS NOT NULL AND s.public_key != ''
               AND d.status = 'approved'",
        )?;
        let keys = stmt
            .query_map(params![email_hash], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(keys)
    }

    /// Number of live sockets belonging to approved devices of a user.
    pub fn online_approved_count(&self, email_hash: &str) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sockets s
             JOIN devices d ON s.public_key = d.public_key AND s.email_hash = d.email_hash
             WHERE s.email_hash = ?1 AND d.status = 'approved'",
            params![email_hash],
            |row| row.get(0),
        )
    }

    // ── Friend requests ──

    /// Store a friend request, replacing any previous one from the same
    /// sender to the same target.
    pub fn upsert_friend_request(
        &self,
        sender_hash: &str,
        target_hash: &str,
        encrypted_packet: &str,
        timestamp: i64,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO requests (sender_hash, target_hash, encrypted_packet, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![sender_hash, target_hash, encrypted_packet, timestamp],
        )?;
        Ok(())
    }

    pub fn delete_friend_request(
        &self,
        sender_hash: &str,
        target_hash: &str,
    ) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM requests WHERE sender_hash = ?1 AND target_hash = ?2",
            params![sender_hash, target_hash],
        )
    }

    pub fn pending_requests_for(
        &self,
        target_hash: &str,
    ) -> Result<Vec<FriendRequestRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sender_hash, encrypted_packet, timestamp FROM requests WHERE target_hash = ?1",
        )?;
        let requests = stmt
            .query_map(params![target_hash], |row| {
                Ok(FriendRequestRecord {
                    sender_hash: row.get(0)?,
                    encrypted_packet: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(requests)
    }

    pub fn delete_requests_for(&self, email_hash: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM requests WHERE sender_hash = ?1 OR target_hash = ?1",
            params![email_hash],
        )
    }

    // ── Friendships ──

    /// Insert a friendship. Hashes must already be in lexicographic
    /// order; a duplicate insert is a no-op.
    pub fn insert_friendship(
        &self,
        user1_hash: &str,
        user2_hash: &str,
        since: i64,
        sid: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO friends (user1_hash, user2_hash, since, sid)
             VALUES (?1, ?2, ?3, ?4)",
            params![user1_hash, user2_hash, since, sid],
        )?;
        Ok(())
    }

    /// All friendships the user is a party to.
    pub fn friendships_for(
        &self,
        email_hash: &str,
    ) -> Result<Vec<FriendshipRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sid, user1_hash, user2_hash FROM friends
             WHERE (user1_hash = ?1 OR user2_hash = ?1) AND sid IS NOT NULL",
        )?;
        let friendships = stmt
            .query_map(params![email_hash], |row| {
                Ok(FriendshipRecord {
                    sid: row.get(0)?,
                    user1_hash: row.get(1)?,
                    user2_hash: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(friendships)
    }

    /// Whether a friendship with this session id names the user as a
    /// party. Gates every relay.
    pub fn friendship_exists(&self, sid: &str, email_hash: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM friends
             WHERE sid = ?1 AND (user1_hash = ?2 OR user2_hash = ?2)",
            params![sid, email_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn friend_session_ids(&self, email_hash: &str) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sid FROM friends
             WHERE (user1_hash = ?1 OR user2_hash = ?1) AND sid IS NOT NULL",
        )?;
        let sids = stmt
            .query_map(params![email_hash], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sids)
    }

    /// Remove the friendship between two users, whichever order it was
    /// stored in.
    pub fn delete_friendship_pair(&self, a: &str, b: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM friends
             WHERE (user1_hash = ?1 AND user2_hash = ?2) OR (user1_hash = ?2 AND user2_hash = ?1)",
            params![a, b],
        )
    }

    pub fn delete_friendships_for(&self, email_hash: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM friends WHERE user1_hash = ?1 OR user2_hash = ?1",
            params![email_hash],
        )
    }

    // ── Offline notifications ──

    /// Queue a serialized frame for delivery on the user's next
    /// successful authentication.
    pub fn enqueue_offline(
        &self,
        email_hash: &str,
        event_data: &str,
        timestamp: i64,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO offline_notifications (email_hash, event_data, timestamp)
             VALUES (?1, ?2, ?3)",
            params![email_hash, event_data, timestamp],
        )?;
        Ok(())
    }

    pub fn offline_notifications(
        &self,
        email_hash: &str,
    ) -> Result<Vec<(i64, String)>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, event_data FROM offline_notifications WHERE email_hash = ?1")?;
        let rows = stmt
            .query_map(params![email_hash], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn delete_offline(&self, id: i64) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM offline_notifications WHERE id = ?1",
            params![id],
        )
    }

    pub fn delete_offline_for(&self, email_hash: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM offline_notifications WHERE email_hash = ?1",
            params![email_hash],
        )
    }

    // ── Maintenance ──

    /// Delete devices, requests, and queued notifications older than
    /// the cutoff (unix milliseconds). Returns the per-table counts.
    pub fn purge_stale(&self, cutoff: i64) -> Result<(usize, usize, usize), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let devices = conn.execute(
            "DELETE FROM devices WHERE last_active < ?1",
            params![cutoff],
        )?;
        let requests = conn.execute(
            "DELETE FROM requests WHERE timestamp < ?1",
            params![cutoff],
        )?;
        let notifications = conn.execute(
            "DELETE FROM offline_notifications WHERE timestamp < ?1",
            params![cutoff],
        )?;
        Ok((devices, requests, notifications))
    }
}

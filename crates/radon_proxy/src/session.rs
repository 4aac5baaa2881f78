//! Client session handle as seen by the statement path.
//!
//! The wire front-end owns the socket; the proxy only needs identity, the
//! current schema and a way to drop the connection on `KILL`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

pub trait Session: Send + Sync {
    fn id(&self) -> u32;
    fn user(&self) -> String;
    /// Peer address, `host:port`.
    fn addr(&self) -> String;
    fn schema(&self) -> String;
    fn set_schema(&self, db: &str);
    /// Handshake salt sent to the client.
    fn salt(&self) -> Vec<u8>;
    /// Auth response returned by the client.
    fn scramble(&self) -> Vec<u8>;
    /// Drop the client connection.
    fn close(&self);
}

static SESSION_ID_SEQ: AtomicU32 = AtomicU32::new(1);

/// Session without a network connection: the console and tests use it.
pub struct LocalSession {
    id: u32,
    user: String,
    addr: String,
    schema: RwLock<String>,
    salt: Vec<u8>,
    closed: AtomicBool,
}

impl LocalSession {
    pub fn new(user: impl Into<String>, addr: impl Into<String>) -> Self {
        let id = SESSION_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            user: user.into(),
            addr: addr.into(),
            schema: RwLock::new(String::new()),
            salt: make_salt(id),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 20 printable bytes, as in the MySQL handshake.
fn make_salt(id: u32) -> Vec<u8> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut salt = Vec::with_capacity(20);
    let mut seed = xxh3_64(&[nanos.to_le_bytes().as_slice(), &id.to_le_bytes()].concat());
    while salt.len() < 20 {
        for b in seed.to_le_bytes() {
            if salt.len() < 20 {
                salt.push(b'!' + b % 94);
            }
        }
        seed = xxh3_64(&seed.to_le_bytes());
    }
    salt
}

impl Session for LocalSession {
    fn id(&self) -> u32 {
        self.id
    }

    fn user(&self) -> String {
        self.user.clone()
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn schema(&self) -> String {
        self.schema.read().clone()
    }

    fn set_schema(&self, db: &str) {
        *self.schema.write() = db.to_string();
    }

    fn salt(&self) -> Vec<u8> {
        self.salt.clone()
    }

    fn scramble(&self) -> Vec<u8> {
        Vec::new()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(session_id = self.id, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = LocalSession::new("root", "127.0.0.1:1");
        let b = LocalSession::new("root", "127.0.0.1:2");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_salt_is_printable() {
        let s = LocalSession::new("root", "127.0.0.1:1");
        let salt = s.salt();
        assert_eq!(salt.len(), 20);
        assert!(salt.iter().all(|b| b.is_ascii_graphic()));
    }

    #[test]
    fn test_schema_and_close() {
        let s = LocalSession::new("root", "127.0.0.1:1");
        assert_eq!(s.schema(), "");
        s.set_schema("db");
        assert_eq!(s.schema(), "db");
        assert!(!s.is_closed());
        s.close();
        s.close();
        assert!(s.is_closed());
    }
}

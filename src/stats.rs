//! Per-connection operation counters.
//!
//! Each [`Connection`](crate::connection::Connection) owns one [`Stats`].
//! Counters only ever grow and are read without locking.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Kind of request issued on a connection, used to pick counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Ping,
    Get,
    Put,
    Post,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Ping => "ping",
            OpKind::Get => "get",
            OpKind::Put => "put",
            OpKind::Post => "post",
            OpKind::Delete => "delete",
        }
    }
}

/// Atomic counters for one connection.
#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    pings: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    posts: AtomicU64,
    deletes: AtomicU64,
    ping_errors: AtomicU64,
    get_errors: AtomicU64,
    put_errors: AtomicU64,
    post_errors: AtomicU64,
    delete_errors: AtomicU64,
}

/// Point-in-time copy of a [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub pings: u64,
    pub gets: u64,
    pub puts: u64,
    pub posts: u64,
    pub deletes: u64,
    pub ping_errors: u64,
    pub get_errors: u64,
    pub put_errors: u64,
    pub post_errors: u64,
    pub delete_errors: u64,
}

impl StatsSnapshot {
    /// Sum of all per-kind error counters.
    pub fn errors(&self) -> u64 {
        self.ping_errors + self.get_errors + self.put_errors + self.post_errors + self.delete_errors
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one attempt of `kind`.
    pub fn record(&self, kind: OpKind) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failure of `kind`.
    pub fn record_error(&self, kind: OpKind) {
        self.error_counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    fn counter(&self, kind: OpKind) -> &AtomicU64 {
        match kind {
            OpKind::Ping => &self.pings,
            OpKind::Get => &self.gets,
            OpKind::Put => &self.puts,
            OpKind::Post => &self.posts,
            OpKind::Delete => &self.deletes,
        }
    }

    fn error_counter(&self, kind: OpKind) -> &AtomicU64 {
        match kind {
            OpKind::Ping => &self.ping_errors,
            OpKind::Get => &self.get_errors,
            OpKind::Put => &self.put_errors,
            OpKind::Post => &self.post_errors,
            OpKind::Delete => &self.delete_errors,
        }
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    pub fn ping_errors(&self) -> u64 {
        self.ping_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            pings: self.pings.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            posts: self.posts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            ping_errors: self.ping_errors.load(Ordering::Relaxed),
            get_errors: self.get_errors.load(Ordering::Relaxed),
            put_errors: self.put_errors.load(Ordering::Relaxed),
            post_errors: self.post_errors.load(Ordering::Relaxed),
            delete_errors: self.delete_errors.load(Ordering::Relaxed),
        }
    }
}

//! Console feed shared by both supervisors.
//!
//! Every raw output line and every lifecycle notice ends up here. Appends
//! take one lock per line, so concurrent writers never interleave text.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Default number of lines kept in memory.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 10_000;

/// Which supervisor produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Server,
    Tunnel,
}

/// Receiver for console output. Must tolerate calls from many tasks at once.
pub trait ConsoleSink: Send + Sync {
    fn append(&self, origin: Origin, text: &str);
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleLine {
    /// Sequential id for polling (`GET /api/console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub origin: Origin,
    pub text: String,
}

struct Ring {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
}

/// Ring buffer of recent console lines.
pub struct ConsoleBuffer {
    ring: Mutex<Ring>,
    max_size: usize,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CONSOLE_CAPACITY)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            ring: Mutex::new(Ring {
                lines: VecDeque::with_capacity(max_size.min(DEFAULT_CONSOLE_CAPACITY)),
                next_id: 0,
            }),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Console buffer lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// All lines with `id > since_id`.
    pub fn since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lock()
            .lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.lock().lines.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count lines containing `needle`. Mostly useful in tests and health checks.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.lock()
            .lines
            .iter()
            .filter(|l| l.text.contains(needle))
            .count()
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleSink for ConsoleBuffer {
    fn append(&self, origin: Origin, text: &str) {
        tracing::debug!(target: "mcwarden::console", origin = ?origin, "{}", text);
        let mut ring = self.lock();
        let line = ConsoleLine {
            id: ring.next_id,
            timestamp: current_timestamp(),
            origin,
            text: text.to_string(),
        };
        ring.next_id += 1;
        if ring.lines.len() >= self.max_size {
            ring.lines.pop_front();
        }
        ring.lines.push_back(line);
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

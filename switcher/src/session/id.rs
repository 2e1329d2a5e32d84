use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Unique identifier of a live session; its chain-specific hex rendering
/// doubles as the miner's ExtraNonce1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u32);

impl SessionId {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{:08x}", self.0)
    }
}

/// Bounded session-id pool. Ids are unique among live sessions and return
/// to a free list on release, so allocation is O(1) amortized.
#[derive(Debug)]
pub struct SessionIdPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    next: u32,
    max: u32,
    free: Vec<u32>,
}

impl SessionIdPool {
    /// Ethereum renders session ids truncated to 24 bits, so the default
    /// domain stays below that boundary.
    pub const DEFAULT_MAX: u32 = 0x00ff_ffff;

    pub fn new(max: u32) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                next: 1,
                max,
                free: Vec::new(),
            }),
        }
    }

    /// Hands out an id, or `None` when the domain is exhausted.
    pub fn allocate(&self) -> Option<SessionId> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = inner.free.pop() {
            return Some(SessionId(id));
        }
        if inner.next <= inner.max {
            let id = inner.next;
            inner.next += 1;
            Some(SessionId(id))
        } else {
            None
        }
    }

    pub fn release(&self, id: SessionId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.free.push(id.0);
    }
}

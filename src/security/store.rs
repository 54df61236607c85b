//! Counter store adapter.
//!
//! The rate limiter keeps every shared counter behind [`CounterStore`] so that
//! several gateway instances can point at one external low-latency store.
//! [`MemoryCounterStore`] is the single-instance implementation.
//!
//! # Design Decisions
//! - Sliding windows are one primitive (`window_try_add`): trim, count and
//!   conditional add happen atomically per key, so concurrent admits can never
//!   push a window past its limit
//! - Every key carries its own expiry; nothing needs an external sweeper

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("key '{0}' holds a different kind of value")]
    WrongType(String),
}

/// Result of a sliding-window operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Whether the member was recorded (always false for pure reads).
    pub admitted: bool,
    /// Members inside the window after the operation.
    pub count: u64,
    /// Timestamp of the oldest member still inside the window.
    pub oldest_ms: Option<u64>,
}

/// Atomic counters with expiry.
///
/// Timestamps are epoch milliseconds supplied by the caller, so instances
/// sharing one store agree on window boundaries.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, creating it with `ttl` when absent. Returns the new value.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Current value, zero when absent or expired.
    async fn count(&self, key: &str) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError>;

    /// Remaining time to live, `None` when the key is absent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Delete `key`. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Drop members older than `now_ms - window_ms`, then record `member` at
    /// `now_ms` only if fewer than `limit` members remain. One atomic step.
    async fn window_try_add(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<WindowSnapshot, StoreError>;

    /// Withdraw a previously recorded member.
    async fn window_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Trim and count without recording anything.
    async fn window_count(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowSnapshot, StoreError>;
}

#[derive(Debug)]
enum Value {
    Counter(u64),
    Window(VecDeque<(u64, String)>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`CounterStore`] backed by a sharded map.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn trim(members: &mut VecDeque<(u64, String)>, now_ms: u64, window_ms: u64) {
    let floor = now_ms.saturating_sub(window_ms);
    while members.front().is_some_and(|(at, _)| *at <= floor) {
        members.pop_front();
    }
}

fn snapshot(members: &VecDeque<(u64, String)>, admitted: bool) -> WindowSnapshot {
    WindowSnapshot {
        admitted,
        count: members.len() as u64,
        oldest_ms: members.front().map(|(at, _)| *at),
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                match &mut occupied.get_mut().value {
                    Value::Counter(n) => {
                        *n += 1;
                        Ok(*n)
                    }
                    Value::Window(_) => Err(StoreError::WrongType(key.to_string())),
                }
            }
            MapEntry::Occupied(mut occupied) => {
                occupied.insert(Slot {
                    value: Value::Counter(1),
                    expires_at: now + ttl,
                });
                Ok(1)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Counter(1),
                    expires_at: now + ttl,
                });
                Ok(1)
            }
        }
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        match self.slots.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.value {
                Value::Counter(n) => Ok(*n),
                Value::Window(members) => Ok(members.len() as u64),
            },
            _ => Ok(0),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self.slots.get(key).is_some_and(|slot| slot.is_live(now)))
    }

    async fn set_with_ttl(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Counter(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.expires_at - now))
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }

    async fn window_try_add(
        &self,
        key: &str,
        member: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        let now = Instant::now();
        let expires_at = now + Duration::from_millis(window_ms);
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Window(VecDeque::new()),
            expires_at,
        });
        if !slot.is_live(now) {
            slot.value = Value::Window(VecDeque::new());
        }
        let Value::Window(members) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };

        trim(members, now_ms, window_ms);
        let admitted = (members.len() as u64) < limit;
        if admitted {
            members.push_back((now_ms, member.to_string()));
        }
        let result = snapshot(members, admitted);
        slot.expires_at = expires_at;
        Ok(result)
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(false);
        };
        let Value::Window(members) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        match members.iter().position(|(_, m)| m == member) {
            Some(index) => {
                members.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn window_count(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        let now = Instant::now();
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(snapshot(&VecDeque::new(), false));
        };
        if !slot.is_live(now) {
            return Ok(snapshot(&VecDeque::new(), false));
        }
        let Value::Window(members) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        trim(members, now_ms, window_ms);
        Ok(snapshot(members, false))
    }
}

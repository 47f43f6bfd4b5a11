// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Correlation of requests with their replies.
//!
//! A requester acquires a [`WaitToken`], sends its id inside the request and
//! blocks on it. The link dispatcher resolves the token when the matching
//! `REPLY` arrives. Ids combine a slot index with a generation counter, so a
//! late reply for an abandoned request never satisfies a newer one.

use slab::Slab;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("channel disconnected")]
    Disconnected,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    value: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    slots: Slab<Slot>,
    generation: u32,
    closed: bool,
    acquired: u64,
    stale: u64,
}

#[derive(Debug, Default)]
pub struct WaitRegistry {
    state: Mutex<State>,
    cond: Condvar,
}

fn token_id(key: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | (key as u64 & 0xFFFF_FFFF)
}

fn split_id(id: u64) -> (usize, u32) {
    ((id & 0xFFFF_FFFF) as usize, (id >> 32) as u32)
}

impl WaitRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(self: &Arc<Self>) -> WaitToken {
        let mut state = self.lock();
        // Generation 0 is never handed out so a zero id always means "no wait".
        state.generation = state.generation.wrapping_add(1).max(1);
        let generation = state.generation;
        let key = state.slots.insert(Slot {
            generation,
            value: None,
        });
        state.acquired += 1;
        WaitToken {
            registry: Arc::clone(self),
            key,
            id: token_id(key, generation),
        }
    }

    /// Delivers `value` to the token with this id. Returns false for ids that
    /// are unknown, already resolved or from an older generation.
    pub fn resolve(&self, id: u64, value: u64) -> bool {
        let (key, generation) = split_id(id);
        let mut state = self.lock();
        match state.slots.get_mut(key) {
            Some(slot) if slot.generation == generation && slot.value.is_none() => {
                slot.value = Some(value);
                drop(state);
                self.cond.notify_all();
                true
            }
            _ => {
                state.stale += 1;
                tracing::debug!("Dropping stale reply for wait token {:#x}", id);
                false
            }
        }
    }

    /// Fails every current and future wait with [`WaitError::Disconnected`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn outstanding(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn acquired_total(&self) -> u64 {
        self.lock().acquired
    }

    pub fn stale_replies(&self) -> u64 {
        self.lock().stale
    }
}

/// Outstanding wait. Dropping it without waiting releases the slot.
#[derive(Debug)]
pub struct WaitToken {
    registry: Arc<WaitRegistry>,
    key: usize,
    id: u64,
}

impl WaitToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until resolved, the registry closes or `timeout` elapses.
    /// `Duration::MAX` waits indefinitely.
    pub fn wait(self, timeout: Duration) -> Result<u64, WaitError> {
        // A timeout too large to represent waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let registry = Arc::clone(&self.registry);
        let mut state = registry.lock();
        loop {
            if let Some(value) = state.slots.get(self.key).and_then(|s| s.value) {
                return Ok(value);
            }
            if state.closed {
                return Err(WaitError::Disconnected);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::TimedOut(timeout));
                    }
                    registry
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => registry.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }
}

impl Drop for WaitToken {
    fn drop(&mut self) {
        let mut state = self.registry.lock();
        if state
            .slots
            .get(self.key)
            .is_some_and(|s| token_id(self.key, s.generation) == self.id)
        {
            state.slots.remove(self.key);
        }
    }
}

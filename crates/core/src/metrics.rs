// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::message::Command;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Traffic counters for one proxy link.
#[derive(Debug)]
pub struct LinkMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    replies: AtomicU64,
    stale_replies: AtomicU64,
    timeouts: AtomicU64,
    sent_by_command: Mutex<HashMap<Command, u64>>,
    start_time: Instant,
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            replies: AtomicU64::new(0),
            stale_replies: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            sent_by_command: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn reset(&self) {
        self.frames_sent.store(0, Ordering::SeqCst);
        self.frames_received.store(0, Ordering::SeqCst);
        self.replies.store(0, Ordering::SeqCst);
        self.stale_replies.store(0, Ordering::SeqCst);
        self.timeouts.store(0, Ordering::SeqCst);
        if let Ok(mut m) = self.sent_by_command.lock() {
            m.clear();
        }
    }

    pub fn record_sent(&self, command: Command) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut m) = self.sent_by_command.lock() {
            *m.entry(command).or_insert(0) += 1;
        }
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self, matched: bool) {
        if matched {
            self.replies.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stale_replies.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::SeqCst)
    }

    pub fn get_frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::SeqCst)
    }

    pub fn get_replies(&self) -> u64 {
        self.replies.load(Ordering::SeqCst)
    }

    pub fn get_stale_replies(&self) -> u64 {
        self.stale_replies.load(Ordering::SeqCst)
    }

    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn get_sent(&self, command: Command) -> u64 {
        self.sent_by_command
            .lock()
            .ok()
            .and_then(|m| m.get(&command).copied())
            .unwrap_or(0)
    }

    pub fn get_frames_per_sec(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.get_frames_sent() + self.get_frames_received()) as f64 / elapsed
        } else {
            0.0
        }
    }
}

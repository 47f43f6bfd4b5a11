// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Periodic liveness probing of every attached remote.
//!
//! The monitor is a timer over an injected [`Clock`]. Each firing pings the
//! registered devices one after another and re-arms. Devices that miss
//! `max_missed` consecutive pings are evicted and their links closed.

use crate::error::ProxyError;
use crate::proxy::ProxyDevice;
use crate::registry::DeviceRegistry;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use labwired_proxy_config::HeartbeatConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Monotonic time source, measured from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: Mutex<Duration>,
}

impl VirtualClock {
    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) += by;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Stopped,
    Running,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub pinged: usize,
    pub answered: usize,
    pub evicted: Vec<String>,
}

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Duration>,
    created: u64,
    fired: u64,
}

pub struct HeartbeatMonitor {
    registry: Arc<DeviceRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_missed: u32,
    timer: Mutex<Timer>,
    /// Consecutive misses keyed by device address.
    misses: Mutex<HashMap<usize, u32>>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("interval", &self.interval)
            .field("max_missed", &self.max_missed)
            .field("state", &self.state())
            .finish()
    }
}

fn device_key(device: &Arc<ProxyDevice>) -> usize {
    Arc::as_ptr(device) as usize
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<DeviceRegistry>, clock: Arc<dyn Clock>, config: &HeartbeatConfig) -> Self {
        Self {
            registry,
            clock,
            interval: Duration::from_millis(config.interval_ms),
            max_missed: config.max_missed,
            timer: Mutex::new(Timer::default()),
            misses: Mutex::new(HashMap::new()),
        }
    }

    fn timer(&self) -> MutexGuard<'_, Timer> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> HeartbeatState {
        if self.timer().deadline.is_some() {
            HeartbeatState::Running
        } else {
            HeartbeatState::Stopped
        }
    }

    /// Next firing time on the monitor's clock.
    pub fn deadline(&self) -> Option<Duration> {
        self.timer().deadline
    }

    /// Number of timers armed from a stopped state since creation.
    pub fn timers_created(&self) -> u64 {
        self.timer().created
    }

    pub fn broadcasts(&self) -> u64 {
        self.timer().fired
    }

    /// Arms a timer one interval from now. A running monitor keeps its
    /// current timer.
    pub fn start(&self) {
        let mut timer = self.timer();
        if timer.deadline.is_none() {
            timer.deadline = Some(self.clock.now() + self.interval);
            timer.created += 1;
            tracing::debug!("Heartbeat started, interval {:?}", self.interval);
        }
    }

    pub fn stop(&self) {
        if self.timer().deadline.take().is_some() {
            tracing::debug!("Heartbeat stopped");
        }
    }

    /// Tears the timer down and arms a fresh one.
    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    /// Fires the timer if it is due. Returns the broadcast result when it
    /// fired.
    pub fn poll(&self) -> Option<BroadcastReport> {
        {
            let mut timer = self.timer();
            match timer.deadline {
                Some(deadline) if self.clock.now() >= deadline => timer.fired += 1,
                _ => return None,
            }
        }

        let report = self.broadcast();

        let mut timer = self.timer();
        if timer.deadline.is_some() {
            if self.registry.is_empty() {
                timer.deadline = None;
                tracing::debug!("Heartbeat stopped, no devices left");
            } else {
                timer.deadline = Some(self.clock.now() + self.interval);
            }
        }
        Some(report)
    }

    /// Pings each registered device in turn, waiting for each reply before
    /// moving on.
    pub fn broadcast(&self) -> BroadcastReport {
        let devices = self.registry.snapshot();
        let mut report = BroadcastReport {
            pinged: devices.len(),
            ..Default::default()
        };

        for device in &devices {
            match device.ping() {
                Ok(pid) => {
                    report.answered += 1;
                    self.lock_misses().remove(&device_key(device));
                    tracing::trace!(device = %device.config().id, pid, "heartbeat ok");
                }
                Err(e) => {
                    if self.record_miss(device, &e) {
                        report.evicted.push(device.config().id.clone());
                    }
                }
            }
        }

        let live: Vec<usize> = self.registry.snapshot().iter().map(device_key).collect();
        self.lock_misses().retain(|k, _| live.contains(k));
        report
    }

    fn lock_misses(&self) -> MutexGuard<'_, HashMap<usize, u32>> {
        self.misses.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Counts a miss and evicts the device at the limit. Returns whether
    /// the device was evicted.
    fn record_miss(&self, device: &Arc<ProxyDevice>, err: &ProxyError) -> bool {
        let missed = {
            let mut misses = self.lock_misses();
            let count = misses.entry(device_key(device)).or_insert(0);
            *count += 1;
            *count
        };
        tracing::warn!(
            device = %device.config().id,
            pid = device.remote_pid().unwrap_or(-1),
            missed,
            "Heartbeat missed: {}",
            err
        );

        if self.max_missed == 0 || missed < self.max_missed {
            return false;
        }
        tracing::error!(device = %device.config().id, "Evicting unresponsive remote");
        self.lock_misses().remove(&device_key(device));
        self.registry.unlink(device);
        device.teardown();
        true
    }
}

/// Background thread that polls a monitor until stopped.
pub struct HeartbeatDriver {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatDriver {
    pub fn spawn(monitor: Arc<HeartbeatMonitor>, period: Duration) -> std::io::Result<Self> {
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("proxy-heartbeat".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(report) = monitor.poll() {
                            tracing::debug!(
                                pinged = report.pinged,
                                answered = report.answered,
                                "Heartbeat broadcast"
                            );
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatDriver {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(interval_ms: u64) -> (HeartbeatMonitor, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::default());
        let config = HeartbeatConfig {
            interval_ms,
            max_missed: 2,
        };
        (
            HeartbeatMonitor::new(DeviceRegistry::new(), clock.clone(), &config),
            clock,
        )
    }

    #[test]
    fn test_start_is_idempotent() {
        let (hb, _clock) = monitor(100);
        assert_eq!(hb.state(), HeartbeatState::Stopped);
        hb.start();
        hb.start();
        assert_eq!(hb.state(), HeartbeatState::Running);
        assert_eq!(hb.timers_created(), 1);
        assert_eq!(hb.deadline(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_restart_arms_fresh_timer() {
        let (hb, clock) = monitor(100);
        hb.start();
        clock.advance(Duration::from_millis(60));
        hb.restart();
        assert_eq!(hb.timers_created(), 2);
        assert_eq!(hb.deadline(), Some(Duration::from_millis(160)));
    }

    #[test]
    fn test_poll_waits_for_deadline() {
        let (hb, clock) = monitor(100);
        assert!(hb.poll().is_none());
        hb.start();
        clock.advance(Duration::from_millis(99));
        assert!(hb.poll().is_none());
        clock.advance(Duration::from_millis(1));
        let report = hb.poll().unwrap();
        assert_eq!(report.pinged, 0);
        // Empty registry: the timer does not re-arm.
        assert_eq!(hb.state(), HeartbeatState::Stopped);
    }

    #[test]
    fn test_driver_stops_on_shutdown() {
        let (hb, _clock) = monitor(100);
        let driver = HeartbeatDriver::spawn(Arc::new(hb), Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        driver.shutdown();
    }
}

// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

mod common;

use common::{device_config, DeadOnceLauncher, InProcessLauncher, SilentLauncher};
use labwired_proxy::{
    Command, ConfigSpaceProxy, HeartbeatState, IntxRouter, ProxyHost, StaticIntxRouter,
    VirtualClock,
};
use labwired_proxy_config::{HeartbeatConfig, ProxyManifest};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_millis(1000);

fn host(
    max_missed: u32,
    reply_timeout_ms: u64,
) -> (ProxyHost, Arc<VirtualClock>, Arc<StaticIntxRouter>) {
    let manifest = ProxyManifest {
        reply_timeout_ms: Some(reply_timeout_ms),
        heartbeat: HeartbeatConfig {
            interval_ms: INTERVAL.as_millis() as u64,
            max_missed,
        },
        ..Default::default()
    };
    let clock = Arc::new(VirtualClock::default());
    let router = Arc::new(StaticIntxRouter::new([Some(32), Some(33), Some(34), Some(35)]));
    let host = ProxyHost::new(&manifest, router.clone(), clock.clone());
    (host, clock, router)
}

#[test]
fn test_attach_detach_any_order_leaves_stopped() {
    let (host, _clock, router) = host(3, 5000);
    let launcher = InProcessLauncher::new(&[]);
    let devices: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| host.create_device(&device_config(id)).unwrap())
        .collect();

    for dev in &devices {
        host.attach_with(dev, &launcher).unwrap();
    }
    assert_eq!(host.registry().len(), 4);
    assert_eq!(host.heartbeat().state(), HeartbeatState::Running);
    // Later attaches reuse the first timer.
    assert_eq!(host.heartbeat().timers_created(), 1);
    assert_eq!(router.active().len(), 4);

    for idx in [2, 0, 3, 1] {
        assert!(host.detach(&devices[idx]));
        assert!(!host.registry().contains(&devices[idx]));
    }
    assert!(host.registry().is_empty());
    assert_eq!(host.heartbeat().state(), HeartbeatState::Stopped);
    assert!(router.active().is_empty());
}

#[test]
fn test_attach_is_idempotent() {
    let (host, _clock, _router) = host(3, 5000);
    let launcher = InProcessLauncher::new(&[]);
    let dev = host.create_device(&device_config("once")).unwrap();
    host.attach_with(&dev, &launcher).unwrap();
    let pid = dev.remote_pid();
    host.attach_with(&dev, &launcher).unwrap();
    assert_eq!(dev.remote_pid(), pid);
    assert_eq!(host.registry().len(), 1);
}

#[test]
fn test_detach_with_devices_left_restarts_timer() {
    let (host, clock, _router) = host(3, 5000);
    let launcher = InProcessLauncher::new(&[]);
    let a = host.create_device(&device_config("a")).unwrap();
    let b = host.create_device(&device_config("b")).unwrap();
    host.attach_with(&a, &launcher).unwrap();
    host.attach_with(&b, &launcher).unwrap();

    clock.advance(INTERVAL / 2);
    host.detach(&a);
    assert_eq!(host.heartbeat().state(), HeartbeatState::Running);
    assert_eq!(host.heartbeat().timers_created(), 2);
    assert_eq!(host.heartbeat().deadline(), Some(INTERVAL / 2 + INTERVAL));
}

#[test]
fn test_reattach_fires_exactly_one_broadcast_after_interval() {
    let (host, clock, _router) = host(3, 5000);
    let launcher = InProcessLauncher::new(&[]);

    let first = host.create_device(&device_config("first")).unwrap();
    host.attach_with(&first, &launcher).unwrap();
    host.detach(&first);
    assert_eq!(host.heartbeat().state(), HeartbeatState::Stopped);

    clock.advance(Duration::from_secs(10));
    let second = host.create_device(&device_config("second")).unwrap();
    host.attach_with(&second, &launcher).unwrap();
    assert_eq!(host.heartbeat().timers_created(), 2);

    clock.advance(INTERVAL - Duration::from_millis(1));
    assert!(host.heartbeat().poll().is_none());
    clock.advance(Duration::from_millis(1));
    let report = host.heartbeat().poll().unwrap();
    assert_eq!(report.pinged, 1);
    assert_eq!(report.answered, 1);
    assert!(host.heartbeat().poll().is_none());

    let link = second.link().unwrap();
    assert_eq!(link.metrics().get_sent(Command::PING), 1);
    assert_eq!(host.heartbeat().state(), HeartbeatState::Running);
}

#[test]
fn test_unresponsive_device_is_evicted() {
    let (host, clock, _router) = host(2, 20);
    let alive = host.create_device(&device_config("alive")).unwrap();
    let silent = host.create_device(&device_config("silent")).unwrap();
    host.attach_with(&silent, &SilentLauncher).unwrap();
    host.attach_with(&alive, &InProcessLauncher::new(&[])).unwrap();

    clock.advance(INTERVAL);
    let report = host.heartbeat().poll().unwrap();
    // The miss does not stop the broadcast from reaching the next device.
    assert_eq!((report.pinged, report.answered), (2, 1));
    assert!(report.evicted.is_empty());
    assert_eq!(host.registry().len(), 2);

    clock.advance(INTERVAL);
    let report = host.heartbeat().poll().unwrap();
    assert_eq!(report.evicted, vec!["silent".to_string()]);
    assert_eq!(host.registry().len(), 1);
    assert!(silent.link().unwrap().is_closed());
    assert_eq!(host.heartbeat().state(), HeartbeatState::Running);
}

#[test]
fn test_evicting_last_device_stops_heartbeat() {
    let (host, clock, _router) = host(1, 20);
    let silent = host.create_device(&device_config("silent")).unwrap();
    host.attach_with(&silent, &SilentLauncher).unwrap();

    clock.advance(INTERVAL);
    let report = host.heartbeat().poll().unwrap();
    assert_eq!(report.evicted.len(), 1);
    assert!(host.registry().is_empty());
    assert_eq!(host.heartbeat().state(), HeartbeatState::Stopped);
}

#[test]
fn test_repeated_irq_setup_keeps_one_route() {
    let (host, _clock, router) = host(3, 5000);
    let dev = host.create_device(&device_config("irq")).unwrap();
    host.attach_with(&dev, &InProcessLauncher::new(&[])).unwrap();
    let first = dev.interrupt_forwarder().unwrap();
    assert_eq!(router.active(), vec![(first.irq().as_raw_fd(), 32)]);

    dev.setup_irqfd(router.clone()).unwrap();
    let second = dev.interrupt_forwarder().unwrap();
    assert_eq!(router.active(), vec![(second.irq().as_raw_fd(), 32)]);
    assert_eq!(first.active_gsi(), None);

    // Routing recomputation moves the single entry.
    router.set_route(0, Some(40));
    assert_eq!(router.active(), vec![(second.irq().as_raw_fd(), 40)]);
    assert_eq!(router.route_intx(0), Some(40));
}

#[test]
fn test_device_without_id_attaches_without_interrupts() {
    let (host, _clock, router) = host(3, 5000);
    let dev = host.create_device(&device_config("")).unwrap();
    host.attach_with(&dev, &InProcessLauncher::new(&[])).unwrap();
    assert!(dev.interrupt_forwarder().is_none());
    assert!(router.active().is_empty());
    assert_eq!(host.registry().len(), 1);
}

#[test]
fn test_attached_device_reads_remote_registers() {
    let (host, _clock, _router) = host(3, 5000);
    let dev = host.create_device(&device_config("regs")).unwrap();
    let launcher = InProcessLauncher::new(&[(0x10, 0x1234_5678)]);
    host.attach_with(&dev, &launcher).unwrap();
    assert_eq!(dev.config_read(0x10, 4).unwrap(), 0x1234_5678);
    assert_eq!(dev.ping().unwrap(), dev.remote_pid().unwrap() as u64);
    host.shutdown();
    assert!(host.registry().is_empty());
}

#[test]
fn test_failed_ready_leaves_device_reattachable() {
    let (host, _clock, router) = host(3, 5000);
    let launcher = DeadOnceLauncher::new(&[(0x10, 0x1234_5678)]);
    let dev = host.create_device(&device_config("retry")).unwrap();

    assert!(host.attach_with(&dev, &launcher).is_err());
    assert!(!dev.is_realized());
    assert_eq!(dev.remote_pid(), None);
    assert!(host.registry().is_empty());
    assert_eq!(host.heartbeat().state(), HeartbeatState::Stopped);
    assert!(router.active().is_empty());
    assert_eq!(router.notifier_count(), 0);

    host.attach_with(&dev, &launcher).unwrap();
    assert_eq!(host.registry().len(), 1);
    assert_eq!(router.active().len(), 1);
    assert_eq!(router.notifier_count(), 1);
    assert_eq!(dev.config_read(0x10, 4).unwrap(), 0x1234_5678);
}

#[test]
fn test_detach_unregisters_routing_callbacks() {
    let (host, _clock, router) = host(3, 5000);
    let launcher = InProcessLauncher::new(&[]);
    for round in 0..10 {
        let dev = host
            .create_device(&device_config(&format!("d{}", round)))
            .unwrap();
        host.attach_with(&dev, &launcher).unwrap();
        dev.setup_irqfd(router.clone()).unwrap();
        assert_eq!(router.notifier_count(), 1);
        host.detach(&dev);
    }
    assert_eq!(router.notifier_count(), 0);
}

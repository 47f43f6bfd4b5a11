// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Out-of-process PCI device proxying.
//!
//! A [`ProxyDevice`] stands in for a device emulated by a separate remote
//! process. Configuration-space and bar accesses are forwarded over a
//! [`Channel`], interrupts come back through eventfds bound to the
//! hypervisor's routing, and a [`HeartbeatMonitor`] probes every attached
//! remote.

#![cfg(unix)]

pub mod channel;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod host;
pub mod irq;
pub mod launcher;
pub mod link;
pub mod message;
pub mod metrics;
pub mod pci;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod wait;

pub use channel::{Channel, ChannelError};
pub use error::{ProxyError, ProxyResult};
pub use event::EventNotifier;
pub use heartbeat::{Clock, HeartbeatDriver, HeartbeatMonitor, HeartbeatState, SystemClock, VirtualClock};
pub use host::ProxyHost;
pub use irq::{InterruptForwarder, IntxRouter, KvmIrqfdRouter, StaticIntxRouter};
pub use launcher::{AttachLauncher, ProcessLauncher, RemoteProcess, SpawnLauncher};
pub use link::ProxyLink;
pub use message::{Command, Message, Payload};
pub use metrics::LinkMetrics;
pub use proxy::{BarProxy, ConfigSpaceProxy, ProxyDevice};
pub use registry::DeviceRegistry;
pub use remote::{RegisterFileDevice, RemoteDevice, RemoteServer};
pub use wait::{WaitError, WaitRegistry, WaitToken};

// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Remote side of a channel: decodes proxy requests, hands them to a
//! [`RemoteDevice`] and answers the ones that expect a reply.

use crate::channel::{Channel, ChannelError};
use crate::error::{ProxyError, ProxyResult};
use crate::event::EventNotifier;
use crate::message::{Command, Message, Payload};
use std::collections::BTreeMap;

/// Device model hosted by a remote process.
pub trait RemoteDevice: Send {
    fn config_read(&mut self, addr: u32, len: u32) -> u32;

    fn config_write(&mut self, addr: u32, value: u32, len: u32);

    fn bar_read(&mut self, addr: u64, size: u32, memory: bool) -> u64;

    fn bar_write(&mut self, addr: u64, value: u64, size: u32, memory: bool);

    /// Interrupt and resample notifiers for legacy interrupt `intx`.
    fn set_irqfd(&mut self, intx: i32, irq: EventNotifier, resample: EventNotifier) {
        let _ = (irq, resample);
        tracing::debug!(intx, "Device ignores interrupt notifiers");
    }

    fn set_options(&mut self, options: serde_json::Value) {
        tracing::debug!("Device ignores options {}", options);
    }

    /// Opcodes at or above [`Command::DEVICE_BASE`].
    fn device_command(&mut self, command: Command, payload: &[u8], bytestream: &[u8]) {
        tracing::warn!(
            "Unhandled {} ({} + {} bytes)",
            command,
            payload.len(),
            bytestream.len()
        );
    }
}

pub struct RemoteServer<D> {
    channel: Channel,
    device: D,
    pid: u32,
    served: u64,
}

impl<D: RemoteDevice> RemoteServer<D> {
    pub fn new(channel: Channel, device: D) -> Self {
        Self {
            channel,
            device,
            pid: std::process::id(),
            served: 0,
        }
    }

    /// Overrides the pid reported in heartbeat replies.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    /// Serves requests until the proxy closes the channel.
    pub fn serve(&mut self) -> ProxyResult<()> {
        loop {
            let msg = match self.channel.recv() {
                Ok(msg) => msg,
                Err(ChannelError::Closed) => {
                    tracing::info!("Proxy closed the channel after {} requests", self.served);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(reply) = self.handle(msg)? {
                self.channel.send(&reply)?;
            }
        }
    }

    /// Applies one request; returns the reply to send, if any.
    pub fn handle(&mut self, msg: Message) -> ProxyResult<Option<Message>> {
        self.served += 1;
        let Message {
            command,
            device_id,
            payload,
            bytestream,
            fds,
        } = msg;
        tracing::debug!(device = ?device_id, "{}", command);

        let reply = match (command, payload) {
            (Command::PING, Payload::Ping(p)) => Some(Message::reply(p.wait, self.pid as u64)),
            (Command::CONFIG_READ, Payload::Config(c)) => {
                let value = self.device.config_read(c.addr, c.len);
                Some(Message::reply(c.wait, value as u64))
            }
            (Command::CONFIG_WRITE, Payload::Config(c)) => {
                self.device.config_write(c.addr, c.value, c.len);
                None
            }
            (Command::BAR_READ, Payload::Bar(b)) => {
                let value = self.device.bar_read(b.addr, b.size, b.is_memory());
                Some(Message::reply(b.wait, value))
            }
            (Command::BAR_WRITE, Payload::Bar(b)) => {
                self.device.bar_write(b.addr, b.value, b.size, b.is_memory());
                None
            }
            (Command::SET_IRQFD, Payload::SetIrqfd(s)) => {
                let mut fds = fds.into_iter();
                match (fds.next(), fds.next()) {
                    (Some(irq), Some(resample)) => self.device.set_irqfd(
                        s.intx,
                        EventNotifier::from_owned_fd(irq),
                        EventNotifier::from_owned_fd(resample),
                    ),
                    _ => return Err(ProxyError::Transport("SET_IRQFD without descriptors".into())),
                }
                None
            }
            (Command::DEVICE_OPTIONS, _) => {
                match serde_json::from_slice(&bytestream) {
                    Ok(options) => self.device.set_options(options),
                    Err(e) => tracing::warn!("Ignoring malformed device options: {}", e),
                }
                None
            }
            (c, Payload::Raw(raw)) if c.is_device_specific() => {
                self.device.device_command(c, &raw, &bytestream);
                None
            }
            (c, _) => {
                tracing::warn!("Ignoring unexpected {} from proxy", c);
                None
            }
        };
        Ok(reply)
    }
}

fn len_mask(len: u32) -> u64 {
    match len {
        0 => 0,
        1..=7 => (1u64 << (8 * len)) - 1,
        _ => u64::MAX,
    }
}

/// Sparse register file: reads return the last written (or preset) value,
/// unknown addresses read as zero. A write to the doorbell address raises
/// the interrupt, if one was provided.
#[derive(Debug, Default)]
pub struct RegisterFileDevice {
    config: BTreeMap<u32, u32>,
    bar: BTreeMap<u64, u64>,
    doorbell: Option<u64>,
    irq: Option<EventNotifier>,
    resample: Option<EventNotifier>,
    options: Option<serde_json::Value>,
}

impl RegisterFileDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_reg(mut self, addr: u32, value: u32) -> Self {
        self.config.insert(addr, value);
        self
    }

    pub fn with_bar_reg(mut self, addr: u64, value: u64) -> Self {
        self.bar.insert(addr, value);
        self
    }

    pub fn with_doorbell(mut self, addr: u64) -> Self {
        self.doorbell = Some(addr);
        self
    }

    pub fn config_reg(&self, addr: u32) -> Option<u32> {
        self.config.get(&addr).copied()
    }

    pub fn bar_reg(&self, addr: u64) -> Option<u64> {
        self.bar.get(&addr).copied()
    }

    pub fn options(&self) -> Option<&serde_json::Value> {
        self.options.as_ref()
    }

    pub fn has_irq(&self) -> bool {
        self.irq.is_some() && self.resample.is_some()
    }
}

impl RemoteDevice for RegisterFileDevice {
    fn config_read(&mut self, addr: u32, len: u32) -> u32 {
        let value = self.config.get(&addr).copied().unwrap_or(0);
        (value as u64 & len_mask(len)) as u32
    }

    fn config_write(&mut self, addr: u32, value: u32, len: u32) {
        self.config
            .insert(addr, (value as u64 & len_mask(len)) as u32);
    }

    fn bar_read(&mut self, addr: u64, size: u32, _memory: bool) -> u64 {
        self.bar.get(&addr).copied().unwrap_or(0) & len_mask(size)
    }

    fn bar_write(&mut self, addr: u64, value: u64, size: u32, _memory: bool) {
        self.bar.insert(addr, value & len_mask(size));
        if self.doorbell == Some(addr) {
            if let Some(irq) = &self.irq {
                if let Err(e) = irq.signal() {
                    tracing::error!("Failed to raise interrupt: {}", e);
                }
            }
        }
    }

    fn set_irqfd(&mut self, intx: i32, irq: EventNotifier, resample: EventNotifier) {
        tracing::info!(intx, "Interrupt notifiers installed");
        self.irq = Some(irq);
        self.resample = Some(resample);
    }

    fn set_options(&mut self, options: serde_json::Value) {
        tracing::info!("Device options {}", options);
        self.options = Some(options);
    }
}

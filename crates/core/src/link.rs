// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Proxy side of a channel: a dispatcher thread that routes replies to
//! waiting requesters, and a request/reply helper on top of it.

use crate::channel::{Channel, ChannelError};
use crate::error::{ProxyError, ProxyResult};
use crate::message::{Command, Message, Payload};
use crate::metrics::LinkMetrics;
use crate::wait::{WaitError, WaitRegistry};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct ProxyLink {
    label: String,
    channel: Arc<Channel>,
    waits: Arc<WaitRegistry>,
    metrics: Arc<LinkMetrics>,
    reply_timeout: Duration,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProxyLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLink")
            .field("label", &self.label)
            .field("channel", &self.channel)
            .finish()
    }
}

impl ProxyLink {
    /// Takes ownership of `channel` and starts its dispatcher thread.
    pub fn start(channel: Channel, label: &str, reply_timeout: Duration) -> ProxyResult<Self> {
        let channel = Arc::new(channel);
        let waits = WaitRegistry::new();
        let metrics = Arc::new(LinkMetrics::new());

        let handle = {
            let channel = Arc::clone(&channel);
            let waits = Arc::clone(&waits);
            let metrics = Arc::clone(&metrics);
            let label = label.to_owned();
            thread::Builder::new()
                .name(format!("proxy-link-{}", label))
                .spawn(move || dispatch(&label, &channel, &waits, &metrics))
                .map_err(|e| ProxyError::Transport(e.to_string()))?
        };

        Ok(Self {
            label: label.to_owned(),
            channel,
            waits,
            metrics,
            reply_timeout,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn metrics(&self) -> &LinkMetrics {
        &self.metrics
    }

    pub fn waits(&self) -> &Arc<WaitRegistry> {
        &self.waits
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.waits.is_closed()
    }

    /// Fire-and-forget send.
    pub fn send(&self, msg: &Message) -> ProxyResult<()> {
        self.channel.send(msg)?;
        self.metrics.record_sent(msg.command);
        Ok(())
    }

    /// Sends the message built around a fresh wait token and blocks for the
    /// reply value.
    pub fn call(&self, build: impl FnOnce(u64) -> Message) -> ProxyResult<u64> {
        let token = self.waits.acquire();
        let msg = build(token.id());
        self.send(&msg)?;
        match token.wait(self.reply_timeout) {
            Ok(value) => Ok(value),
            Err(WaitError::TimedOut(d)) => {
                self.metrics.record_timeout();
                tracing::warn!("{}: {} got no reply within {:?}", self.label, msg.command, d);
                Err(ProxyError::Timeout(d))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Closes the channel, fails pending waits and joins the dispatcher.
    pub fn close(&self) {
        self.channel.shutdown();
        self.waits.close();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ProxyLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch(label: &str, channel: &Channel, waits: &WaitRegistry, metrics: &LinkMetrics) {
    loop {
        let msg = match channel.recv() {
            Ok(msg) => msg,
            Err(ChannelError::Closed) => {
                tracing::debug!("{}: remote closed the channel", label);
                break;
            }
            Err(e) => {
                tracing::error!("{}: dropping link: {}", label, e);
                break;
            }
        };
        metrics.record_received();

        match (msg.command, &msg.payload) {
            (Command::REPLY, Payload::Reply(reply)) => {
                let matched = waits.resolve(reply.wait, reply.value);
                metrics.record_reply(matched);
            }
            (command, _) => {
                tracing::warn!("{}: ignoring unsolicited {} from remote", label, command);
            }
        }
    }
    channel.shutdown();
    waits.close();
}

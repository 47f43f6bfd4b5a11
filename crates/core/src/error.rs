// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::channel::ChannelError;
use crate::message::FrameError;
use crate::wait::WaitError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel closed by peer")]
    ChannelClosed,
    #[error("failed to spawn remote process: {0}")]
    Spawn(String),
    #[error("failed to attach to remote process: {0}")]
    Attach(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("failed to allocate message payload")]
    Resource(#[from] std::collections::TryReserveError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no reply from remote within {0:?}")]
    Timeout(std::time::Duration),
    #[error("remote disconnected before replying")]
    Disconnected,
    #[error("device has no channel to a remote process")]
    NotRealized,
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<ChannelError> for ProxyError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => ProxyError::ChannelClosed,
            ChannelError::Frame(FrameError::Resource(e)) => ProxyError::Resource(e),
            other => ProxyError::Transport(other.to_string()),
        }
    }
}

impl From<FrameError> for ProxyError {
    fn from(err: FrameError) -> Self {
        ChannelError::Frame(err).into()
    }
}

impl From<WaitError> for ProxyError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut(d) => ProxyError::Timeout(d),
            WaitError::Disconnected => ProxyError::Disconnected,
        }
    }
}

impl ProxyError {
    /// Negative errno-style status for callers that only propagate a code.
    pub fn errno(&self) -> i32 {
        match self {
            ProxyError::InvalidArgument(_) | ProxyError::Configuration(_) => -libc::EINVAL,
            ProxyError::Resource(_) => -libc::ENOMEM,
            ProxyError::Timeout(_) => -libc::ETIMEDOUT,
            ProxyError::ChannelClosed | ProxyError::Disconnected => -libc::ENOTCONN,
            ProxyError::NotRealized => -libc::ENODEV,
            ProxyError::Spawn(_) | ProxyError::Attach(_) => -libc::ECHILD,
            ProxyError::Transport(_) => -libc::EIO,
        }
    }
}

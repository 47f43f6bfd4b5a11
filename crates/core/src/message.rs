// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Wire format shared by the proxy and the remote device process.
//!
//! A frame is a fixed [`Header`] followed by the device id, the
//! command-specific fixed payload and an opaque variable payload. Every
//! length is carried in the header; nothing is inferred from content.
//! Auxiliary file descriptors travel out-of-band and their count is a
//! function of the command alone.

use std::collections::TryReserveError;
use std::fmt;
use std::os::fd::OwnedFd;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();
pub const MAX_DEVICE_ID_LEN: usize = 256;
pub const MAX_FRAME_SIZE: usize = 1 << 20;
/// Upper bound on descriptors carried by any single frame.
pub const MAX_FDS: usize = 8;

/// Command code. Codes at or above [`Command::DEVICE_BASE`] are reserved for
/// device-specific opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Command(pub u32);

impl Command {
    pub const CONFIG_READ: Self = Self(1);
    pub const CONFIG_WRITE: Self = Self(2);
    pub const BAR_READ: Self = Self(3);
    pub const BAR_WRITE: Self = Self(4);
    pub const SET_IRQFD: Self = Self(5);
    pub const PING: Self = Self(6);
    /// Remote to proxy: value for an outstanding wait token.
    pub const REPLY: Self = Self(7);
    pub const DEVICE_OPTIONS: Self = Self(8);

    pub const DEVICE_BASE: u32 = 0x100;

    pub const fn device(code: u32) -> Self {
        Self(Self::DEVICE_BASE + code)
    }

    pub fn is_device_specific(self) -> bool {
        self.0 >= Self::DEVICE_BASE
    }

    pub fn is_known(self) -> bool {
        self.is_device_specific() || (Self::CONFIG_READ.0..=Self::DEVICE_OPTIONS.0).contains(&self.0)
    }

    /// Number of auxiliary descriptors that must accompany this command.
    pub fn fd_count(self) -> usize {
        match self {
            Self::SET_IRQFD => 2,
            _ => 0,
        }
    }

    pub fn expects_reply(self) -> bool {
        matches!(self, Self::PING | Self::CONFIG_READ | Self::BAR_READ)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CONFIG_READ => "CONFIG_READ",
            Self::CONFIG_WRITE => "CONFIG_WRITE",
            Self::BAR_READ => "BAR_READ",
            Self::BAR_WRITE => "BAR_WRITE",
            Self::SET_IRQFD => "SET_IRQFD",
            Self::PING => "PING",
            Self::REPLY => "REPLY",
            Self::DEVICE_OPTIONS => "DEVICE_OPTIONS",
            c if c.is_device_specific() => "DEVICE",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_device_specific() {
            write!(f, "DEVICE({:#x})", self.0 - Self::DEVICE_BASE)
        } else {
            write!(f, "{}", self.name())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame header too short ({0} bytes)")]
    ShortHeader(usize),
    #[error("unknown command {0:#x}")]
    UnknownCommand(u32),
    #[error("device id of {0} bytes exceeds limit")]
    DeviceIdTooLong(usize),
    #[error("device id is not valid UTF-8")]
    DeviceIdEncoding,
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("{command} carries {actual} descriptors, expected {expected}")]
    FdCount {
        command: Command,
        expected: usize,
        actual: usize,
    },
    #[error("{command} has a {actual} byte fixed payload, expected {expected}")]
    FixedLen {
        command: Command,
        expected: usize,
        actual: usize,
    },
    #[error("body is {actual} bytes, header announces {expected}")]
    BodyLen { expected: usize, actual: usize },
    #[error(transparent)]
    Resource(#[from] TryReserveError),
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Header {
    pub command: u32,
    pub device_id_len: u32,
    pub fixed_len: u32,
    pub variable_len: u32,
    pub fd_count: u32,
}

impl Header {
    /// Parses and bounds-checks a header.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let (header, _) =
            Header::read_from_prefix(bytes).map_err(|_| FrameError::ShortHeader(bytes.len()))?;
        let command = Command(header.command);
        if !command.is_known() {
            return Err(FrameError::UnknownCommand(header.command));
        }
        if header.device_id_len as usize > MAX_DEVICE_ID_LEN {
            return Err(FrameError::DeviceIdTooLong(header.device_id_len as usize));
        }
        let total = HEADER_SIZE as u64
            + header.device_id_len as u64
            + header.fixed_len as u64
            + header.variable_len as u64;
        if total > MAX_FRAME_SIZE as u64 {
            return Err(FrameError::TooLarge(total as usize));
        }
        if header.fd_count as usize != command.fd_count() {
            return Err(FrameError::FdCount {
                command,
                expected: command.fd_count(),
                actual: header.fd_count as usize,
            });
        }
        Ok(header)
    }

    pub fn command(&self) -> Command {
        Command(self.command)
    }

    /// Bytes following the header.
    pub fn body_len(&self) -> usize {
        self.device_id_len as usize + self.fixed_len as usize + self.variable_len as usize
    }
}

/// Configuration-space access. Reads carry a wait token, writes carry a value.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ConfigAccess {
    pub addr: u32,
    pub value: u32,
    pub len: u32,
    pub reserved: u32,
    pub wait: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct BarAccess {
    /// Absolute address: bar base plus offset.
    pub addr: u64,
    pub value: u64,
    pub size: u32,
    /// Non-zero for memory space, zero for IO space.
    pub memory: u32,
    pub wait: u64,
}

impl BarAccess {
    pub fn is_memory(&self) -> bool {
        self.memory != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SetIrqfd {
    /// Legacy interrupt index (pin - 1), or -1 when the function has no pin.
    pub intx: i32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Ping {
    pub wait: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Reply {
    pub wait: u64,
    pub value: u64,
}

/// Command-specific fixed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Config(ConfigAccess),
    Bar(BarAccess),
    SetIrqfd(SetIrqfd),
    Ping(Ping),
    Reply(Reply),
    /// Device-specific opcodes carry an uninterpreted fixed payload.
    Raw(Vec<u8>),
}

impl Payload {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::None => &[],
            Payload::Config(p) => p.as_bytes(),
            Payload::Bar(p) => p.as_bytes(),
            Payload::SetIrqfd(p) => p.as_bytes(),
            Payload::Ping(p) => p.as_bytes(),
            Payload::Reply(p) => p.as_bytes(),
            Payload::Raw(v) => v,
        }
    }

    fn decode(command: Command, bytes: &[u8]) -> Result<Self, FrameError> {
        fn read<T: FromBytes>(command: Command, bytes: &[u8]) -> Result<T, FrameError> {
            T::read_from_bytes(bytes).map_err(|_| FrameError::FixedLen {
                command,
                expected: std::mem::size_of::<T>(),
                actual: bytes.len(),
            })
        }

        Ok(match command {
            Command::CONFIG_READ | Command::CONFIG_WRITE => Payload::Config(read(command, bytes)?),
            Command::BAR_READ | Command::BAR_WRITE => Payload::Bar(read(command, bytes)?),
            Command::SET_IRQFD => Payload::SetIrqfd(read(command, bytes)?),
            Command::PING => Payload::Ping(read(command, bytes)?),
            Command::REPLY => Payload::Reply(read(command, bytes)?),
            Command::DEVICE_OPTIONS if bytes.is_empty() => Payload::None,
            Command::DEVICE_OPTIONS => {
                return Err(FrameError::FixedLen {
                    command,
                    expected: 0,
                    actual: bytes.len(),
                })
            }
            c if c.is_device_specific() => {
                let mut raw = Vec::new();
                raw.try_reserve_exact(bytes.len())?;
                raw.extend_from_slice(bytes);
                Payload::Raw(raw)
            }
            c => return Err(FrameError::UnknownCommand(c.0)),
        })
    }

    /// Wait token carried by reply-expecting requests and by replies.
    pub fn wait_token(&self) -> Option<u64> {
        match self {
            Payload::Config(p) => Some(p.wait),
            Payload::Bar(p) => Some(p.wait),
            Payload::Ping(p) => Some(p.wait),
            Payload::Reply(p) => Some(p.wait),
            _ => None,
        }
    }
}

/// One unit of communication between the proxy and the remote process.
#[derive(Debug)]
pub struct Message {
    pub command: Command,
    pub device_id: Option<String>,
    pub payload: Payload,
    /// Variable-length payload, e.g. serialized device options.
    pub bytestream: Vec<u8>,
    /// Descriptors sent out-of-band. Received descriptors are owned by the
    /// message and closed when it is dropped.
    pub fds: Vec<OwnedFd>,
}

impl Message {
    pub fn new(command: Command, payload: Payload) -> Self {
        Self {
            command,
            device_id: None,
            payload,
            bytestream: Vec::new(),
            fds: Vec::new(),
        }
    }

    pub fn with_device_id(mut self, id: Option<&str>) -> Self {
        self.device_id = id.map(str::to_owned);
        self
    }

    pub fn ping(wait: u64) -> Self {
        Self::new(Command::PING, Payload::Ping(Ping { wait }))
    }

    pub fn reply(wait: u64, value: u64) -> Self {
        Self::new(Command::REPLY, Payload::Reply(Reply { wait, value }))
    }

    pub fn config_read(addr: u32, len: u32, wait: u64) -> Self {
        Self::new(
            Command::CONFIG_READ,
            Payload::Config(ConfigAccess {
                addr,
                len,
                wait,
                ..Default::default()
            }),
        )
    }

    pub fn config_write(addr: u32, value: u32, len: u32) -> Self {
        Self::new(
            Command::CONFIG_WRITE,
            Payload::Config(ConfigAccess {
                addr,
                value,
                len,
                ..Default::default()
            }),
        )
    }

    pub fn bar_read(addr: u64, size: u32, memory: bool, wait: u64) -> Self {
        Self::new(
            Command::BAR_READ,
            Payload::Bar(BarAccess {
                addr,
                size,
                memory: memory as u32,
                wait,
                ..Default::default()
            }),
        )
    }

    pub fn bar_write(addr: u64, value: u64, size: u32, memory: bool) -> Self {
        Self::new(
            Command::BAR_WRITE,
            Payload::Bar(BarAccess {
                addr,
                value,
                size,
                memory: memory as u32,
                wait: 0,
            }),
        )
    }

    pub fn set_irqfd(intx: i32, intr: OwnedFd, resample: OwnedFd) -> Self {
        let mut msg = Self::new(
            Command::SET_IRQFD,
            Payload::SetIrqfd(SetIrqfd { intx, reserved: 0 }),
        );
        msg.fds = vec![intr, resample];
        msg
    }

    pub fn device_options(bytestream: Vec<u8>) -> Self {
        let mut msg = Self::new(Command::DEVICE_OPTIONS, Payload::None);
        msg.bytestream = bytestream;
        msg
    }

    pub fn header(&self) -> Header {
        Header {
            command: self.command.0,
            device_id_len: self.device_id.as_ref().map_or(0, |id| id.len()) as u32,
            fixed_len: self.payload.as_bytes().len() as u32,
            variable_len: self.bytestream.len() as u32,
            fd_count: self.fds.len() as u32,
        }
    }

    /// Serializes header and body into a single buffer. Descriptors are not
    /// part of the buffer; the transport sends them alongside it.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if !self.command.is_known() {
            return Err(FrameError::UnknownCommand(self.command.0));
        }
        if self.fds.len() != self.command.fd_count() {
            return Err(FrameError::FdCount {
                command: self.command,
                expected: self.command.fd_count(),
                actual: self.fds.len(),
            });
        }
        let id = self.device_id.as_deref().unwrap_or("");
        if id.len() > MAX_DEVICE_ID_LEN {
            return Err(FrameError::DeviceIdTooLong(id.len()));
        }
        let header = self.header();
        let total = HEADER_SIZE + header.body_len();
        if total > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(total));
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(total)?;
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(self.payload.as_bytes());
        buf.extend_from_slice(&self.bytestream);
        Ok(buf)
    }

    /// Rebuilds a message from a parsed header, its body and the
    /// descriptors received with it.
    pub fn decode(header: &Header, body: &[u8], fds: Vec<OwnedFd>) -> Result<Self, FrameError> {
        let command = header.command();
        if body.len() != header.body_len() {
            return Err(FrameError::BodyLen {
                expected: header.body_len(),
                actual: body.len(),
            });
        }
        if fds.len() != command.fd_count() {
            return Err(FrameError::FdCount {
                command,
                expected: command.fd_count(),
                actual: fds.len(),
            });
        }

        let (id, rest) = body.split_at(header.device_id_len as usize);
        let (fixed, variable) = rest.split_at(header.fixed_len as usize);

        let device_id = if id.is_empty() {
            None
        } else {
            Some(
                std::str::from_utf8(id)
                    .map_err(|_| FrameError::DeviceIdEncoding)?
                    .to_owned(),
            )
        };

        let payload = Payload::decode(command, fixed)?;

        let mut bytestream = Vec::new();
        bytestream.try_reserve_exact(variable.len())?;
        bytestream.extend_from_slice(variable);

        Ok(Self {
            command,
            device_id,
            payload,
            bytestream,
            fds,
        })
    }

    /// Decodes a complete frame held in memory.
    pub fn decode_frame(frame: &[u8], fds: Vec<OwnedFd>) -> Result<Self, FrameError> {
        let header = Header::parse(frame)?;
        Self::decode(&header, &frame[HEADER_SIZE..], fds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        let frame = msg.encode().unwrap();
        Message::decode_frame(&frame, Vec::new()).unwrap()
    }

    #[test]
    fn test_config_read_round_trip() {
        let msg = Message::config_read(0x10, 4, 77).with_device_id(Some("lsi0"));
        let decoded = round_trip(&msg);
        assert_eq!(decoded.command, Command::CONFIG_READ);
        assert_eq!(decoded.device_id.as_deref(), Some("lsi0"));
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.payload.wait_token(), Some(77));
        assert!(decoded.fds.is_empty());
    }

    #[test]
    fn test_anonymous_bar_write_round_trip() {
        let msg = Message::bar_write(0x1004, 0xDEAD_BEEF, 4, true);
        let decoded = round_trip(&msg);
        assert_eq!(decoded.device_id, None);
        match decoded.payload {
            Payload::Bar(bar) => {
                assert_eq!(bar.addr, 0x1004);
                assert_eq!(bar.value, 0xDEAD_BEEF);
                assert!(bar.is_memory());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_options_bytestream_round_trip() {
        let msg = Message::device_options(br#"{"drive":"disk0"}"#.to_vec()).with_device_id(Some("d"));
        let decoded = round_trip(&msg);
        assert_eq!(decoded.payload, Payload::None);
        assert_eq!(decoded.bytestream, msg.bytestream);
        assert_eq!(decoded.header(), msg.header());
    }

    #[test]
    fn test_device_specific_raw_payload() {
        let msg = Message::new(Command::device(3), Payload::Raw(vec![1, 2, 3]));
        let decoded = round_trip(&msg);
        assert_eq!(decoded.command, Command::device(3));
        assert_eq!(decoded.payload, Payload::Raw(vec![1, 2, 3]));
        assert_eq!(decoded.command.to_string(), "DEVICE(0x3)");
    }

    #[test]
    fn test_set_irqfd_without_fds_is_rejected() {
        let msg = Message::new(Command::SET_IRQFD, Payload::SetIrqfd(SetIrqfd::default()));
        assert!(matches!(
            msg.encode(),
            Err(FrameError::FdCount {
                expected: 2,
                actual: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_header_rejects_unknown_command() {
        let header = Header {
            command: 0x42,
            ..Default::default()
        };
        assert!(matches!(
            Header::parse(header.as_bytes()),
            Err(FrameError::UnknownCommand(0x42))
        ));
    }

    #[test]
    fn test_header_rejects_oversized_frame() {
        let header = Header {
            command: Command::DEVICE_OPTIONS.0,
            variable_len: MAX_FRAME_SIZE as u32,
            ..Default::default()
        };
        assert!(matches!(
            Header::parse(header.as_bytes()),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn test_wrong_fixed_len_is_malformed() {
        let mut frame = Message::ping(1).encode().unwrap();
        // Shrink the announced fixed payload by one byte.
        let mut header = Header::parse(&frame).unwrap();
        header.fixed_len -= 1;
        frame[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        frame.pop();
        assert!(matches!(
            Message::decode_frame(&frame, Vec::new()),
            Err(FrameError::FixedLen { .. })
        ));
    }
}

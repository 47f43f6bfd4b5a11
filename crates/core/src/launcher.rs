// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Obtaining a remote process and a channel to it: either by spawning the
//! remote executable over a fresh socket pair, or by attaching to one that
//! is owned elsewhere.

use crate::channel::Channel;
use crate::error::{ProxyError, ProxyResult};
use labwired_proxy_config::{DeviceConfig, RemoteConfig};
use std::ffi::OsString;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread::{self, JoinHandle};

/// Upper bound on the remote argument vector, executable and fd included.
pub const MAX_REMOTE_ARGS: usize = 64;

/// A remote process and the local end of its channel.
#[derive(Debug)]
pub struct RemoteProcess {
    pub pid: i32,
    pub channel: Channel,
    /// Present when this process spawned the remote and must reap it.
    pub child: Option<Child>,
}

pub trait ProcessLauncher: Send + Sync {
    /// Establishes the remote for `device`. Returns `Ok(None)` when this
    /// launcher does not apply to the device's mode.
    fn launch(&self, device: &DeviceConfig) -> ProxyResult<Option<RemoteProcess>>;
}

/// Starts the well-known remote executable and owns the child.
#[derive(Debug, Clone)]
pub struct SpawnLauncher {
    exec_dir: PathBuf,
    executable: String,
}

impl SpawnLauncher {
    pub fn new(exec_dir: impl Into<PathBuf>, executable: impl Into<String>) -> Self {
        Self {
            exec_dir: exec_dir.into(),
            executable: executable.into(),
        }
    }

    pub fn from_config(remote: &RemoteConfig) -> ProxyResult<Self> {
        let dir = remote
            .resolved_exec_dir()
            .map_err(|e| ProxyError::Configuration(format!("{:#}", e)))?;
        Ok(Self::new(dir, remote.executable.clone()))
    }

    pub fn executable_path(&self) -> PathBuf {
        self.exec_dir.join(&self.executable)
    }

    /// `[executable, fd, command tokens...]`.
    pub fn build_argv(&self, fd: RawFd, command: &str) -> ProxyResult<Vec<OsString>> {
        let mut argv: Vec<OsString> = vec![
            self.executable_path().into_os_string(),
            fd.to_string().into(),
        ];
        argv.extend(command.split_whitespace().map(OsString::from));
        if argv.len() > MAX_REMOTE_ARGS {
            return Err(ProxyError::Spawn(format!(
                "{} arguments exceed the limit of {}",
                argv.len(),
                MAX_REMOTE_ARGS
            )));
        }
        Ok(argv)
    }

    /// Spawns the remote with `command` appended to its argument vector.
    /// Managed devices are owned elsewhere; for them this returns `Ok(None)`.
    pub fn spawn(&self, command: &str, managed: bool) -> ProxyResult<Option<RemoteProcess>> {
        if managed {
            return Ok(None);
        }

        let (local, remote) = UnixStream::pair()
            .map_err(|e| ProxyError::Spawn(format!("socket pair: {}", e)))?;
        let remote_fd = remote.as_raw_fd();
        let argv = self.build_argv(remote_fd, command)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                let flags = libc::fcntl(remote_fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(remote_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| ProxyError::Spawn(format!("{}: {}", Path::new(&argv[0]).display(), e)))?;
        drop(remote);

        let pid = child.id() as i32;
        tracing::info!(pid, "Spawned remote {}", self.executable_path().display());
        Ok(Some(RemoteProcess {
            pid,
            channel: Channel::new(local),
            child: Some(child),
        }))
    }
}

impl ProcessLauncher for SpawnLauncher {
    fn launch(&self, device: &DeviceConfig) -> ProxyResult<Option<RemoteProcess>> {
        self.spawn(&device.command, device.managed)
    }
}

/// Connects to an externally owned remote over its socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachLauncher;

impl AttachLauncher {
    pub fn attach(&self, pid: &str, socket: &Path) -> ProxyResult<RemoteProcess> {
        let pid = parse_pid(pid)?;
        let stream = UnixStream::connect(socket)
            .map_err(|e| ProxyError::Attach(format!("{}: {}", socket.display(), e)))?;
        tracing::info!(pid, "Attached to remote at {}", socket.display());
        Ok(RemoteProcess {
            pid,
            channel: Channel::new(stream),
            child: None,
        })
    }
}

impl ProcessLauncher for AttachLauncher {
    fn launch(&self, device: &DeviceConfig) -> ProxyResult<Option<RemoteProcess>> {
        if !device.managed {
            return Ok(None);
        }
        let pid = device
            .pid
            .as_deref()
            .ok_or_else(|| ProxyError::Attach("managed device without a pid".into()))?;
        let socket = device
            .socket
            .as_deref()
            .ok_or_else(|| ProxyError::Attach("managed device without a socket".into()))?;
        self.attach(pid, socket).map(Some)
    }
}

/// Parses an externally supplied pid. `-1` is the "no process" sentinel.
pub fn parse_pid(pid: &str) -> ProxyResult<i32> {
    match pid.trim().parse::<i32>() {
        Ok(-1) => Err(ProxyError::Attach("pid is the -1 sentinel".into())),
        Ok(pid) if pid > 0 => Ok(pid),
        Ok(pid) => Err(ProxyError::Attach(format!("invalid pid {}", pid))),
        Err(e) => Err(ProxyError::Attach(format!("invalid pid '{}': {}", pid, e))),
    }
}

/// Picks the launcher matching the device's ownership mode.
pub fn launcher_for(device: &DeviceConfig, remote: &RemoteConfig) -> ProxyResult<Box<dyn ProcessLauncher>> {
    if device.managed {
        Ok(Box::new(AttachLauncher))
    } else {
        Ok(Box::new(SpawnLauncher::from_config(remote)?))
    }
}

/// Reaps `child` on a background thread and logs its exit. Nothing else
/// reacts to the death; the link notices when the channel closes.
pub fn watch_child(mut child: Child, label: &str) -> ProxyResult<JoinHandle<()>> {
    let label = label.to_owned();
    thread::Builder::new()
        .name(format!("remote-reaper-{}", label))
        .spawn(move || {
            let pid = child.id();
            match child.wait() {
                Ok(status) => tracing::warn!(pid, %status, "{}: remote process exited", label),
                Err(e) => tracing::error!(pid, "{}: failed to reap remote: {}", label, e),
            }
        })
        .map_err(|e| ProxyError::Spawn(e.to_string()))
}

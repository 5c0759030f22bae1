// 传输层接口：会话管理器只通过这些 trait 访问 SSH 连接
use crate::config::{AuthMethod, ConnectionTarget};
use crate::ssh::known_hosts::HostKey;
use crate::utils::error::{ConnectionError, TransportError};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// File attributes as reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteStat {
    pub size: u64,
    /// Raw mode bits, including the file type.
    pub permissions: u32,
    /// Seconds since the Unix epoch, 0 when unknown.
    pub modified: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub name: String,
    pub stat: RemoteStat,
}

pub type RemoteReader = Box<dyn Read + Send>;
pub type RemoteWriter = Box<dyn Write + Send>;

/// Forces the underlying socket closed so blocked protocol calls return.
#[derive(Debug)]
pub struct AbortHandle(TcpStream);

impl AbortHandle {
    pub fn new(stream: TcpStream) -> Self {
        Self(stream)
    }

    pub fn abort(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Opens transports. One call yields one socket with a completed SSH
/// handshake; authentication happens afterwards on the returned handle.
pub trait Connector: Send + Sync {
    fn open(&self, target: &ConnectionTarget, timeout: Option<Duration>) -> Result<Box<dyn Transport>, ConnectionError>;

    /// Whether an I/O error from a reader or writer means the connection is gone.
    fn is_connection_lost(&self, err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
        )
    }
}

/// One negotiated SSH connection. Not safe for concurrent use; the session
/// manager serializes every call. After `close` every primitive fails with
/// `TransportError::NotConnected`.
pub trait Transport: Send {
    /// Key presented by the server during the handshake.
    fn host_key(&self) -> Option<HostKey>;

    fn authenticate(&mut self, username: &str, auth: &AuthMethod) -> Result<(), ConnectionError>;

    /// Starts the SFTP subsystem once authenticated.
    fn start_sftp(&mut self) -> Result<(), ConnectionError>;

    fn abort_handle(&self) -> Option<AbortHandle>;

    fn read_dir(&mut self, path: &str) -> Result<Vec<RawEntry>, TransportError>;

    fn stat(&mut self, path: &str) -> Result<RemoteStat, TransportError>;

    fn realpath(&mut self, path: &str) -> Result<String, TransportError>;

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), TransportError>;

    fn unlink(&mut self, path: &str) -> Result<(), TransportError>;

    fn rmdir(&mut self, path: &str) -> Result<(), TransportError>;

    fn open_read(&mut self, path: &str) -> Result<RemoteReader, TransportError>;

    /// Creates or truncates `path`.
    fn open_write(&mut self, path: &str, mode: i32) -> Result<RemoteWriter, TransportError>;

    /// Runs `command` on a fresh channel; stdout and stderr are merged.
    fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<String, TransportError>;

    fn close(&mut self);
}

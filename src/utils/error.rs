// 错误类型
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the primitive transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("SSH error: {message}")]
    Protocol { message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// 连接已不可用，会话必须拆除
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ConnectionLost { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key for {host} is not trusted ({}); fingerprint {fingerprint}", trust_reason(.changed))]
    UntrustedHostKey {
        host: String,
        fingerprint: String,
        changed: bool,
    },

    #[error("Private key file does not exist: {}", .0.display())]
    InvalidKeyPath(PathBuf),

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("Failed to start SFTP subsystem: {0}")]
    Protocol(String),

    #[error("Connection attempt aborted by disconnect")]
    Aborted,

    #[error("Known hosts ledger error: {0}")]
    TrustStore(String),
}

fn trust_reason(changed: &bool) -> &'static str {
    if *changed {
        "key changed since it was accepted"
    } else {
        "unknown host"
    }
}

/// Errors of directory listing and the mkdir/rm/rmdir family.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("Not connected")]
    NotConnected,

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

pub type ListError = OpError;

impl From<TransportError> for OpError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected | TransportError::ConnectionLost { .. } => {
                OpError::NotConnected
            }
            TransportError::NotFound { path } => OpError::PathNotFound(path),
            TransportError::PermissionDenied { path } => OpError::PermissionDenied(path),
            other => OpError::ProtocolError(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Not connected")]
    NotConnected,

    #[error("Local IO error: {0}")]
    LocalIoError(String),

    #[error("Remote IO error: {0}")]
    RemoteIoError(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected | TransportError::ConnectionLost { .. } => {
                TransferError::NotConnected
            }
            other => TransferError::RemoteIoError(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Not connected")]
    NotConnected,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl From<TransportError> for ExecError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected | TransportError::ConnectionLost { .. } => {
                ExecError::NotConnected
            }
            other => ExecError::ChannelError(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("No host key has been presented by {host}; connect first")]
    UnknownHost { host: String },

    #[error("Known hosts IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<TrustError> for ConnectionError {
    fn from(err: TrustError) -> Self {
        ConnectionError::TrustStore(err.to_string())
    }
}

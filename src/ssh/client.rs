// SSH客户端封装：基于 ssh2 的传输层实现
use crate::config::{AuthMethod, ConnectionTarget};
use crate::ssh::known_hosts::HostKey;
use crate::ssh::transport::{
    AbortHandle, Connector, RawEntry, RemoteReader, RemoteStat, RemoteWriter, Transport,
};
use crate::utils::error::{ConnectionError, TransportError};
use log::{debug, info};
use ssh2::{ErrorCode, ExtendedData, FileStat, OpenFlags, OpenType, Session, Sftp};
use std::io::{self, prelude::*};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

// libssh2 错误码
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

/// Opens real SSH connections with libssh2.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn open(
        &self,
        target: &ConnectionTarget,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        Ok(Box::new(SshClient::connect(target, timeout)?))
    }

    fn is_connection_lost(&self, err: &io::Error) -> bool {
        if let Some(ssh_err) = err.get_ref().and_then(|e| e.downcast_ref::<ssh2::Error>()) {
            return is_socket_failure(ssh_err);
        }
        matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
        )
    }
}

fn is_socket_failure(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

/// 把 ssh2 错误映射为传输层错误，带上出错路径
fn map_err(err: &ssh2::Error, path: &str) -> TransportError {
    match err.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE | LIBSSH2_FX_NO_SUCH_PATH) => {
            TransportError::NotFound {
                path: path.to_string(),
            }
        }
        ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) => TransportError::PermissionDenied {
            path: path.to_string(),
        },
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => TransportError::Timeout {
            message: format!("{}: {}", path, err.message()),
        },
        _ if is_socket_failure(err) => TransportError::ConnectionLost {
            message: err.message().to_string(),
        },
        _ => TransportError::Protocol {
            message: format!("{}: {}", path, err),
        },
    }
}

fn map_io_err(err: io::Error, context: &str) -> TransportError {
    match err.get_ref().and_then(|e| e.downcast_ref::<ssh2::Error>()) {
        Some(ssh_err) => map_err(ssh_err, context),
        None if err.kind() == io::ErrorKind::TimedOut => TransportError::Timeout {
            message: context.to_string(),
        },
        None => TransportError::Io(err),
    }
}

fn to_stat(stat: &FileStat) -> RemoteStat {
    RemoteStat {
        size: stat.size.unwrap_or(0),
        permissions: stat.perm.unwrap_or(0),
        modified: stat.mtime.unwrap_or(0),
        is_dir: stat.is_dir(),
    }
}

pub struct SshClient {
    session: Option<Session>,
    sftp: Option<Sftp>,
    // 用于强制断开的套接字副本
    stream: Option<TcpStream>,
    host_key: Option<HostKey>,
}

impl SshClient {
    pub fn connect(target: &ConnectionTarget, timeout: Option<Duration>) -> Result<Self, ConnectionError> {
        let address = format!("{}:{}", target.host, target.port);
        debug!("Connecting to {}...", address);

        let tcp = open_socket(&address, timeout)?;
        let stream = tcp.try_clone().ok();

        let mut session = Session::new()
            .map_err(|e| ConnectionError::HostUnreachable(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        if let Some(timeout) = timeout {
            session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        }
        session
            .handshake()
            .map_err(|e| ConnectionError::HostUnreachable(format!("SSH handshake failed: {}", e)))?;
        session.set_timeout(0);

        let host_key = session
            .host_key()
            .map(|(blob, _)| HostKey::from_blob(blob.to_vec()));

        info!("SSH handshake with {} completed", address);
        Ok(SshClient {
            session: Some(session),
            sftp: None,
            stream,
            host_key,
        })
    }

    fn session(&self) -> Result<&Session, TransportError> {
        self.session.as_ref().ok_or(TransportError::NotConnected)
    }

    fn sftp(&self) -> Result<&Sftp, TransportError> {
        self.sftp.as_ref().ok_or(TransportError::NotConnected)
    }
}

fn open_socket(address: &str, timeout: Option<Duration>) -> Result<TcpStream, ConnectionError> {
    let unreachable = |e: io::Error| ConnectionError::HostUnreachable(format!("{}: {}", address, e));

    let Some(timeout) = timeout else {
        return TcpStream::connect(address).map_err(unreachable);
    };

    let addrs: Vec<SocketAddr> = address.to_socket_addrs().map_err(unreachable)?.collect();
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = e,
        }
    }
    Err(unreachable(last_err))
}

impl Transport for SshClient {
    fn host_key(&self) -> Option<HostKey> {
        self.host_key.clone()
    }

    fn authenticate(&mut self, username: &str, auth: &AuthMethod) -> Result<(), ConnectionError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ConnectionError::HostUnreachable("connection closed".to_string()))?;

        let result = match auth {
            AuthMethod::Password(password) => {
                debug!("Authenticating {} with password...", username);
                session.userauth_password(username, password)
            }
            AuthMethod::PrivateKey { path, passphrase } => {
                debug!("Authenticating {} with SSH key: {}", username, path.display());
                session.userauth_pubkey_file(username, None, path, passphrase.as_deref())
            }
        };

        if let Err(e) = result {
            if is_socket_failure(&e) {
                return Err(ConnectionError::HostUnreachable(e.message().to_string()));
            }
            return Err(ConnectionError::AuthenticationFailed(e.message().to_string()));
        }

        if !session.authenticated() {
            return Err(ConnectionError::AuthenticationFailed(
                "server did not accept the credentials".to_string(),
            ));
        }
        Ok(())
    }

    fn start_sftp(&mut self) -> Result<(), ConnectionError> {
        let sftp = self
            .session
            .as_ref()
            .ok_or_else(|| ConnectionError::Protocol("connection closed".to_string()))?
            .sftp()
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        self.sftp = Some(sftp);
        Ok(())
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        self.stream
            .as_ref()
            .and_then(|s| s.try_clone().ok())
            .map(AbortHandle::new)
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RawEntry>, TransportError> {
        // ssh2 已过滤 . 和 ..
        let entries = self
            .sftp()?
            .readdir(Path::new(path))
            .map_err(|e| map_err(&e, path))?;

        Ok(entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().into_owned();
                Some(RawEntry {
                    name,
                    stat: to_stat(&stat),
                })
            })
            .collect())
    }

    fn stat(&mut self, path: &str) -> Result<RemoteStat, TransportError> {
        self.sftp()?
            .stat(Path::new(path))
            .map(|stat| to_stat(&stat))
            .map_err(|e| map_err(&e, path))
    }

    fn realpath(&mut self, path: &str) -> Result<String, TransportError> {
        self.sftp()?
            .realpath(Path::new(path))
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| map_err(&e, path))
    }

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), TransportError> {
        self.sftp()?
            .mkdir(Path::new(path), mode)
            .map_err(|e| map_err(&e, path))
    }

    fn unlink(&mut self, path: &str) -> Result<(), TransportError> {
        self.sftp()?
            .unlink(Path::new(path))
            .map_err(|e| map_err(&e, path))
    }

    fn rmdir(&mut self, path: &str) -> Result<(), TransportError> {
        self.sftp()?
            .rmdir(Path::new(path))
            .map_err(|e| map_err(&e, path))
    }

    fn open_read(&mut self, path: &str) -> Result<RemoteReader, TransportError> {
        let file = self
            .sftp()?
            .open(Path::new(path))
            .map_err(|e| map_err(&e, path))?;
        Ok(Box::new(file))
    }

    fn open_write(&mut self, path: &str, mode: i32) -> Result<RemoteWriter, TransportError> {
        let file = self
            .sftp()?
            .open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
            .map_err(|e| map_err(&e, path))?;
        Ok(Box::new(file))
    }

    fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<String, TransportError> {
        let session = self.session()?;
        if self.sftp.is_none() {
            return Err(TransportError::NotConnected);
        }

        // libssh2 只有会话级超时，命令期间的传输读写同样受限
        if let Some(timeout) = timeout {
            session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        }
        let result = run_channel(session, command);
        session.set_timeout(0);
        result
    }

    fn close(&mut self) {
        // Sftp 必须先于 Session 释放
        self.sftp = None;
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
            debug!("SSH session closed");
        }
        self.stream = None;
    }
}

fn run_channel(session: &Session, command: &str) -> Result<String, TransportError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| map_err(&e, command))?;
    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(|e| map_err(&e, command))?;
    channel.exec(command).map_err(|e| map_err(&e, command))?;

    let mut output = Vec::new();
    channel
        .read_to_end(&mut output)
        .map_err(|e| map_io_err(e, command))?;

    channel.wait_close().map_err(|e| map_err(&e, command))?;
    if let Ok(status) = channel.exit_status() {
        debug!("`{}` exited with status {}", command, status);
    }

    Ok(decode_output(output))
}

/// 远端 locale 不一定是 UTF-8，非法字节替换为 U+FFFD
fn decode_output(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_survives_invalid_utf8() {
        assert_eq!(decode_output(b"hello\n".to_vec()), "hello\n");
        // Latin-1 的 é 后面仍有输出
        assert_eq!(
            decode_output(b"caf\xe9\nnext line\n".to_vec()),
            "caf\u{FFFD}\nnext line\n"
        );
        assert_eq!(decode_output(Vec::new()), "");
    }

    #[test]
    fn sftp_codes_map_to_path_errors() {
        let missing = ssh2::Error::new(ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE), "no such file");
        assert!(matches!(
            map_err(&missing, "/nope"),
            TransportError::NotFound { path } if path == "/nope"
        ));

        let denied = ssh2::Error::new(ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED), "denied");
        assert!(matches!(
            map_err(&denied, "/root"),
            TransportError::PermissionDenied { .. }
        ));
    }

    #[test]
    fn socket_codes_are_fatal() {
        let dropped = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV), "recv failed");
        let mapped = map_err(&dropped, "/x");
        assert!(mapped.is_fatal());

        let io_err: io::Error = dropped.into();
        assert!(SshConnector.is_connection_lost(&io_err));
        assert!(!SshConnector.is_connection_lost(&io::Error::new(io::ErrorKind::Other, "disk full")));
    }

    #[test]
    fn never_opened_client_fails_fast() {
        let mut client = SshClient {
            session: None,
            sftp: None,
            stream: None,
            host_key: None,
        };
        assert!(matches!(client.read_dir("/"), Err(TransportError::NotConnected)));
        assert!(matches!(client.exec("pwd", None), Err(TransportError::NotConnected)));
        assert!(client.abort_handle().is_none());
    }

    #[test]
    fn unreachable_host_is_reported() {
        // 端口 1 上通常没有服务
        let target = ConnectionTarget::with_password("127.0.0.1", "u", "p").port(1);
        let result = SshClient::connect(&target, Some(Duration::from_millis(500)));
        assert!(matches!(result, Err(ConnectionError::HostUnreachable(_))));
    }
}

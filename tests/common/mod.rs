// 测试用的内存 SSH 服务端
#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use scp_client::config::{AuthMethod, ConnectionTarget, EngineConfig, TrustPolicy};
use scp_client::ssh::known_hosts::HostKey;
use scp_client::ssh::transport::{
    AbortHandle, Connector, RawEntry, RemoteReader, RemoteStat, RemoteWriter, Transport,
};
use scp_client::utils::error::{ConnectionError, TransportError};
use scp_client::SessionManager;
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

pub const HOST: &str = "files.example.com";
pub const USER: &str = "alice";
pub const PASSWORD: &str = "s3cret";
pub const HOME: &str = "/home/alice";

#[derive(Debug, Clone)]
pub enum Node {
    File(Vec<u8>),
    Dir,
}

pub fn host_key(seed: u8) -> HostKey {
    let name = b"ssh-ed25519";
    let mut blob = (name.len() as u32).to_be_bytes().to_vec();
    blob.extend_from_slice(name);
    blob.extend_from_slice(&[seed; 32]);
    HostKey::from_blob(blob)
}

pub struct MockServer {
    pub fs: Mutex<BTreeMap<String, Node>>,
    pub denied: Mutex<HashSet<String>>,
    pub host_key: Mutex<HostKey>,
    /// Protocol calls in the order the server saw them.
    pub calls: Mutex<Vec<String>>,
    pub connections: AtomicUsize,
    pub auth_attempts: AtomicUsize,
    pub closed: AtomicUsize,
    in_flight: AtomicBool,
    pub overlapped: AtomicBool,
    /// Once set every primitive and open stream fails like a dropped socket.
    pub dead: AtomicBool,
    pub io_delay: Mutex<Option<Duration>>,
    auth_gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    exec_gate: Mutex<Option<Receiver<()>>>,
    /// Timeout passed with the most recent exec.
    pub exec_timeout: Mutex<Option<Duration>>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        let server = Arc::new(Self {
            fs: Mutex::new(BTreeMap::new()),
            denied: Mutex::new(HashSet::new()),
            host_key: Mutex::new(host_key(1)),
            calls: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            auth_attempts: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            io_delay: Mutex::new(None),
            auth_gate: Mutex::new(None),
            exec_gate: Mutex::new(None),
            exec_timeout: Mutex::new(None),
        });
        server.mkdir_p("/home/alice");
        server.mkdir_p("/root");
        server.denied.lock().unwrap().insert("/root".to_string());
        server
    }

    pub fn mkdir_p(&self, path: &str) {
        let mut fs = self.fs.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            fs.entry(current.clone()).or_insert(Node::Dir);
        }
        fs.insert("/".to_string(), Node::Dir);
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        let parent = parent_of(path);
        self.mkdir_p(&parent);
        self.fs
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.fs.lock().unwrap().get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.fs.lock().unwrap().contains_key(path)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_host_key(&self, key: HostKey) {
        *self.host_key.lock().unwrap() = key;
    }

    pub fn set_io_delay(&self, delay: Duration) {
        *self.io_delay.lock().unwrap() = Some(delay);
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// Holds the next authentication until the returned sender fires.
    /// The receiver reports when authentication has started.
    pub fn gate_auth(&self) -> (Sender<()>, Receiver<()>) {
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        *self.auth_gate.lock().unwrap() = Some((started_tx, release_rx));
        (release_tx, started_rx)
    }

    /// Makes the `block` command wait until the returned sender fires.
    pub fn gate_exec(&self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        *self.exec_gate.lock().unwrap() = Some(rx);
        tx
    }

    fn enter(&self, call: String) -> Result<CallGuard<'_>, TransportError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost {
                message: "connection reset by peer".into(),
            });
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls.lock().unwrap().push(call);
        Ok(CallGuard(self))
    }

    fn check_access(&self, path: &str) -> Result<(), TransportError> {
        let denied = self.denied.lock().unwrap();
        if denied.iter().any(|d| path == d || path.starts_with(&format!("{}/", d))) {
            return Err(TransportError::PermissionDenied {
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

struct CallGuard<'a>(&'a MockServer);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        // 放慢一点，让并发重叠更容易暴露
        thread::sleep(Duration::from_millis(1));
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

fn parent_of(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Collapses `.` and `..` segments of an absolute path.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if part == ".." {
            parts.pop();
        } else {
            parts.push(part);
        }
    }
    format!("/{}", parts.join("/"))
}

fn not_found(path: &str) -> TransportError {
    TransportError::NotFound {
        path: path.to_string(),
    }
}

pub struct MockConnector {
    pub server: Arc<MockServer>,
}

impl Connector for MockConnector {
    fn open(&self, target: &ConnectionTarget, _timeout: Option<Duration>) -> Result<Box<dyn Transport>, ConnectionError> {
        if target.host != HOST {
            return Err(ConnectionError::HostUnreachable(format!(
                "{}:{}: no route to host",
                target.host, target.port
            )));
        }
        self.server.connections.fetch_add(1, Ordering::SeqCst);
        self.server.dead.store(false, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            server: Arc::clone(&self.server),
            open: true,
            authenticated: false,
            sftp: false,
        }))
    }
}

pub struct MockTransport {
    server: Arc<MockServer>,
    open: bool,
    authenticated: bool,
    sftp: bool,
}

impl MockTransport {
    fn ready(&self) -> Result<(), TransportError> {
        if self.open && self.sftp {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn node(&self, path: &str) -> Result<Node, TransportError> {
        self.server.check_access(path)?;
        self.server
            .fs
            .lock()
            .unwrap()
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn stat_of(node: &Node) -> RemoteStat {
        match node {
            Node::Dir => RemoteStat {
                size: 4096,
                permissions: 0o040755,
                modified: 1_700_000_000,
                is_dir: true,
            },
            Node::File(data) => RemoteStat {
                size: data.len() as u64,
                // setuid 位应被列表过滤掉
                permissions: 0o104644,
                modified: 1_700_000_000,
                is_dir: false,
            },
        }
    }
}

impl Transport for MockTransport {
    fn host_key(&self) -> Option<HostKey> {
        Some(self.server.host_key.lock().unwrap().clone())
    }

    fn authenticate(&mut self, username: &str, auth: &AuthMethod) -> Result<(), ConnectionError> {
        self.server.auth_attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.server.auth_gate.lock().unwrap().take();
        if let Some((started, release)) = gate {
            let _ = started.send(());
            let _ = release.recv_timeout(Duration::from_secs(5));
        }

        let accepted = username == USER
            && match auth {
                AuthMethod::Password(password) => password == PASSWORD,
                AuthMethod::PrivateKey { path, .. } => path.is_file(),
            };
        if !accepted {
            return Err(ConnectionError::AuthenticationFailed(
                "Authentication failed (username/password)".into(),
            ));
        }
        self.authenticated = true;
        Ok(())
    }

    fn start_sftp(&mut self) -> Result<(), ConnectionError> {
        if !self.authenticated {
            return Err(ConnectionError::Protocol("not authenticated".into()));
        }
        self.sftp = true;
        Ok(())
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RawEntry>, TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("read_dir {}", path))?;
        match self.node(path)? {
            Node::Dir => {}
            Node::File(_) => return Err(not_found(path)),
        }

        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        let fs = self.server.fs.lock().unwrap();
        let entries = fs
            .iter()
            .filter_map(|(p, node)| {
                let name = p.strip_prefix(&prefix)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                Some(RawEntry {
                    name: name.to_string(),
                    stat: Self::stat_of(node),
                })
            })
            .collect();
        Ok(entries)
    }

    fn stat(&mut self, path: &str) -> Result<RemoteStat, TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("stat {}", path))?;
        self.node(path).map(|node| Self::stat_of(&node))
    }

    fn realpath(&mut self, path: &str) -> Result<String, TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("realpath {}", path))?;
        if path == "." {
            return Ok(HOME.to_string());
        }
        Ok(normalize(path))
    }

    fn mkdir(&mut self, path: &str, _mode: i32) -> Result<(), TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("mkdir {}", path))?;
        self.server.check_access(path)?;
        let mut fs = self.server.fs.lock().unwrap();
        if fs.contains_key(path) {
            return Err(TransportError::Protocol {
                message: format!("{}: file already exists", path),
            });
        }
        if !matches!(fs.get(&parent_of(path)), Some(Node::Dir)) {
            return Err(not_found(path));
        }
        fs.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<(), TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("unlink {}", path))?;
        match self.node(path)? {
            Node::File(_) => {
                self.server.fs.lock().unwrap().remove(path);
                Ok(())
            }
            Node::Dir => Err(TransportError::Protocol {
                message: format!("{}: is a directory", path),
            }),
        }
    }

    fn rmdir(&mut self, path: &str) -> Result<(), TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("rmdir {}", path))?;
        if let Node::File(_) = self.node(path)? {
            return Err(TransportError::Protocol {
                message: format!("{}: not a directory", path),
            });
        }
        let mut fs = self.server.fs.lock().unwrap();
        let prefix = format!("{}/", path);
        if fs.keys().any(|k| k.starts_with(&prefix)) {
            return Err(TransportError::Protocol {
                message: format!("{}: directory not empty", path),
            });
        }
        fs.remove(path);
        Ok(())
    }

    fn open_read(&mut self, path: &str) -> Result<RemoteReader, TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("open_read {}", path))?;
        match self.node(path)? {
            Node::File(data) => Ok(Box::new(MockReader {
                data: Cursor::new(data),
                server: Arc::clone(&self.server),
            })),
            Node::Dir => Err(TransportError::Protocol {
                message: format!("{}: is a directory", path),
            }),
        }
    }

    fn open_write(&mut self, path: &str, _mode: i32) -> Result<RemoteWriter, TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("open_write {}", path))?;
        self.server.check_access(path)?;
        let mut fs = self.server.fs.lock().unwrap();
        if !matches!(fs.get(&parent_of(path)), Some(Node::Dir)) {
            return Err(not_found(path));
        }
        if let Some(Node::Dir) = fs.get(path) {
            return Err(TransportError::Protocol {
                message: format!("{}: is a directory", path),
            });
        }
        fs.insert(path.to_string(), Node::File(Vec::new()));
        Ok(Box::new(MockWriter {
            path: path.to_string(),
            server: Arc::clone(&self.server),
        }))
    }

    fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<String, TransportError> {
        self.ready()?;
        let _guard = self.server.enter(format!("exec {}", command))?;
        *self.server.exec_timeout.lock().unwrap() = timeout;

        if command == "block" {
            let gate = self.server.exec_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                // 与 libssh2 一样，超时后通道报错而会话继续可用
                let released = gate.recv_timeout(timeout.unwrap_or(Duration::from_secs(5)));
                if released.is_err() && timeout.is_some() {
                    return Err(TransportError::Timeout {
                        message: format!("`{}` timed out", command),
                    });
                }
            }
            return Ok(String::new());
        }
        if command == "pwd" {
            return Ok(format!("{}\n", HOME));
        }
        if let Some(rest) = command.strip_prefix("echo ") {
            return Ok(format!("{}\n", rest));
        }
        if let Some(arg) = command.strip_prefix("md5sum ") {
            let path = arg.trim_matches('\'');
            return Ok(match self.server.file(path) {
                Some(data) => format!("{:x}  {}\n", md5::compute(data), path),
                None => format!("md5sum: {}: No such file or directory\n", path),
            });
        }
        if command.starts_with("ls /nope") {
            return Ok("ls: cannot access '/nope': No such file or directory\n".into());
        }
        Ok(format!("sh: 1: {}: not found\n", command))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.sftp = false;
            self.server.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")
}

struct MockReader {
    data: Cursor<Vec<u8>>,
    server: Arc<MockServer>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let delay = *self.server.io_delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.server.dead.load(Ordering::SeqCst) {
            return Err(reset_error());
        }
        self.data.read(buf)
    }
}

struct MockWriter {
    path: String,
    server: Arc<MockServer>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = *self.server.io_delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.server.dead.load(Ordering::SeqCst) {
            return Err(reset_error());
        }
        let mut fs = self.server.fs.lock().unwrap();
        match fs.get_mut(&self.path) {
            Some(Node::File(data)) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "remote file vanished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Deterministic non-repeating-ish payload.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub struct Harness {
    pub server: Arc<MockServer>,
    pub session: SessionManager,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(policy: TrustPolicy) -> Self {
        Self::with_config(policy, |_| {})
    }

    pub fn with_config<F: FnOnce(&mut EngineConfig)>(policy: TrustPolicy, tweak: F) -> Self {
        let dir = TempDir::new().unwrap();
        let server = MockServer::new();
        let mut config = EngineConfig {
            chunk_size: 1024,
            threads: 4,
            trust_policy: policy,
            known_hosts_path: dir.path().join("known_hosts"),
            connect_timeout: None,
            command_timeout: None,
        };
        tweak(&mut config);
        let session = SessionManager::with_connector(
            config,
            Arc::new(MockConnector {
                server: Arc::clone(&server),
            }),
        )
        .unwrap();
        Self {
            server,
            session,
            dir,
        }
    }

    /// Trust-on-first-use session, already connected with the right password.
    pub fn connected() -> Self {
        let harness = Self::new(TrustPolicy::AutoAcceptFirstUse);
        harness.session.connect(target()).unwrap();
        harness
    }
}

pub fn target() -> ConnectionTarget {
    ConnectionTarget::with_password(HOST, USER, PASSWORD)
}

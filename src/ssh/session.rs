// SSH会话管理：单一会话、FIFO 串行队列、传输调度
use crate::config::{AuthMethod, ConnectionTarget, EngineConfig, TrustPolicy};
use crate::remote::{exec, listing, path, RemoteEntry};
use crate::ssh::client::SshConnector;
use crate::ssh::known_hosts::{HostKeyStatus, HostTrustStore};
use crate::ssh::transport::{
    AbortHandle, Connector, RawEntry, RemoteReader, RemoteStat, RemoteWriter, Transport,
};
use crate::threadpool::SerialQueue;
use crate::transfer::engine::{Endpoints, TransferEngine, TransferHandle, TransferLink};
use crate::transfer::task::{TaskId, TransferDirection, TransferEvent, TransferTask};
use crate::transfer::{download, upload};
use crate::utils::error::{ConnectionError, ExecError, OpError, TransferError, TransportError};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

const DIR_MODE: i32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Authenticating,
    Ready,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SessionInfo {
    state: SessionState,
    target: Option<ConnectionTarget>,
    cwd: String,
    home: String,
    // 每次连接/断开递增，用来识别过期的连接尝试和排队操作
    generation: u64,
}

impl SessionInfo {
    fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.target = None;
        self.cwd = "/".to_string();
        self.home = "/".to_string();
        self.generation += 1;
    }
}

/// The live transport, tagged with the generation that opened it.
struct Live {
    generation: u64,
    transport: Box<dyn Transport>,
}

type Slot = Option<Live>;

struct Shared {
    info: Mutex<SessionInfo>,
    trust: Arc<Mutex<HostTrustStore>>,
    abort: Arc<Mutex<Option<(u64, AbortHandle)>>>,
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    queue: SerialQueue<Slot>,
    transfers: TransferEngine,
}

impl Shared {
    fn ready_generation(&self) -> Option<u64> {
        let info = lock(&self.info);
        (info.state == SessionState::Ready).then_some(info.generation)
    }

    /// Forces closed the socket of any connection older than `before`.
    fn abort_socket(&self, before: u64) {
        let mut abort = lock(&self.abort);
        if matches!(&*abort, Some((owner, _)) if *owner < before) {
            if let Some((_, handle)) = abort.take() {
                handle.abort();
            }
        }
    }

    fn close_slot(&self, before: u64) {
        let posted = self.queue.post(move |slot: &mut Slot| {
            if matches!(slot.as_ref(), Some(live) if live.generation < before) {
                if let Some(mut live) = slot.take() {
                    live.transport.close();
                }
            }
        });
        if posted.is_err() {
            debug!("operation queue already closed");
        }
    }

    /// Ends the session after a fatal transport error.
    fn lose_connection(&self, generation: u64, reason: &str) {
        {
            let mut info = lock(&self.info);
            if info.generation != generation || info.state != SessionState::Ready {
                return;
            }
            info.reset();
        }
        warn!("Connection lost: {}", reason);
        self.transfers.cancel_all_active();
        self.abort_socket(generation + 1);
        self.close_slot(generation + 1);
    }

    /// 在队列中执行一次协议操作；只作用于 `generation` 对应的连接
    fn submit_for<T, E, F>(&self, generation: u64, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transport) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<TransportError> + Send + 'static,
    {
        let outcome = self.queue.submit(move |slot: &mut Slot| {
            let (result, lost) = match slot.as_mut() {
                Some(live) if live.generation == generation => {
                    let mut watched = Watched::new(live.transport.as_mut());
                    let result = f(&mut watched);
                    (result, watched.lost)
                }
                _ => return (Err(E::from(TransportError::NotConnected)), None),
            };
            // 连接已断，后续排队的操作直接得到 NotConnected
            if lost.is_some() {
                if let Some(mut live) = slot.take() {
                    live.transport.close();
                }
            }
            (result, lost)
        });

        let (result, lost) =
            outcome.unwrap_or_else(|_| (Err(E::from(TransportError::NotConnected)), None));
        if let Some(reason) = lost {
            self.lose_connection(generation, &reason);
        }
        result
    }

    fn submit<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn Transport) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<TransportError> + Send + 'static,
    {
        match self.ready_generation() {
            Some(generation) => self.submit_for(generation, f),
            None => Err(E::from(TransportError::NotConnected)),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.transfers.cancel_all_active();
        self.abort_socket(u64::MAX);
    }
}

/// Session entry point: owns the single live connection and serializes every
/// protocol operation through one FIFO queue. Cloning yields another handle
/// to the same session.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Uses libssh2 and the known_hosts ledger named in `config`.
    pub fn new(config: EngineConfig) -> Result<Self, ConnectionError> {
        Self::with_connector(config, Arc::new(SshConnector))
    }

    pub fn with_connector(config: EngineConfig, connector: Arc<dyn Connector>) -> Result<Self, ConnectionError> {
        let trust = HostTrustStore::open(&config.known_hosts_path)?;
        let transfers = TransferEngine::new(config.threads, config.chunk_size);

        Ok(Self {
            shared: Arc::new(Shared {
                info: Mutex::new(SessionInfo {
                    state: SessionState::Disconnected,
                    target: None,
                    cwd: "/".to_string(),
                    home: "/".to_string(),
                    generation: 0,
                }),
                trust: Arc::new(Mutex::new(trust)),
                abort: Arc::new(Mutex::new(None)),
                connector,
                config,
                queue: SerialQueue::new("ssh-session", None),
                transfers,
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.info).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn target(&self) -> Option<ConnectionTarget> {
        lock(&self.shared.info).target.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Runs `f` against the host trust store. The store is locked only for
    /// the duration of the call.
    pub fn with_trust_store<R>(&self, f: impl FnOnce(&mut HostTrustStore) -> R) -> R {
        f(&mut lock(&self.shared.trust))
    }

    /// Opens, verifies, and authenticates a new session, replacing any live one.
    pub fn connect(&self, target: ConnectionTarget) -> Result<(), ConnectionError> {
        let generation = {
            let mut info = lock(&self.shared.info);
            if info.state == SessionState::Authenticating {
                return Err(ConnectionError::AlreadyConnecting);
            }
            if let AuthMethod::PrivateKey { path, .. } = &target.auth {
                if !path.is_file() {
                    return Err(ConnectionError::InvalidKeyPath(path.clone()));
                }
            }
            let replacing = info.state == SessionState::Ready;
            info.reset();
            info.state = SessionState::Authenticating;
            info.target = Some(target.clone());
            if replacing {
                debug!("Replacing the live session");
            }
            info.generation
        };

        // 旧会话的传输全部取消，旧连接在连接任务开始时关闭
        self.shared.transfers.cancel_all_active();
        self.shared.abort_socket(generation);

        info!("Connecting to {}@{}:{}", target.username, target.host, target.port);
        let job = ConnectJob {
            generation,
            target,
            connector: Arc::clone(&self.shared.connector),
            trust: Arc::clone(&self.shared.trust),
            abort: Arc::clone(&self.shared.abort),
            policy: self.shared.config.trust_policy,
            timeout: self.shared.config.connect_timeout,
        };
        let outcome = self
            .shared
            .queue
            .submit(move |slot: &mut Slot| job.run(slot))
            .unwrap_or(Err(ConnectionError::Aborted));

        let mut info = lock(&self.shared.info);
        if info.generation != generation {
            // disconnect() 抢先：它排在后面的关闭任务会释放这条连接
            debug!("Connection attempt superseded");
            return Err(ConnectionError::Aborted);
        }

        match outcome {
            Ok(home) => {
                info.state = SessionState::Ready;
                info.cwd = home.clone();
                info.home = home;
                info!("Session ready, working directory {}", info.cwd);
                Ok(())
            }
            Err(e) => {
                info.reset();
                warn!("Connection failed: {}", e);
                Err(e)
            }
        }
    }

    /// Valid from any state. Cancels every in-flight transfer and releases
    /// the connection.
    pub fn disconnect(&self) {
        let (previous, generation) = {
            let mut info = lock(&self.shared.info);
            let previous = info.state;
            info.reset();
            (previous, info.generation)
        };

        let cancelled = self.shared.transfers.cancel_all_active();
        self.shared.abort_socket(generation);
        self.shared.close_slot(generation);

        if previous != SessionState::Disconnected {
            info!("Disconnected ({} transfer(s) cancelled)", cancelled);
        }
    }

    fn resolve(&self, remote: &str) -> String {
        let info = lock(&self.shared.info);
        path::resolve(&info.cwd, &info.home, remote)
    }

    pub fn current_directory(&self) -> Result<String, OpError> {
        let info = lock(&self.shared.info);
        if info.state != SessionState::Ready {
            return Err(OpError::NotConnected);
        }
        Ok(info.cwd.clone())
    }

    /// Moves the working directory; the target must be an existing directory.
    pub fn change_directory(&self, remote: &str) -> Result<String, OpError> {
        let generation = self.shared.ready_generation().ok_or(OpError::NotConnected)?;
        let dir = self.resolve(remote);

        let resolved = self.shared.submit_for(generation, move |t: &mut dyn Transport| {
            let stat = t.stat(&dir)?;
            if !stat.is_dir {
                return Err(OpError::PathNotFound(dir));
            }
            Ok(t.realpath(&dir).unwrap_or(dir))
        })?;

        let mut info = lock(&self.shared.info);
        if info.generation != generation {
            return Err(OpError::NotConnected);
        }
        info.cwd = resolved.clone();
        Ok(resolved)
    }

    pub fn parent_directory(&self) -> Result<String, OpError> {
        let parent = path::parent(&self.current_directory()?);
        self.change_directory(&parent)
    }

    pub fn list_directory(&self, remote: &str) -> Result<Vec<RemoteEntry>, OpError> {
        let dir = self.resolve(remote);
        self.shared
            .submit(move |t: &mut dyn Transport| listing::list(t, &dir))
    }

    pub fn create_directory(&self, remote: &str) -> Result<(), OpError> {
        let dir = self.resolve(remote);
        self.shared.submit(move |t: &mut dyn Transport| {
            t.mkdir(&dir, DIR_MODE)?;
            info!("Created remote directory {}", dir);
            Ok(())
        })
    }

    pub fn delete_file(&self, remote: &str) -> Result<(), OpError> {
        let file = self.resolve(remote);
        self.shared.submit(move |t: &mut dyn Transport| {
            t.unlink(&file)?;
            info!("Deleted remote file {}", file);
            Ok(())
        })
    }

    pub fn delete_directory(&self, remote: &str) -> Result<(), OpError> {
        let dir = self.resolve(remote);
        self.shared.submit(move |t: &mut dyn Transport| {
            t.rmdir(&dir)?;
            info!("Deleted remote directory {}", dir);
            Ok(())
        })
    }

    /// Runs a command with the configured timeout (none by default).
    pub fn exec(&self, command: &str) -> Result<String, ExecError> {
        self.exec_with_timeout(command, self.shared.config.command_timeout)
    }

    /// Runs a command that fails with `ChannelError` once `timeout` passes.
    ///
    /// The timeout is set on the libssh2 session rather than the channel.
    /// Transfers streaming while the command runs are bound by it too, and a
    /// chunk that stalls past it fails its task.
    pub fn exec_with_timeout(&self, command: &str, timeout: Option<Duration>) -> Result<String, ExecError> {
        let command = command.to_string();
        self.shared
            .submit(move |t: &mut dyn Transport| exec::run_command(t, &command, timeout))
    }

    pub fn start_upload<P: AsRef<Path>>(&self, local: P, remote: &str) -> Result<TransferHandle, TransferError> {
        let generation = self.shared.ready_generation().ok_or(TransferError::NotConnected)?;
        let local = local.as_ref();
        // 大小未知时由打开阶段补全
        let total = fs::metadata(local).map(|m| m.len()).unwrap_or(0);

        Ok(self.shared.transfers.start(
            TransferDirection::Upload,
            local.to_string_lossy().into_owned(),
            self.resolve(remote),
            total,
            self.link(generation, None),
        ))
    }

    pub fn start_download<P: AsRef<Path>>(
        &self,
        remote: &str,
        local: P,
        known_size: Option<u64>,
    ) -> Result<TransferHandle, TransferError> {
        let generation = self.shared.ready_generation().ok_or(TransferError::NotConnected)?;

        Ok(self.shared.transfers.start(
            TransferDirection::Download,
            self.resolve(remote),
            local.as_ref().to_string_lossy().into_owned(),
            known_size.unwrap_or(0),
            self.link(generation, known_size),
        ))
    }

    fn link(&self, generation: u64, known_size: Option<u64>) -> Arc<dyn TransferLink> {
        Arc::new(SessionLink {
            shared: Arc::downgrade(&self.shared),
            generation,
            known_size,
        })
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared.transfers.cancel(id)
    }

    pub fn subscribe(&self, id: TaskId) -> Option<Receiver<TransferEvent>> {
        self.shared.transfers.subscribe(id)
    }

    pub fn subscribe_all(&self) -> Receiver<TransferEvent> {
        self.shared.transfers.subscribe_all()
    }

    pub fn tasks(&self) -> Vec<TransferTask> {
        self.shared.transfers.tasks()
    }

    pub fn task(&self, id: TaskId) -> Option<TransferTask> {
        self.shared.transfers.task(id)
    }

    pub fn clear_finished(&self) -> usize {
        self.shared.transfers.clear_finished()
    }
}

/// Everything the connect job needs, moved onto the queue worker.
struct ConnectJob {
    generation: u64,
    target: ConnectionTarget,
    connector: Arc<dyn Connector>,
    trust: Arc<Mutex<HostTrustStore>>,
    abort: Arc<Mutex<Option<(u64, AbortHandle)>>>,
    policy: TrustPolicy,
    timeout: Option<Duration>,
}

impl ConnectJob {
    /// Returns the login directory on success.
    fn run(self, slot: &mut Slot) -> Result<String, ConnectionError> {
        if let Some(mut old) = slot.take() {
            old.transport.close();
        }

        let mut transport = self.connector.open(&self.target, self.timeout)?;
        if let Some(handle) = transport.abort_handle() {
            *lock(&self.abort) = Some((self.generation, handle));
        }

        match self.establish(transport.as_mut()) {
            Ok(home) => {
                *slot = Some(Live {
                    generation: self.generation,
                    transport,
                });
                Ok(home)
            }
            Err(e) => {
                transport.close();
                let mut abort = lock(&self.abort);
                if matches!(&*abort, Some((owner, _)) if *owner == self.generation) {
                    *abort = None;
                }
                Err(e)
            }
        }
    }

    fn establish(&self, transport: &mut dyn Transport) -> Result<String, ConnectionError> {
        let host = self.target.host_id();
        let key = transport
            .host_key()
            .ok_or_else(|| ConnectionError::Protocol("server presented no host key".to_string()))?;
        let fingerprint = key.fingerprint();

        // 信任检查先于认证，凭据不会发给未确认的主机
        let status = lock(&self.trust).check(&host, &key);
        let accept_after_auth = match status {
            HostKeyStatus::Trusted => false,
            HostKeyStatus::Changed { previous } => {
                warn!("Host key for {} changed: was {}, now {}", host, previous, fingerprint);
                return Err(ConnectionError::UntrustedHostKey {
                    host,
                    fingerprint: fingerprint.to_string(),
                    changed: true,
                });
            }
            HostKeyStatus::Unknown => match self.policy {
                TrustPolicy::RequireExplicitAccept => {
                    return Err(ConnectionError::UntrustedHostKey {
                        host,
                        fingerprint: fingerprint.to_string(),
                        changed: false,
                    });
                }
                TrustPolicy::AutoAcceptFirstUse => true,
            },
        };

        transport.authenticate(&self.target.username, &self.target.auth)?;
        debug!("Authenticated as {}", self.target.username);
        transport.start_sftp()?;

        if accept_after_auth {
            lock(&self.trust).accept(&host)?;
            info!("Trusted new host {} ({})", host, fingerprint);
        }

        let home = transport.realpath(".").unwrap_or_else(|e| {
            warn!("Could not resolve the login directory: {}", e);
            "/".to_string()
        });
        Ok(home)
    }
}

/// Connects transfer workers back to the session that started them.
struct SessionLink {
    shared: Weak<Shared>,
    generation: u64,
    known_size: Option<u64>,
}

impl TransferLink for SessionLink {
    fn open(&self, task: &TransferTask) -> Result<Endpoints, TransferError> {
        let shared = self.shared.upgrade().ok_or(TransferError::NotConnected)?;
        let direction = task.direction;
        let source = task.source.clone();
        let destination = task.destination.clone();
        let known_size = self.known_size;

        shared.submit_for(self.generation, move |t: &mut dyn Transport| match direction {
            TransferDirection::Upload => upload::open_upload(t, &source, &destination),
            TransferDirection::Download => download::open_download(t, &source, &destination, known_size),
        })
    }

    fn on_remote_error(&self, err: &io::Error) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return true;
        };
        if shared.connector.is_connection_lost(err) {
            shared.lose_connection(self.generation, &err.to_string());
            return true;
        }
        false
    }
}

/// Forwards to the live transport and remembers whether the connection died.
struct Watched<'a> {
    inner: &'a mut dyn Transport,
    lost: Option<String>,
}

impl<'a> Watched<'a> {
    fn new(inner: &'a mut dyn Transport) -> Self {
        Self { inner, lost: None }
    }

    fn watch<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.is_fatal() && self.lost.is_none() {
                self.lost = Some(e.to_string());
            }
        }
        result
    }
}

impl Transport for Watched<'_> {
    fn host_key(&self) -> Option<crate::ssh::known_hosts::HostKey> {
        self.inner.host_key()
    }

    fn authenticate(&mut self, username: &str, auth: &AuthMethod) -> Result<(), ConnectionError> {
        self.inner.authenticate(username, auth)
    }

    fn start_sftp(&mut self) -> Result<(), ConnectionError> {
        self.inner.start_sftp()
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        self.inner.abort_handle()
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RawEntry>, TransportError> {
        let result = self.inner.read_dir(path);
        self.watch(result)
    }

    fn stat(&mut self, path: &str) -> Result<RemoteStat, TransportError> {
        let result = self.inner.stat(path);
        self.watch(result)
    }

    fn realpath(&mut self, path: &str) -> Result<String, TransportError> {
        let result = self.inner.realpath(path);
        self.watch(result)
    }

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), TransportError> {
        let result = self.inner.mkdir(path, mode);
        self.watch(result)
    }

    fn unlink(&mut self, path: &str) -> Result<(), TransportError> {
        let result = self.inner.unlink(path);
        self.watch(result)
    }

    fn rmdir(&mut self, path: &str) -> Result<(), TransportError> {
        let result = self.inner.rmdir(path);
        self.watch(result)
    }

    fn open_read(&mut self, path: &str) -> Result<RemoteReader, TransportError> {
        let result = self.inner.open_read(path);
        self.watch(result)
    }

    fn open_write(&mut self, path: &str, mode: i32) -> Result<RemoteWriter, TransportError> {
        let result = self.inner.open_write(path, mode);
        self.watch(result)
    }

    fn exec(&mut self, command: &str, timeout: Option<Duration>) -> Result<String, TransportError> {
        let result = self.inner.exec(command, timeout);
        self.watch(result)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

// 异步封装：阻塞的会话操作放到 tokio 阻塞线程池执行
use crate::config::ConnectionTarget;
use crate::remote::RemoteEntry;
use crate::ssh::session::SessionManager;
use crate::transfer::engine::TransferHandle;
use crate::transfer::task::TransferTask;
use crate::utils::error::{ConnectionError, ExecError, OpError, TransferError};
use std::path::PathBuf;
use tokio::task;

/// Async facade over [`SessionManager`]. Callers suspend while their
/// operation waits for its turn in the session queue.
#[derive(Clone)]
pub struct AsyncSession {
    inner: SessionManager,
}

impl AsyncSession {
    pub fn new(inner: SessionManager) -> Self {
        Self { inner }
    }

    pub fn blocking(&self) -> &SessionManager {
        &self.inner
    }

    async fn run<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(SessionManager) -> T + Send + 'static,
        T: Send + 'static,
    {
        let session = self.inner.clone();
        task::spawn_blocking(move || f(session)).await.ok()
    }

    pub async fn connect(&self, target: ConnectionTarget) -> Result<(), ConnectionError> {
        self.run(move |s| s.connect(target))
            .await
            .unwrap_or(Err(ConnectionError::Aborted))
    }

    pub async fn disconnect(&self) {
        self.run(|s| s.disconnect()).await;
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>, OpError> {
        let path = path.to_string();
        self.run(move |s| s.list_directory(&path))
            .await
            .unwrap_or(Err(OpError::NotConnected))
    }

    pub async fn change_directory(&self, path: &str) -> Result<String, OpError> {
        let path = path.to_string();
        self.run(move |s| s.change_directory(&path))
            .await
            .unwrap_or(Err(OpError::NotConnected))
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), OpError> {
        let path = path.to_string();
        self.run(move |s| s.create_directory(&path))
            .await
            .unwrap_or(Err(OpError::NotConnected))
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), OpError> {
        let path = path.to_string();
        self.run(move |s| s.delete_file(&path))
            .await
            .unwrap_or(Err(OpError::NotConnected))
    }

    pub async fn delete_directory(&self, path: &str) -> Result<(), OpError> {
        let path = path.to_string();
        self.run(move |s| s.delete_directory(&path))
            .await
            .unwrap_or(Err(OpError::NotConnected))
    }

    pub async fn exec(&self, command: &str) -> Result<String, ExecError> {
        let command = command.to_string();
        self.run(move |s| s.exec(&command))
            .await
            .unwrap_or(Err(ExecError::NotConnected))
    }

    /// Scheduling never blocks, so these stay synchronous.
    pub fn start_upload(&self, local: impl Into<PathBuf>, remote: &str) -> Result<TransferHandle, TransferError> {
        self.inner.start_upload(local.into(), remote)
    }

    pub fn start_download(
        &self,
        remote: &str,
        local: impl Into<PathBuf>,
        known_size: Option<u64>,
    ) -> Result<TransferHandle, TransferError> {
        self.inner.start_download(remote, local.into(), known_size)
    }

    /// Suspends until the transfer reaches a terminal state.
    pub async fn wait(&self, handle: TransferHandle) -> Option<TransferTask> {
        self.run(move |_| handle.wait()).await
    }
}

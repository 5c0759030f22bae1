// 传输引擎：任务登记、分块拷贝、取消与进度分发
use crate::threadpool::ThreadPool;
use crate::transfer::task::{
    TaskId, TransferDirection, TransferEvent, TransferStatus, TransferTask,
};
use crate::utils::error::TransferError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Both ends of an opened transfer.
pub struct Endpoints {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    /// Size learned while opening, when the caller did not know it.
    pub total_size: Option<u64>,
    /// Final destination after target resolution.
    pub destination: Option<String>,
}

/// What the engine needs from the session that owns the connection.
pub trait TransferLink: Send + Sync {
    /// Opens both ends of the transfer. Runs on the transfer worker.
    fn open(&self, task: &TransferTask) -> Result<Endpoints, TransferError>;

    /// Reports a failed remote read or write. Returns true when the
    /// connection itself is gone.
    fn on_remote_error(&self, err: &io::Error) -> bool;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Subscribers = Mutex<Vec<Sender<TransferEvent>>>;

fn broadcast(subscribers: &Subscribers, event: TransferEvent) {
    lock(subscribers).retain(|tx| tx.send(event).is_ok());
}

struct TaskCell {
    task: Mutex<TransferTask>,
    cancel_requested: AtomicBool,
    subscribers: Subscribers,
}

impl TaskCell {
    fn snapshot(&self) -> TransferTask {
        lock(&self.task).clone()
    }

    fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// 修改任务并在持锁期间广播，保证同一任务的事件有序
    fn update<F>(&self, global: &Subscribers, f: F) -> bool
    where
        F: FnOnce(&mut TransferTask) -> bool,
    {
        let mut task = lock(&self.task);
        if !f(&mut task) {
            return false;
        }
        let event = task.event();
        // 全局监听先收到，任务订阅者醒来时全局事件已就绪
        broadcast(global, event);
        broadcast(&self.subscribers, event);
        true
    }
}

struct EngineInner {
    tasks: Mutex<BTreeMap<TaskId, Arc<TaskCell>>>,
    listeners: Subscribers,
    next_id: AtomicU64,
    chunk_size: usize,
}

pub struct TransferEngine {
    inner: Arc<EngineInner>,
    pool: ThreadPool,
}

impl TransferEngine {
    pub fn new(threads: usize, chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tasks: Mutex::new(BTreeMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                chunk_size: chunk_size.max(1),
            }),
            pool: ThreadPool::new(threads, "transfer"),
        }
    }

    /// Registers a task in `Pending` and schedules it. Returns immediately.
    pub fn start(
        &self,
        direction: TransferDirection,
        source: String,
        destination: String,
        total_size: u64,
        link: Arc<dyn TransferLink>,
    ) -> TransferHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let task = TransferTask::new(id, direction, source, destination, total_size);
        debug!("Queued {} #{}: {} -> {}", direction, id, task.source, task.destination);

        let cell = Arc::new(TaskCell {
            task: Mutex::new(task),
            cancel_requested: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        });
        lock(&self.inner.tasks).insert(id, Arc::clone(&cell));

        let inner = Arc::clone(&self.inner);
        let worker_cell = Arc::clone(&cell);
        let scheduled = self.pool.execute(move || {
            run_task(&inner, &worker_cell, link.as_ref());
        });
        if !scheduled {
            cell.update(&self.inner.listeners, |t| {
                t.transition(
                    TransferStatus::Failed,
                    Some(TransferError::LocalIoError("transfer workers are shut down".into())),
                )
            });
        }

        TransferHandle {
            cell,
            engine: Arc::clone(&self.inner),
        }
    }

    /// Requests cancellation. Pending tasks are cancelled at once; running
    /// ones stop at the next chunk boundary.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.cell(id) {
            Some(cell) => cancel_cell(&self.inner, &cell, false),
            None => false,
        }
    }

    /// Cancels every non-terminal task immediately. Returns how many were cancelled.
    pub fn cancel_all_active(&self) -> usize {
        let cells: Vec<Arc<TaskCell>> = lock(&self.inner.tasks).values().cloned().collect();
        let cancelled = cells
            .iter()
            .filter(|cell| cancel_cell(&self.inner, cell, true))
            .count();
        if cancelled > 0 {
            info!("Cancelled {} active transfer(s)", cancelled);
        }
        cancelled
    }

    pub fn task(&self, id: TaskId) -> Option<TransferTask> {
        self.cell(id).map(|cell| cell.snapshot())
    }

    pub fn tasks(&self) -> Vec<TransferTask> {
        lock(&self.inner.tasks)
            .values()
            .map(|cell| cell.snapshot())
            .collect()
    }

    /// Drops finished tasks from the registry.
    pub fn clear_finished(&self) -> usize {
        let mut tasks = lock(&self.inner.tasks);
        let before = tasks.len();
        tasks.retain(|_, cell| !lock(&cell.task).status().is_terminal());
        before - tasks.len()
    }

    /// Per-task events, starting with the current state.
    pub fn subscribe(&self, id: TaskId) -> Option<Receiver<TransferEvent>> {
        self.cell(id).map(|cell| subscribe_cell(&cell))
    }

    /// Events of every task started from now on, and of those already running.
    pub fn subscribe_all(&self) -> Receiver<TransferEvent> {
        let (tx, rx) = unbounded();
        lock(&self.inner.listeners).push(tx);
        rx
    }

    fn cell(&self, id: TaskId) -> Option<Arc<TaskCell>> {
        lock(&self.inner.tasks).get(&id).cloned()
    }
}

fn subscribe_cell(cell: &TaskCell) -> Receiver<TransferEvent> {
    let (tx, rx) = unbounded();
    // 先发送当前快照，再登记订阅，两步在任务锁内完成
    let task = lock(&cell.task);
    let _ = tx.send(task.event());
    lock(&cell.subscribers).push(tx);
    rx
}

fn cancel_cell(inner: &EngineInner, cell: &TaskCell, force: bool) -> bool {
    cell.update(&inner.listeners, |t| {
        if t.status().is_terminal() {
            return false;
        }
        cell.cancel_requested.store(true, Ordering::SeqCst);
        if force || t.status() == TransferStatus::Pending {
            t.transition(TransferStatus::Cancelled, None)
        } else {
            // 运行中的任务在下一个分块边界处理
            true
        }
    })
}

#[derive(Clone, Copy)]
enum Side {
    Local,
    Remote,
}

fn side_of(direction: TransferDirection, reading: bool) -> Side {
    match (direction, reading) {
        (TransferDirection::Upload, true) | (TransferDirection::Download, false) => Side::Local,
        _ => Side::Remote,
    }
}

fn classify(side: Side, err: io::Error, path: &str, link: &dyn TransferLink) -> TransferError {
    match side {
        Side::Local => TransferError::LocalIoError(format!("{}: {}", path, err)),
        Side::Remote => {
            if link.on_remote_error(&err) {
                TransferError::NotConnected
            } else {
                TransferError::RemoteIoError(format!("{}: {}", path, err))
            }
        }
    }
}

fn run_task(inner: &EngineInner, cell: &TaskCell, link: &dyn TransferLink) {
    let global = &inner.listeners;
    let fail = |err: TransferError| {
        warn!("Transfer #{} failed: {}", lock(&cell.task).id, err);
        cell.update(global, |t| t.transition(TransferStatus::Failed, Some(err)));
    };

    if cell.is_cancel_requested() {
        cell.update(global, |t| t.transition(TransferStatus::Cancelled, None));
        return;
    }

    let snapshot = cell.snapshot();
    if snapshot.status().is_terminal() {
        return;
    }

    let endpoints = match link.open(&snapshot) {
        Ok(endpoints) => endpoints,
        Err(err) => return fail(err),
    };
    let Endpoints {
        mut reader,
        mut writer,
        total_size,
        destination,
    } = endpoints;

    {
        let mut task = lock(&cell.task);
        if let Some(total) = total_size {
            task.set_total_size(total);
        }
        if let Some(destination) = destination {
            task.destination = destination;
        }
    }

    let direction = snapshot.direction;
    let (read_path, write_path) = {
        let task = lock(&cell.task);
        (task.source.clone(), task.destination.clone())
    };

    let mut buffer = vec![0u8; inner.chunk_size];
    let mut transferred: u64 = 0;
    let mut started = false;

    loop {
        if cell.is_cancel_requested() {
            debug!("Transfer #{} cancelled after {} bytes", snapshot.id, transferred);
            cell.update(global, |t| t.transition(TransferStatus::Cancelled, None));
            return;
        }

        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return fail(classify(side_of(direction, true), e, &read_path, link)),
        };

        if let Err(e) = writer.write_all(&buffer[..n]) {
            return fail(classify(side_of(direction, false), e, &write_path, link));
        }
        transferred += n as u64;

        if !started {
            started = true;
            if !cell.update(global, |t| t.transition(TransferStatus::InProgress, None)) {
                return;
            }
        }
        cell.update(global, |t| t.record_progress(transferred));
    }

    if let Err(e) = writer.flush() {
        return fail(classify(side_of(direction, false), e, &write_path, link));
    }
    drop(writer);
    drop(reader);

    if cell.is_cancel_requested() {
        cell.update(global, |t| t.transition(TransferStatus::Cancelled, None));
        return;
    }

    // 空文件没有数据块，补一次状态迁移
    if !started && !cell.update(global, |t| t.transition(TransferStatus::InProgress, None)) {
        return;
    }
    if cell.update(global, |t| t.transition(TransferStatus::Completed, None)) {
        info!("Transfer #{} completed: {} bytes", snapshot.id, transferred);
    }
}

/// Caller-side handle to a scheduled transfer.
#[derive(Clone)]
pub struct TransferHandle {
    cell: Arc<TaskCell>,
    engine: Arc<EngineInner>,
}

impl TransferHandle {
    pub fn id(&self) -> TaskId {
        lock(&self.cell.task).id
    }

    pub fn snapshot(&self) -> TransferTask {
        self.cell.snapshot()
    }

    pub fn status(&self) -> TransferStatus {
        lock(&self.cell.task).status()
    }

    pub fn subscribe(&self) -> Receiver<TransferEvent> {
        subscribe_cell(&self.cell)
    }

    pub fn cancel(&self) -> bool {
        cancel_cell(&self.engine, &self.cell, false)
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(&self) -> TransferTask {
        let events = self.subscribe();
        for event in events.iter() {
            if event.status.is_terminal() {
                break;
            }
        }
        self.snapshot()
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle")
            .field("task", &*lock(&self.cell.task))
            .finish()
    }
}

// 单线程 FIFO 操作队列：状态只归工作线程所有，调用方通过消息访问
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation queue is closed")]
pub struct QueueClosed;

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Runs closures one at a time, in submission order, against state owned by
/// a single worker thread.
pub struct SerialQueue<S> {
    sender: Option<Sender<Job<S>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<S: Send + 'static> SerialQueue<S> {
    pub fn new(name: &str, mut state: S) -> Self {
        let (sender, receiver) = unbounded::<Job<S>>();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    // 单个操作 panic 不能让整个队列停摆
                    if panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                        error!("queued operation panicked");
                    }
                }
                debug!("operation queue drained");
            })
            .ok();

        Self {
            sender: worker.as_ref().map(|_| sender),
            worker,
        }
    }

    /// 排队执行并阻塞等待结果
    pub fn submit<F, T>(&self, f: F) -> Result<T, QueueClosed>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        self.post(move |state| {
            let _ = reply_tx.send(f(state));
        })?;
        reply_rx.recv().map_err(|_| QueueClosed)
    }

    /// 排队执行，不等待
    pub fn post<F>(&self, f: F) -> Result<(), QueueClosed>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(QueueClosed)?;
        sender.send(Box::new(f)).map_err(|_| QueueClosed)
    }
}

impl<S> Drop for SerialQueue<S> {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

// 传输工作线程池
pub mod serial;

pub use serial::{QueueClosed, SerialQueue};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use std::thread;

pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<Sender<Job>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl ThreadPool {
    pub fn new(size: usize, name: &str) -> ThreadPool {
        let size = size.max(1);

        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            workers.push(Worker::new(id, name, receiver.clone()));
        }

        ThreadPool {
            workers,
            sender: Some(sender),
        }
    }

    /// 任务按提交顺序被空闲线程取走；线程池已关闭时返回 false
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(sender) => sender.send(Box::new(f)).is_ok(),
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // 关闭发送端，工作线程处理完剩余任务后退出
        drop(self.sender.take());

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.thread().id() == thread::current().id() {
                    continue;
                }
                let _ = thread.join();
            }
        }
    }
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, name: &str, receiver: Receiver<Job>) -> Worker {
        let thread = thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
                debug!("worker {} exiting", id);
            })
            .ok();

        Worker { thread }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_every_job_before_drop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(3, "test-pool");
            assert_eq!(pool.size(), 3);
            for _ in 0..20 {
                let counter = Arc::clone(&counter);
                assert!(pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn zero_size_is_clamped() {
        let pool = ThreadPool::new(0, "tiny");
        assert_eq!(pool.size(), 1);
    }
}

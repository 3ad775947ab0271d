use std::thread;

use crossbeam_channel::{Sender, unbounded};
use tracing::warn;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared pool that dispatch lanes schedule onto. The remoting runtime
/// normally supplies its own implementation.
pub trait WorkerPool: Send + Sync {
    fn execute(&self, task: Task);
}

/// Minimal channel-fed pool with a fixed number of worker threads. Workers
/// exit once the pool is dropped and the feed runs dry.
pub struct FixedPool {
    feed: Sender<Task>,
}

impl FixedPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "pool needs at least one worker");
        let (feed, work) = unbounded::<Task>();
        for i in 0..size {
            let work = work.clone();
            thread::Builder::new()
                .name(format!("tether-pool-{i}"))
                .spawn(move || {
                    while let Ok(task) = work.recv() {
                        task();
                    }
                })
                .expect("couldn't spawn pool worker");
        }
        Self { feed }
    }
}

impl WorkerPool for FixedPool {
    fn execute(&self, task: Task) {
        if self.feed.send(task).is_err() {
            warn!("worker pool is gone, task dropped");
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use crossbeam_channel::unbounded;

    use super::*;

    #[test]
    fn executes_tasks_on_worker_threads() {
        let pool = Arc::new(FixedPool::new(2));
        let (tx, rx) = unbounded();
        for _ in 0..8 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                let _ = tx.send(thread::current().id());
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert!(!seen.contains(&thread::current().id()));
    }
}

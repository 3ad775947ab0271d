use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
};

use tracing::error;

use crate::pool::{Task, WorkerPool};

struct LaneState {
    queue: VecDeque<Task>,
    /// True while a pool task is draining the queue.
    draining: bool,
}

struct LaneInner {
    pool: Arc<dyn WorkerPool>,
    state: Mutex<LaneState>,
}

impl LaneInner {
    fn drain(&self) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("lane task panicked");
            }
        }
    }
}

/// Single-lane sequencer over a shared [`WorkerPool`].
///
/// Submissions run one at a time in submission order. An idle lane schedules
/// exactly one pool task that drains the queue and goes idle again, so
/// distinct lanes make independent progress on the same pool.
#[derive(Clone)]
pub struct Lane {
    inner: Arc<LaneInner>,
}

impl Lane {
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            inner: Arc::new(LaneInner {
                pool,
                state: Mutex::new(LaneState { queue: VecDeque::new(), draining: false }),
            }),
        }
    }

    /// Appends `task` to the lane. A panicking task is logged and does not
    /// stall the lane.
    pub fn submit(&self, task: Task) {
        let mut state = self.inner.state.lock().unwrap();
        state.queue.push_back(task);
        if state.draining {
            return;
        }
        state.draining = true;
        drop(state);
        let inner = Arc::clone(&self.inner);
        self.inner.pool.execute(Box::new(move || inner.drain()));
    }
}

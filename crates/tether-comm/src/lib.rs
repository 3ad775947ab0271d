mod error;
mod fifo;
mod lane;
mod pool;

pub use error::BufferClosed;
pub use fifo::{Drain, FifoBuffer, Fill};
pub use lane::Lane;
pub use pool::{FixedPool, Task, WorkerPool};

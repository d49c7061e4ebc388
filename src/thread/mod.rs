//! Threading primitives shared by the read and write pipelines.

pub mod pool;
pub mod sorted_queue;

pub use pool::{Task, ThreadPool, WORK_QUEUE_FACTOR};
pub use sorted_queue::SortedQueue;

mod worker_pool;

pub use worker_pool::{Reservation, WorkerPool};

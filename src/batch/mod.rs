pub mod executor;
pub mod pool;

pub use executor::BatchExecutor;
pub use pool::{PoolClosed, WorkerPool};

pub mod events;
pub mod manager;

pub use events::JobEvent;
pub use manager::JobManager;

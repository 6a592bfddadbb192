pub mod batch;
pub mod cli;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod process;
pub mod storage;

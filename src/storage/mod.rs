pub mod log;
pub mod snapshot;

pub mod config;
pub mod engine;
pub mod finalizer;
pub mod fiscal;
pub mod keycodec;
pub mod limits;
pub mod location;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;

pub mod automation;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod opslog;
pub mod reminder;
pub mod scheduler;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;

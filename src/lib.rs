pub mod admission;
pub mod bootstrap;
pub mod broadcast;
pub mod codec;
pub mod compute;
pub mod health;
pub mod health_check;
pub mod job;
pub mod job_runner;
pub mod keys;
pub mod kv;
pub mod metrics;
pub mod result_cache;
pub mod retry;
pub mod server;
pub mod settings;
pub mod status;
pub mod task_broker;
pub mod task_runner;
pub mod trace;

pub use gpugate_macros::test;

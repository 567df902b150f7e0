pub mod chunk_iterator;
pub mod clock;
pub mod local_storage;
pub mod persistence;
pub mod rate_limiter;
pub mod remote_storage;
pub mod runner;
pub mod storage;
pub mod transfer_client;

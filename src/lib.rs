//! Resumable, chunked transfer of backup archives to and from a remote
//! backup backend.
//!
//! Each call to [`services::runner::TransferRunner::tick`] moves as many
//! chunks as its time budget allows, persisting the cursor after every
//! chunk so a later process can resume at the exact byte.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

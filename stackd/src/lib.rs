//! stackd library
//!
//! Git-driven deployment and reconciliation of docker compose stacks.

pub mod app;
pub mod crypto;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;

//! Integration tests for stackd, run against in-memory Git and compose fakes

mod common;
mod test_manager;
mod test_server;
mod test_watcher;

//! Deployment engine: Git checkouts, compose execution and project lifecycle

pub mod cancel;
pub mod compose;
pub mod fsm;
pub mod git;
pub mod lock;
pub mod manager;
pub mod process;

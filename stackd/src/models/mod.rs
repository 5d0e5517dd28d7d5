//! Domain models

pub mod deployment;
pub mod project;

//! Credential encryption

pub mod cipher;

//! Utilities shared by the wsrelay binaries.

pub mod logger;

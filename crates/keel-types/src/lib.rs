#![forbid(unsafe_code)]
#![doc = "Shared types for the keel TLS session engine."]

pub mod codes;
mod error;

pub use error::{ErrorKind, TlsError};

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod manifest;
pub mod manifest_list;
pub mod platform;
pub mod reference;
pub mod registry;
pub mod sync;

pub use error::{Error, ErrorKind, Result};
pub use reference::{Digest, ImageReference};
pub use sync::{SyncResult, Synchronizer};

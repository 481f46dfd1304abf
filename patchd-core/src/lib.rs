pub mod bundle;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod path_safety;
pub mod ratelimit;
pub mod reconcile;
pub mod service;

pub use error::ServiceError;
pub use manifest::{FileEntry, Manifest};

pub mod backend;
pub mod database;
pub mod error;
pub mod executable;
pub mod naming;
pub mod operations;
pub mod record;
pub mod registry;
pub mod runner;
pub mod transaction;

pub use error::{UpkgError, UpkgResult};
pub use operations::PackageManager;

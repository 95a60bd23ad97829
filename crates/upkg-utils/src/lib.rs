//! Shared helpers used across the upkg crates: filesystem primitives, XDG path
//! resolution, per-package file locks and small string utilities.

pub mod error;
pub mod fs;
pub mod lock;
pub mod path;
pub mod string;
pub mod system;

//! Command implementations for the stowage CLI
//!
//! - **install**: install, reinstall, upgrade and remove packages
//! - **list**: installed packages and libraries
//! - **maintenance**: startup sweep, backup pruning, configuration
//! - **utils**: shared helpers (internal)

pub mod install;
pub mod list;
pub mod maintenance;
pub(crate) mod utils;

pub use install::{install, reinstall, remove, upgrade};
pub use list::{libraries, list};
pub use maintenance::{cleanup, config, prune};

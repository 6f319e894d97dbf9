//! Library interface for stowage
//!
//! Installs, upgrades and removes host-application packages and the shared
//! libraries they depend on, and reconciles on-disk state with the
//! `installed_packages` registry across restarts. See [`PackageManager`]
//! for the entry point.

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod fsops;
pub mod host;
pub mod layout;
pub mod library;
pub mod messages;
pub mod metadata;
pub mod package_io;
pub mod package_manager;
pub mod platform;
pub mod registry;
pub mod resolver;
pub mod selector;
pub mod transport;
pub mod usage;
pub mod version;

// Re-export commonly used types
pub use cleanup::CleanupReport;
pub use error::{ErrorKind, Result, StowageError};
pub use package_manager::{OutdatedPackage, Outcome, PackageManager};
pub use resolver::LibraryRef;
pub use version::PackageVersion;

//! Names and limits shared across crates.

/// Crate version, from the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Program name used in logs and the CLI.
pub const NAME: &str = "groupcast";

/// Longest accepted group name, in bytes.
pub const MAX_GROUP_NAME_LEN: usize = 100;

/// Separates the configured topic prefix from the group name.
pub const GROUP_TOPIC_INFIX: &str = "__group__";

//! Embedded templates for sandboxd files.

/// Default `sandboxd.toml` configuration.
pub(crate) const SANDBOXD_TOML: &str = include_str!("sandboxd.toml");

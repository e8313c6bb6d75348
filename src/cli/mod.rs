//! CLI command handlers.

pub(crate) mod check;
pub(crate) mod common;
pub(crate) mod discover;
pub(crate) mod sign;
pub(crate) mod watch;

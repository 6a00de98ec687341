//! Subcommand implementations.

pub(crate) mod check;
pub(crate) mod index;
pub(crate) mod run;

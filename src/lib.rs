//! Plexus host: configuration, builtin modules and the frame loop driving them.

pub mod builtin;
pub mod entrypoint;
pub mod utils;

//! Platform-specific directory discovery.

pub mod paths;

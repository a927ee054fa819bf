//! Shared utilities

mod expiring;

pub use expiring::ExpiringSet;

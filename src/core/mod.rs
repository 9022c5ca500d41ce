//! Core infrastructure: configuration, errors, scheduling, runtime.

pub mod config;
pub mod error;
pub mod runtime;
pub mod schedule;

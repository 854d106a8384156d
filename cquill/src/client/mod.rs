//! This module holds entities that represent the driver's client of the
//! cluster:
//! - [Session](session::Session) - the main entity of the driver: owns the
//!   connection pools and routes every request through a query plan,
//! - [SessionBuilder](session_builder::SessionBuilder) - a convenient
//!   builder for a `Session`,
//! - [SessionConfig](config::SessionConfig) and friends - everything a
//!   session is parameterized with.

pub mod config;
pub mod session;
pub mod session_builder;

#[cfg(test)]
mod session_test;

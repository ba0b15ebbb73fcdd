//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `roomcast` application.
//!
//! This module centralizes the error taxonomy shared by the store, registry
//! and broadcast layers, and the logging bootstrap used by the binary.

pub mod error;
pub mod logging;

pub use error::{HubError, StoreError};

//! Core components shared by every subsystem.
//!
//! This module contains the foundational building blocks of the library:
//! - The primary [`TenaceError`] type and its per-concern companions.
//! - Shared vocabulary models like [`RequestIdentity`] and [`ResponseRecord`].

/// The primary error type (`TenaceError`) and per-concern error enums.
pub mod error;
/// Shared vocabulary models used across subsystems.
pub mod models;

// convenient re-exports so most code can just `use crate::core::TenaceError`
pub use error::{
    AuthError, CacheError, PayloadError, ResponseError, StatusHandlerError, TenaceError,
};
pub use models::{RequestIdentity, ResponseRecord};

//! # NestDB Testkit
//!
//! Test utilities for NestDB.
//!
//! This crate provides:
//! - Fixtures: table definitions, seeded engines and session helpers
//! - Property-based test generators using proptest
//! - A scripted scenario runner with a reference model of expected outcomes
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use nestdb_testkit::prelude::*;
//!
//! let engine = seeded_engine();
//! let mut session = session(&engine);
//! session.begin().unwrap();
//! session.add(USERS, user("wendy"));
//! session.commit().unwrap();
//! assert!(committed_names(&engine).contains(&"wendy".to_string()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scenario;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenario::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scenario::*;

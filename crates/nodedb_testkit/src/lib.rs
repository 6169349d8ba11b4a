//! # nodedb Testkit
//!
//! Test utilities for nodedb.
//!
//! This crate provides:
//! - A ready engine over memory or file stores with a reference schema
//! - Property-based test generators using proptest
//! - Concurrency stress helpers
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nodedb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     let t = TestEngine::memory();
//!     t.transaction(|_| {
//!         let site = add_site(&t, "news")?;
//!         add_story(&t, &site, "hello", "sports")
//!     })
//!     .unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use stress::*;

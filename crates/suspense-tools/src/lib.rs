//! # SuspenseCore Tools
//!
//! Development tools for SuspenseCore inventories.
//!
//! This crate provides:
//! - Text command console with the `inv.*` command set
//! - Grid debugger (text rendering, reports, integrity checks)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod console;
pub mod debugger;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::console::*;
    pub use crate::debugger::*;
}

pub use prelude::*;

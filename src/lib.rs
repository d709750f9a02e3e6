//! Native container-image build core.
//!
//! Four tightly-coupled components: the build graph an executor walks
//! ([`graph`], [`scheduler`]), snapshot lifecycle and per-stage
//! mutable state ([`snapshot`], [`context`]), canonical Merkle
//! diffing of filesystem deltas ([`diff`], [`diffkey`]), and a
//! content-addressable cache of operation results ([`cache`]).

#![deny(unused_imports, unused_must_use)]
#![warn(unused_variables, dead_code)]

pub mod binary_path;
pub mod cache;
pub mod context;
pub mod diff;
pub mod diffkey;
pub mod digest;
pub mod error;
pub mod graph;
pub mod platform;
pub mod scheduler;
pub mod snapshot;

pub use binary_path::BinaryPath;
pub use digest::Digest;
pub use error::{Error, Result};
pub use platform::Platform;

//! Strand Core
//!
//! This crate provides a transactional, glitch-free functional reactive
//! programming runtime. It implements:
//!
//! - A vertex registry with rank ordering and cycle collection
//! - Transactions that propagate every firing in one consistent pass
//! - Streams, cells, loops and listeners built on top of the core
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Vertex registry, ranks, lifetime management and traversal
//! - `transaction`: The close algorithm, the action queue and the ambient
//!   transaction context
//! - `reactive`: User-facing streams and cells
//! - `config`: Debug trace configuration
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_core::reactive::{CellSink, StreamSink};
//! use strand_core::transaction;
//!
//! let price = CellSink::new(10);
//! let quantity = CellSink::new(2);
//! let total = price.lift(&quantity, |p, q| p * q);
//!
//! let _l = total.listen(|t| println!("total: {t}"))?;
//!
//! // Both changes land in one transaction; the listener sees 60 only.
//! transaction::run(|_| {
//!     price.send(20)?;
//!     quantity.send(3)
//! })?;
//! ```
//!
//! Everything lives in thread-local state. Handles are `!Send`, and each
//! thread runs its own independent graph.

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod transaction;
pub(crate) mod vertex;

pub use config::{enable_debug, EngineConfig};
pub use error::{Result, StrandError};
pub use graph::{collect_cycles, stats, total_registrations, GraphStats, VertexId};
pub use reactive::{Cell, CellLoop, CellSink, Listener, Router, Stream, StreamLoop, StreamSink};
pub use transaction::{Phase, Transaction};

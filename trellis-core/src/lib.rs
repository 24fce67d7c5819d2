//! Pruned finite-state intersection for lattice decoding.
//!
//! Given a batch of decoding graphs and dense per-frame acoustic scores,
//! the engine runs a time-synchronous forward search with a dynamic beam,
//! prunes backwards behind the forward pass on a second worker, and emits a
//! pruned lattice per utterance together with maps back into the graph arcs
//! and the score matrix.
//!
//! ```no_run
//! use trellis_core::{intersect_dense_pruned, Arc, Context, DenseFsaVec, FsaVec};
//! use trellis_core::PrunedIntersectParams;
//!
//! # fn run() -> trellis_core::Result<()> {
//! let graph = FsaVec::from_fsas(
//!     Context::Cpu,
//!     &[(3, vec![Arc::new(0, 1, 0, 0.0), Arc::new(1, 2, -1, 0.0)])],
//! )?;
//! let neg = f32::NEG_INFINITY;
//! let scores = DenseFsaVec::from_scores(
//!     Context::Cpu,
//!     &[vec![vec![neg, 0.0], vec![0.0, neg]]],
//! )?;
//! let params = PrunedIntersectParams {
//!     search_beam: 20.0,
//!     output_beam: 8.0,
//!     min_active: 1,
//!     max_active: 10_000,
//!     allow_partial: false,
//! };
//! let out = intersect_dense_pruned(&graph, &scores, &params)?;
//! println!("{} lattice arcs", out.lattice.num_arcs());
//! # Ok(())
//! # }
//! ```

pub mod context;
mod error;
mod float;
pub mod fsa;
mod hash;
pub mod intersect;
pub mod ragged;

pub use context::Context;
pub use error::{Error, Result};
pub use fsa::{best_path_score, Arc, DenseFsaVec, FsaVec};
pub use intersect::{
    intersect_dense_pruned, DecodeState, OnlineDenseIntersecter, PrunedIntersectParams,
    PrunedLattice,
};

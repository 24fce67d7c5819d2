//! Pruned intersection of decoding graphs with dense acoustic scores.
//!
//! The entry points are [`intersect_dense_pruned`] for whole utterances and
//! [`OnlineDenseIntersecter`] for chunked decoding. Both run the same
//! per-frame cycle: expand the arcs leaving every active state, prune them
//! against a dynamic beam, deduplicate destination states through a
//! concurrent hash, and accumulate forward log-likes with atomic max. A
//! backward worker runs behind the forward pass and rewrites finished frame
//! ranges in place, so memory stays bounded to roughly one prune window.
use std::sync::mpsc;
use std::sync::Arc as StdArc;

use crate::hash::{KeyBits, StateHash};
use crate::{DenseFsaVec, Error, FsaVec, Result};

mod assemble;
mod beam;
mod frame;
mod forward;
mod online;
mod prune;

pub use online::{DecodeState, OnlineDenseIntersecter};

use beam::BeamController;
use frame::FrameStore;
use prune::{PruneWindow, Semaphore, PRUNE_NUM_FRAMES, PRUNE_SHIFT};

/// Search parameters of the pruned intersection.
#[derive(Debug, Clone, PartialEq)]
pub struct PrunedIntersectParams {
    /// Beam below the best arc end-log-like during search; must be positive.
    pub search_beam: f32,
    /// Beam below the best path when emitting the lattice; must be positive.
    pub output_beam: f32,
    /// Advisory lower bound on active states per utterance per frame.
    pub min_active: usize,
    /// Advisory upper bound on active states; must exceed `min_active`.
    pub max_active: usize,
    /// Synthesize a -1-labeled final arc for utterances whose search never
    /// reaches a real final state.
    pub allow_partial: bool,
}

impl PrunedIntersectParams {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.search_beam > 0.0) || !(self.output_beam > 0.0) {
            return Err(Error::ConfigInvalid {
                msg: format!(
                    "beams must be positive, got search {} output {}",
                    self.search_beam, self.output_beam
                ),
            }
            .bt());
        }
        if self.max_active <= self.min_active {
            return Err(Error::ConfigInvalid {
                msg: format!(
                    "max_active ({}) must exceed min_active ({})",
                    self.max_active, self.min_active
                ),
            }
            .bt());
        }
        Ok(())
    }
}

/// Output of the batch intersection: the lattice plus per-arc maps into the
/// graph arcs (-1 for synthesized arcs) and into the dense score matrix.
#[derive(Debug)]
pub struct PrunedLattice {
    pub lattice: FsaVec,
    pub arc_map_a: Vec<i32>,
    pub arc_map_b: Vec<i32>,
}

/// Intersects a batch of decoding graphs with dense per-frame scores and
/// returns the pruned lattices. `a_fsas` holds either one graph per
/// utterance of `b_fsas` or a single graph shared by all of them.
pub fn intersect_dense_pruned(
    a_fsas: &FsaVec,
    b_fsas: &DenseFsaVec,
    params: &PrunedIntersectParams,
) -> Result<PrunedLattice> {
    params.validate()?;
    a_fsas
        .context()
        .same_context(b_fsas.context(), "intersect_dense_pruned")?;
    let num_seqs = b_fsas.dim0();
    if a_fsas.dim0() != 1 && a_fsas.dim0() != num_seqs {
        return Err(Error::ConfigInvalid {
            msg: format!(
                "a_fsas must hold 1 or {} fsas, got {}",
                num_seqs,
                a_fsas.dim0()
            ),
        }
        .bt());
    }
    let final_ts: Vec<usize> = (0..num_seqs).map(|i| b_fsas.len(i)).collect();
    let mut engine = Intersecter::new(a_fsas, num_seqs, params.clone(), false, final_ts.clone())?;
    engine.init_start_frame()?;

    let t_steps = b_fsas.max_len();
    let gate = Semaphore::new(1);
    let (tx, rx) = mpsc::channel::<PruneWindow>();
    let worker_frames = engine.frames.clone();
    let output_beam = params.output_beam;

    let mut forward_res: Result<()> = Ok(());
    let mut worker_res: Result<()> = Ok(());
    std::thread::scope(|s| {
        let gate = &gate;
        let handle = s.spawn(move || {
            prune::backward_worker(rx, gate, &worker_frames, a_fsas, output_beam)
        });
        forward_res = (|| {
            for t in 0..t_steps {
                engine.propagate(t, b_fsas, 0)?;
                if t > 0 && t % PRUNE_SHIFT == 0 {
                    let window = PruneWindow {
                        begin_t: t.saturating_sub(PRUNE_NUM_FRAMES),
                        end_t: t,
                    };
                    if tx.send(window).is_err() {
                        // The worker died; its error surfaces at join.
                        break;
                    }
                    gate.acquire();
                }
            }
            // Drain: the last window ends on the true final frame.
            let _ = tx.send(PruneWindow {
                begin_t: t_steps.saturating_sub(PRUNE_NUM_FRAMES),
                end_t: t_steps,
            });
            Ok(())
        })();
        drop(tx);
        worker_res = handle
            .join()
            .unwrap_or_else(|_| Err(Error::Msg("backward worker panicked".to_string())));
    });
    forward_res?;
    worker_res?;

    let frames = engine.into_frames();
    let (lattice, arc_map_a, arc_map_b) = assemble::format_output(
        &frames,
        a_fsas,
        &final_ts,
        params.allow_partial,
        Some(b_fsas),
    )?;
    Ok(PrunedLattice {
        lattice,
        arc_map_a,
        arc_map_b,
    })
}

/// The engine state shared by batch and online decoding.
pub(crate) struct Intersecter<'a> {
    graph: &'a FsaVec,
    params: PrunedIntersectParams,
    num_seqs: usize,
    shared_graph: bool,
    key_stride: u64,
    frames: StdArc<FrameStore>,
    beams: BeamController,
    hash: StateHash,
    online: bool,
    /// Per-utterance score frame count (sentinel included); `usize::MAX`
    /// while decoding online chunks.
    final_ts: Vec<usize>,
}

impl<'a> Intersecter<'a> {
    pub(crate) fn new(
        graph: &'a FsaVec,
        num_seqs: usize,
        params: PrunedIntersectParams,
        online: bool,
        final_ts: Vec<usize>,
    ) -> Result<Self> {
        let shared_graph = graph.dim0() == 1;
        let tot_states = graph.tot_states() as u64;
        let (key_stride, num_keys) = if shared_graph {
            (tot_states, tot_states * num_seqs as u64)
        } else {
            (0, tot_states)
        };
        let key_bits = KeyBits::pick(num_keys.max(1))?;
        let hash = StateHash::new(num_seqs * 4 * params.max_active, key_bits);
        Ok(Self {
            graph,
            num_seqs,
            shared_graph,
            key_stride,
            frames: StdArc::new(FrameStore::new()),
            beams: BeamController::new(
                num_seqs,
                params.search_beam,
                params.min_active,
                params.max_active,
            ),
            hash,
            online,
            final_ts,
            params,
        })
    }

    pub(crate) fn restore_beams(&mut self, beams: Vec<f32>) {
        self.beams = BeamController::with_beams(
            beams,
            self.params.search_beam,
            self.params.min_active,
            self.params.max_active,
        );
    }

    pub(crate) fn beams(&self) -> &[f32] {
        self.beams.beams()
    }

    /// Graph fsa index backing utterance `i`.
    pub(crate) fn graph_fsa(&self, i: usize) -> usize {
        if self.shared_graph {
            0
        } else {
            i
        }
    }

    /// Packed hash key of a (utterance, graph state) pair.
    pub(crate) fn state_key(&self, fsa: usize, a_state_idx01: usize) -> u64 {
        fsa as u64 * self.key_stride + a_state_idx01 as u64
    }

    /// Takes the frames out once both workers are done.
    pub(crate) fn into_frames(self) -> Vec<frame::FrameInfo> {
        FrameStore::into_frames(self.frames)
    }
}

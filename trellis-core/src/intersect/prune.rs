//! Concurrent backward pruning.
//!
//! The backward worker runs behind the forward pass. The forward worker
//! signals it a frame range, then blocks on a gate whose initial count of 1
//! lets the first window proceed without a matching release; the effect is
//! that forward is only ever blocked by the *previous* prune window, capping
//! memory to roughly one window ahead. Windows overlap (stride < size), so
//! frames first pruned with a mid-stream backward estimate get re-pruned
//! later with a tighter one. Setting `backward = -forward` on the window's
//! final frame makes `forward + backward` a best-path-relative quantity and
//! under-prunes mid-stream, which is the safe direction.
use std::sync::mpsc::Receiver;
use std::sync::{Condvar, Mutex};

use rayon::prelude::*;
use tracing::debug;

use crate::ragged::{exclusive_sum, Ragged, RaggedShape, Renumbering};
use crate::{FsaVec, Result};

use super::frame::{ArcDest, FrameInfo, FrameStore, StateInfo};

/// Frames per prune window and the stride between window starts.
pub(crate) const PRUNE_NUM_FRAMES: usize = 30;
pub(crate) const PRUNE_SHIFT: usize = 20;

/// Backward log-likes at or below this count as unreachable. Finite rather
/// than -inf so denormal arithmetic cannot sneak a dead state past the test.
const BACKWARD_MIN: f32 = f32::MIN / 2.0;

#[derive(Debug, Clone, Copy)]
pub(crate) struct PruneWindow {
    pub begin_t: usize,
    pub end_t: usize,
}

/// A counting semaphore in the Mutex + Condvar idiom.
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub(crate) fn release(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_one();
    }
}

/// Body of the backward worker: prune every window the forward pass hands
/// over, in issuance order, releasing the forward gate after each one.
pub(crate) fn backward_worker(
    rx: Receiver<PruneWindow>,
    gate: &Semaphore,
    frames: &FrameStore,
    graph: &FsaVec,
    output_beam: f32,
) -> Result<()> {
    while let Ok(window) = rx.recv() {
        let res = prune_time_range(frames, graph, output_beam, window.begin_t, window.end_t);
        // Release before surfacing any error so the forward worker can never
        // be left blocked on the gate.
        gate.release();
        res?;
    }
    Ok(())
}

/// Computes backward log-likes over `[begin_t, end_t]`, marks surviving
/// states and arcs, and rewrites frames `[begin_t, end_t)` in place with
/// compacted numbering. States on `begin_t` are pinned: arcs on
/// `begin_t - 1` reference them by index, so they are never renumbered.
pub(crate) fn prune_time_range(
    frames: &FrameStore,
    graph: &FsaVec,
    output_beam: f32,
    begin_t: usize,
    end_t: usize,
) -> Result<()> {
    debug_assert!(begin_t <= end_t && end_t < frames.len());
    let is_final = |a_state: i32| -> bool {
        if a_state < 0 {
            return false;
        }
        let a = a_state as usize;
        a + 1 == graph.state_range(graph.fsa_of_state(a)).end
    };

    // Normalize the window's final frame so forward + backward is relative
    // to the locally best path.
    let end_handle = frames.get(end_t);
    let mut next_backward: Vec<f32> = {
        let mut f = end_handle.lock().unwrap();
        for s in f.states.values.iter_mut() {
            s.backward_loglike = if s.forward_loglike > f32::NEG_INFINITY {
                -s.forward_loglike
            } else {
                f32::NEG_INFINITY
            };
        }
        f.states.values.iter().map(|s| s.backward_loglike).collect()
    };

    let num_frames = end_t - begin_t;
    let mut keep_states: Vec<Vec<bool>> = vec![Vec::new(); num_frames];
    let mut keep_arcs: Vec<Vec<bool>> = vec![Vec::new(); num_frames];

    for t in (begin_t..end_t).rev() {
        let handle = frames.get(t);
        let mut f = handle.lock().unwrap();
        let states = &f.states;
        let arcs = &f.arcs;
        let per_state: Vec<(f32, Vec<bool>)> = (0..states.len())
            .into_par_iter()
            .map(|si| {
                let sinfo = states.values[si];
                let range = arcs.shape.row_range(2, si);
                let mut best = f32::NEG_INFINITY;
                let mut keep = Vec::with_capacity(range.len());
                for j in range {
                    let a = arcs.values[j];
                    let kept = match a.dest {
                        ArcDest::Frame(d) if d >= 0 => {
                            let arc_back = a.arc_loglike + next_backward[d as usize];
                            if arc_back + sinfo.forward_loglike >= -output_beam {
                                best = best.max(arc_back);
                                true
                            } else {
                                false
                            }
                        }
                        _ => false,
                    };
                    keep.push(kept);
                }
                let backward = if is_final(sinfo.a_fsas_state_idx01) {
                    if sinfo.forward_loglike > f32::NEG_INFINITY {
                        -sinfo.forward_loglike
                    } else {
                        f32::NEG_INFINITY
                    }
                } else {
                    best
                };
                debug_assert!(
                    !(backward.is_finite() && sinfo.forward_loglike.is_finite())
                        || backward + sinfo.forward_loglike <= 2.0,
                    "backward log-like exceeds its upper bound"
                );
                (backward, keep)
            })
            .collect();

        let mut kstates = Vec::with_capacity(per_state.len());
        let mut karcs = Vec::new();
        for (si, (backward, keep)) in per_state.into_iter().enumerate() {
            f.states.values[si].backward_loglike = backward;
            kstates.push(t == begin_t || backward > BACKWARD_MIN);
            karcs.extend(keep);
        }
        next_backward = f.states.values.iter().map(|s| s.backward_loglike).collect();
        keep_states[t - begin_t] = kstates;
        keep_arcs[t - begin_t] = karcs;
    }

    // Batch-compact the window. Destination indices of frame t point into
    // frame t + 1's renumbering, except on the window's last frame whose
    // destinations (the states on end_t) keep their numbering.
    let renums: Vec<Renumbering> = keep_states.iter().map(|k| Renumbering::from_keep(k)).collect();
    for t in begin_t..end_t {
        let handle = frames.get(t);
        let mut f = handle.lock().unwrap();
        let renum = &renums[t - begin_t];
        let karcs = &keep_arcs[t - begin_t];
        let num_fsas = f.states.shape.dim0();

        let new_states: Vec<StateInfo> =
            renum.new2old.iter().map(|&o| f.states.values[o]).collect();
        let mut state_counts = vec![0usize; num_fsas];
        {
            let state_fsa = f.states.shape.row_ids(1);
            for &o in renum.new2old.iter() {
                state_counts[state_fsa[o]] += 1;
            }
        }

        let mut arc_counts = Vec::with_capacity(renum.num_new());
        let mut new_arcs = Vec::new();
        for &o in renum.new2old.iter() {
            let range = f.arcs.shape.row_range(2, o);
            let mut count = 0usize;
            for j in range {
                if !karcs[j] {
                    continue;
                }
                let mut a = f.arcs.values[j];
                if t + 1 < end_t {
                    if let ArcDest::Frame(d) = a.dest {
                        let nd = renums[t + 1 - begin_t].old2new[d as usize];
                        debug_assert!(nd >= 0, "kept arc points at a pruned state");
                        a.dest = ArcDest::Frame(nd);
                    }
                }
                new_arcs.push(a);
                count += 1;
            }
            arc_counts.push(count);
        }
        debug_assert_eq!(new_arcs.len(), karcs.iter().filter(|&&k| k).count());

        let states_shape = RaggedShape::from_row_splits(exclusive_sum(&state_counts))?;
        let arcs_shape = RaggedShape::compose(
            &states_shape,
            &RaggedShape::from_row_splits(exclusive_sum(&arc_counts))?,
        )?;
        *f = FrameInfo {
            states: Ragged::new(states_shape, new_states)?,
            arcs: Ragged::new(arcs_shape, new_arcs)?,
        };
    }
    debug!(begin_t, end_t, "pruned time range");
    Ok(())
}

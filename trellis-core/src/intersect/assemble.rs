//! Lattice assembly.
//!
//! Stitches the per-frame arc tables into one output FsaVec. Conceptually
//! this stacks the frames along a new axis, transposes to
//! `[fsa][frame][state][arc]` and removes the frame axis; here the stacked
//! traversal is done directly in (fsa, frame, state, arc) order, which is
//! exactly the output arc order.
use crate::fsa::Arc;
use crate::{DenseFsaVec, FsaVec, Result};

use super::frame::{ArcDest, FrameInfo};

/// Builds the output lattice plus `arc_map_a` (graph arcs, -1 for
/// synthesized arcs) and, when `scores` is given, `arc_map_b` (entries of
/// the dense score matrix).
///
/// Utterances with a start state but no surviving state on their final frame
/// get one extra trailing state; without it a consumer would read whatever
/// state happens to be last as the final state.
pub(crate) fn format_output(
    frames: &[FrameInfo],
    graph: &FsaVec,
    final_ts: &[usize],
    allow_partial: bool,
    scores: Option<&DenseFsaVec>,
) -> Result<(FsaVec, Vec<i32>, Vec<i32>)> {
    let num_seqs = final_ts.len();
    let num_frames = frames.len();

    // Per-utterance state offsets by frame, plus the trailing placeholder.
    let mut offsets: Vec<Vec<usize>> = Vec::with_capacity(num_seqs);
    let mut placeholder = vec![false; num_seqs];
    for i in 0..num_seqs {
        let has_start = !frames[0].states.shape.row_range(1, i).is_empty();
        let final_idx = final_ts[i].min(num_frames - 1);
        let final_empty = frames[final_idx].states.shape.row_range(1, i).is_empty();
        placeholder[i] = has_start && final_empty;
        let mut off = Vec::with_capacity(num_frames + 1);
        let mut cum = 0usize;
        for frame in frames.iter() {
            off.push(cum);
            cum += frame.states.shape.row_range(1, i).len();
        }
        off.push(cum);
        offsets.push(off);
    }

    let mut per_fsa: Vec<(usize, Vec<Arc>)> = (0..num_seqs)
        .map(|i| {
            let num_states = offsets[i][num_frames] + placeholder[i] as usize;
            (num_states, Vec::new())
        })
        .collect();
    let mut arc_map_a = Vec::new();
    let mut arc_map_b = Vec::new();

    for i in 0..num_seqs {
        for (t, fi) in frames.iter().enumerate() {
            let srange = fi.states.shape.row_range(1, i);
            for (s_local, si) in srange.enumerate() {
                for j in fi.arcs.shape.row_range(2, si) {
                    let a = fi.arcs.values[j];
                    let d = match a.dest {
                        ArcDest::Frame(d) if d >= 0 => d as usize,
                        _ => {
                            debug_assert!(false, "unpruned arc reached assembly");
                            continue;
                        }
                    };
                    let next = &frames[t + 1];
                    let dest_idx1 = d - next.states.shape.row_splits(1)[i];
                    let src_out = offsets[i][t] + s_local;
                    let dest_out = offsets[i][t + 1] + dest_idx1;
                    let graph_arc = graph.arc(a.a_fsas_arc_idx012 as usize);
                    let mut label = graph_arc.label;
                    let mut map_a = a.a_fsas_arc_idx012;
                    if allow_partial && t + 1 == final_ts[i] && label != -1 {
                        // A partial path terminated through the final-frame
                        // rewrite: relabel to the final symbol and mark the
                        // arc as synthesized.
                        label = -1;
                        map_a = -1;
                    }
                    per_fsa[i].1.push(Arc::new(
                        src_out as i32,
                        dest_out as i32,
                        label,
                        a.arc_loglike,
                    ));
                    arc_map_a.push(map_a);
                    if let Some(b) = scores {
                        let row = b.row_offset(i) + t;
                        arc_map_b.push((row * b.width()) as i32 + label + 1);
                    }
                }
            }
        }
    }

    let lattice = FsaVec::from_fsas(*graph.context(), &per_fsa)?;
    Ok((lattice, arc_map_a, arc_map_b))
}

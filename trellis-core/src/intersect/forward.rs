//! Arc expansion and per-frame forward propagation.
use rayon::prelude::*;
use tracing::debug;

use crate::float::LogLikeCell;
use crate::ragged::{exclusive_sum, max_per_sublist, Ragged, RaggedShape, Renumbering};
use crate::{DenseFsaVec, Error, Result};

use super::frame::{ArcDest, ArcInfo, FrameInfo, StateInfo};
use super::Intersecter;

impl<'a> Intersecter<'a> {
    /// Seeds frame 0 with one start state per utterance (none for utterances
    /// whose graph has no states).
    pub(crate) fn init_start_frame(&self) -> Result<()> {
        let mut counts = vec![0usize; self.num_seqs];
        let mut states = Vec::with_capacity(self.num_seqs);
        for i in 0..self.num_seqs {
            if let Some(start) = self.graph.start_state(self.graph_fsa(i)) {
                counts[i] = 1;
                states.push(StateInfo::new(start as i32, 0.0));
            }
        }
        let shape = RaggedShape::from_row_splits(exclusive_sum(&counts))?;
        self.frames.push(FrameInfo::new(Ragged::new(shape, states)?)?);
        Ok(())
    }

    /// Runs one frame of the forward pass: expands the arcs leaving frame
    /// `t`'s states, prunes them against the dynamic beam, deduplicates
    /// destination states through the hash and seeds frame `t + 1` with
    /// max-reduced forward log-likes. Scores for frame `t` are read from row
    /// `t - score_offset` of `scores` (the offset is nonzero only when
    /// resuming online decoding mid-stream).
    pub(crate) fn propagate(
        &mut self,
        t: usize,
        scores: &DenseFsaVec,
        score_offset: usize,
    ) -> Result<()> {
        let cur_handle = self.frames.get(t);
        let mut cur = cur_handle.lock().unwrap();
        let num_seqs = self.num_seqs;

        let states = &cur.states;
        let state_fsa = states.shape.row_ids(1);
        let counts: Vec<usize> = states
            .values
            .iter()
            .map(|s| self.graph.arc_range(s.a_fsas_state_idx01 as usize).len())
            .collect();
        let arc_splits = exclusive_sum(&counts);
        let total_arcs = *arc_splits.last().unwrap();
        let arcs_shape = RaggedShape::compose(
            &states.shape,
            &RaggedShape::from_row_splits(arc_splits)?,
        )?;
        let row_ids2 = arcs_shape.row_ids(2);
        let row_splits2 = arcs_shape.row_splits(2);

        // On an utterance's sentinel frame with allow_partial, reroute every
        // arc to the graph's final state unless a real final arc can leave
        // some active state.
        let rewrite: Vec<bool> = (0..num_seqs)
            .map(|i| {
                if self.online || !self.params.allow_partial || t + 1 != self.final_ts[i] {
                    return false;
                }
                let has_final_arc = states.shape.row_range(1, i).any(|si| {
                    self.graph
                        .arc_range(states.values[si].a_fsas_state_idx01 as usize)
                        .any(|ga| self.graph.arc(ga).label == -1)
                });
                !has_final_arc
            })
            .collect();

        let mut arcs: Vec<ArcInfo> = (0..total_arcs)
            .into_par_iter()
            .map(|j| {
                let si = row_ids2[j];
                let i = state_fsa[si];
                let sinfo = &states.values[si];
                let a_state = sinfo.a_fsas_state_idx01 as usize;
                let ga = self.graph.arc_range(a_state).start + (j - row_splits2[si]);
                let arc = self.graph.arc(ga);
                let gf = self.graph_fsa(i);
                let (acoustic, dest_idx1) = if rewrite[i] {
                    (0.0, self.graph.num_states(gf) as i32 - 1)
                } else {
                    (scores.score(i, t - score_offset, arc.label), arc.dest_state)
                };
                let arc_loglike = arc.score + acoustic;
                let dest_idx01 = self.graph.state_range(gf).start as i32 + dest_idx1;
                ArcInfo {
                    a_fsas_arc_idx012: ga as i32,
                    arc_loglike,
                    end_loglike: sinfo.forward_loglike + arc_loglike,
                    dest: ArcDest::Graph(dest_idx01),
                }
            })
            .collect();

        // Per-utterance cutoffs from the dynamic beams.
        let rs1 = arcs_shape.row_splits(1);
        let fsa_arc_splits: Vec<usize> = rs1.iter().map(|&s| row_splits2[s]).collect();
        let end_loglikes: Vec<f32> = arcs.iter().map(|a| a.end_loglike).collect();
        let best = max_per_sublist(&end_loglikes, &fsa_arc_splits);
        let active: Vec<usize> = (0..num_seqs)
            .map(|i| states.shape.row_range(1, i).len())
            .collect();
        let cutoffs = self
            .beams
            .cutoffs(t, &self.final_ts, &best, &active, self.online);

        if total_arcs as u64 >= self.hash.value_limit() {
            return Err(Error::CapacityExceeded {
                what: "frame arcs",
                count: total_arcs as u64,
                limit: self.hash.value_limit(),
            }
            .bt());
        }
        if total_arcs.next_power_of_two() > self.hash.capacity() {
            // The hash is guaranteed empty between frames, so this is a
            // plain reallocation.
            self.hash.resize(total_arcs.next_power_of_two());
        }
        debug_assert_eq!(self.hash.num_entries(), 0);

        // One arc wins per surviving destination state.
        let keep: Vec<bool> = (0..total_arcs)
            .into_par_iter()
            .map(|j| {
                let i = state_fsa[row_ids2[j]];
                let a = &arcs[j];
                if a.end_loglike > cutoffs[i] {
                    match a.dest {
                        ArcDest::Graph(d) => {
                            self.hash.insert(self.state_key(i, d as usize), j as u64)
                        }
                        _ => unreachable!("arcs carry graph destinations before dedup"),
                    }
                } else {
                    false
                }
            })
            .collect();

        let renum = Renumbering::from_keep(&keep);
        let num_new = renum.num_new();
        let next_state_fsa: Vec<usize> = renum
            .new2old
            .iter()
            .map(|&old| state_fsa[row_ids2[old]])
            .collect();
        debug_assert!(next_state_fsa.windows(2).all(|w| w[0] <= w[1]));
        let mut next_counts = vec![0usize; num_seqs];
        for &i in next_state_fsa.iter() {
            next_counts[i] += 1;
        }

        let mut next_states: Vec<StateInfo> = renum
            .new2old
            .iter()
            .map(|&old| match arcs[old].dest {
                ArcDest::Graph(d) => StateInfo::new(d, f32::NEG_INFINITY),
                _ => unreachable!("winning arcs carry graph destinations"),
            })
            .collect();
        let accum: Vec<LogLikeCell> = (0..num_new).map(|_| LogLikeCell::neg_inf()).collect();

        // Swap the hash values from winning arc index to next-frame state
        // index, then resolve every surviving arc against it.
        (0..num_new).into_par_iter().for_each(|k| {
            let key = self.state_key(
                next_state_fsa[k],
                next_states[k].a_fsas_state_idx01 as usize,
            );
            let found = self.hash.replace_value(key, k as u64);
            debug_assert!(found, "winning destination vanished from the hash");
        });

        arcs.par_iter_mut().enumerate().for_each(|(j, a)| {
            let i = state_fsa[row_ids2[j]];
            if a.end_loglike > cutoffs[i] {
                let d = match a.dest {
                    ArcDest::Graph(d) => d,
                    _ => unreachable!("arcs carry graph destinations before dedup"),
                };
                match self.hash.find(self.state_key(i, d as usize)) {
                    Some(v) => {
                        a.dest = ArcDest::Frame(v as i32);
                        accum[v as usize].fetch_max(a.end_loglike);
                    }
                    None => a.dest = ArcDest::Pruned,
                }
            } else {
                a.dest = ArcDest::Pruned;
            }
        });

        // Drain; the hash must be empty outside a single frame's propagation.
        (0..num_new).into_par_iter().for_each(|k| {
            self.hash.delete(self.state_key(
                next_state_fsa[k],
                next_states[k].a_fsas_state_idx01 as usize,
            ));
        });
        debug_assert_eq!(self.hash.num_entries(), 0);

        for (s, c) in next_states.iter_mut().zip(accum.iter()) {
            s.forward_loglike = c.get();
        }

        debug!(
            t,
            num_arcs = total_arcs,
            num_next_states = num_new,
            "propagated frame"
        );

        let next_shape = RaggedShape::from_row_splits(exclusive_sum(&next_counts))?;
        cur.arcs = Ragged::new(arcs_shape, arcs)?;
        drop(cur);
        self.frames
            .push(FrameInfo::new(Ragged::new(next_shape, next_states)?)?);
        Ok(())
    }
}

//! Online (chunked) decoding.
//!
//! The online intersecter is fed successive score chunks and carries each
//! utterance's pruned search history across calls in a [`DecodeState`].
//! Every call returns a partial lattice for the whole utterance so far,
//! terminated by a synthesized final frame; `arc_map_b` is not produced
//! because a chunk only covers part of the score matrix.
use crate::ragged::{exclusive_sum, Ragged, RaggedShape};
use crate::{DenseFsaVec, Error, FsaVec, Result};

use super::frame::{ArcDest, ArcInfo, FrameInfo, StateInfo};
use super::{assemble, prune, Intersecter, PrunedIntersectParams};

/// Per-utterance carry between chunks: the pruned history (states per frame,
/// arcs per frame with utterance-local destination indices) and the dynamic
/// beam. A default-constructed state means "not started yet".
#[derive(Debug, Clone, Default)]
pub struct DecodeState {
    history: Option<History>,
}

#[derive(Debug, Clone)]
struct History {
    /// `[frame][state]`
    states: Ragged<StateInfo>,
    /// `[frame][state][arc]`
    arcs: Ragged<ArcInfo>,
    beam: f32,
}

impl DecodeState {
    /// Number of history frames carried so far (0 before the first chunk).
    pub fn num_frames(&self) -> usize {
        self.history.as_ref().map_or(0, |h| h.states.shape.dim0())
    }
}

/// Chunked variant of the pruned intersection. The batch width is fixed at
/// construction and the decoding graph is shared by all utterances.
pub struct OnlineDenseIntersecter {
    graph: FsaVec,
    params: PrunedIntersectParams,
    num_seqs: usize,
}

impl OnlineDenseIntersecter {
    pub fn new(graph: FsaVec, num_seqs: usize, params: PrunedIntersectParams) -> Result<Self> {
        params.validate()?;
        if graph.dim0() != 1 {
            return Err(Error::ConfigInvalid {
                msg: format!(
                    "online decoding requires a single shared graph, got {}",
                    graph.dim0()
                ),
            }
            .bt());
        }
        if num_seqs == 0 {
            return Err(Error::ConfigInvalid {
                msg: "num_seqs must be positive".to_string(),
            }
            .bt());
        }
        Ok(Self {
            graph,
            params,
            num_seqs,
        })
    }

    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    /// Decodes one chunk. `chunk` holds `chunk_size + 1` rows per utterance
    /// (the trailing sentinel row is not consumed mid-stream); all rows of a
    /// chunk must have the same length, and all decode states the same
    /// number of carried frames. Returns the partial lattice over the whole
    /// utterance so far plus its `arc_map_a`.
    pub fn decode(
        &self,
        chunk: &DenseFsaVec,
        decode_states: &mut [DecodeState],
    ) -> Result<(FsaVec, Vec<i32>)> {
        self.graph
            .context()
            .same_context(chunk.context(), "online_decode")?;
        if chunk.dim0() != self.num_seqs || decode_states.len() != self.num_seqs {
            return Err(Error::ShapeMismatch {
                op: "online_decode",
                expected: format!("{} utterances", self.num_seqs),
                got: format!(
                    "{} score rows, {} decode states",
                    chunk.dim0(),
                    decode_states.len()
                ),
            }
            .bt());
        }
        let chunk_len = chunk.len(0);
        if (0..self.num_seqs).any(|i| chunk.len(i) != chunk_len) {
            return Err(Error::ShapeMismatch {
                op: "online_decode",
                expected: format!("uniform chunk length {chunk_len}"),
                got: "ragged chunk lengths".to_string(),
            }
            .bt());
        }
        if chunk_len < 2 {
            return Err(Error::ConfigInvalid {
                msg: "a chunk needs at least one real frame besides the sentinel".to_string(),
            }
            .bt());
        }
        let n_prior = decode_states[0].num_frames();
        if decode_states.iter().any(|ds| ds.num_frames() != n_prior) {
            return Err(Error::ShapeMismatch {
                op: "online_decode",
                expected: format!("{n_prior} carried frames per utterance"),
                got: "unequal histories".to_string(),
            }
            .bt());
        }

        let mut engine = Intersecter::new(
            &self.graph,
            self.num_seqs,
            self.params.clone(),
            true,
            vec![usize::MAX; self.num_seqs],
        )?;
        engine.restore_beams(
            decode_states
                .iter()
                .map(|ds| {
                    ds.history
                        .as_ref()
                        .map_or(self.params.search_beam, |h| h.beam)
                })
                .collect(),
        );

        let t_prior = if n_prior == 0 {
            engine.init_start_frame()?;
            0
        } else {
            for t in 0..n_prior {
                engine.frames.push(stack_frame(decode_states, t, n_prior)?);
            }
            n_prior - 1
        };

        let chunk_size = chunk_len - 1;
        for t in t_prior..t_prior + chunk_size {
            engine.propagate(t, chunk, t_prior)?;
        }
        let t_cur = t_prior + chunk_size;

        prune::prune_time_range(
            &engine.frames,
            &self.graph,
            self.params.output_beam,
            t_prior.saturating_sub(2),
            t_cur,
        )?;

        let beams = engine.beams().to_vec();
        let mut frames = engine.into_frames();

        // Carry the pruned history before the synthesized final frame is
        // attached for assembly.
        for (i, ds) in decode_states.iter_mut().enumerate() {
            ds.history = Some(unstack_history(&frames, i, beams[i])?);
        }

        let (frontier_arcs, final_states) = self.final_frame(&frames[t_cur])?;
        frames[t_cur].arcs = frontier_arcs;
        frames.push(FrameInfo::new(final_states)?);

        let final_ts = vec![t_cur + 1; self.num_seqs];
        let (lattice, arc_map_a, _) = assemble::format_output(
            &frames,
            &self.graph,
            &final_ts,
            self.params.allow_partial,
            None,
        )?;
        Ok((lattice, arc_map_a))
    }

    /// Synthesizes a final frame from the frontier states without advancing
    /// real decoding: expand the frontier against a virtual sentinel row, so
    /// only final arcs stay finite, and point every kept arc at one state
    /// per utterance. With allow_partial, an utterance with no reachable
    /// final arc gets all its frontier arcs rerouted instead, mirroring the
    /// sentinel-frame rewrite of batch mode.
    fn final_frame(&self, frontier: &FrameInfo) -> Result<(Ragged<ArcInfo>, Ragged<StateInfo>)> {
        let states = &frontier.states;
        let mut arcs_per_state: Vec<Vec<ArcInfo>> = vec![Vec::new(); states.len()];
        let mut state_counts = vec![0usize; self.num_seqs];
        let mut new_states: Vec<StateInfo> = Vec::new();
        for i in 0..self.num_seqs {
            let srange = states.shape.row_range(1, i);
            if srange.is_empty() {
                continue;
            }
            let has_final_arc = srange.clone().any(|si| {
                self.graph
                    .arc_range(states.values[si].a_fsas_state_idx01 as usize)
                    .any(|ga| self.graph.arc(ga).label == -1)
            });
            let rewrite = self.params.allow_partial && !has_final_arc;
            let dest_new = new_states.len() as i32;
            let mut best = f32::NEG_INFINITY;
            let mut any = false;
            for si in srange {
                let sinfo = states.values[si];
                for ga in self.graph.arc_range(sinfo.a_fsas_state_idx01 as usize) {
                    let arc = self.graph.arc(ga);
                    let acoustic = if rewrite || arc.label == -1 {
                        0.0
                    } else {
                        f32::NEG_INFINITY
                    };
                    let arc_loglike = arc.score + acoustic;
                    if arc_loglike == f32::NEG_INFINITY {
                        continue;
                    }
                    let end_loglike = sinfo.forward_loglike + arc_loglike;
                    best = best.max(end_loglike);
                    any = true;
                    arcs_per_state[si].push(ArcInfo {
                        a_fsas_arc_idx012: ga as i32,
                        arc_loglike,
                        end_loglike,
                        dest: ArcDest::Frame(dest_new),
                    });
                }
            }
            if any {
                let final_state = self
                    .graph
                    .final_state(0)
                    .expect("an fsa with arcs has states");
                new_states.push(StateInfo::new(final_state as i32, best));
                state_counts[i] = 1;
            }
        }
        let arc_counts: Vec<usize> = arcs_per_state.iter().map(|a| a.len()).collect();
        let arcs_shape = RaggedShape::compose(
            &states.shape,
            &RaggedShape::from_row_splits(exclusive_sum(&arc_counts))?,
        )?;
        let arcs = Ragged::new(
            arcs_shape,
            arcs_per_state.into_iter().flatten().collect(),
        )?;
        let states_shape = RaggedShape::from_row_splits(exclusive_sum(&state_counts))?;
        Ok((arcs, Ragged::new(states_shape, new_states)?))
    }
}

/// Restacks one history frame across utterances, translating arc
/// destinations from utterance-local to frame-global indices.
fn stack_frame(decode_states: &[DecodeState], t: usize, n_prior: usize) -> Result<FrameInfo> {
    let num_seqs = decode_states.len();
    let mut state_counts = vec![0usize; num_seqs];
    let mut next_offsets = vec![0usize; num_seqs + 1];
    let mut states = Vec::new();
    for (i, ds) in decode_states.iter().enumerate() {
        let h = ds.history.as_ref().expect("carried history");
        state_counts[i] = h.states.shape.row_range(1, t).len();
        next_offsets[i + 1] = next_offsets[i]
            + if t + 1 < n_prior {
                h.states.shape.row_range(1, t + 1).len()
            } else {
                0
            };
        states.extend(
            h.states.shape.row_range(1, t).map(|k| h.states.values[k]),
        );
    }
    let mut arc_counts = Vec::new();
    let mut arcs = Vec::new();
    for (i, ds) in decode_states.iter().enumerate() {
        let h = ds.history.as_ref().expect("carried history");
        for si in h.states.shape.row_range(1, t) {
            let range = h.arcs.shape.row_range(2, si);
            arc_counts.push(range.len());
            for j in range {
                let mut a = h.arcs.values[j];
                a.dest = match a.dest {
                    ArcDest::Frame(d) => ArcDest::Frame(d + next_offsets[i] as i32),
                    other => other,
                };
                arcs.push(a);
            }
        }
    }
    let states_shape = RaggedShape::from_row_splits(exclusive_sum(&state_counts))?;
    let arcs_shape = RaggedShape::compose(
        &states_shape,
        &RaggedShape::from_row_splits(exclusive_sum(&arc_counts))?,
    )?;
    Ok(FrameInfo {
        states: Ragged::new(states_shape.clone(), states)?,
        arcs: Ragged::new(arcs_shape, arcs)?,
    })
}

/// Carves one utterance's history out of the batched frames, translating arc
/// destinations to utterance-local indices.
fn unstack_history(frames: &[FrameInfo], i: usize, beam: f32) -> Result<History> {
    let num_frames = frames.len();
    let mut frame_counts = Vec::with_capacity(num_frames);
    let mut states = Vec::new();
    let mut arc_counts = Vec::new();
    let mut arcs = Vec::new();
    for (t, frame) in frames.iter().enumerate() {
        let srange = frame.states.shape.row_range(1, i);
        frame_counts.push(srange.len());
        for si in srange {
            states.push(frame.states.values[si]);
            let range = frame.arcs.shape.row_range(2, si);
            arc_counts.push(range.len());
            for j in range {
                let mut a = frame.arcs.values[j];
                a.dest = match a.dest {
                    ArcDest::Frame(d) => {
                        let next_base = frames[t + 1].states.shape.row_splits(1)[i];
                        ArcDest::Frame(d - next_base as i32)
                    }
                    other => other,
                };
                arcs.push(a);
            }
        }
    }
    let frames_shape = RaggedShape::from_row_splits(exclusive_sum(&frame_counts))?;
    let arcs_shape = RaggedShape::compose(
        &frames_shape,
        &RaggedShape::from_row_splits(exclusive_sum(&arc_counts))?,
    )?;
    Ok(History {
        states: Ragged::new(frames_shape.clone(), states)?,
        arcs: Ragged::new(arcs_shape, arcs)?,
        beam,
    })
}

//! FSA containers: batched graphs and dense acoustic scores.
//!
//! `FsaVec` follows the usual weighted-automaton conventions: per FSA, state
//! 0 is the start state, the last state is the only candidate final state,
//! and arcs entering it carry the final label -1. `DenseFsaVec` holds one
//! dense row of per-symbol log-likes per frame, with column 0 reserved for
//! the final symbol (scores are indexed by `label + 1`) and a sentinel last
//! row per FSA that only the final symbol can traverse.
use crate::ragged::RaggedShape;
use crate::{Context, Error, Result};

/// A single weighted arc. `src_state`/`dest_state` are indices local to the
/// arc's FSA; the final label is -1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arc {
    pub src_state: i32,
    pub dest_state: i32,
    pub label: i32,
    pub score: f32,
}

impl Arc {
    pub fn new(src_state: i32, dest_state: i32, label: i32, score: f32) -> Self {
        Self {
            src_state,
            dest_state,
            label,
            score,
        }
    }
}

/// A batched set of FSAs stored as a 3-axis ragged array `[fsa][state][arc]`.
#[derive(Debug, Clone)]
pub struct FsaVec {
    shape: RaggedShape,
    arcs: Vec<Arc>,
    context: Context,
}

impl FsaVec {
    /// Builds an FsaVec from per-FSA `(num_states, arcs)` pairs. Arcs must be
    /// grouped by source state in non-decreasing order.
    pub fn from_fsas(context: Context, fsas: &[(usize, Vec<Arc>)]) -> Result<Self> {
        let mut state_splits = Vec::with_capacity(fsas.len() + 1);
        state_splits.push(0usize);
        let tot_states: usize = fsas.iter().map(|(n, _)| n).sum();
        let mut arc_counts = vec![0usize; tot_states];
        let mut arcs = Vec::new();
        let mut state_base = 0usize;
        for (num_states, fsa_arcs) in fsas.iter() {
            let mut prev_src = 0i32;
            for arc in fsa_arcs.iter() {
                if arc.src_state < prev_src {
                    crate::bail!(
                        "arcs must be grouped by source state, got {} after {}",
                        arc.src_state,
                        prev_src
                    );
                }
                prev_src = arc.src_state;
                let src = arc.src_state as usize;
                let dest = arc.dest_state as usize;
                if arc.src_state < 0 || src >= *num_states || arc.dest_state < 0 || dest >= *num_states
                {
                    crate::bail!(
                        "arc {}->{} out of range for an fsa with {} states",
                        arc.src_state,
                        arc.dest_state,
                        num_states
                    );
                }
                if arc.label == -1 && dest + 1 != *num_states {
                    crate::bail!("final arcs must enter the last state, got dest {dest}");
                }
                arc_counts[state_base + src] += 1;
                arcs.push(*arc);
            }
            state_base += num_states;
            state_splits.push(state_base);
        }
        let states_shape = RaggedShape::from_row_splits(state_splits)?;
        let arcs_shape = RaggedShape::from_row_splits(crate::ragged::exclusive_sum(&arc_counts))?;
        let shape = RaggedShape::compose(&states_shape, &arcs_shape)?;
        Ok(Self {
            shape,
            arcs,
            context,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn shape(&self) -> &RaggedShape {
        &self.shape
    }

    pub fn dim0(&self) -> usize {
        self.shape.dim0()
    }

    pub fn tot_states(&self) -> usize {
        self.shape.tot_size(1)
    }

    pub fn num_arcs(&self) -> usize {
        self.shape.tot_size(2)
    }

    pub fn arcs(&self) -> &[Arc] {
        &self.arcs
    }

    pub fn arc(&self, arc_idx012: usize) -> &Arc {
        &self.arcs[arc_idx012]
    }

    /// Range of state indices (idx01) belonging to `fsa`.
    pub fn state_range(&self, fsa: usize) -> std::ops::Range<usize> {
        self.shape.row_range(1, fsa)
    }

    /// Range of arc indices (idx012) leaving state `state_idx01`.
    pub fn arc_range(&self, state_idx01: usize) -> std::ops::Range<usize> {
        self.shape.row_range(2, state_idx01)
    }

    pub fn num_states(&self, fsa: usize) -> usize {
        self.state_range(fsa).len()
    }

    pub fn fsa_of_state(&self, state_idx01: usize) -> usize {
        self.shape.row_ids(1)[state_idx01]
    }

    pub fn start_state(&self, fsa: usize) -> Option<usize> {
        let range = self.state_range(fsa);
        if range.is_empty() {
            None
        } else {
            Some(range.start)
        }
    }

    pub fn final_state(&self, fsa: usize) -> Option<usize> {
        let range = self.state_range(fsa);
        if range.is_empty() {
            None
        } else {
            Some(range.end - 1)
        }
    }
}

/// Best-path score of one FSA of an acyclic, topologically sorted FsaVec
/// (such as the lattices this crate emits): the max-score path from the
/// start state into the last state, or `None` when no such path exists.
pub fn best_path_score(fsas: &FsaVec, fsa: usize) -> Option<f32> {
    let states = fsas.state_range(fsa);
    if states.is_empty() {
        return None;
    }
    let n = states.len();
    let mut best = vec![f32::NEG_INFINITY; n];
    best[0] = 0.0;
    for s in 0..n {
        if best[s] == f32::NEG_INFINITY {
            continue;
        }
        for a in fsas.arc_range(states.start + s) {
            let arc = fsas.arc(a);
            let dest = arc.dest_state as usize;
            let cand = best[s] + arc.score;
            if cand > best[dest] {
                best[dest] = cand;
            }
        }
    }
    if n == 1 {
        // Start state only: no path has terminated.
        return None;
    }
    let score = best[n - 1];
    if score == f32::NEG_INFINITY {
        None
    } else {
        Some(score)
    }
}

/// Batched dense acoustic scores, ragged over `[fsa][frame]`.
#[derive(Debug, Clone)]
pub struct DenseFsaVec {
    shape: RaggedShape,
    scores: Vec<f32>,
    width: usize,
    context: Context,
}

impl DenseFsaVec {
    /// Builds a DenseFsaVec from per-FSA frame rows, each of uniform width
    /// `num_symbols + 1`. Column 0 is reserved for the final symbol: it must
    /// be -inf on every row except the last one per FSA, the sentinel final
    /// row, where it is 0 and every other column is -inf.
    pub fn from_scores(context: Context, scores: &[Vec<Vec<f32>>]) -> Result<Self> {
        let mut width = None;
        let mut splits = Vec::with_capacity(scores.len() + 1);
        splits.push(0usize);
        let mut values = Vec::new();
        for rows in scores.iter() {
            if rows.is_empty() {
                crate::bail!("every fsa needs at least the sentinel final frame");
            }
            for row in rows.iter() {
                if row.is_empty() {
                    crate::bail!("score rows must have at least the final-symbol column");
                }
                match width {
                    None => width = Some(row.len()),
                    Some(w) if w != row.len() => {
                        return Err(Error::ShapeMismatch {
                            op: "dense_from_scores",
                            expected: format!("rows of width {w}"),
                            got: format!("row of width {}", row.len()),
                        }
                        .bt())
                    }
                    _ => {}
                }
                values.extend_from_slice(row);
            }
            let last = rows.last().unwrap();
            if last[0] != 0.0 || last[1..].iter().any(|&v| v != f32::NEG_INFINITY) {
                crate::bail!("the last frame of every fsa must be the final sentinel row");
            }
            if rows[..rows.len() - 1]
                .iter()
                .any(|row| row[0] != f32::NEG_INFINITY)
            {
                crate::bail!("column 0 is reserved for the final symbol on the sentinel row");
            }
            splits.push(splits.last().unwrap() + rows.len());
        }
        let width = width.unwrap_or(1);
        Ok(Self {
            shape: RaggedShape::from_row_splits(splits)?,
            scores: values,
            width,
            context,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn shape(&self) -> &RaggedShape {
        &self.shape
    }

    pub fn dim0(&self) -> usize {
        self.shape.dim0()
    }

    /// Number of score frames of `fsa`, the sentinel final frame included.
    pub fn len(&self, fsa: usize) -> usize {
        self.shape.row_range(1, fsa).len()
    }

    pub fn is_empty(&self) -> bool {
        self.dim0() == 0
    }

    pub fn max_len(&self) -> usize {
        (0..self.dim0()).map(|i| self.len(i)).max().unwrap_or(0)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Global row index of `fsa`'s frame 0.
    pub fn row_offset(&self, fsa: usize) -> usize {
        self.shape.row_splits(1)[fsa]
    }

    /// Log-like of `label` on frame `t` of `fsa`; -inf when `t` is out of
    /// range or the label has no column.
    pub fn score(&self, fsa: usize, t: usize, label: i32) -> f32 {
        if t >= self.len(fsa) {
            return f32::NEG_INFINITY;
        }
        let col = (label + 1) as usize;
        if col >= self.width {
            return f32::NEG_INFINITY;
        }
        self.scores[(self.row_offset(fsa) + t) * self.width + col]
    }
}

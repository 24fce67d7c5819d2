//! Per-frame search state.
use std::sync::{Arc, Mutex};

use crate::ragged::{exclusive_sum, Ragged, RaggedShape};
use crate::Result;

/// One surviving (frame, state) pair. `a_fsas_state_idx01` indexes the graph
/// state list; forward/backward log-likes are relative to the best path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StateInfo {
    pub a_fsas_state_idx01: i32,
    pub forward_loglike: f32,
    pub backward_loglike: f32,
}

impl StateInfo {
    pub(crate) fn new(a_fsas_state_idx01: i32, forward_loglike: f32) -> Self {
        Self {
            a_fsas_state_idx01,
            forward_loglike,
            backward_loglike: f32::NEG_INFINITY,
        }
    }
}

/// Destination of an in-flight arc. Exactly one variant is meaningful per
/// forward-pass phase: `Graph` between expansion and dedup, `Frame` (a
/// state index into the next frame) afterwards, `Pruned` once the arc has
/// been cut off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArcDest {
    Graph(i32),
    Frame(i32),
    Pruned,
}

/// One expanded (frame, arc) entry. `arc_loglike` is graph score plus
/// acoustic score; `end_loglike` additionally includes the source state's
/// forward log-like.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArcInfo {
    pub a_fsas_arc_idx012: i32,
    pub arc_loglike: f32,
    pub end_loglike: f32,
    pub dest: ArcDest,
}

/// States and arcs of one time step. `states` is `[fsa][state]`, `arcs` is
/// `[fsa][state][arc]`; a freshly pushed frame has no arcs until the forward
/// pass expands it.
#[derive(Debug, Clone)]
pub(crate) struct FrameInfo {
    pub states: Ragged<StateInfo>,
    pub arcs: Ragged<ArcInfo>,
}

impl FrameInfo {
    pub(crate) fn new(states: Ragged<StateInfo>) -> Result<Self> {
        let arcs = empty_arcs(&states.shape)?;
        Ok(Self { states, arcs })
    }
}

/// A 3-axis arcs ragged with zero arcs per state.
pub(crate) fn empty_arcs(states_shape: &RaggedShape) -> Result<Ragged<ArcInfo>> {
    let counts = vec![0usize; states_shape.tot_size(1)];
    let arcs_shape = RaggedShape::from_row_splits(exclusive_sum(&counts))?;
    Ragged::new(RaggedShape::compose(states_shape, &arcs_shape)?, Vec::new())
}

pub(crate) type SharedFrame = Arc<Mutex<FrameInfo>>;

/// Owns the per-time-step frames in sequence order. The forward worker
/// appends; the backward worker rewrites ranges the forward worker has
/// explicitly handed off. The per-frame mutex expresses that hand-off.
#[derive(Debug, Default)]
pub(crate) struct FrameStore {
    frames: Mutex<Vec<SharedFrame>>,
}

impl FrameStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, frame: FrameInfo) {
        self.frames
            .lock()
            .unwrap()
            .push(Arc::new(Mutex::new(frame)));
    }

    pub(crate) fn get(&self, t: usize) -> SharedFrame {
        self.frames.lock().unwrap()[t].clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Takes the frames out once both workers are done with the store.
    pub(crate) fn into_frames(store: Arc<Self>) -> Vec<FrameInfo> {
        let store = Arc::try_unwrap(store).expect("frame store still shared");
        store
            .frames
            .into_inner()
            .unwrap()
            .into_iter()
            .map(|f| Arc::try_unwrap(f).expect("frame still shared").into_inner().unwrap())
            .collect()
    }
}

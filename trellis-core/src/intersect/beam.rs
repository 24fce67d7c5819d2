//! Dynamic beam control.
//!
//! Each utterance keeps a beam that starts at `search_beam` and reacts to
//! the number of active states: it grows while the search is starving
//! (below `min_active`), shrinks while it is flooding (above `max_active`),
//! and otherwise relaxes back towards `search_beam`. The exact factors are
//! part of the engine contract.

/// Relaxation towards the configured beam when the active count is healthy.
pub(crate) const BEAM_DECAY: f32 = 0.8;
pub(crate) const BEAM_RETURN: f32 = 0.2;
/// Growth factor while under `min_active`.
pub(crate) const BEAM_GROW: f32 = 1.25;
/// Shrink factor while over `max_active`.
pub(crate) const BEAM_SHRINK: f32 = 0.8;
/// Frames before the end of an utterance where final states get protected.
pub(crate) const FINAL_LOOKAHEAD: usize = 5;

#[derive(Debug)]
pub(crate) struct BeamController {
    beams: Vec<f32>,
    search_beam: f32,
    min_active: usize,
    max_active: usize,
}

impl BeamController {
    pub(crate) fn new(num_seqs: usize, search_beam: f32, min_active: usize, max_active: usize) -> Self {
        Self::with_beams(vec![search_beam; num_seqs], search_beam, min_active, max_active)
    }

    pub(crate) fn with_beams(
        beams: Vec<f32>,
        search_beam: f32,
        min_active: usize,
        max_active: usize,
    ) -> Self {
        Self {
            beams,
            search_beam,
            min_active,
            max_active,
        }
    }

    pub(crate) fn beams(&self) -> &[f32] {
        &self.beams
    }

    /// Updates the per-utterance beams for frame `t` and returns the pruning
    /// cutoffs. `best` is the max arc end-log-like per utterance (-inf when
    /// nothing was expanded), `active` the state count that fed expansion,
    /// `final_ts` the per-utterance frame count.
    pub(crate) fn cutoffs(
        &mut self,
        t: usize,
        final_ts: &[usize],
        best: &[f32],
        active: &[usize],
        online: bool,
    ) -> Vec<f32> {
        let mut cutoffs = Vec::with_capacity(self.beams.len());
        for i in 0..self.beams.len() {
            let final_t = final_ts[i];
            let mut beam = self.beams[i];
            let mut min_active = self.min_active;
            if !online && t + FINAL_LOOKAHEAD >= final_t {
                // Protect final states near the end of the utterance.
                min_active = min_active.max(self.max_active / 2);
            }
            if active[i] <= self.max_active {
                if active[i] >= min_active || active[i] == 0 {
                    beam = BEAM_DECAY * beam + BEAM_RETURN * self.search_beam;
                } else {
                    beam = beam.max(self.search_beam) * BEAM_GROW;
                }
            } else if online || t + FINAL_LOOKAHEAD < final_t {
                beam = beam.min(self.search_beam) * BEAM_SHRINK;
            }
            if !online && t + 1 >= final_t {
                // Keep every final arc on the last frame.
                beam = f32::INFINITY;
            }
            self.beams[i] = beam;
            cutoffs.push(best[i] - beam);
        }
        cutoffs
    }
}

//! End-to-end tests for the batch pruned intersection.
//!
//! The scenarios build small decoding graphs by hand, feed them dense score
//! matrices (column 0 is the final symbol, so label `l` lives in column
//! `l + 1`, and the last row per utterance is the final sentinel) and check
//! the emitted lattice plus its arc maps.

use rand::prelude::*;
use trellis_core::{
    best_path_score, intersect_dense_pruned, Arc, Context, DenseFsaVec, FsaVec,
    PrunedIntersectParams, Result,
};

const NEG: f32 = f32::NEG_INFINITY;

/// Score agreement tolerance for paths recomputed through the lattice.
const SCORE_TOL: f32 = 1e-4;

fn params(
    search_beam: f32,
    output_beam: f32,
    min_active: usize,
    max_active: usize,
    allow_partial: bool,
) -> PrunedIntersectParams {
    PrunedIntersectParams {
        search_beam,
        output_beam,
        min_active,
        max_active,
        allow_partial,
    }
}

/// A linear graph accepting exactly `1 1` then the final symbol.
fn linear_graph() -> Result<FsaVec> {
    FsaVec::from_fsas(
        Context::Cpu,
        &[(
            4,
            vec![
                Arc::new(0, 1, 1, 0.0),
                Arc::new(1, 2, 1, 0.0),
                Arc::new(2, 3, -1, 0.0),
            ],
        )],
    )
}

#[test]
fn linear_chain_single_path() -> Result<()> {
    let graph = linear_graph()?;
    let scores = DenseFsaVec::from_scores(
        Context::Cpu,
        &[vec![
            vec![NEG, NEG, 0.0],
            vec![NEG, NEG, 0.0],
            vec![0.0, NEG, NEG],
        ]],
    )?;
    let out = intersect_dense_pruned(&graph, &scores, &params(10.0, 8.0, 1, 10, false))?;

    let lattice = &out.lattice;
    assert_eq!(lattice.dim0(), 1);
    assert_eq!(lattice.num_states(0), 4);
    let labels: Vec<i32> = lattice.arcs().iter().map(|a| a.label).collect();
    assert_eq!(labels, vec![1, 1, -1]);
    let path: Vec<(i32, i32)> = lattice
        .arcs()
        .iter()
        .map(|a| (a.src_state, a.dest_state))
        .collect();
    assert_eq!(path, vec![(0, 1), (1, 2), (2, 3)]);
    assert_eq!(out.arc_map_a, vec![0, 1, 2]);
    // (row offset + t) * width + label + 1.
    assert_eq!(out.arc_map_b, vec![2, 5, 6]);
    let best = best_path_score(lattice, 0).unwrap();
    assert!(best.abs() < SCORE_TOL);
    Ok(())
}

#[test]
fn output_beam_prunes_competing_path() -> Result<()> {
    // Two arcs into the same state; their score gap (3.0) exceeds the
    // output beam (1.0), so only the better one survives backward pruning.
    let graph = FsaVec::from_fsas(
        Context::Cpu,
        &[(
            3,
            vec![
                Arc::new(0, 1, 1, 0.0),
                Arc::new(0, 1, 2, -3.0),
                Arc::new(1, 2, -1, 0.0),
            ],
        )],
    )?;
    let scores = DenseFsaVec::from_scores(
        Context::Cpu,
        &[vec![
            vec![NEG, NEG, 0.0, 0.0],
            vec![0.0, NEG, NEG, NEG],
        ]],
    )?;
    let out = intersect_dense_pruned(&graph, &scores, &params(10.0, 1.0, 1, 10, false))?;

    let labels: Vec<i32> = out.lattice.arcs().iter().map(|a| a.label).collect();
    assert_eq!(labels, vec![1, -1]);
    assert_eq!(out.arc_map_a, vec![0, 2]);
    Ok(())
}

#[test]
fn allow_partial_synthesizes_final_arc() -> Result<()> {
    // The utterance is one frame too short for the graph, so no real final
    // arc is reachable on the last frame.
    let graph = linear_graph()?;
    let scores = DenseFsaVec::from_scores(
        Context::Cpu,
        &[vec![vec![NEG, NEG, 0.0], vec![0.0, NEG, NEG]]],
    )?;

    let out = intersect_dense_pruned(&graph, &scores, &params(10.0, 8.0, 1, 10, true))?;
    let labels: Vec<i32> = out.lattice.arcs().iter().map(|a| a.label).collect();
    assert_eq!(labels, vec![1, -1]);
    // The terminating arc is synthesized, so it maps to no graph arc.
    assert_eq!(out.arc_map_a, vec![0, -1]);
    assert!(best_path_score(&out.lattice, 0).is_some());

    // Without allow_partial the same inputs yield no hypothesis: the start
    // state plus a trailing state that cannot be mistaken for a final one.
    let out = intersect_dense_pruned(&graph, &scores, &params(10.0, 8.0, 1, 10, false))?;
    assert_eq!(out.lattice.num_arcs(), 0);
    assert_eq!(out.lattice.num_states(0), 2);
    assert!(best_path_score(&out.lattice, 0).is_none());
    Ok(())
}

/// Layered fan-out graph: `layers` layers of `width` states, each state
/// feeding three states of the next layer with random scores, then a
/// pre-final state and the final state.
fn fan_graph(layers: usize, width: usize, rng: &mut StdRng) -> Result<FsaVec> {
    let state = |layer: usize, i: usize| (1 + (layer - 1) * width + i) as i32;
    let pre_final = (1 + layers * width) as i32;
    let num_states = pre_final as usize + 2;
    let mut arcs = Vec::new();
    for i in 0..width {
        arcs.push(Arc::new(0, state(1, i), 1, -30.0 * rng.random::<f32>()));
    }
    for layer in 1..layers {
        for i in 0..width {
            for d in 0..3 {
                arcs.push(Arc::new(
                    state(layer, i),
                    state(layer + 1, (i + d) % width),
                    1,
                    -30.0 * rng.random::<f32>(),
                ));
            }
        }
    }
    for i in 0..width {
        arcs.push(Arc::new(state(layers, i), pre_final, 1, 0.0));
    }
    arcs.push(Arc::new(pre_final, pre_final + 1, -1, 0.0));
    FsaVec::from_fsas(Context::Cpu, &[(num_states, arcs)])
}

#[test]
fn max_active_shrinks_the_beam() -> Result<()> {
    let layers = 4;
    let width = 1000;
    let mut rng = StdRng::seed_from_u64(42);
    let graph = fan_graph(layers, width, &mut rng)?;
    // layers + 1 real frames (fan-in to the pre-final state included), then
    // the sentinel.
    let mut rows: Vec<Vec<f32>> = (0..layers + 1).map(|_| vec![NEG, NEG, 0.0]).collect();
    rows.push(vec![0.0, NEG, NEG]);
    let scores = DenseFsaVec::from_scores(Context::Cpu, &[rows])?;

    let flooded = intersect_dense_pruned(&graph, &scores, &params(15.0, 1000.0, 1, 16, false))?;
    let relaxed = intersect_dense_pruned(&graph, &scores, &params(15.0, 1000.0, 1, 5000, false))?;

    // A tighter search can lose the optimum but never improve on it.
    let flooded_best = best_path_score(&flooded.lattice, 0).unwrap();
    let relaxed_best = best_path_score(&relaxed.lattice, 0).unwrap();
    assert!(flooded_best <= relaxed_best + SCORE_TOL);

    // Flooding past max_active shrinks the beam frame over frame, so the
    // low max_active run must survive with strictly fewer states.
    assert!(
        flooded.lattice.num_states(0) < relaxed.lattice.num_states(0),
        "expected {} < {}",
        flooded.lattice.num_states(0),
        relaxed.lattice.num_states(0)
    );
    Ok(())
}

/// A graph accepting two or three `1` symbols before the final symbol.
fn flexible_graph() -> Result<FsaVec> {
    FsaVec::from_fsas(
        Context::Cpu,
        &[(
            5,
            vec![
                Arc::new(0, 1, 1, 0.0),
                Arc::new(1, 2, 1, 0.0),
                Arc::new(2, 3, 1, -0.5),
                Arc::new(2, 4, -1, 0.0),
                Arc::new(3, 4, -1, 0.0),
            ],
        )],
    )
}

#[test]
fn shared_graph_matches_per_utterance_runs() -> Result<()> {
    let graph = flexible_graph()?;
    let utterances: Vec<Vec<Vec<f32>>> = vec![
        vec![
            vec![NEG, NEG, -0.25],
            vec![NEG, NEG, -0.5],
            vec![0.0, NEG, NEG],
        ],
        vec![
            vec![NEG, NEG, -1.0],
            vec![NEG, NEG, -0.125],
            vec![NEG, NEG, -2.0],
            vec![0.0, NEG, NEG],
        ],
        vec![
            vec![NEG, NEG, -3.0],
            vec![NEG, NEG, -0.75],
            vec![0.0, NEG, NEG],
        ],
        vec![
            vec![NEG, NEG, -0.5],
            vec![NEG, NEG, -0.5],
            vec![NEG, NEG, -0.5],
            vec![0.0, NEG, NEG],
        ],
    ];
    let p = params(10.0, 8.0, 1, 32, false);

    let batched = intersect_dense_pruned(
        &graph,
        &DenseFsaVec::from_scores(Context::Cpu, &utterances)?,
        &p,
    )?;
    assert_eq!(batched.lattice.dim0(), utterances.len());

    let mut map_a_offset = 0usize;
    for (i, rows) in utterances.iter().enumerate() {
        let single = intersect_dense_pruned(
            &graph,
            &DenseFsaVec::from_scores(Context::Cpu, std::slice::from_ref(rows))?,
            &p,
        )?;
        let batched_states = batched.lattice.state_range(i);
        assert_eq!(batched_states.len(), single.lattice.num_states(0));
        let batched_arcs: Vec<&Arc> = batched_states
            .clone()
            .flat_map(|s| batched.lattice.arc_range(s))
            .map(|a| batched.lattice.arc(a))
            .collect();
        let single_arcs: Vec<&Arc> = single
            .lattice
            .state_range(0)
            .flat_map(|s| single.lattice.arc_range(s))
            .map(|a| single.lattice.arc(a))
            .collect();
        assert_eq!(batched_arcs, single_arcs);
        assert_eq!(
            &batched.arc_map_a[map_a_offset..map_a_offset + single_arcs.len()],
            &single.arc_map_a[..],
        );
        map_a_offset += single_arcs.len();
        let b = best_path_score(&batched.lattice, i).unwrap();
        let s = best_path_score(&single.lattice, 0).unwrap();
        assert!((b - s).abs() < SCORE_TOL);
    }
    Ok(())
}

#[test]
fn allow_partial_is_a_superset_when_final_is_reached() -> Result<()> {
    let graph = linear_graph()?;
    let scores = DenseFsaVec::from_scores(
        Context::Cpu,
        &[vec![
            vec![NEG, NEG, -0.5],
            vec![NEG, NEG, -0.25],
            vec![0.0, NEG, NEG],
        ]],
    )?;
    let strict = intersect_dense_pruned(&graph, &scores, &params(10.0, 8.0, 1, 10, false))?;
    let partial = intersect_dense_pruned(&graph, &scores, &params(10.0, 8.0, 1, 10, true))?;
    // The final state is reachable, so allow_partial adds nothing.
    assert_eq!(strict.arc_map_a, partial.arc_map_a);
    assert_eq!(strict.lattice.arcs(), partial.lattice.arcs());
    Ok(())
}

#[test]
fn arc_map_a_entries_are_valid() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let graph = fan_graph(3, 20, &mut rng)?;
    let mut rows: Vec<Vec<f32>> = (0..4).map(|_| vec![NEG, NEG, 0.0]).collect();
    rows.push(vec![0.0, NEG, NEG]);
    let scores = DenseFsaVec::from_scores(Context::Cpu, &[rows])?;
    let out = intersect_dense_pruned(&graph, &scores, &params(12.0, 12.0, 1, 8, true))?;

    assert_eq!(out.arc_map_a.len(), out.lattice.num_arcs());
    assert_eq!(out.arc_map_b.len(), out.lattice.num_arcs());
    for (arc, &map_a) in out.lattice.arcs().iter().zip(out.arc_map_a.iter()) {
        assert!(map_a == -1 || (map_a as usize) < graph.num_arcs());
        if map_a >= 0 {
            assert_eq!(graph.arc(map_a as usize).label, arc.label);
        } else {
            assert_eq!(arc.label, -1);
        }
    }
    Ok(())
}

#[test]
fn invalid_configurations_are_rejected() -> Result<()> {
    let graph = linear_graph()?;
    let scores = DenseFsaVec::from_scores(
        Context::Cpu,
        &[vec![vec![NEG, NEG, 0.0], vec![0.0, NEG, NEG]]],
    )?;
    assert!(intersect_dense_pruned(&graph, &scores, &params(-1.0, 8.0, 1, 10, false)).is_err());
    assert!(intersect_dense_pruned(&graph, &scores, &params(10.0, 8.0, 10, 10, false)).is_err());

    // Two graphs for one utterance.
    let two = FsaVec::from_fsas(
        Context::Cpu,
        &[
            (2, vec![Arc::new(0, 1, -1, 0.0)]),
            (2, vec![Arc::new(0, 1, -1, 0.0)]),
        ],
    )?;
    assert!(intersect_dense_pruned(&two, &scores, &params(10.0, 8.0, 1, 10, false)).is_err());
    Ok(())
}

#[test]
fn empty_graph_yields_empty_lattice() -> Result<()> {
    let graph = FsaVec::from_fsas(Context::Cpu, &[(0, vec![])])?;
    let scores = DenseFsaVec::from_scores(
        Context::Cpu,
        &[vec![vec![NEG, NEG, 0.0], vec![0.0, NEG, NEG]]],
    )?;
    let out = intersect_dense_pruned(&graph, &scores, &params(10.0, 8.0, 1, 10, true))?;
    assert_eq!(out.lattice.dim0(), 1);
    assert_eq!(out.lattice.num_states(0), 0);
    assert_eq!(out.lattice.num_arcs(), 0);
    Ok(())
}

//! Chunked decoding against the batch reference.

use trellis_core::{
    best_path_score, intersect_dense_pruned, Arc, Context, DecodeState, DenseFsaVec, FsaVec,
    OnlineDenseIntersecter, PrunedIntersectParams, Result,
};

const NEG: f32 = f32::NEG_INFINITY;
const SCORE_TOL: f32 = 1e-4;

fn params(allow_partial: bool) -> PrunedIntersectParams {
    PrunedIntersectParams {
        search_beam: 100.0,
        output_beam: 100.0,
        min_active: 1,
        max_active: 1000,
        allow_partial,
    }
}

/// A chain accepting exactly `len` `1` symbols, then the final symbol.
fn chain_graph(len: usize) -> Result<FsaVec> {
    let mut arcs: Vec<Arc> = (0..len)
        .map(|i| Arc::new(i as i32, i as i32 + 1, 1, -0.01 * i as f32))
        .collect();
    arcs.push(Arc::new(len as i32, len as i32 + 1, -1, 0.0));
    FsaVec::from_fsas(Context::Cpu, &[(len + 2, arcs)])
}

/// `num_frames` real rows with the given per-frame label-1 scores, plus the
/// sentinel row.
fn rows_for(scores: &[f32]) -> Vec<Vec<f32>> {
    let mut rows: Vec<Vec<f32>> = scores.iter().map(|&s| vec![NEG, NEG, s]).collect();
    rows.push(vec![0.0, NEG, NEG]);
    rows
}

#[test]
fn chunked_decoding_matches_batch() -> Result<()> {
    let num_frames = 17;
    let graph = chain_graph(num_frames)?;
    let frame_scores: Vec<f32> = (0..num_frames).map(|t| -0.2 - 0.03 * t as f32).collect();

    let batch = intersect_dense_pruned(
        &graph,
        &DenseFsaVec::from_scores(Context::Cpu, &[rows_for(&frame_scores)])?,
        &params(false),
    )?;
    let batch_best = best_path_score(&batch.lattice, 0).unwrap();

    let intersecter = OnlineDenseIntersecter::new(graph.clone(), 1, params(false))?;
    let mut states = vec![DecodeState::default()];
    let chunk1 = DenseFsaVec::from_scores(Context::Cpu, &[rows_for(&frame_scores[..10])])?;
    intersecter.decode(&chunk1, &mut states)?;
    assert_eq!(states[0].num_frames(), 11);

    let chunk2 = DenseFsaVec::from_scores(Context::Cpu, &[rows_for(&frame_scores[10..])])?;
    let (lattice, arc_map_a) = intersecter.decode(&chunk2, &mut states)?;
    assert_eq!(states[0].num_frames(), 18);

    let online_best = best_path_score(&lattice, 0).unwrap();
    assert!(
        (online_best - batch_best).abs() < SCORE_TOL,
        "online {online_best} vs batch {batch_best}"
    );
    // The chain completed for real, so no arc is synthesized.
    assert!(arc_map_a.iter().all(|&m| m >= 0));
    assert_eq!(arc_map_a.len(), lattice.num_arcs());
    let labels: Vec<i32> = lattice.arcs().iter().map(|a| a.label).collect();
    assert_eq!(labels.len(), num_frames + 1);
    assert_eq!(labels.last(), Some(&-1));
    Ok(())
}

#[test]
fn partial_lattice_after_first_chunk() -> Result<()> {
    let graph = chain_graph(17)?;
    let frame_scores: Vec<f32> = (0..10).map(|_| -0.5).collect();
    let intersecter = OnlineDenseIntersecter::new(graph, 1, params(true))?;
    let mut states = vec![DecodeState::default()];
    let chunk = DenseFsaVec::from_scores(Context::Cpu, &[rows_for(&frame_scores)])?;
    let (lattice, arc_map_a) = intersecter.decode(&chunk, &mut states)?;

    // Mid-chain there is no real final arc; the partial path terminates
    // through a synthesized -1 arc that keeps the rerouted arc's graph
    // score (frames 0..10 of acoustics, graph arcs 0..=10).
    let best = best_path_score(&lattice, 0).unwrap();
    let expected = -0.5 * 10.0 - 0.01 * (0..=10).sum::<i32>() as f32;
    assert!((best - expected).abs() < SCORE_TOL, "best {best} expected {expected}");
    assert_eq!(arc_map_a.last(), Some(&-1));
    assert_eq!(lattice.arcs().last().map(|a| a.label), Some(-1));
    Ok(())
}

#[test]
fn two_streams_decode_independently() -> Result<()> {
    let num_frames = 12;
    let graph = chain_graph(num_frames)?;
    let scores_a: Vec<f32> = (0..num_frames).map(|t| -0.1 * t as f32).collect();
    let scores_b: Vec<f32> = (0..num_frames).map(|t| -0.3 - 0.05 * t as f32).collect();

    let intersecter = OnlineDenseIntersecter::new(graph.clone(), 2, params(false))?;
    let mut states = vec![DecodeState::default(), DecodeState::default()];
    let chunk1 = DenseFsaVec::from_scores(
        Context::Cpu,
        &[rows_for(&scores_a[..6]), rows_for(&scores_b[..6])],
    )?;
    intersecter.decode(&chunk1, &mut states)?;
    let chunk2 = DenseFsaVec::from_scores(
        Context::Cpu,
        &[rows_for(&scores_a[6..]), rows_for(&scores_b[6..])],
    )?;
    let (lattice, _) = intersecter.decode(&chunk2, &mut states)?;

    for (i, scores) in [&scores_a, &scores_b].into_iter().enumerate() {
        let batch = intersect_dense_pruned(
            &graph,
            &DenseFsaVec::from_scores(Context::Cpu, &[rows_for(scores)])?,
            &params(false),
        )?;
        let batch_best = best_path_score(&batch.lattice, 0).unwrap();
        let online_best = best_path_score(&lattice, i).unwrap();
        assert!((online_best - batch_best).abs() < SCORE_TOL);
    }
    Ok(())
}

#[test]
fn online_rejects_bad_shapes() -> Result<()> {
    let graph = chain_graph(4)?;
    let intersecter = OnlineDenseIntersecter::new(graph.clone(), 2, params(false))?;
    // Wrong batch width.
    let chunk = DenseFsaVec::from_scores(Context::Cpu, &[rows_for(&[-0.5, -0.5])])?;
    let mut states = vec![DecodeState::default(), DecodeState::default()];
    assert!(intersecter.decode(&chunk, &mut states).is_err());

    // Per-utterance graphs are a batch-mode feature.
    let two = FsaVec::from_fsas(
        Context::Cpu,
        &[
            (2, vec![Arc::new(0, 1, -1, 0.0)]),
            (2, vec![Arc::new(0, 1, -1, 0.0)]),
        ],
    )?;
    assert!(OnlineDenseIntersecter::new(two, 2, params(false)).is_err());
    Ok(())
}

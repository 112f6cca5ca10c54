// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Rank Geometry
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Rank coordinates, neighbor discovery, global offsets, and the
//! wave-front angle/extension arithmetic.
//!
//! Every rank broadcasts its coordinate and domain-size tuples; each
//! rank then derives, for every other rank, the signed coordinate
//! delta, Manhattan and Chebyshev distances, and in-line relations.
//! Neighbors at Chebyshev distance <= 1 are recorded with a dense index
//! obtained by adding 1 per dim and linearizing.

use std::sync::Arc;

use stencil_comm::Transport;
use stencil_types::dims::Dims;
use stencil_types::error::{StencilError, StencilResult};
use stencil_types::idx::round_up;
use stencil_types::settings::SolverSettings;
use tracing::debug;

/// One immediate neighbor (Chebyshev distance <= 1).
#[derive(Clone, Debug)]
pub struct NeighborInfo {
    pub rank: usize,
    /// Per-dim offset in {-1, 0, +1}.
    pub offsets: Vec<i64>,
    pub man_dist: i64,
    /// All of that rank's domain sizes are fold multiples.
    pub vlen_mults: bool,
}

/// This rank's place in the global problem.
#[derive(Clone, Debug)]
pub struct RankGeometry {
    pub my_rank: usize,
    pub num_ranks: usize,
    pub rank_indices: Vec<i64>,
    pub rank_sizes: Vec<i64>,
    /// Global index of local 0 per domain dim.
    pub rank_offsets: Vec<i64>,
    pub overall_sizes: Vec<i64>,
    /// Dense neighborhood table of size 3^n; self sits at the center.
    pub neighbors: Vec<Option<NeighborInfo>>,
    pub my_vlen_mults: bool,

    pub max_halos: Vec<i64>,
    pub wf_steps: i64,
    pub num_wf_shifts: i64,
    pub wf_angles: Vec<i64>,
    pub wf_shift_pts: Vec<i64>,
    pub left_wf_exts: Vec<i64>,
    pub right_wf_exts: Vec<i64>,
}

impl RankGeometry {
    pub fn is_first_rank(&self, j: usize) -> bool {
        self.rank_indices[j] == 0
    }

    pub fn is_last_rank(&self, j: usize, num_ranks: &[i64]) -> bool {
        self.rank_indices[j] == num_ranks[j] - 1
    }

    /// Dense index of a neighbor offset tuple (each entry in {-1,0,+1}).
    pub fn neighbor_index(offsets: &[i64]) -> usize {
        let mut idx = 0usize;
        for o in offsets {
            debug_assert!((-1..=1).contains(o));
            idx = idx * 3 + (o + 1) as usize;
        }
        idx
    }

    pub fn neighborhood_size(nd: usize) -> usize {
        3usize.pow(nd as u32)
    }

    /// Offsets of the dense neighbor index (inverse of
    /// [`RankGeometry::neighbor_index`]).
    pub fn neighbor_offsets(idx: usize, nd: usize) -> Vec<i64> {
        let mut out = vec![0i64; nd];
        let mut rem = idx;
        for j in (0..nd).rev() {
            out[j] = (rem % 3) as i64 - 1;
            rem /= 3;
        }
        out
    }

    /// Visit every recorded neighbor (never self).
    pub fn visit_neighbors(&self, mut f: impl FnMut(usize, &NeighborInfo)) {
        for (i, n) in self.neighbors.iter().enumerate() {
            if let Some(info) = n {
                if info.rank != self.my_rank || info.man_dist != 0 {
                    f(i, info);
                }
            }
        }
    }
}

/// Learn this rank's coordinates and neighborhood, verify the global
/// layout, and derive the wave-front shift geometry.
pub fn setup_rank(
    dims: &Dims,
    settings: &mut SolverSettings,
    env: &Arc<dyn Transport>,
    max_halos: &[i64],
    num_packs: i64,
) -> StencilResult<RankGeometry> {
    let nd = dims.num_domain_dims();
    let me = env.my_rank();
    let num_ranks = env.num_ranks();

    let req_ranks: i64 = settings.num_ranks.product();
    if req_ranks != num_ranks as i64 {
        return Err(StencilError::Config(format!(
            "{req_ranks} rank(s) requested ({}), but {num_ranks} rank(s) are active",
            settings.num_ranks.make_dim_val_str(" * ")
        )));
    }

    // Derive coordinates by unlayout of the rank index when no layout
    // was given (row-major over the rank-count tuple).
    if settings.find_location {
        let coords = settings.num_ranks.unlayout(me as i64);
        settings.rank_indices.set_vals(&coords);
    }
    for j in 0..nd {
        let ri = settings.rank_indices.val(j);
        let nr = settings.num_ranks.val(j);
        if ri < 0 || ri >= nr {
            return Err(StencilError::Config(format!(
                "rank index {ri} outside [0, {nr}) in dim '{}'",
                dims.domain_dims[j]
            )));
        }
    }

    // Broadcast coordinate and size rows.
    let my_row: Vec<i64> = settings
        .rank_indices
        .vals()
        .into_iter()
        .chain(settings.rank_sizes.vals())
        .collect();
    let rows = env.allgather(&my_row)?;
    if rows.len() != num_ranks {
        return Err(StencilError::Messaging(format!(
            "allgather returned {} row(s) for {num_ranks} rank(s)",
            rows.len()
        )));
    }
    let coords: Vec<&[i64]> = rows.iter().map(|r| &r[0..nd]).collect();
    let rsizes: Vec<&[i64]> = rows.iter().map(|r| &r[nd..2 * nd]).collect();

    let my_sizes = settings.rank_sizes.vals();
    let my_vlen_mults = (0..nd).all(|j| my_sizes[j] % dims.fold_val(j) == 0);

    let mut rank_offsets = vec![0i64; nd];
    let mut overall_sizes = my_sizes.clone();
    let mut neighbors: Vec<Option<NeighborInfo>> =
        vec![None; RankGeometry::neighborhood_size(nd)];
    let mut num_neighbors = 0;

    for rn in 0..num_ranks {
        let rdeltas: Vec<i64> = (0..nd).map(|j| coords[rn][j] - coords[me][j]).collect();
        let man_dist: i64 = rdeltas.iter().map(|d| d.abs()).sum();
        let max_dist: i64 = rdeltas.iter().map(|d| d.abs()).max().unwrap_or(0);

        if rn == me {
            if man_dist != 0 {
                return Err(StencilError::InternalInvariant(format!(
                    "distance to own rank == {man_dist}"
                )));
            }
        } else if man_dist == 0 {
            return Err(StencilError::Config(format!(
                "ranks {me} and {rn} at same coordinates"
            )));
        }

        for j in 0..nd {
            // Rank rn is in-line with me in dim j when deltas in all
            // other dims are zero.
            let is_inline = (0..nd).all(|k| k == j || rdeltas[k] == 0);
            if !is_inline {
                continue;
            }
            if rn != me {
                overall_sizes[j] += rsizes[rn][j];
            }
            if rdeltas[j] < 0 {
                rank_offsets[j] += rsizes[rn][j];
            }
            // Domains must line up along edges and corners: every other
            // dim must match in size.
            for k in 0..nd {
                if k != j && rsizes[rn][k] != my_sizes[k] {
                    return Err(StencilError::Config(format!(
                        "ranks {rn} and {me} are both at rank-index {} in the '{}' \
                         dimension, but their rank-domain sizes are {} and {} (resp.) \
                         in the '{}' dimension, making them unaligned",
                        coords[me][j],
                        dims.domain_dims[j],
                        rsizes[rn][k],
                        my_sizes[k],
                        dims.domain_dims[k]
                    )));
                }
            }
        }

        // Immediate neighbor (or self) when Chebyshev distance <= 1.
        if max_dist <= 1 {
            let idx =
                RankGeometry::neighbor_index(&rdeltas.iter().map(|d| *d).collect::<Vec<_>>());
            let vlen_mults = (0..nd).all(|j| rsizes[rn][j] % dims.fold_val(j) == 0);
            neighbors[idx] = Some(NeighborInfo {
                rank: rn,
                offsets: rdeltas.clone(),
                man_dist,
                vlen_mults,
            });
            if rn != me {
                num_neighbors += 1;
                debug!(
                    "neighbor #{num_neighbors} is rank {rn} at relative position {:?}",
                    rdeltas
                );
            }
        }
    }

    // Wave-front shift geometry. One shift per (pack, WF step) beyond
    // the first.
    let wf_steps = settings.wf_steps;
    let geometry = wf_geometry(dims, settings, max_halos, wf_steps, &my_sizes, num_packs)?;

    Ok(RankGeometry {
        my_rank: me,
        num_ranks,
        rank_indices: settings.rank_indices.vals(),
        rank_sizes: my_sizes,
        rank_offsets,
        overall_sizes,
        neighbors,
        my_vlen_mults,
        max_halos: max_halos.to_vec(),
        wf_steps,
        num_wf_shifts: geometry.0,
        wf_angles: geometry.1,
        wf_shift_pts: geometry.2,
        left_wf_exts: geometry.3,
        right_wf_exts: geometry.4,
    })
}

/// Number of packs is supplied later; geometry holds per-dim amounts.
/// Returns (num_wf_shifts, angles, shift_pts, left_exts, right_exts).
fn wf_geometry(
    dims: &Dims,
    settings: &SolverSettings,
    max_halos: &[i64],
    wf_steps: i64,
    rank_sizes: &[i64],
    num_packs: i64,
) -> StencilResult<(i64, Vec<i64>, Vec<i64>, Vec<i64>, Vec<i64>)> {
    let nd = dims.num_domain_dims();
    let num_packs = num_packs.max(1);
    let mut num_wf_shifts = 0;
    if wf_steps > 0 {
        num_wf_shifts = (num_packs * wf_steps - 1).max(0);
    }

    let mut angles = vec![0i64; nd];
    let mut shift_pts = vec![0i64; nd];
    let mut left_exts = vec![0i64; nd];
    let mut right_exts = vec![0i64; nd];
    for j in 0..nd {
        let rnsize = settings.region_sizes.val(j);
        let rksize = rank_sizes[j];
        let nranks = settings.num_ranks.val(j);

        // Shift per step based on max halo, rounded up to the fold.
        let angle = round_up(max_halos[j], dims.fold_val(j));

        // No wave-front shifting is needed in a dim whose region covers
        // the whole global domain.
        let wf_angle = if rnsize < rksize || nranks > 1 { angle } else { 0 };
        angles[j] = wf_angle;
        let shifts = wf_angle * num_wf_shifts;
        shift_pts[j] = shifts;

        // A rank domain must accommodate its halo plus the total shift
        // when it has peers in this dim.
        let min_size = max_halos[j] + shifts;
        if nranks > 1 && rksize < min_size {
            return Err(StencilError::Config(format!(
                "rank-domain size of {rksize} in '{}' dim is less than minimum size \
                 of {min_size}, which is based on stencil halos and temporal \
                 wave-front sizes",
                dims.domain_dims[j]
            )));
        }

        let first = settings.rank_indices.val(j) == 0;
        let last = settings.rank_indices.val(j) == nranks - 1;
        left_exts[j] = if first { 0 } else { shifts };
        right_exts[j] = if last { 0 } else { shifts };
    }
    Ok((num_wf_shifts, angles, shift_pts, left_exts, right_exts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_comm::NullTransport;

    fn dims_2d() -> Dims {
        Dims::simple("t", &["x", "y"]).expect("dims")
    }

    #[test]
    fn test_neighbor_index_roundtrip() {
        for idx in 0..RankGeometry::neighborhood_size(3) {
            let ofs = RankGeometry::neighbor_offsets(idx, 3);
            assert_eq!(RankGeometry::neighbor_index(&ofs), idx);
        }
        assert_eq!(RankGeometry::neighbor_index(&[0, 0]), 4);
        assert_eq!(RankGeometry::neighbor_index(&[-1, -1]), 0);
        assert_eq!(RankGeometry::neighbor_index(&[1, 1]), 8);
    }

    #[test]
    fn test_single_rank_geometry() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[8, 8]);
        s.adjust(&dims).expect("adjust");
        let env: Arc<dyn Transport> = Arc::new(NullTransport);
        let g = setup_rank(&dims, &mut s, &env, &[1, 1], 1).expect("setup");
        assert_eq!(g.rank_offsets, vec![0, 0]);
        assert_eq!(g.overall_sizes, vec![8, 8]);
        assert_eq!(g.num_wf_shifts, 0);
        // Only self in the neighborhood.
        let center = RankGeometry::neighbor_index(&[0, 0]);
        assert!(g.neighbors[center].is_some());
        let others = g
            .neighbors
            .iter()
            .enumerate()
            .filter(|(i, n)| *i != center && n.is_some())
            .count();
        assert_eq!(others, 0);
    }

    #[test]
    fn test_rank_count_mismatch_is_config_error() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[8, 8]);
        s.num_ranks.set_vals(&[2, 1]);
        s.adjust(&dims).expect("adjust");
        let env: Arc<dyn Transport> = Arc::new(NullTransport);
        let err = setup_rank(&dims, &mut s, &env, &[1, 1], 1).expect_err("mismatch");
        assert!(matches!(err, StencilError::Config(_)));
    }

    #[test]
    fn test_wf_geometry_single_rank_whole_region_has_no_angle() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[8, 8]);
        s.wf_steps = 4;
        s.adjust(&dims).expect("adjust");
        let env: Arc<dyn Transport> = Arc::new(NullTransport);
        let g = setup_rank(&dims, &mut s, &env, &[1, 1], 1).expect("setup");
        // Region covers the rank and there is one rank: no WF angle.
        assert_eq!(g.wf_angles, vec![0, 0]);
        assert_eq!(g.num_wf_shifts, 3);
        assert_eq!(g.wf_shift_pts, vec![0, 0]);
    }

    #[test]
    fn test_wf_geometry_sub_rank_region_gets_angle() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[16, 16]);
        s.region_sizes.set_vals(&[8, 0]);
        s.wf_steps = 2;
        s.adjust(&dims).expect("adjust");
        let env: Arc<dyn Transport> = Arc::new(NullTransport);
        let g = setup_rank(&dims, &mut s, &env, &[2, 1], 2).expect("setup");
        // 2 packs * 2 steps - 1 = 3 shifts; angle 2 in x only.
        assert_eq!(g.num_wf_shifts, 3);
        assert_eq!(g.wf_angles, vec![2, 0]);
        assert_eq!(g.wf_shift_pts, vec![6, 0]);
        // Single rank: no extensions on either side.
        assert_eq!(g.left_wf_exts, vec![0, 0]);
        assert_eq!(g.right_wf_exts, vec![0, 0]);
    }
}

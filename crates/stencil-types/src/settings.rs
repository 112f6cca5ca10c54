// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Settings
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! All run-time knobs of the engine, serializable as JSON.
//!
//! Per-dim tuples cover the domain dims. The step-dim entries of the
//! region and block sizes are carried as `wf_steps` and `tb_steps`.
//! A tile size of 0 in a dim inherits the enclosing level's size in that
//! dim, which disables tiling at that level in that dim.

use crate::dims::Dims;
use crate::error::{StencilError, StencilResult};
use crate::idx::{ceil_div, round_up, IdxTuple};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverSettings {
    // Rank layout.
    pub num_ranks: IdxTuple,
    pub rank_indices: IdxTuple,
    /// Derive rank coordinates by unlayout of the rank index when true.
    pub find_location: bool,

    // Spatial tile sizes per domain dim, outer to inner.
    pub rank_sizes: IdxTuple,
    pub region_sizes: IdxTuple,
    pub block_sizes: IdxTuple,
    pub mini_block_sizes: IdxTuple,
    pub sub_block_sizes: IdxTuple,

    // Temporal tile depths (step-dim entries of region/block sizes).
    pub wf_steps: i64,
    pub tb_steps: i64,

    // Iteration-ordering hints.
    pub block_group_sizes: IdxTuple,
    pub mini_block_group_sizes: IdxTuple,
    pub sub_block_group_sizes: IdxTuple,

    // Padding.
    pub min_pad_sizes: IdxTuple,
    pub extra_pad_sizes: IdxTuple,

    // Threads.
    pub max_threads: usize,
    pub thread_divisor: usize,
    pub block_threads: usize,

    // Messaging.
    pub msg_rank: usize,
    pub overlap_comms: bool,

    /// Explicit step-ring size; 0 means "computed from halo offsets".
    pub step_alloc: i64,

    /// Run the auto-tuner silently during normal stepping.
    pub auto_tune: bool,
}

impl SolverSettings {
    /// Default settings over the given dims: one rank, no tiling beyond
    /// the rank level, no temporal tiling, no padding.
    pub fn new(dims: &Dims) -> Self {
        let zeros = dims.domain_tuple();
        let mut ones = dims.domain_tuple();
        ones.set_vals_same(1);
        SolverSettings {
            num_ranks: ones,
            rank_indices: zeros.clone(),
            find_location: true,
            rank_sizes: zeros.clone(),
            region_sizes: zeros.clone(),
            block_sizes: zeros.clone(),
            mini_block_sizes: zeros.clone(),
            sub_block_sizes: zeros.clone(),
            wf_steps: 0,
            tb_steps: 0,
            block_group_sizes: zeros.clone(),
            mini_block_group_sizes: zeros.clone(),
            sub_block_group_sizes: zeros.clone(),
            min_pad_sizes: zeros.clone(),
            extra_pad_sizes: zeros,
            max_threads: 0,
            thread_divisor: 1,
            block_threads: 1,
            msg_rank: 0,
            overlap_comms: false,
            step_alloc: 0,
            auto_tune: false,
        }
    }

    /// Load settings from a JSON file.
    pub fn from_file(path: &str) -> StencilResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Finish the inheritance chain and clamp tile sizes, in the order
    /// rank -> region -> block -> mini-block -> sub-block. Rank sizes are
    /// rounded up to cluster multiples first. Group sizes of 0 inherit
    /// the tile size at their level.
    pub fn adjust(&mut self, dims: &Dims) -> StencilResult<()> {
        let nd = dims.num_domain_dims();
        for j in 0..nd {
            let rk = self.rank_sizes.val(j);
            if rk < 0 {
                return Err(StencilError::Config(format!(
                    "rank size in dim '{}' is negative",
                    dims.domain_dims[j]
                )));
            }
            let rk = round_up(rk, dims.cluster_val(j));
            self.rank_sizes.set_val(j, rk);

            // Inherit and clamp each level.
            let rg = inherit_clamp(self.region_sizes.val(j), rk);
            self.region_sizes.set_val(j, rg);
            let bk = inherit_clamp(self.block_sizes.val(j), rg);
            self.block_sizes.set_val(j, bk);
            let mb = inherit_clamp(self.mini_block_sizes.val(j), bk);
            self.mini_block_sizes.set_val(j, mb);
            let sb = inherit_clamp(self.sub_block_sizes.val(j), mb);
            self.sub_block_sizes.set_val(j, sb);

            let bg = self.block_group_sizes.val(j);
            self.block_group_sizes
                .set_val(j, if bg == 0 { bk } else { bg.min(rg) });
            let mg = self.mini_block_group_sizes.val(j);
            self.mini_block_group_sizes
                .set_val(j, if mg == 0 { mb } else { mg.min(bk) });
            let sg = self.sub_block_group_sizes.val(j);
            self.sub_block_group_sizes
                .set_val(j, if sg == 0 { sb } else { sg.min(mb) });
        }
        if self.wf_steps < 0 || self.tb_steps < 0 {
            return Err(StencilError::Config(
                "temporal tile depths must be >= 0".to_string(),
            ));
        }
        // TB is inside WF, so WF depth can not be smaller.
        if self.wf_steps > 0 || self.tb_steps > 0 {
            self.wf_steps = self.wf_steps.max(self.tb_steps);
        }
        if self.thread_divisor == 0 {
            self.thread_divisor = 1;
        }
        if self.block_threads == 0 {
            self.block_threads = 1;
        }
        Ok(())
    }

    /// Number of tiles of `inner` size per `outer` size in each dim.
    pub fn num_tiles(outer: &IdxTuple, inner: &IdxTuple) -> IdxTuple {
        let mut counts = outer.clone();
        for j in 0..outer.len() {
            let o = outer.val(j);
            let i = inner.val(j).max(1);
            counts.set_val(j, if o == 0 { 0 } else { ceil_div(o, i) });
        }
        counts
    }
}

#[inline]
fn inherit_clamp(mine: i64, parent: i64) -> i64 {
    if mine <= 0 {
        parent
    } else {
        mine.min(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims_2d() -> Dims {
        Dims::simple("t", &["x", "y"]).expect("valid dims")
    }

    #[test]
    fn test_zero_sizes_inherit_parent() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[64, 32]);
        s.region_sizes.set_vals(&[16, 0]);
        s.block_sizes.set_vals(&[0, 8]);
        s.adjust(&dims).expect("adjust must succeed");
        assert_eq!(s.region_sizes.vals(), vec![16, 32]);
        assert_eq!(s.block_sizes.vals(), vec![16, 8]);
        assert_eq!(s.mini_block_sizes.vals(), vec![16, 8]);
        assert_eq!(s.sub_block_sizes.vals(), vec![16, 8]);
        assert_eq!(s.block_group_sizes.vals(), vec![16, 8]);
    }

    #[test]
    fn test_tile_sizes_clamped_to_parent() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[16, 16]);
        s.region_sizes.set_vals(&[64, 64]);
        s.block_sizes.set_vals(&[256, 4]);
        s.adjust(&dims).expect("adjust must succeed");
        assert_eq!(s.region_sizes.vals(), vec![16, 16]);
        assert_eq!(s.block_sizes.vals(), vec![16, 4]);
    }

    #[test]
    fn test_wf_steps_rounded_up_to_tb() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[8, 8]);
        s.wf_steps = 1;
        s.tb_steps = 4;
        s.adjust(&dims).expect("adjust must succeed");
        assert_eq!(s.wf_steps, 4);
    }

    #[test]
    fn test_roundtrip_serialization() {
        let dims = dims_2d();
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[64, 32]);
        s.overlap_comms = true;
        let json = serde_json::to_string_pretty(&s).expect("serialize");
        let s2: SolverSettings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(s2.rank_sizes.vals(), vec![64, 32]);
        assert!(s2.overlap_comms);
    }

    #[test]
    fn test_num_tiles() {
        let outer = IdxTuple::from_pairs(&[("x", 17), ("y", 8)]);
        let inner = IdxTuple::from_pairs(&[("x", 4), ("y", 8)]);
        let n = SolverSettings::num_tiles(&outer, &inner);
        assert_eq!(n.vals(), vec![5, 1]);
    }
}

// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Bounding Boxes
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Rectangular covers of bundle sub-domains.
//!
//! A bundle with no sub-domain predicate gets the extended rank BB. A
//! bundle with a predicate gets an overall BB from a full scan and, when
//! the overall BB is not solid, a list of non-overlapping sub-rects
//! whose union is exactly the valid point set. The engine only executes
//! bundles inside these rects.

use stencil_types::dims::Dims;
use stencil_types::error::StencilResult;
use stencil_types::idx::{ceil_div, imod_flr, IdxTuple};
use tracing::debug;

use crate::bundle::Bundle;
use crate::parallel::{parallel_for, ThreadCounts};

/// Half-open rectangular region in domain-dim space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub begin: Vec<i64>,
    pub end: Vec<i64>,
    pub len: Vec<i64>,
    pub size: i64,
    pub num_points: i64,
    pub is_full: bool,
    pub is_aligned: bool,
    pub is_cluster_mult: bool,
    pub valid: bool,
}

impl BoundingBox {
    pub fn empty(nd: usize) -> Self {
        BoundingBox {
            begin: vec![0; nd],
            end: vec![0; nd],
            len: vec![0; nd],
            size: 0,
            num_points: 0,
            is_full: false,
            is_aligned: true,
            is_cluster_mult: true,
            valid: false,
        }
    }

    pub fn from_range(begin: Vec<i64>, end: Vec<i64>) -> Self {
        let nd = begin.len();
        let mut bb = BoundingBox::empty(nd);
        bb.begin = begin;
        bb.end = end;
        bb
    }

    /// Recompute derived attributes. With `force_full`, `num_points` is
    /// set to the area (used for rank and sub-rect boxes).
    pub fn update(&mut self, name: &str, dims: &Dims, rank_offsets: &[i64], force_full: bool) {
        let nd = self.begin.len();
        self.len = (0..nd)
            .map(|j| (self.end[j] - self.begin[j]).max(0))
            .collect();
        self.size = self.len.iter().product();
        if force_full {
            self.num_points = self.size;
        }
        self.is_full = self.num_points == self.size;

        self.is_aligned = true;
        for j in 0..nd {
            if imod_flr(self.begin[j] - rank_offsets[j], dims.fold_val(j)) != 0 {
                self.is_aligned = false;
                break;
            }
        }

        self.is_cluster_mult = true;
        for j in 0..nd {
            if self.len[j] % dims.cluster_val(j) != 0 {
                self.is_cluster_mult = false;
                break;
            }
        }
        if self.is_full && self.is_aligned && !self.is_cluster_mult {
            debug!(
                "'{name}' domain has one or more sizes that are not cluster multiples; \
                 masked remainder calculations will be used"
            );
        }
        self.valid = true;
    }

    #[inline]
    pub fn contains_point(&self, pt: &[i64]) -> bool {
        pt.iter()
            .zip(self.begin.iter().zip(self.end.iter()))
            .all(|(p, (b, e))| p >= b && p < e)
    }

    /// True when `[start, stop)` lies entirely inside this box.
    #[inline]
    pub fn contains_range(&self, start: &[i64], stop: &[i64]) -> bool {
        (0..self.begin.len()).all(|j| start[j] >= self.begin[j] && stop[j] <= self.end[j])
    }

    /// Intersection of `[start, stop)` with this box, or None if empty.
    pub fn trim_range(&self, start: &[i64], stop: &[i64]) -> Option<(Vec<i64>, Vec<i64>)> {
        let nd = self.begin.len();
        let mut s = vec![0i64; nd];
        let mut e = vec![0i64; nd];
        for j in 0..nd {
            s[j] = start[j].max(self.begin[j]);
            e[j] = stop[j].min(self.end[j]);
            if e[j] <= s[j] {
                return None;
            }
        }
        Some((s, e))
    }
}

/// Overall BB plus the sub-rect decomposition for one bundle.
#[derive(Clone, Debug)]
pub struct BundleBBs {
    pub overall: BoundingBox,
    pub list: Vec<BoundingBox>,
}

/// Find the overall BB and sub-rect cover of `bundle` within the
/// extended rank BB `ext_bb`.
pub fn find_bundle_bbs(
    bundle: &dyn Bundle,
    ext_bb: &BoundingBox,
    dims: &Dims,
    rank_offsets: &[i64],
    threads: ThreadCounts,
) -> StencilResult<BundleBBs> {
    let nd = dims.num_domain_dims();

    // Without a predicate the BB is the whole extended rank.
    if !bundle.has_sub_domain() {
        let mut overall = ext_bb.clone();
        overall.update(bundle.name(), dims, rank_offsets, true);
        return Ok(BundleBBs {
            list: vec![overall.clone()],
            overall,
        });
    }

    // Overall scan: min/max of valid points plus a count, in parallel
    // slices along the outermost domain dim.
    let outer_len = ext_bb.end[0] - ext_bb.begin[0];
    let nslices = (threads.total() as i64).clamp(1, outer_len.max(1));
    let len_per_slice = ceil_div(outer_len.max(0), nslices);
    let results: std::sync::Mutex<Vec<(Vec<i64>, Vec<i64>, i64)>> =
        std::sync::Mutex::new(Vec::new());
    parallel_for(threads, 0, nslices, 1, &|s0, _s1, _w| {
        let mut lo = ext_bb.begin.clone();
        let mut hi = ext_bb.end.clone();
        lo[0] = ext_bb.begin[0] + s0 * len_per_slice;
        hi[0] = (lo[0] + len_per_slice).min(ext_bb.end[0]);
        if hi[0] <= lo[0] {
            return Ok(());
        }
        let mut mins = vec![i64::MAX; nd];
        let mut maxs = vec![i64::MIN; nd];
        let mut npts = 0i64;
        visit_span(&lo, &hi, |pt| {
            if bundle.in_valid_domain(pt) {
                for j in 0..nd {
                    mins[j] = mins[j].min(pt[j]);
                    maxs[j] = maxs[j].max(pt[j]);
                }
                npts += 1;
            }
        });
        if npts > 0 {
            results
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((mins, maxs, npts));
        }
        Ok(())
    })?;
    let slices = results.into_inner().unwrap_or_else(|p| p.into_inner());

    let mut overall = BoundingBox::empty(nd);
    let mut npts = 0i64;
    if !slices.is_empty() {
        let mut mins = vec![i64::MAX; nd];
        let mut maxs = vec![i64::MIN; nd];
        for (lo, hi, n) in &slices {
            for j in 0..nd {
                mins[j] = mins[j].min(lo[j]);
                maxs[j] = maxs[j].max(hi[j]);
            }
            npts += n;
        }
        overall.begin = mins;
        overall.end = maxs.iter().map(|m| m + 1).collect();
    }
    overall.num_points = npts;
    overall.update(bundle.name(), dims, rank_offsets, false);

    if npts == 0 {
        debug!("BB of bundle '{}' is empty", bundle.name());
        return Ok(BundleBBs {
            overall,
            list: Vec::new(),
        });
    }
    if overall.is_full {
        return Ok(BundleBBs {
            list: vec![overall.clone()],
            overall,
        });
    }

    // The overall BB is not solid (common for boundary conditions):
    // cover the valid set with maximal axis-aligned rects, one slice of
    // the outer dim per worker, merged afterward.
    debug!(
        "'{}' domain has only {} valid point(s) inside its bounding box of {}; \
         multiple sub-boxes will be used",
        bundle.name(),
        npts,
        overall.size
    );
    let outer_len = overall.end[0] - overall.begin[0];
    let nslices = (threads.total() as i64).clamp(1, outer_len);
    let len_per_slice = ceil_div(outer_len, nslices);
    let rect_lists: std::sync::Mutex<Vec<(i64, Vec<BoundingBox>)>> =
        std::sync::Mutex::new(Vec::new());
    parallel_for(threads, 0, nslices, 1, &|s0, _s1, _w| {
        let mut slice_begin = overall.begin.clone();
        let mut slice_end = overall.end.clone();
        slice_begin[0] = overall.begin[0] + s0 * len_per_slice;
        slice_end[0] = (slice_begin[0] + len_per_slice).min(overall.end[0]);
        if slice_end[0] <= slice_begin[0] {
            return Ok(());
        }
        let rects = find_rects_in_slice(bundle, dims, rank_offsets, &slice_begin, &slice_end);
        rect_lists
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((s0, rects));
        Ok(())
    })?;
    let mut rect_lists = rect_lists.into_inner().unwrap_or_else(|p| p.into_inner());
    rect_lists.sort_by_key(|(s0, _)| *s0);

    // Merge rects adjacent along the outer dim and aligned in all other
    // dims.
    let mut final_list: Vec<BoundingBox> = Vec::new();
    for (_, rects) in rect_lists {
        'next_rect: for bbn in rects {
            if bbn.size == 0 {
                continue;
            }
            for bb in final_list.iter_mut() {
                let adjacent = bb.end[0] == bbn.begin[0];
                let aligned = (1..nd)
                    .all(|j| bb.begin[j] == bbn.begin[j] && bb.end[j] == bbn.end[j]);
                if adjacent && aligned {
                    bb.end[0] = bbn.end[0];
                    bb.update("sub-bb", dims, rank_offsets, true);
                    continue 'next_rect;
                }
            }
            final_list.push(bbn);
        }
    }
    Ok(BundleBBs {
        overall,
        list: final_list,
    })
}

/// Maximal-rect cover of the valid points inside one slice. At each
/// unclaimed valid point, a candidate extent is grown and re-scanned,
/// shrinking in the first dim where an invalid or already-covered point
/// appears, until a full scan passes.
fn find_rects_in_slice(
    bundle: &dyn Bundle,
    dims: &Dims,
    rank_offsets: &[i64],
    slice_begin: &[i64],
    slice_end: &[i64],
) -> Vec<BoundingBox> {
    let nd = slice_begin.len();
    let mut rects: Vec<BoundingBox> = Vec::new();
    let covered = |rects: &[BoundingBox], pt: &[i64]| rects.iter().any(|r| r.contains_point(pt));

    let mut bpt = slice_begin.to_vec();
    loop {
        let valid = bundle.in_valid_domain(&bpt) && !covered(&rects, &bpt);
        if valid {
            // Grow a rect from bpt toward the slice end.
            let mut scan_len: Vec<i64> = (0..nd).map(|j| slice_end[j] - bpt[j]).collect();
            let mut do_scan = true;
            while do_scan {
                do_scan = false;
                let sizes = IdxTuple::from_pairs(
                    &scan_len
                        .iter()
                        .enumerate()
                        .map(|(j, l)| (dims.domain_dims[j].clone(), *l))
                        .collect::<Vec<_>>(),
                );
                let mut ept = vec![0i64; nd];
                sizes.visit_all_points(|ofs, _| {
                    for j in 0..nd {
                        ept[j] = bpt[j] + ofs[j];
                    }
                    let evalid = bundle.in_valid_domain(&ept) && !covered(&rects, &ept);
                    if !evalid {
                        // Shrink the first dim beyond its start and
                        // restart the scan for remaining dims.
                        for j in 0..nd {
                            if ept[j] > bpt[j] {
                                scan_len[j] = ept[j] - bpt[j];
                                if j < nd - 1 {
                                    do_scan = true;
                                }
                                return false;
                            }
                        }
                    }
                    true
                });
            }
            let mut bb = BoundingBox::from_range(
                bpt.clone(),
                (0..nd).map(|j| bpt[j] + scan_len[j]).collect(),
            );
            bb.update("sub-bb", dims, rank_offsets, true);
            rects.push(bb);
        }
        // Advance to the next point of the slice.
        let mut i = nd;
        loop {
            if i == 0 {
                return rects;
            }
            i -= 1;
            bpt[i] += 1;
            if bpt[i] < slice_end[i] {
                break;
            }
            bpt[i] = slice_begin[i];
        }
    }
}

/// Visit every point of the half-open span `[begin, end)` in row-major
/// order.
pub fn visit_span(begin: &[i64], end: &[i64], mut f: impl FnMut(&[i64])) {
    let nd = begin.len();
    if (0..nd).any(|j| end[j] <= begin[j]) {
        return;
    }
    let mut pt = begin.to_vec();
    loop {
        f(&pt);
        let mut i = nd;
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            pt[i] += 1;
            if pt[i] < end[i] {
                break;
            }
            pt[i] = begin[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{EvalVars, StepUse};
    use crate::var::VarId;
    use std::collections::HashSet;
    use stencil_types::error::StencilResult;

    struct PredBundle {
        pred: fn(&[i64]) -> bool,
    }

    impl Bundle for PredBundle {
        fn name(&self) -> &str {
            "pred"
        }
        fn inputs(&self) -> Vec<VarId> {
            Vec::new()
        }
        fn outputs(&self) -> Vec<VarId> {
            Vec::new()
        }
        fn has_sub_domain(&self) -> bool {
            true
        }
        fn in_valid_domain(&self, pt: &[i64]) -> bool {
            (self.pred)(pt)
        }
        fn output_step_index(&self, t: i64) -> Option<i64> {
            Some(t + 1)
        }
        fn step_uses(&self, _var: VarId) -> Vec<StepUse> {
            Vec::new()
        }
        fn calc_point(&self, _vars: &EvalVars, _pt: &[i64], _t: i64) -> StencilResult<()> {
            Ok(())
        }
    }

    fn ext_bb_2d(nx: i64, ny: i64) -> BoundingBox {
        BoundingBox::from_range(vec![0, 0], vec![nx, ny])
    }

    fn check_cover(bbs: &BundleBBs, ext: &BoundingBox, pred: fn(&[i64]) -> bool) {
        // Sub-rects are disjoint and their union is exactly the valid
        // set; sizes sum to num_points.
        let mut covered: HashSet<Vec<i64>> = HashSet::new();
        let mut total = 0i64;
        for bb in &bbs.list {
            total += bb.size;
            visit_span(&bb.begin, &bb.end, |pt| {
                assert!(
                    covered.insert(pt.to_vec()),
                    "point {pt:?} covered twice"
                );
                assert!(pred(pt), "invalid point {pt:?} covered");
            });
        }
        visit_span(&ext.begin, &ext.end, |pt| {
            if pred(pt) {
                assert!(covered.contains(pt), "valid point {pt:?} not covered");
            }
        });
        assert_eq!(total, bbs.overall.num_points);
    }

    #[test]
    fn test_full_bb_has_single_rect() {
        let dims = Dims::simple("t", &["x", "y"]).expect("dims");
        let b = PredBundle { pred: |_| true };
        let ext = ext_bb_2d(6, 5);
        let bbs =
            find_bundle_bbs(&b, &ext, &dims, &[0, 0], ThreadCounts::flat(2)).expect("bbs");
        assert!(bbs.overall.is_full);
        assert_eq!(bbs.list.len(), 1);
        assert_eq!(bbs.list[0].begin, ext.begin);
        assert_eq!(bbs.list[0].end, ext.end);
    }

    #[test]
    fn test_no_predicate_uses_extended_bb() {
        struct Whole;
        impl Bundle for Whole {
            fn name(&self) -> &str {
                "whole"
            }
            fn inputs(&self) -> Vec<VarId> {
                Vec::new()
            }
            fn outputs(&self) -> Vec<VarId> {
                Vec::new()
            }
            fn output_step_index(&self, t: i64) -> Option<i64> {
                Some(t + 1)
            }
            fn step_uses(&self, _var: VarId) -> Vec<StepUse> {
                Vec::new()
            }
            fn calc_point(&self, _v: &EvalVars, _pt: &[i64], _t: i64) -> StencilResult<()> {
                Ok(())
            }
        }
        let dims = Dims::simple("t", &["x", "y"]).expect("dims");
        let ext = ext_bb_2d(4, 4);
        let bbs =
            find_bundle_bbs(&Whole, &ext, &dims, &[0, 0], ThreadCounts::flat(1)).expect("bbs");
        assert!(bbs.overall.is_full);
        assert_eq!(bbs.overall.num_points, 16);
    }

    #[test]
    fn test_disc_predicate_cover_is_exact() {
        fn disc(pt: &[i64]) -> bool {
            let dx = pt[0] - 5;
            let dy = pt[1] - 5;
            dx * dx + dy * dy <= 16
        }
        let dims = Dims::simple("t", &["x", "y"]).expect("dims");
        let b = PredBundle { pred: disc };
        let ext = ext_bb_2d(12, 12);
        for nthreads in [1, 3] {
            let bbs = find_bundle_bbs(&b, &ext, &dims, &[0, 0], ThreadCounts::flat(nthreads))
                .expect("bbs");
            assert!(!bbs.overall.is_full);
            assert!(bbs.list.len() > 1);
            check_cover(&bbs, &ext, disc);
        }
    }

    #[test]
    fn test_checkerboard_cover_is_exact() {
        fn checker(pt: &[i64]) -> bool {
            (pt[0] + pt[1]) % 2 == 0
        }
        let dims = Dims::simple("t", &["x", "y"]).expect("dims");
        let b = PredBundle { pred: checker };
        let ext = ext_bb_2d(5, 4);
        let bbs =
            find_bundle_bbs(&b, &ext, &dims, &[0, 0], ThreadCounts::flat(2)).expect("bbs");
        check_cover(&bbs, &ext, checker);
    }

    #[test]
    fn test_empty_predicate_yields_empty_cover() {
        let dims = Dims::simple("t", &["x", "y"]).expect("dims");
        let b = PredBundle { pred: |_| false };
        let ext = ext_bb_2d(4, 4);
        let bbs =
            find_bundle_bbs(&b, &ext, &dims, &[0, 0], ThreadCounts::flat(2)).expect("bbs");
        assert_eq!(bbs.overall.num_points, 0);
        assert!(bbs.list.is_empty());
    }

    #[test]
    fn test_half_plane_merges_to_one_rect() {
        fn half(pt: &[i64]) -> bool {
            pt[1] >= 2
        }
        let dims = Dims::simple("t", &["x", "y"]).expect("dims");
        let b = PredBundle { pred: half };
        let ext = ext_bb_2d(6, 6);
        let bbs =
            find_bundle_bbs(&b, &ext, &dims, &[0, 0], ThreadCounts::flat(3)).expect("bbs");
        // The overall BB [0..6, 2..6) is solid, so one rect suffices.
        assert!(bbs.overall.is_full);
        assert_eq!(bbs.list.len(), 1);
        assert_eq!(bbs.list[0].begin, vec![0, 2]);
    }

    #[test]
    fn test_bb_alignment_flags() {
        let mut fold = IdxTuple::with_names(&["x", "y"]);
        fold.set_vals(&[4, 1]);
        let mut cluster = IdxTuple::with_names(&["x", "y"]);
        cluster.set_vals(&[8, 1]);
        let decls = vec![
            stencil_types::dims::DimDef {
                name: "t".into(),
                dim_type: stencil_types::dims::DimType::Step,
            },
            stencil_types::dims::DimDef {
                name: "x".into(),
                dim_type: stencil_types::dims::DimType::Domain,
            },
            stencil_types::dims::DimDef {
                name: "y".into(),
                dim_type: stencil_types::dims::DimType::Domain,
            },
        ];
        let dims = Dims::new(&decls, fold, cluster).expect("dims");
        let mut bb = BoundingBox::from_range(vec![4, 0], vec![16, 4]);
        bb.update("test", &dims, &[0, 0], true);
        assert!(bb.is_aligned); // begin 4 is a fold multiple
        assert!(!bb.is_cluster_mult); // len 12 is not a multiple of 8
        let mut bb2 = BoundingBox::from_range(vec![2, 0], vec![10, 4]);
        bb2.update("test2", &dims, &[0, 0], true);
        assert!(!bb2.is_aligned);
    }
}

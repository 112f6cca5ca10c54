// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Halo Exchange
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Exchange-buffer geometry and the four-phase halo protocol.
//!
//! For each (var, neighbor, direction) a buffer slice is derived: the
//! full rank span where the neighbor is in-line, a halo-width slab at
//! the matching edge otherwise. The slab width is the halo plus the
//! total wave-front shift. One step is exchanged per message; the tag
//! is the var's registry index. The four phases are irecv, pack+isend,
//! unpack, and finalize; with overlap the first two run after the
//! exterior compute pass and the last two after the interior pass.

use std::sync::{Arc, Mutex};

use stencil_comm::{bytes_to_elems, elems_to_bytes, Request, Transport};
use stencil_types::dims::{DimType, Dims};
use stencil_types::error::{StencilError, StencilResult};
use stencil_types::idx::{imod_flr, round_down_flr, round_up, round_up_flr};
use stencil_types::settings::SolverSettings;
use tracing::{debug, trace};

use crate::bbox::BoundingBox;
use crate::geometry::RankGeometry;
use crate::parallel::Timer;
use crate::var::Var;

/// Which halo phases to run in one `exchange` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaloPass {
    /// No overlap: all four phases.
    Unified,
    /// Overlap, after the exterior compute: irecv + pack/isend.
    AfterExterior,
    /// Overlap, after the interior compute: unpack + finalize.
    AfterInterior,
}

/// One direction's buffer slice of a var, bounds inclusive per var dim.
/// The step entry is a placeholder filled in at call time.
#[derive(Clone, Debug)]
pub struct BufSpec {
    pub first: Vec<i64>,
    pub last: Vec<i64>,
    pub num_elems: usize,
    pub vec_ok: bool,
}

/// Send/receive buffers toward one neighbor for one var.
pub struct NeighborBufs {
    pub rank: usize,
    pub send: Option<BufSpec>,
    pub recv: Option<BufSpec>,
    send_req: Mutex<Option<Request>>,
    recv_req: Mutex<Option<Request>>,
}

/// All exchange buffers of one var, dense over the neighborhood.
pub struct VarHalo {
    pub neighbors: Vec<Option<NeighborBufs>>,
}

/// Exchange state for the whole solution.
pub struct HaloState {
    /// Indexed by var registry index; None when the var exchanges
    /// nothing (scratch, fixed-size, or no facing neighbor).
    pub per_var: Vec<Option<VarHalo>>,
}

impl HaloState {
    pub fn empty(nvars: usize) -> Self {
        HaloState {
            per_var: (0..nvars).map(|_| None).collect(),
        }
    }

    pub fn has_buffers(&self, var_idx: usize) -> bool {
        self.per_var.get(var_idx).is_some_and(|v| v.is_some())
    }

    /// Poll the transport on all outstanding requests to promote
    /// progress during interior-only compute.
    pub fn test_all(&self, env: &Arc<dyn Transport>) -> StencilResult<()> {
        let mut num_tests = 0;
        for vh in self.per_var.iter().flatten() {
            for nb in vh.neighbors.iter().flatten() {
                for req in [&nb.send_req, &nb.recv_req] {
                    let guard = req
                        .lock()
                        .map_err(|_| StencilError::Messaging("poisoned request lock".into()))?;
                    if let Some(r) = guard.as_ref() {
                        env.test(r)?;
                        num_tests += 1;
                    }
                }
            }
        }
        trace!("exchange progress: {num_tests} transport test(s) issued");
        Ok(())
    }

    /// Run the requested phases for the ordered `(var, step)` list.
    /// Returns seconds spent blocked in transport waits.
    pub fn exchange(
        &self,
        env: &Arc<dyn Transport>,
        vars: &[Arc<Var>],
        swaps: &[(usize, Vec<i64>)],
        pass: HaloPass,
    ) -> StencilResult<f64> {
        #[derive(Clone, Copy, PartialEq)]
        enum Phase {
            Irecv,
            PackIsend,
            Unpack,
            Finalize,
        }
        let phases: &[Phase] = match pass {
            HaloPass::Unified => &[
                Phase::Irecv,
                Phase::PackIsend,
                Phase::Unpack,
                Phase::Finalize,
            ],
            HaloPass::AfterExterior => &[Phase::Irecv, Phase::PackIsend],
            HaloPass::AfterInterior => &[Phase::Unpack, Phase::Finalize],
        };
        // With overlap there is one buffer per var in flight, so only
        // one step per var may be exchanged per call.
        if pass != HaloPass::Unified {
            for (vi, steps) in swaps {
                if steps.len() > 1 {
                    return Err(StencilError::InternalInvariant(format!(
                        "var '{}' has {} dirty step(s) with overlapped exchange",
                        vars[*vi].name(),
                        steps.len()
                    )));
                }
            }
        }

        let max_steps = swaps.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
        let mut wait_timer = Timer::new();

        // The step loop is outermost: one buffer per var means one step
        // must complete before the next begins.
        for svi in 0..max_steps {
            for phase in phases {
                for (vi, steps) in swaps {
                    if steps.len() <= svi {
                        continue;
                    }
                    let t = steps[svi];
                    let var = &vars[*vi];
                    let tag = *vi as u32;
                    let Some(vh) = &self.per_var[*vi] else {
                        continue;
                    };
                    let step_posn = var.dim_posn_of_step();
                    for nb in vh.neighbors.iter().flatten() {
                        match phase {
                            Phase::Irecv => {
                                if let Some(spec) = &nb.recv {
                                    trace!(
                                        "requesting {} elem(s) of '{}' step {t} from rank {}",
                                        spec.num_elems,
                                        var.name(),
                                        nb.rank
                                    );
                                    let req =
                                        env.irecv(nb.rank, tag, spec.num_elems * 8)?;
                                    store_req(&nb.recv_req, req)?;
                                }
                            }
                            Phase::PackIsend => {
                                if let Some(spec) = &nb.send {
                                    let (first, last) =
                                        spec.bounds_at_step(step_posn, t);
                                    let mut buf = vec![0.0f64; spec.num_elems];
                                    var.get_elements_in_slice(&mut buf, &first, &last)?;
                                    trace!(
                                        "sending {} elem(s) of '{}' step {t} to rank {} \
                                         ({} copy)",
                                        spec.num_elems,
                                        var.name(),
                                        nb.rank,
                                        if spec.vec_ok { "vector" } else { "scalar" }
                                    );
                                    let req =
                                        env.isend(nb.rank, tag, elems_to_bytes(&buf))?;
                                    store_req(&nb.send_req, req)?;
                                }
                            }
                            Phase::Unpack => {
                                if let Some(spec) = &nb.recv {
                                    let req = take_req(&nb.recv_req)?;
                                    let Some(req) = req else {
                                        return Err(StencilError::InternalInvariant(
                                            format!(
                                                "no posted receive for '{}' from rank {}",
                                                var.name(),
                                                nb.rank
                                            ),
                                        ));
                                    };
                                    wait_timer.start();
                                    let bytes = env.wait(req)?.ok_or_else(|| {
                                        StencilError::Messaging(
                                            "receive completed without payload".into(),
                                        )
                                    })?;
                                    wait_timer.stop();
                                    let elems = bytes_to_elems(&bytes)?;
                                    let (first, last) =
                                        spec.bounds_at_step(step_posn, t);
                                    let n =
                                        var.set_elements_in_slice(&elems, &first, &last)?;
                                    if n != spec.num_elems {
                                        return Err(StencilError::InternalInvariant(
                                            format!(
                                                "unpacked {n} elem(s) into '{}', expected {}",
                                                var.name(),
                                                spec.num_elems
                                            ),
                                        ));
                                    }
                                }
                            }
                            Phase::Finalize => {
                                if nb.send.is_some() {
                                    if let Some(req) = take_req(&nb.send_req)? {
                                        wait_timer.start();
                                        env.wait(req)?;
                                        wait_timer.stop();
                                    }
                                }
                            }
                        }
                    }
                    // Mark the step clean once its sends are finished.
                    if *phase == Phase::Finalize && var.is_dirty(t) {
                        var.set_dirty(false, t);
                        trace!("var '{}' marked clean at step {t}", var.name());
                    }
                }
            }
        }
        Ok(wait_timer.elapsed_secs())
    }
}

impl BufSpec {
    fn bounds_at_step(&self, step_posn: Option<usize>, t: i64) -> (Vec<i64>, Vec<i64>) {
        let mut first = self.first.clone();
        let mut last = self.last.clone();
        if let Some(sp) = step_posn {
            first[sp] = t;
            last[sp] = t;
        }
        (first, last)
    }
}

fn store_req(slot: &Mutex<Option<Request>>, req: Request) -> StencilResult<()> {
    let mut guard = slot
        .lock()
        .map_err(|_| StencilError::Messaging("poisoned request lock".into()))?;
    if guard.is_some() {
        return Err(StencilError::InternalInvariant(
            "request posted while one is already in flight".into(),
        ));
    }
    *guard = Some(req);
    Ok(())
}

fn take_req(slot: &Mutex<Option<Request>>) -> StencilResult<Option<Request>> {
    let mut guard = slot
        .lock()
        .map_err(|_| StencilError::Messaging("poisoned request lock".into()))?;
    Ok(guard.take())
}

/// Derive all exchange buffers and the MPI-interior box.
///
/// Buffer shapes must agree between peers by construction: my left send
/// buffer uses the neighbor's right halo and vice-versa, and both ranks
/// run this identical computation.
pub fn build_halo_state(
    dims: &Dims,
    settings: &SolverSettings,
    geom: &RankGeometry,
    vars: &[Arc<Var>],
    ext_bb: &BoundingBox,
) -> StencilResult<(HaloState, BoundingBox)> {
    let nd = dims.num_domain_dims();
    let mut state = HaloState::empty(vars.len());
    let mut interior = ext_bb.clone();
    interior.valid = false;

    let allow_vec = true;
    let mut num_send = 0usize;

    let my_idx = RankGeometry::neighbor_index(&vec![0; nd]);
    let my_vlen_ok = geom.neighbors[my_idx]
        .as_ref()
        .map(|n| n.vlen_mults)
        .unwrap_or(geom.my_vlen_mults);

    geom.visit_neighbors(|_ni, neigh| {
        for (vi, var) in vars.iter().enumerate() {
            if var.is_scratch() || var.is_fixed_size() {
                continue;
            }
            let mut grid_vec_ok = allow_vec && my_vlen_ok && neigh.vlen_mults;

            // Per domain dim used in this var: inner/outer spans and
            // halo widths facing this neighbor.
            let mut found_delta = false;
            let vdims = var.dims().to_vec();
            let mut first_inner = vec![0i64; vdims.len()];
            let mut last_inner = vec![0i64; vdims.len()];
            let mut first_outer = vec![0i64; vdims.len()];
            let mut last_outer = vec![0i64; vdims.len()];
            let mut my_halo = vec![0i64; vdims.len()];
            let mut neigh_halo = vec![0i64; vdims.len()];
            for (i, d) in vdims.iter().enumerate() {
                if d.kind != DimType::Domain {
                    continue;
                }
                let Some(j) = dims.domain_posn(&d.name) else {
                    continue;
                };
                let fidx = var.rank_offset(i);
                let lidx = fidx + d.domain_size - 1;
                first_inner[i] = fidx;
                last_inner[i] = lidx;
                // With no rank beyond an edge, extend the outer span
                // into the halo so all data are synchronized there.
                let mut fo = fidx;
                let mut lo = lidx;
                if geom.is_first_rank(j) {
                    fo -= d.left_halo;
                }
                if geom.is_last_rank(j, &settings.num_ranks.vals()) {
                    lo += d.right_halo;
                }
                first_outer[i] = fo;
                last_outer[i] = lo;

                // Rounding the outer span to fold multiples must stay
                // inside the allocation for the vector path.
                let fv = round_down_flr(fo, d.vec_len);
                let lv = round_up_flr(lo + 1, d.vec_len) - 1;
                if fv < var.first_local_index(i) || lv > var.last_local_index(i) {
                    grid_vec_ok = false;
                }

                let ext = geom.wf_shift_pts[j];
                match neigh.offsets[j] {
                    -1 => {
                        my_halo[i] = d.left_halo + ext;
                        neigh_halo[i] = d.right_halo + ext;
                        found_delta = true;
                    }
                    1 => {
                        my_halo[i] = d.right_halo + ext;
                        neigh_halo[i] = d.left_halo + ext;
                        found_delta = true;
                    }
                    _ => {}
                }
            }
            if !found_delta {
                continue;
            }

            if grid_vec_ok {
                for (i, d) in vdims.iter().enumerate() {
                    if d.kind != DimType::Domain {
                        continue;
                    }
                    first_outer[i] = round_down_flr(first_outer[i], d.vec_len);
                    last_outer[i] = round_up_flr(last_outer[i] + 1, d.vec_len) - 1;
                    my_halo[i] = round_up(my_halo[i], d.vec_len);
                    neigh_halo[i] = round_up(neigh_halo[i], d.vec_len);
                }
            }

            let mut mk_buf = |is_send: bool| -> Option<BufSpec> {
                let mut first = vec![0i64; vdims.len()];
                let mut last = vec![0i64; vdims.len()];
                let mut n = 1usize;
                let mut vec_ok = grid_vec_ok;
                for (i, d) in vdims.iter().enumerate() {
                    match d.kind {
                        DimType::Domain => {
                            let j = dims.domain_posn(&d.name).unwrap_or(0);
                            let (mut b, mut e) = (first_outer[i], last_outer[i] + 1);
                            match (is_send, neigh.offsets[j]) {
                                (true, -1) => {
                                    // Data from inside my domain for the
                                    // neighbor's halo.
                                    b = first_inner[i];
                                    e = first_inner[i] + neigh_halo[i];
                                    interior.begin[j] = interior.begin[j].max(e);
                                }
                                (true, 1) => {
                                    b = last_inner[i] + 1 - neigh_halo[i];
                                    e = last_inner[i] + 1;
                                    interior.end[j] = interior.end[j].min(b);
                                }
                                (false, -1) => {
                                    b = first_inner[i] - my_halo[i];
                                    e = first_inner[i];
                                }
                                (false, 1) => {
                                    b = last_inner[i] + 1;
                                    e = last_inner[i] + 1 + my_halo[i];
                                }
                                _ => {}
                            }
                            if e <= b {
                                return None;
                            }
                            if (e - b) % d.vec_len != 0 || imod_flr(b, d.vec_len) != 0 {
                                vec_ok = false;
                            }
                            first[i] = b;
                            last[i] = e - 1;
                            n *= (e - b) as usize;
                        }
                        DimType::Step => {
                            first[i] = 0;
                            last[i] = 0;
                        }
                        DimType::Misc => {
                            first[i] = d.first_misc;
                            last[i] = d.last_misc;
                            n *= (d.last_misc - d.first_misc + 1) as usize;
                        }
                    }
                }
                if n == 0 {
                    return None;
                }
                Some(BufSpec {
                    first,
                    last,
                    num_elems: n,
                    vec_ok,
                })
            };

            let send = mk_buf(true);
            let recv = mk_buf(false);
            if send.is_none() && recv.is_none() {
                continue;
            }
            if send.is_some() {
                num_send += 1;
            }
            debug!(
                "exchange buffers for var '{}' with rank {}: send {:?} elem(s), recv {:?} elem(s)",
                var.name(),
                neigh.rank,
                send.as_ref().map(|b| b.num_elems),
                recv.as_ref().map(|b| b.num_elems)
            );

            let vh = state.per_var[vi].get_or_insert_with(|| VarHalo {
                neighbors: (0..RankGeometry::neighborhood_size(nd))
                    .map(|_| None)
                    .collect(),
            });
            let nidx = RankGeometry::neighbor_index(&neigh.offsets);
            vh.neighbors[nidx] = Some(NeighborBufs {
                rank: neigh.rank,
                send,
                recv,
                send_req: Mutex::new(None),
                recv_req: Mutex::new(None),
            });
        }
    });
    debug!("number of exchange send buffers on this rank: {num_send}");

    // The interior is only meaningful with peers and overlap enabled.
    if geom.num_ranks > 1 && settings.overlap_comms {
        interior.update("interior", dims, &geom.rank_offsets, true);
    }
    Ok((state, interior))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::{finalize_var_dims, StoragePool, VarSpec};
    use stencil_comm::NullTransport;
    use stencil_types::settings::SolverSettings;

    // Two-rank split in x: rank 0 at [0, 8), rank 1 at [8, 16).
    fn two_rank_geom(me: usize) -> (Dims, SolverSettings, RankGeometry) {
        let dims = Dims::simple("t", &["x"]).expect("dims");
        let mut s = SolverSettings::new(&dims);
        s.rank_sizes.set_vals(&[8]);
        s.num_ranks.set_vals(&[2]);
        s.rank_indices.set_vals(&[me as i64]);
        s.find_location = false;
        s.adjust(&dims).expect("adjust");
        let mut neighbors = vec![None, None, None];
        neighbors[RankGeometry::neighbor_index(&[0])] = Some(NeighborInfo {
            rank: me,
            offsets: vec![0],
            man_dist: 0,
            vlen_mults: true,
        });
        let other = 1 - me;
        let delta = if me == 0 { 1 } else { -1 };
        neighbors[RankGeometry::neighbor_index(&[delta])] = Some(NeighborInfo {
            rank: other,
            offsets: vec![delta],
            man_dist: 1,
            vlen_mults: true,
        });
        let geom = RankGeometry {
            my_rank: me,
            num_ranks: 2,
            rank_indices: vec![me as i64],
            rank_sizes: vec![8],
            rank_offsets: vec![8 * me as i64],
            overall_sizes: vec![16],
            neighbors,
            my_vlen_mults: true,
            max_halos: vec![1],
            wf_steps: 0,
            num_wf_shifts: 0,
            wf_angles: vec![0],
            wf_shift_pts: vec![0],
            left_wf_exts: vec![0],
            right_wf_exts: vec![0],
        };
        (dims, s, geom)
    }

    use crate::geometry::NeighborInfo;

    fn make_u(dims: &Dims, geom: &RankGeometry) -> Arc<Var> {
        let spec = VarSpec::new("u", &["t", "x"], dims)
            .expect("spec")
            .halo("x", 1, 1);
        let (infos, _) = finalize_var_dims(
            &spec,
            dims,
            &geom.rank_sizes,
            &geom.rank_offsets,
            &geom.left_wf_exts,
            &geom.right_wf_exts,
            &[0],
            &[0],
        );
        let mut v = crate::var::Var::new("u", infos, false, false, -1, 2).expect("var");
        let x = v.dim_posn("x").expect("x");
        v.set_rank_offset(x, geom.rank_offsets[0]);
        let pool = StoragePool::new(v.num_storage_elems()).expect("pool");
        v.set_storage(pool, 0).expect("storage");
        Arc::new(v)
    }

    #[test]
    fn test_buffer_geometry_two_ranks() {
        let (dims, s, geom) = two_rank_geom(0);
        let u = make_u(&dims, &geom);
        let ext = BoundingBox::from_range(vec![0], vec![8]);
        let (state, _interior) =
            build_halo_state(&dims, &s, &geom, &[Arc::clone(&u)], &ext).expect("halo");
        assert!(state.has_buffers(0));
        let vh = state.per_var[0].as_ref().expect("var halo");
        let right = RankGeometry::neighbor_index(&[1]);
        let nb = vh.neighbors[right].as_ref().expect("right neighbor");
        // Send my last column [7, 7]; receive into my right halo [8, 8].
        let send = nb.send.as_ref().expect("send spec");
        assert_eq!(send.first[1], 7);
        assert_eq!(send.last[1], 7);
        assert_eq!(send.num_elems, 1);
        let recv = nb.recv.as_ref().expect("recv spec");
        assert_eq!(recv.first[1], 8);
        assert_eq!(recv.last[1], 8);
    }

    #[test]
    fn test_interior_excludes_send_slabs() {
        let (dims, mut s, geom) = two_rank_geom(1);
        s.overlap_comms = true;
        let u = make_u(&dims, &geom);
        let ext = BoundingBox::from_range(vec![8], vec![16]);
        let (_state, interior) =
            build_halo_state(&dims, &s, &geom, &[Arc::clone(&u)], &ext).expect("halo");
        // Rank 1 sends its first column (8) to rank 0, so the interior
        // starts at 9; no right neighbor, so it ends at 16.
        assert!(interior.valid);
        assert_eq!(interior.begin, vec![9]);
        assert_eq!(interior.end, vec![16]);
    }

    #[test]
    fn test_scratch_vars_get_no_buffers() {
        let (dims, s, geom) = two_rank_geom(0);
        let spec = VarSpec::new("s", &["t", "x"], &dims)
            .expect("spec")
            .halo("x", 1, 1)
            .scratch();
        let (infos, _) = finalize_var_dims(
            &spec,
            &dims,
            &geom.rank_sizes,
            &geom.rank_offsets,
            &[0],
            &[0],
            &[0],
            &[0],
        );
        let mut v = crate::var::Var::new("s", infos, true, false, -1, 1).expect("var");
        let pool = StoragePool::new(v.num_storage_elems()).expect("pool");
        v.set_storage(pool, 0).expect("storage");
        let ext = BoundingBox::from_range(vec![0], vec![8]);
        let (state, _) =
            build_halo_state(&dims, &s, &geom, &[Arc::new(v)], &ext).expect("halo");
        assert!(!state.has_buffers(0));
    }

    #[test]
    fn test_overlap_rejects_multiple_dirty_steps() {
        let (dims, s, geom) = two_rank_geom(0);
        let u = make_u(&dims, &geom);
        let ext = BoundingBox::from_range(vec![0], vec![8]);
        let (state, _) =
            build_halo_state(&dims, &s, &geom, &[Arc::clone(&u)], &ext).expect("halo");
        let env: Arc<dyn Transport> = Arc::new(NullTransport);
        let err = state
            .exchange(&env, &[u], &[(0, vec![0, 1])], HaloPass::AfterExterior)
            .expect_err("two steps in flight");
        assert!(matches!(err, StencilError::InternalInvariant(_)));
    }
}

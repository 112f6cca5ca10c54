// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Solver Context
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Top-level run loop and the region → block → mini-block → sub-block
//! tile scheduler, with wave-front and temporal-block shifting.
//!
//! The traversal follows the shift arithmetic laid out in the geometry
//! module: at each (pack, step) evaluated inside a region the active
//! span moves left by the wave-front angle; inside a block the
//! temporal-block angles carve trapezoids and bridges across n+1
//! tessellation phases; mini-blocks ride their own one-step wave-front.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use stencil_comm::Transport;
use stencil_types::dims::{DimType, Dims};
use stencil_types::error::{StencilError, StencilResult};
use stencil_types::idx::{ceil_div, round_up, IdxTuple};
use stencil_types::settings::SolverSettings;
use tracing::{debug, trace};

use crate::autotune::{AutoTuner, TileSizes};
use crate::bbox::{find_bundle_bbs, visit_span, BoundingBox, BundleBBs};
use crate::bundle::{Bundle, EvalVars, StencilProgram};
use crate::geometry::{setup_rank, RankGeometry};
use crate::halo::{build_halo_state, HaloPass, HaloState};
use crate::parallel::{parallel_for, ThreadCounts, Timer};
use crate::stats::{Stats, WorkStats};
use crate::var::{
    finalize_var_dims, update_scratch_offsets, StoragePool, Var, VarId, VarSpec,
};

/// Which blocks a pass computes relative to the MPI interior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MpiPass {
    Both,
    Exterior,
    Interior,
}

/// Per-pack run-time state.
pub struct PackRuntime {
    pub name: String,
    pub bundles: Vec<usize>,
    settings: RwLock<SolverSettings>,
    steps_done: AtomicI64,
    timer: Mutex<Timer>,
    tuner: Mutex<AutoTuner>,
    reads_per_step: i64,
    writes_per_step: i64,
    fp_ops_per_step: i64,
}

/// Temporal-block tiling state; recomputed when block sizes change.
#[derive(Clone, Debug, Default)]
struct TbInfo {
    tb_steps: i64,
    num_tb_shifts: i64,
    tb_angles: Vec<i64>,
    tb_widths: Vec<i64>,
    tb_tops: Vec<i64>,
    mb_angles: Vec<i64>,
}

#[derive(Default)]
struct TimerBank {
    run: Timer,
    ext: Timer,
    int_: Timer,
    halo: Timer,
    wait_secs: f64,
}

/// The execution engine for one solution on one rank.
pub struct SolverContext {
    dims: Dims,
    env: Arc<dyn Transport>,
    bundles: Vec<Arc<dyn Bundle>>,
    /// Scratch prerequisites (topological) plus the bundle itself.
    reqd_bundles: Vec<Vec<usize>>,
    packs: Vec<PackRuntime>,
    var_specs: Vec<VarSpec>,
    vars: Vec<Arc<Var>>,
    /// Per-worker copies of each scratch var, by registry index.
    scratch: RwLock<HashMap<usize, Vec<Arc<Var>>>>,
    settings: RwLock<SolverSettings>,

    geom: Option<RankGeometry>,
    rank_bb: BoundingBox,
    ext_bb: BoundingBox,
    mpi_interior: BoundingBox,
    bundle_bbs: Vec<BundleBBs>,
    pack_bbs: Vec<BoundingBox>,
    tb: RwLock<TbInfo>,
    halo: HaloState,
    threads: ThreadCounts,
    prepared: bool,

    enable_halo_exchange: AtomicBool,
    check_step_conds: AtomicBool,
    use_pack_tuners: bool,
    tuner: Mutex<AutoTuner>,
    tuner_last_secs: Mutex<f64>,
    steps_done: AtomicI64,
    timers: Mutex<TimerBank>,
}

impl SolverContext {
    pub fn new(
        program: StencilProgram,
        settings: SolverSettings,
        env: Arc<dyn Transport>,
    ) -> StencilResult<Self> {
        let StencilProgram {
            dims,
            var_specs,
            bundles,
            packs,
        } = program;
        if packs.is_empty() {
            return Err(StencilError::Config("at least one pack is required".into()));
        }
        for p in &packs {
            for &b in &p.bundles {
                if b >= bundles.len() {
                    return Err(StencilError::Config(format!(
                        "pack '{}' names unknown bundle {b}",
                        p.name
                    )));
                }
                if bundles[b].is_scratch() {
                    return Err(StencilError::Config(format!(
                        "pack '{}' lists scratch bundle '{}'; scratch bundles are \
                         prerequisites, not pack members",
                        p.name,
                        bundles[b].name()
                    )));
                }
            }
        }
        let nd = dims.num_domain_dims();
        let reqd_bundles = (0..bundles.len())
            .map(|b| {
                let mut list = bundles[b].required_scratch();
                let mut out = Vec::new();
                while let Some(s) = list.pop() {
                    if s >= bundles.len() {
                        return Err(StencilError::Config(format!(
                            "bundle '{}' requires unknown bundle {s}",
                            bundles[b].name()
                        )));
                    }
                    if !out.contains(&s) {
                        list.extend(bundles[s].required_scratch());
                        out.push(s);
                    }
                }
                out.sort_unstable();
                out.push(b);
                Ok(out)
            })
            .collect::<StencilResult<Vec<_>>>()?;

        let dummy_sizes = TileSizes {
            block: dims.domain_tuple(),
            mini_block: dims.domain_tuple(),
            sub_block: dims.domain_tuple(),
        };
        let pack_runtimes = packs
            .iter()
            .map(|p| PackRuntime {
                name: p.name.clone(),
                bundles: p.bundles.clone(),
                settings: RwLock::new(settings.clone()),
                steps_done: AtomicI64::new(0),
                timer: Mutex::new(Timer::new()),
                tuner: Mutex::new(AutoTuner::new(
                    &p.name,
                    dummy_sizes.clone(),
                    vec![1; nd],
                    vec![1; nd],
                )),
                reads_per_step: 0,
                writes_per_step: 0,
                fp_ops_per_step: 0,
            })
            .collect();

        let nvars = var_specs.len();
        Ok(SolverContext {
            dims,
            env,
            bundles,
            reqd_bundles,
            packs: pack_runtimes,
            var_specs,
            vars: Vec::new(),
            scratch: RwLock::new(HashMap::new()),
            settings: RwLock::new(settings),
            geom: None,
            rank_bb: BoundingBox::empty(nd),
            ext_bb: BoundingBox::empty(nd),
            mpi_interior: BoundingBox::empty(nd),
            bundle_bbs: Vec::new(),
            pack_bbs: Vec::new(),
            tb: RwLock::new(TbInfo::default()),
            halo: HaloState::empty(nvars),
            threads: ThreadCounts::flat(1),
            prepared: false,
            enable_halo_exchange: AtomicBool::new(true),
            check_step_conds: AtomicBool::new(true),
            use_pack_tuners: false,
            tuner: Mutex::new(AutoTuner::new(
                "solution",
                dummy_sizes,
                vec![1; nd],
                vec![1; nd],
            )),
            tuner_last_secs: Mutex::new(0.0),
            steps_done: AtomicI64::new(0),
            timers: Mutex::new(TimerBank::default()),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    pub fn var(&self, id: VarId) -> StencilResult<Arc<Var>> {
        self.vars.get(id.0).cloned().ok_or_else(|| {
            StencilError::Config(format!("unknown var handle {}", id.0))
        })
    }

    pub fn geometry(&self) -> Option<&RankGeometry> {
        self.geom.as_ref()
    }

    pub fn rank_bb(&self) -> &BoundingBox {
        &self.rank_bb
    }

    pub fn extended_bb(&self) -> &BoundingBox {
        &self.ext_bb
    }

    pub fn mpi_interior_bb(&self) -> &BoundingBox {
        &self.mpi_interior
    }

    pub fn bundle_bbs(&self, b: usize) -> Option<&BundleBBs> {
        self.bundle_bbs.get(b)
    }

    pub fn has_halo_buffers(&self, id: VarId) -> bool {
        self.halo.has_buffers(id.0)
    }

    pub fn steps_done(&self) -> i64 {
        self.steps_done.load(Ordering::Relaxed)
    }

    fn geom_ref(&self) -> StencilResult<&RankGeometry> {
        self.geom
            .as_ref()
            .ok_or_else(|| StencilError::InternalInvariant("prepare() must run first".into()))
    }

    // ── Preparation ──────────────────────────────────────────────────

    /// Validate settings, learn the rank geometry, size and allocate
    /// all vars, find bounding boxes, and set up exchange buffers.
    pub fn prepare(&mut self) -> StencilResult<()> {
        self.env.barrier()?;
        let num_packs = self.packs.len() as i64;
        let nd = self.dims.num_domain_dims();

        {
            let mut s = self
                .settings
                .write()
                .map_err(|_| StencilError::InternalInvariant("settings lock".into()))?;
            s.adjust(&self.dims)?;
        }
        let mut s = self.snapshot_settings()?;

        // Thread budget: T = max_threads / thread_divisor, split into
        // outer block workers and inner threads per block.
        let hw = rayon::current_num_threads().max(1);
        let total = if s.max_threads == 0 { hw } else { s.max_threads };
        let total = (total / s.thread_divisor.max(1)).max(1);
        let inner = s.block_threads.clamp(1, total);
        self.threads = ThreadCounts {
            outer: (total / inner).max(1),
            inner,
        };

        // Max halo across vars per domain dim drives the angles.
        let mut max_halos = vec![0i64; nd];
        for spec in &self.var_specs {
            if spec.scratch {
                continue;
            }
            for d in &spec.dims {
                if d.kind == DimType::Domain {
                    if let Some(j) = self.dims.domain_posn(&d.name) {
                        max_halos[j] = max_halos[j].max(d.left_halo).max(d.right_halo);
                    }
                }
            }
        }

        let geom = {
            let mut sw = self
                .settings
                .write()
                .map_err(|_| StencilError::InternalInvariant("settings lock".into()))?;
            setup_rank(&self.dims, &mut sw, &self.env, &max_halos, num_packs)?
        };
        s = self.snapshot_settings()?;

        // Rank BB and its wave-front extension.
        self.rank_bb = BoundingBox::from_range(
            geom.rank_offsets.clone(),
            (0..nd)
                .map(|j| geom.rank_offsets[j] + geom.rank_sizes[j])
                .collect(),
        );
        self.rank_bb
            .update("rank", &self.dims, &geom.rank_offsets, true);
        self.ext_bb = BoundingBox::from_range(
            (0..nd)
                .map(|j| self.rank_bb.begin[j] - geom.left_wf_exts[j])
                .collect(),
            (0..nd)
                .map(|j| self.rank_bb.end[j] + geom.right_wf_exts[j])
                .collect(),
        );
        self.ext_bb
            .update("extended-rank", &self.dims, &geom.rank_offsets, true);

        // Build and allocate the non-scratch vars.
        self.build_vars(&geom, &s)?;

        // Bounding boxes per bundle, then per pack.
        self.bundle_bbs = Vec::with_capacity(self.bundles.len());
        for b in &self.bundles {
            let bbs = find_bundle_bbs(
                b.as_ref(),
                &self.ext_bb,
                &self.dims,
                &geom.rank_offsets,
                self.threads,
            )?;
            self.bundle_bbs.push(bbs);
        }
        self.pack_bbs = self
            .packs
            .iter()
            .map(|p| {
                let mut bb = BoundingBox::empty(nd);
                let mut first = true;
                for &b in &p.bundles {
                    let obb = &self.bundle_bbs[b].overall;
                    if obb.num_points == 0 {
                        continue;
                    }
                    if first {
                        bb.begin = obb.begin.clone();
                        bb.end = obb.end.clone();
                        first = false;
                    } else {
                        for j in 0..nd {
                            bb.begin[j] = bb.begin[j].min(obb.begin[j]);
                            bb.end[j] = bb.end[j].max(obb.end[j]);
                        }
                    }
                }
                bb.update("pack", &self.dims, &geom.rank_offsets, true);
                bb
            })
            .collect();

        // Work estimates per pack per step.
        for pi in 0..self.packs.len() {
            let mut reads = 0;
            let mut writes = 0;
            let mut fp_ops = 0;
            for &b in &self.packs[pi].bundles.clone() {
                let n = self.bundle_bbs[b].overall.num_points;
                reads += self.bundles[b].est_reads_per_point() * n;
                writes += self.bundles[b].est_writes_per_point() * n;
                fp_ops += self.bundles[b].est_fp_ops_per_point() * n;
            }
            self.packs[pi].reads_per_step = reads;
            self.packs[pi].writes_per_step = writes;
            self.packs[pi].fp_ops_per_step = fp_ops;
        }

        // Pack-local settings snapshots.
        for p in &self.packs {
            *p.settings
                .write()
                .map_err(|_| StencilError::InternalInvariant("pack settings lock".into()))? =
                s.clone();
        }

        debug!(
            "regions per rank: {}, blocks per region: {}, mini-blocks per block: {}",
            SolverSettings::num_tiles(&s.rank_sizes, &s.region_sizes).product(),
            SolverSettings::num_tiles(&s.region_sizes, &s.block_sizes).product(),
            SolverSettings::num_tiles(&s.block_sizes, &s.mini_block_sizes).product()
        );

        self.update_tb_info(&geom, &s)?;
        self.alloc_scratch(&s)?;

        let (halo, interior) = build_halo_state(&self.dims, &s, &geom, &self.vars, &self.ext_bb)?;
        self.halo = halo;
        self.mpi_interior = interior;

        // Tuners. Separate per-pack tuners are only possible without
        // temporal blocking.
        let tb_steps = self
            .tb
            .read()
            .map_err(|_| StencilError::InternalInvariant("tb lock".into()))?
            .tb_steps;
        self.use_pack_tuners = tb_steps == 0 && self.packs.len() > 1;
        let min_sizes: Vec<i64> = (0..nd).map(|j| self.dims.fold_val(j)).collect();
        let max_sizes: Vec<i64> = (0..nd).map(|j| s.region_sizes.val(j).max(1)).collect();
        let initial = TileSizes {
            block: s.block_sizes.clone(),
            mini_block: s.mini_block_sizes.clone(),
            sub_block: s.sub_block_sizes.clone(),
        };
        *self
            .tuner
            .lock()
            .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))? =
            AutoTuner::new("solution", initial.clone(), min_sizes.clone(), max_sizes.clone());
        for p in &self.packs {
            *p.tuner
                .lock()
                .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))? =
                AutoTuner::new(&p.name, initial.clone(), min_sizes.clone(), max_sizes.clone());
        }
        if s.auto_tune {
            self.reset_auto_tuner(true)?;
        }

        self.geom = Some(geom);
        self.prepared = true;
        self.env.barrier()?;
        // Informational summary from the designated messaging rank only.
        if self.env.my_rank() == s.msg_rank {
            tracing::info!(
                "prepared: {} rank(s), rank domain {:?}, extended {:?}, interior valid: {}, \
                 threads {}x{}",
                self.env.num_ranks(),
                self.rank_bb.len,
                self.ext_bb.len,
                self.mpi_interior.valid,
                self.threads.outer,
                self.threads.inner
            );
        }
        debug!(
            "prepared: rank {:?}, extended {:?}, interior valid: {}",
            self.rank_bb, self.ext_bb, self.mpi_interior.valid
        );
        Ok(())
    }

    fn snapshot_settings(&self) -> StencilResult<SolverSettings> {
        Ok(self
            .settings
            .read()
            .map_err(|_| StencilError::InternalInvariant("settings lock".into()))?
            .clone())
    }

    fn pack_settings(&self, pi: usize) -> StencilResult<SolverSettings> {
        Ok(self.packs[pi]
            .settings
            .read()
            .map_err(|_| StencilError::InternalInvariant("pack settings lock".into()))?
            .clone())
    }

    /// Ring size for one var per the step offsets of every bundle that
    /// touches it: span of `[min_ofs, max_ofs]`, minus one when the
    /// write can reuse an end slot (zero halo at both ends and the
    /// write at one of them). An explicit override is authoritative and
    /// applied after the computation.
    fn compute_step_alloc(&self, vid: usize, settings: &SolverSettings) -> i64 {
        let mut max_sz = 1i64;
        for (bi, b) in self.bundles.iter().enumerate() {
            if b.is_scratch() {
                // Scratch bundles are folded into their consumers'
                // stages below.
                continue;
            }
            let mut uses = Vec::new();
            for &cb in &self.reqd_bundles[bi] {
                uses.extend(self.bundles[cb].step_uses(VarId(vid)));
            }
            if uses.is_empty() {
                continue;
            }
            let first = uses.iter().map(|u| u.step_ofs).min().unwrap_or(0);
            let last = uses.iter().map(|u| u.step_ofs).max().unwrap_or(0);
            let mut sz = last - first + 1;
            if sz > 1 {
                let halo_at = |ofs: i64| {
                    uses.iter()
                        .filter(|u| u.step_ofs == ofs)
                        .map(|u| u.max_halo)
                        .max()
                        .unwrap_or(0)
                };
                let written_at = |ofs: i64| {
                    uses.iter().any(|u| u.step_ofs == ofs && u.is_write)
                };
                let writes_end = written_at(first) || written_at(last);
                if writes_end && halo_at(first) == 0 && halo_at(last) == 0 {
                    // The write slot reuses the oldest read slot; wrap
                    // arithmetic lands the write there naturally.
                    sz -= 1;
                } else if uses.iter().any(|u| u.is_write)
                    && !written_at(first)
                    && !written_at(last)
                {
                    // Middle writes never reuse a slot.
                    trace!(
                        "var {} written strictly inside its step span; keeping full ring",
                        vid
                    );
                }
            }
            max_sz = max_sz.max(sz);
        }
        let spec = &self.var_specs[vid];
        let mut size = max_sz;
        if spec.step_alloc_override > 0 {
            size = spec.step_alloc_override;
        }
        if settings.step_alloc > 0 {
            size = settings.step_alloc;
        }
        size
    }

    /// Finalize geometry for non-scratch vars and allocate their
    /// storage: bytes counted per NUMA key, one pool per key, offsets
    /// distributed cacheline-rounded.
    fn build_vars(&mut self, geom: &RankGeometry, s: &SolverSettings) -> StencilResult<()> {
        const CACHELINE_ELEMS: usize = 8;
        self.vars.clear();
        let mut new_vars = Vec::with_capacity(self.var_specs.len());
        for (vi, spec) in self.var_specs.iter().enumerate() {
            let step_alloc = if spec.dims.iter().any(|d| d.kind == DimType::Step) {
                self.compute_step_alloc(vi, s)
            } else {
                1
            };
            let (infos, offsets) = finalize_var_dims(
                spec,
                &self.dims,
                &geom.rank_sizes,
                &geom.rank_offsets,
                &geom.left_wf_exts,
                &geom.right_wf_exts,
                &s.min_pad_sizes.vals(),
                &s.extra_pad_sizes.vals(),
            );
            let var = Var::new(
                &spec.name,
                infos,
                spec.scratch,
                spec.fixed_size,
                spec.numa_preferred,
                step_alloc,
            )?;
            for (i, ofs) in offsets.iter().enumerate() {
                var.set_rank_offset(i, *ofs);
            }
            new_vars.push(var);
        }

        // Pass 1: count bytes per NUMA key (scratch vars are handled by
        // alloc_scratch). Pass 2: distribute offsets into the pools.
        let mut pool_elems: BTreeMap<i32, usize> = BTreeMap::new();
        for v in new_vars.iter().filter(|v| !v.is_scratch()) {
            let n = round_up(v.num_storage_elems() as i64, CACHELINE_ELEMS as i64) as usize;
            *pool_elems.entry(v.numa_preferred()).or_insert(0) += n;
        }
        let mut pools: BTreeMap<i32, (Arc<StoragePool>, usize)> = BTreeMap::new();
        for (numa, n) in &pool_elems {
            debug!("allocating {n} elem(s) for vars preferring NUMA node {numa}");
            pools.insert(*numa, (StoragePool::new(*n)?, 0));
        }
        for v in new_vars.iter_mut() {
            if v.is_scratch() {
                continue;
            }
            let (pool, used) = pools
                .get_mut(&v.numa_preferred())
                .ok_or_else(|| StencilError::Allocation("missing pool".into()))?;
            v.set_storage(Arc::clone(pool), *used)?;
            *used += round_up(v.num_storage_elems() as i64, CACHELINE_ELEMS as i64) as usize;
        }
        self.vars = new_vars.into_iter().map(Arc::new).collect();
        Ok(())
    }

    /// (Re)build per-worker scratch vars sized to the current maximum
    /// block size across packs.
    fn alloc_scratch(&self, s: &SolverSettings) -> StencilResult<()> {
        self.alloc_scratch_sized(s, None)
    }

    fn alloc_scratch_sized(
        &self,
        s: &SolverSettings,
        force_block: Option<&[i64]>,
    ) -> StencilResult<()> {
        const CACHELINE_ELEMS: usize = 8;
        let nd = self.dims.num_domain_dims();
        let nworkers = self.threads.total();

        // Max block size across packs, rounded up to the fold.
        let mut blk = vec![0i64; nd];
        for j in 0..nd {
            match force_block {
                Some(fb) => blk[j] = fb[j],
                None => {
                    for pi in 0..self.packs.len() {
                        let ps = self.pack_settings(pi)?;
                        blk[j] = blk[j]
                            .max(round_up(ps.block_sizes.val(j), self.dims.fold_val(j)));
                    }
                }
            }
        }

        let mut map = HashMap::new();
        let mut pool_elems: BTreeMap<i32, usize> = BTreeMap::new();
        let mut protos: Vec<(usize, Vec<Var>)> = Vec::new();
        for (vi, spec) in self.var_specs.iter().enumerate() {
            if !spec.scratch {
                continue;
            }
            let mut instances = Vec::with_capacity(nworkers);
            for _ in 0..nworkers {
                let step_alloc = if spec.dims.iter().any(|d| d.kind == DimType::Step) {
                    self.compute_step_alloc(vi, s)
                } else {
                    1
                };
                let (infos, _) = finalize_var_dims(
                    spec,
                    &self.dims,
                    &blk,
                    &vec![0i64; nd],
                    &vec![0i64; nd],
                    &vec![0i64; nd],
                    &s.min_pad_sizes.vals(),
                    &s.extra_pad_sizes.vals(),
                );
                let v = Var::new(
                    &spec.name,
                    infos,
                    true,
                    spec.fixed_size,
                    spec.numa_preferred,
                    step_alloc,
                )?;
                *pool_elems.entry(spec.numa_preferred).or_insert(0) +=
                    round_up(v.num_storage_elems() as i64, CACHELINE_ELEMS as i64) as usize;
                instances.push(v);
            }
            protos.push((vi, instances));
        }
        if protos.is_empty() {
            return Ok(());
        }
        let mut pools: BTreeMap<i32, (Arc<StoragePool>, usize)> = BTreeMap::new();
        for (numa, n) in &pool_elems {
            debug!("allocating {n} elem(s) for scratch vars on NUMA node {numa}");
            pools.insert(*numa, (StoragePool::new(*n)?, 0));
        }
        for (vi, mut instances) in protos {
            let mut arcs = Vec::with_capacity(instances.len());
            for v in instances.iter_mut() {
                let (pool, used) = pools
                    .get_mut(&v.numa_preferred())
                    .ok_or_else(|| StencilError::Allocation("missing scratch pool".into()))?;
                v.set_storage(Arc::clone(pool), *used)?;
                *used +=
                    round_up(v.num_storage_elems() as i64, CACHELINE_ELEMS as i64) as usize;
            }
            for v in instances {
                arcs.push(Arc::new(v));
            }
            map.insert(vi, arcs);
        }
        *self
            .scratch
            .write()
            .map_err(|_| StencilError::InternalInvariant("scratch lock".into()))? = map;
        Ok(())
    }

    /// Temporal-block depth, angles, and trapezoid widths; recomputed
    /// whenever a block size changes.
    fn update_tb_info(&self, geom: &RankGeometry, s: &SolverSettings) -> StencilResult<()> {
        let nd = self.dims.num_domain_dims();
        let npacks = self.packs.len() as i64;
        let mut tb = TbInfo {
            tb_steps: s.tb_steps,
            num_tb_shifts: 0,
            tb_angles: vec![0; nd],
            tb_widths: vec![0; nd],
            tb_tops: vec![0; nd],
            mb_angles: vec![0; nd],
        };
        if tb.tb_steps > 0 {
            // TB is inside WF, so its depth cannot exceed it; also cap
            // per dim so the trapezoid top stays at least one fold.
            let mut max_steps = tb.tb_steps.min(geom.wf_steps.max(1));
            for j in 0..nd {
                let rnsize = s.region_sizes.val(j);
                let blksize = s.block_sizes.val(j);
                let mblksize = s.mini_block_sizes.val(j);
                let fpts = self.dims.fold_val(j);
                let angle = round_up(geom.max_halos[j], fpts);
                tb.mb_angles[j] = if mblksize < blksize { angle } else { 0 };
                let tb_angle = if blksize < rnsize { angle } else { 0 };
                tb.tb_angles[j] = tb_angle;
                if tb_angle > 0 {
                    let top_sz = fpts;
                    let sh_pts = tb_angle * 2 * npacks;
                    let nsteps = (blksize - top_sz + tb_angle * 2) / sh_pts;
                    max_steps = max_steps.min(nsteps);
                    trace!(
                        "max TB steps in dim '{}' = {nsteps} for block size {blksize}",
                        self.dims.domain_dims[j]
                    );
                }
            }
            tb.tb_steps = tb.tb_steps.min(max_steps).max(0);
        }
        if tb.tb_steps > 0 {
            tb.num_tb_shifts = (npacks * tb.tb_steps - 1).max(0);
        }
        for j in 0..nd {
            let blk_sz = s.block_sizes.val(j);
            tb.tb_widths[j] = blk_sz;
            tb.tb_tops[j] = blk_sz;
            if tb.num_tb_shifts > 0 && tb.tb_angles[j] > 0 {
                let fpts = self.dims.fold_val(j);
                let sa = tb.num_tb_shifts * tb.tb_angles[j];
                let min_blk_width = fpts + 2 * sa;
                let mut blk_width = round_up(ceil_div(blk_sz, 2) + sa, fpts);
                blk_width = blk_width.max(min_blk_width);
                tb.tb_widths[j] = blk_width;
                tb.tb_tops[j] = (blk_width - 2 * sa).max(0);
            }
        }
        debug!(
            "temporal blocking: steps {}, shifts {}, angles {:?}, long base {:?}, short base {:?}",
            tb.tb_steps, tb.num_tb_shifts, tb.tb_angles, tb.tb_widths, tb.tb_tops
        );
        *self
            .tb
            .write()
            .map_err(|_| StencilError::InternalInvariant("tb lock".into()))? = tb;
        Ok(())
    }

    /// Seed every var (and scratch copies) with a distinct base value.
    pub fn init_values(&self) -> StencilResult<()> {
        let mut seed = 0.1;
        for v in &self.vars {
            if v.is_scratch() {
                // Registry entries for scratch vars carry no storage;
                // the per-worker copies are seeded below.
                seed += 0.01;
                continue;
            }
            v.set_all_elements_same(seed)?;
            seed += 0.01;
        }
        let scratch = self
            .scratch
            .read()
            .map_err(|_| StencilError::InternalInvariant("scratch lock".into()))?;
        for insts in scratch.values() {
            for v in insts {
                v.set_all_elements_same(seed)?;
            }
            seed += 0.01;
        }
        Ok(())
    }

    /// Final halo exchange and storage release.
    pub fn end_solution(&self) -> StencilResult<()> {
        self.exchange_halos(HaloPass::Unified)?;
        self.env.barrier()
    }

    // ── Dirty-flag and exchange plumbing ─────────────────────────────

    /// Mark output vars of the selected (or all) packs dirty at the
    /// step(s) written when evaluating input steps `[start, stop)`.
    /// Marking is unconditional on sub-domains so that all ranks agree.
    fn mark_vars_dirty(&self, sel_pack: Option<usize>, start: i64, stop: i64) {
        let step = if start > stop { -1 } else { 1 };
        let mut done: HashSet<(usize, i64)> = HashSet::new();
        for (pi, pack) in self.packs.iter().enumerate() {
            if sel_pack.is_some_and(|s| s != pi) {
                continue;
            }
            let mut t = start;
            while t != stop {
                for &b in &pack.bundles {
                    if let Some(t_out) = self.bundles[b].output_step_index(t) {
                        for v in self.bundles[b].outputs() {
                            if self.vars[v.0].is_scratch() {
                                continue;
                            }
                            if done.insert((v.0, t_out)) {
                                self.vars[v.0].set_dirty(true, t_out);
                                trace!(
                                    "var '{}' marked dirty at step {t_out}",
                                    self.vars[v.0].name()
                                );
                            }
                        }
                    }
                }
                t += step;
            }
        }
    }

    /// Deterministic ordered list of `(var, dirty steps)` pairs: scan
    /// packs in declared order, bundles, their scratch prerequisites,
    /// input vars, then resident steps with the dirty flag set.
    fn dirty_swap_list(&self) -> Vec<(usize, Vec<i64>)> {
        let mut found: BTreeMap<usize, BTreeSet<i64>> = BTreeMap::new();
        for pack in &self.packs {
            for &b in &pack.bundles {
                for &cb in &self.reqd_bundles[b] {
                    for v in self.bundles[cb].inputs() {
                        let var = &self.vars[v.0];
                        if var.is_scratch() || !self.halo.has_buffers(v.0) {
                            continue;
                        }
                        for t in var.resident_steps() {
                            if var.is_dirty(t) {
                                found.entry(v.0).or_default().insert(t);
                            }
                        }
                    }
                }
            }
        }
        found
            .into_iter()
            .map(|(v, steps)| (v, steps.into_iter().collect()))
            .collect()
    }

    fn exchange_halos(&self, pass: HaloPass) -> StencilResult<()> {
        if !self.enable_halo_exchange.load(Ordering::Relaxed) || self.env.num_ranks() < 2 {
            return Ok(());
        }
        let swaps = self.dirty_swap_list();
        trace!(
            "exchange_halos ({pass:?}): {} var(s) with dirty steps",
            swaps.len()
        );
        {
            let mut tb = self
                .timers
                .lock()
                .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
            tb.halo.start();
        }
        let wait = self.halo.exchange(&self.env, &self.vars, &swaps, pass);
        {
            let mut tb = self
                .timers
                .lock()
                .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
            tb.halo.stop();
            if let Ok(w) = &wait {
                tb.wait_secs += w;
            }
        }
        wait.map(|_| ())
    }

    // ── Reference path ───────────────────────────────────────────────

    /// Scalar oracle: every bundle point-by-point over its bounding
    /// box, one step at a time, full halo exchange between bundles.
    /// Bit-identical to `run_solution` from the same initial state.
    pub fn run_ref(&self, first_step: i64, last_step: i64) -> StencilResult<()> {
        self.require_prepared()?;
        {
            let mut tb = self
                .timers
                .lock()
                .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
            tb.run.start();
        }
        let geom = self.geom_ref()?;
        let s = self.snapshot_settings()?;
        // Whole-rank scratch coverage for the scalar sweep.
        self.alloc_scratch_sized(&s, Some(&geom.rank_sizes))?;

        let dir: i64 = if last_step >= first_step { 1 } else { -1 };
        let end_t = last_step + dir;
        let check_steps = self.check_step_conds.load(Ordering::Relaxed);

        self.rebase_rings(first_step)?;
        self.exchange_halos(HaloPass::Unified)?;
        let mut t = first_step;
        while t != end_t {
            for pack in &self.packs {
                for &b in &pack.bundles {
                    if check_steps && !self.bundles[b].is_in_valid_step(t) {
                        continue;
                    }
                    self.exchange_halos(HaloPass::Unified)?;
                    let ev = self.eval_vars(0)?;
                    for &cb in &self.reqd_bundles[b] {
                        let bundle = &self.bundles[cb];
                        if bundle.is_scratch() {
                            let (lo, hi) =
                                self.scratch_span(cb, &self.rank_bb.begin, &self.rank_bb.end);
                            self.position_scratch(cb, 0, &self.rank_bb.begin)?;
                            let check = bundle.has_sub_domain();
                            let mut err = None;
                            visit_span(&lo, &hi, |pt| {
                                if err.is_none() && (!check || bundle.in_valid_domain(pt)) {
                                    if let Err(e) = bundle.calc_point(&ev, pt, t) {
                                        err = Some(e);
                                    }
                                }
                            });
                            if let Some(e) = err {
                                return Err(e);
                            }
                        } else {
                            let obb = &self.bundle_bbs[cb].overall;
                            if obb.num_points == 0 {
                                continue;
                            }
                            let check = bundle.has_sub_domain();
                            let mut err = None;
                            visit_span(&obb.begin, &obb.end, |pt| {
                                if err.is_none() && (!check || bundle.in_valid_domain(pt)) {
                                    if let Err(e) = bundle.calc_point(&ev, pt, t) {
                                        err = Some(e);
                                    }
                                }
                            });
                            if let Some(e) = err {
                                return Err(e);
                            }
                        }
                    }
                    self.mark_vars_dirty(None, t, t + dir);
                }
            }
            t += dir;
        }
        self.steps_done
            .fetch_add((last_step - first_step).abs() + 1, Ordering::Relaxed);
        self.exchange_halos(HaloPass::Unified)?;
        let mut tbank = self
            .timers
            .lock()
            .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
        tbank.run.stop();
        Ok(())
    }

    fn require_prepared(&self) -> StencilResult<()> {
        if !self.prepared {
            return Err(StencilError::Config(
                "run called without calling prepare() first".into(),
            ));
        }
        Ok(())
    }

    /// Position every ring window to end at the run's first step so
    /// input reads resolve against the current slot contents.
    fn rebase_rings(&self, first_step: i64) -> StencilResult<()> {
        for v in &self.vars {
            if !v.is_scratch() {
                v.rebase_ring(first_step);
            }
        }
        let scratch = self
            .scratch
            .read()
            .map_err(|_| StencilError::InternalInvariant("scratch lock".into()))?;
        for insts in scratch.values() {
            for v in insts {
                v.rebase_ring(first_step);
            }
        }
        Ok(())
    }

    // ── Optimized path ───────────────────────────────────────────────

    /// Advance all vars from `first_step` through `last_step` with the
    /// full tile hierarchy, overlapping communication when enabled.
    pub fn run_solution(&self, first_step: i64, last_step: i64) -> StencilResult<()> {
        self.require_prepared()?;
        if self.ext_bb.size < 1 {
            trace!("nothing to do in solution");
            return Ok(());
        }
        {
            let mut tb = self
                .timers
                .lock()
                .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
            tb.run.start();
        }
        let geom = self.geom_ref()?;
        let s = self.snapshot_settings()?;
        let nd = self.dims.num_domain_dims();
        let wf_steps = geom.wf_steps;
        let check_steps = self.check_step_conds.load(Ordering::Relaxed);

        let dir: i64 = if last_step >= first_step { 1 } else { -1 };
        let step_t = wf_steps.max(1) * dir;
        let begin_t = first_step;
        let end_t = last_step + dir;

        // Region-loop span: the extended BB, further extended on sides
        // with no neighbor so shifted regions still cover the edge.
        let mut begin = self.ext_bb.begin.clone();
        let mut end = self.ext_bb.end.clone();
        let mut stride: Vec<i64> = (0..nd).map(|j| s.region_sizes.val(j)).collect();
        if wf_steps > 0 {
            for j in 0..nd {
                if geom.right_wf_exts[j] == 0 {
                    end[j] += geom.wf_shift_pts[j];
                }
                if s.region_sizes.val(j) >= geom.rank_sizes[j] {
                    stride[j] = end[j] - begin[j];
                }
            }
        }
        trace!(
            "run_solution: steps [{begin_t}..{end_t}) by {step_t}, regions [{begin:?}..{end:?}) by {stride:?}"
        );

        self.rebase_rings(first_step)?;
        self.exchange_halos(HaloPass::Unified)?;

        let num_t = ceil_div((end_t - begin_t).abs(), step_t.abs());
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * step_t;
            let stop_t = if step_t > 0 {
                (start_t + step_t).min(end_t)
            } else {
                (start_t + step_t).max(end_t)
            };
            let this_num_t = (stop_t - start_t).abs();

            if wf_steps == 0 {
                // One pack at a time; two passes when overlapping comms.
                for pi in 0..self.packs.len() {
                    if check_steps && !self.pack_valid_step(pi, start_t) {
                        continue;
                    }
                    for pass in 0..2 {
                        let mode = if self.mpi_interior.valid {
                            if pass == 0 {
                                MpiPass::Exterior
                            } else {
                                MpiPass::Interior
                            }
                        } else {
                            MpiPass::Both
                        };
                        self.for_each_region(&begin, &end, &stride, |rs, re| {
                            self.calc_region(Some(pi), mode, rs, re, start_t, stop_t)
                        })?;
                        match mode {
                            MpiPass::Exterior => self.exchange_halos(HaloPass::AfterExterior)?,
                            MpiPass::Interior => self.exchange_halos(HaloPass::AfterInterior)?,
                            MpiPass::Both => self.exchange_halos(HaloPass::Unified)?,
                        }
                        if !self.mpi_interior.valid {
                            break;
                        }
                    }
                }
            } else {
                // Wave-fronts evaluate all packs per region traversal.
                self.for_each_region(&begin, &end, &stride, |rs, re| {
                    self.calc_region(None, MpiPass::Both, rs, re, start_t, stop_t)
                })?;
                self.exchange_halos(HaloPass::Unified)?;
            }

            self.steps_done.fetch_add(this_num_t, Ordering::Relaxed);
            for pi in 0..self.packs.len() {
                let mut n = 0;
                if !check_steps {
                    n = this_num_t;
                } else {
                    let mut t = start_t;
                    while t != stop_t {
                        if self.pack_valid_step(pi, t) {
                            n += 1;
                        }
                        t += dir;
                    }
                }
                self.packs[pi].steps_done.fetch_add(n, Ordering::Relaxed);
            }
            self.eval_auto_tuner(this_num_t)?;
        }

        let mut tbank = self
            .timers
            .lock()
            .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
        tbank.run.stop();
        Ok(())
    }

    fn pack_valid_step(&self, pi: usize, t: i64) -> bool {
        self.packs[pi]
            .bundles
            .iter()
            .any(|&b| self.bundles[b].is_in_valid_step(t))
    }

    /// Serial row-major sweep of region tiles.
    fn for_each_region(
        &self,
        begin: &[i64],
        end: &[i64],
        stride: &[i64],
        mut f: impl FnMut(&[i64], &[i64]) -> StencilResult<()>,
    ) -> StencilResult<()> {
        let nd = begin.len();
        let counts: Vec<i64> = (0..nd)
            .map(|j| {
                if end[j] <= begin[j] {
                    0
                } else {
                    ceil_div(end[j] - begin[j], stride[j].max(1))
                }
            })
            .collect();
        if counts.iter().any(|&c| c == 0) {
            return Ok(());
        }
        let mut idx = vec![0i64; nd];
        loop {
            let rs: Vec<i64> = (0..nd).map(|j| begin[j] + idx[j] * stride[j].max(1)).collect();
            let re: Vec<i64> = (0..nd).map(|j| (rs[j] + stride[j].max(1)).min(end[j])).collect();
            f(&rs, &re)?;
            let mut i = nd;
            loop {
                if i == 0 {
                    return Ok(());
                }
                i -= 1;
                idx[i] += 1;
                if idx[i] < counts[i] {
                    break;
                }
                idx[i] = 0;
            }
        }
    }

    /// Evaluate one region tile: loop over its (TB-grouped) time steps
    /// and packs, shifting the active span per (pack, step), and walk
    /// blocks in parallel.
    fn calc_region(
        &self,
        sel_pack: Option<usize>,
        mode: MpiPass,
        rstart: &[i64],
        rstop: &[i64],
        t_begin: i64,
        t_end: i64,
    ) -> StencilResult<()> {
        {
            let mut tb = self
                .timers
                .lock()
                .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
            match mode {
                MpiPass::Interior => tb.int_.start(),
                _ => tb.ext.start(),
            }
        }
        let result = self.calc_region_inner(sel_pack, mode, rstart, rstop, t_begin, t_end);
        let mut tb = self
            .timers
            .lock()
            .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
        match mode {
            MpiPass::Interior => tb.int_.stop(),
            _ => tb.ext.stop(),
        };
        result
    }

    fn calc_region_inner(
        &self,
        sel_pack: Option<usize>,
        mode: MpiPass,
        rstart: &[i64],
        rstop: &[i64],
        t_begin: i64,
        t_end: i64,
    ) -> StencilResult<()> {
        let nd = self.dims.num_domain_dims();
        let tb = self
            .tb
            .read()
            .map_err(|_| StencilError::InternalInvariant("tb lock".into()))?
            .clone();
        let check_steps = self.check_step_conds.load(Ordering::Relaxed);
        let dir: i64 = if t_end >= t_begin { 1 } else { -1 };
        let step_t = tb.tb_steps.max(1) * dir;
        let num_t = ceil_div((t_end - t_begin).abs(), step_t.abs());

        let mut shift_num: i64 = 0;
        for index_t in 0..num_t {
            let start_t = t_begin + index_t * step_t;
            let stop_t = if step_t > 0 {
                (start_t + step_t).min(t_end)
            } else {
                (start_t + step_t).max(t_end)
            };

            if tb.tb_steps == 0 {
                // One pack per block walk.
                for pi in 0..self.packs.len() {
                    if sel_pack.is_some_and(|s| s != pi) {
                        continue;
                    }
                    if check_steps && !self.pack_valid_step(pi, start_t) {
                        continue;
                    }
                    let ps = self.pack_settings(pi)?;
                    let (span_begin, span_end, ok) =
                        self.shift_region(rstart, rstop, shift_num, Some(pi))?;
                    let mut stride: Vec<i64> =
                        (0..nd).map(|j| ps.block_sizes.val(j)).collect();
                    for j in 0..nd {
                        if ps.block_sizes.val(j) >= ps.region_sizes.val(j) {
                            stride[j] = (span_end[j] - span_begin[j]).max(1);
                        }
                    }
                    if ok {
                        self.par_blocks(&span_begin, &span_end, &stride, &|bs, be, w| {
                            self.calc_block(
                                Some(pi),
                                0,
                                1,
                                mode,
                                rstart,
                                rstop,
                                shift_num,
                                &span_begin,
                                &span_end,
                                bs,
                                be,
                                start_t,
                                stop_t,
                                w,
                            )
                        })?;
                    }
                    // Blocks skipped for the interior pass do not feed
                    // outgoing halos; mark on the exterior side only.
                    if mode != MpiPass::Interior {
                        self.mark_vars_dirty(Some(pi), start_t, stop_t);
                    }
                    shift_num += 1;
                }
            } else {
                // Temporal blocking: all packs, n+1 tessellation phases
                // with a barrier between phases.
                let (span_begin, span_end, ok) =
                    self.shift_region(rstart, rstop, shift_num, None)?;
                let s = self.snapshot_settings()?;
                let mut stride: Vec<i64> = (0..nd).map(|j| s.block_sizes.val(j)).collect();
                for j in 0..nd {
                    if s.block_sizes.val(j) >= s.region_sizes.val(j) {
                        stride[j] = (span_end[j] - span_begin[j]).max(1);
                    }
                }
                if ok {
                    let nphases = nd as i64 + 1;
                    for phase in 0..nphases {
                        self.par_blocks(&span_begin, &span_end, &stride, &|bs, be, w| {
                            self.calc_block(
                                None,
                                phase,
                                nphases,
                                mode,
                                rstart,
                                rstop,
                                shift_num,
                                &span_begin,
                                &span_end,
                                bs,
                                be,
                                start_t,
                                stop_t,
                                w,
                            )
                        })?;
                        // The parallel_for join is the phase barrier.
                    }
                }
                let mut t = start_t;
                while t != stop_t {
                    for pi in 0..self.packs.len() {
                        if check_steps && !self.pack_valid_step(pi, t) {
                            continue;
                        }
                        shift_num += 1;
                        self.mark_vars_dirty(Some(pi), t, t + dir);
                    }
                    t += dir;
                }
            }
        }
        Ok(())
    }

    /// Shifted, trimmed span of a region base for the given shift
    /// count. Returns begin/end per dim and whether any work remains.
    fn shift_region(
        &self,
        base_start: &[i64],
        base_stop: &[i64],
        shift_num: i64,
        pack: Option<usize>,
    ) -> StencilResult<(Vec<i64>, Vec<i64>, bool)> {
        let geom = self.geom_ref()?;
        let nd = self.dims.num_domain_dims();
        let mut begin = vec![0i64; nd];
        let mut end = vec![0i64; nd];
        let mut ok = true;
        for j in 0..nd {
            let angle = geom.wf_angles[j];
            // Wave-fronts only shift left, so region walks strictly
            // increment.
            let mut rstart = base_start[j] - angle * shift_num;
            let mut rstop = base_stop[j] - angle * shift_num;
            if let Some(pi) = pack {
                let pbb = &self.pack_bbs[pi];
                rstart = rstart.max(pbb.begin[j]);
                rstop = rstop.min(pbb.end[j]);
            }
            let dbegin = self.rank_bb.begin[j];
            let dend = self.rank_bb.end[j];
            // Inside an extension the span follows the shift back in.
            if rstart < dbegin && geom.left_wf_exts[j] > 0 {
                rstart = rstart.max(dbegin - geom.left_wf_exts[j] + shift_num * angle);
            }
            if rstop > dend && geom.right_wf_exts[j] > 0 {
                rstop = rstop.min(dend + geom.right_wf_exts[j] - shift_num * angle);
            }
            begin[j] = rstart;
            end[j] = rstop;
            if rstop <= rstart {
                ok = false;
            }
        }
        Ok((begin, end, ok))
    }

    /// Parallel walk of block tiles over `[begin, end)` by `stride`.
    fn par_blocks(
        &self,
        begin: &[i64],
        end: &[i64],
        stride: &[i64],
        f: &(dyn Fn(&[i64], &[i64], usize) -> StencilResult<()> + Sync),
    ) -> StencilResult<()> {
        let nd = begin.len();
        let counts: Vec<i64> = (0..nd)
            .map(|j| {
                if end[j] <= begin[j] {
                    0
                } else {
                    ceil_div(end[j] - begin[j], stride[j].max(1))
                }
            })
            .collect();
        let total: i64 = counts.iter().product();
        if counts.iter().any(|&c| c == 0) {
            return Ok(());
        }
        let count_tuple = IdxTuple::from_pairs(
            &counts
                .iter()
                .enumerate()
                .map(|(j, c)| (self.dims.domain_dims[j].clone(), *c))
                .collect::<Vec<_>>(),
        );
        parallel_for(self.threads, 0, total, 1, &|flat, _stop, w| {
            let coords = count_tuple.unlayout(flat);
            let bs: Vec<i64> = (0..nd)
                .map(|j| begin[j] + coords[j] * stride[j].max(1))
                .collect();
            let be: Vec<i64> = (0..nd)
                .map(|j| (bs[j] + stride[j].max(1)).min(end[j]))
                .collect();
            f(&bs, &be, w)
        })
    }

    /// Evaluate one block: mini-block walk, or the TB shapes of one
    /// tessellation phase.
    #[allow(clippy::too_many_arguments)]
    fn calc_block(
        &self,
        sel_pack: Option<usize>,
        phase: i64,
        nphases: i64,
        mode: MpiPass,
        region_base_start: &[i64],
        region_base_stop: &[i64],
        region_shift0: i64,
        group_region_begin: &[i64],
        group_region_end: &[i64],
        block_start: &[i64],
        block_stop: &[i64],
        t_begin: i64,
        t_end: i64,
        worker: usize,
    ) -> StencilResult<()> {
        let nd = self.dims.num_domain_dims();

        // Interior/exterior split: a block even partially outside the
        // interior belongs to the exterior pass.
        if mode != MpiPass::Both {
            let inside = self.mpi_interior.contains_range(block_start, block_stop);
            match mode {
                MpiPass::Interior if !inside => return Ok(()),
                MpiPass::Exterior if inside => return Ok(()),
                _ => {}
            }
        }

        let tb = self
            .tb
            .read()
            .map_err(|_| StencilError::InternalInvariant("tb lock".into()))?
            .clone();

        if tb.tb_steps == 0 {
            let pi = sel_pack.ok_or_else(|| {
                StencilError::InternalInvariant("no pack selected without TB".into())
            })?;
            let ps = self.pack_settings(pi)?;
            let mut stride: Vec<i64> = (0..nd).map(|j| ps.mini_block_sizes.val(j)).collect();
            let group: Vec<i64> = (0..nd)
                .map(|j| ps.mini_block_group_sizes.val(j))
                .collect();
            for j in 0..nd {
                if ps.mini_block_sizes.val(j) >= ps.block_sizes.val(j) {
                    stride[j] = (block_stop[j] - block_start[j]).max(1);
                }
            }
            self.for_each_tile_grouped(block_start, block_stop, &stride, &group, &mut |ms,
                                                                                        me| {
                self.calc_mini_block(
                    sel_pack,
                    1,
                    0,
                    &[],
                    mode,
                    region_base_start,
                    region_base_stop,
                    region_shift0,
                    group_region_begin,
                    group_region_end,
                    block_start,
                    block_stop,
                    block_start,
                    block_stop,
                    ms,
                    me,
                    t_begin,
                    t_end,
                    worker,
                )
            })
        } else {
            // Shapes extend to the right only; the adjusted walk covers
            // this block plus the width of the next.
            let s = self.snapshot_settings()?;
            let mut adj_stop = vec![0i64; nd];
            for j in 0..nd {
                let width = block_stop[j] - block_start[j];
                adj_stop[j] = block_stop[j] + width;
            }
            let mut stride: Vec<i64> = (0..nd).map(|j| s.mini_block_sizes.val(j)).collect();
            let group: Vec<i64> = (0..nd)
                .map(|j| s.mini_block_group_sizes.val(j))
                .collect();
            for j in 0..nd {
                if s.mini_block_sizes.val(j) >= s.block_sizes.val(j) {
                    stride[j] = (adj_stop[j] - block_start[j]).max(1);
                }
            }
            let nshapes = choose(nd as i64, phase);
            for shape in 0..nshapes {
                let bridge_dims = combination(nd, phase as usize, shape as usize);
                self.for_each_tile_grouped(
                    block_start,
                    &adj_stop,
                    &stride,
                    &group,
                    &mut |ms, me| {
                        self.calc_mini_block(
                            None,
                            nphases,
                            phase,
                            &bridge_dims,
                            mode,
                            region_base_start,
                            region_base_stop,
                            region_shift0,
                            group_region_begin,
                            group_region_end,
                            block_start,
                            block_stop,
                            block_start,
                            &adj_stop,
                            ms,
                            me,
                            t_begin,
                            t_end,
                            worker,
                        )
                    },
                )?;
            }
            Ok(())
        }
    }

    /// Evaluate one mini-block: one step at a time, all (or the
    /// selected) packs, with the composed region/TB/mini-block shift.
    #[allow(clippy::too_many_arguments)]
    fn calc_mini_block(
        &self,
        sel_pack: Option<usize>,
        nphases: i64,
        phase: i64,
        bridge_dims: &[usize],
        mode: MpiPass,
        region_base_start: &[i64],
        region_base_stop: &[i64],
        region_shift0: i64,
        group_region_begin: &[i64],
        group_region_end: &[i64],
        block_base_start: &[i64],
        block_base_stop: &[i64],
        adj_base_start: &[i64],
        adj_base_stop: &[i64],
        mb_start: &[i64],
        mb_stop: &[i64],
        t_begin: i64,
        t_end: i64,
        worker: usize,
    ) -> StencilResult<()> {
        // Promote transport progress from one worker while only the
        // interior is being computed.
        if mode == MpiPass::Interior && worker == 0 {
            if self.enable_halo_exchange.load(Ordering::Relaxed) && self.env.num_ranks() > 1 {
                self.halo.test_all(&self.env)?;
            }
        }

        let check_steps = self.check_step_conds.load(Ordering::Relaxed);
        let dir: i64 = if t_end >= t_begin { 1 } else { -1 };
        let num_t = (t_end - t_begin).abs();
        let mut local_shift: i64 = 0;
        for index_t in 0..num_t {
            let start_t = t_begin + index_t * dir;
            for pi in 0..self.packs.len() {
                if sel_pack.is_some_and(|s| s != pi) {
                    continue;
                }
                if check_steps && !self.pack_valid_step(pi, start_t) {
                    continue;
                }
                if worker == 0 {
                    if let Ok(mut t) = self.packs[pi].timer.lock() {
                        t.start();
                    }
                }
                let ps = self.pack_settings(pi)?;
                let (span_begin, span_end, ok) = self.shift_mini_block(
                    mb_start,
                    mb_stop,
                    local_shift,
                    adj_base_start,
                    adj_base_stop,
                    block_base_start,
                    block_base_stop,
                    local_shift,
                    nphases,
                    phase,
                    bridge_dims,
                    region_base_start,
                    region_base_stop,
                    region_shift0 + local_shift,
                    group_region_begin,
                    group_region_end,
                    pi,
                )?;
                if ok {
                    let nd = self.dims.num_domain_dims();
                    let sub_stride: Vec<i64> =
                        (0..nd).map(|j| ps.sub_block_sizes.val(j)).collect();
                    let sub_group: Vec<i64> =
                        (0..nd).map(|j| ps.sub_block_group_sizes.val(j)).collect();
                    for &b in &self.packs[pi].bundles {
                        if check_steps && !self.bundles[b].is_in_valid_step(start_t) {
                            continue;
                        }
                        if self.bundle_bbs[b].overall.num_points == 0 {
                            continue;
                        }
                        self.calc_bundle_span(
                            b,
                            &span_begin,
                            &span_end,
                            &sub_stride,
                            &sub_group,
                            start_t,
                            worker,
                        )?;
                    }
                }
                local_shift += 1;
                if worker == 0 {
                    if let Ok(mut t) = self.packs[pi].timer.lock() {
                        t.stop();
                    }
                }
            }
        }
        Ok(())
    }

    /// Compose the active span of one (pack, step) inside a mini-block
    /// from the region shift, the TB trapezoid/bridge of the current
    /// phase & shape, and the mini-block's own wave-front.
    #[allow(clippy::too_many_arguments)]
    fn shift_mini_block(
        &self,
        mb_base_start: &[i64],
        mb_base_stop: &[i64],
        mb_shift_num: i64,
        adj_base_start: &[i64],
        adj_base_stop: &[i64],
        block_base_start: &[i64],
        block_base_stop: &[i64],
        block_shift_num: i64,
        nphases: i64,
        phase: i64,
        bridge_dims: &[usize],
        region_base_start: &[i64],
        region_base_stop: &[i64],
        region_shift_total: i64,
        group_region_begin: &[i64],
        group_region_end: &[i64],
        pack: usize,
    ) -> StencilResult<(Vec<i64>, Vec<i64>, bool)> {
        let nd = self.dims.num_domain_dims();
        let tb = self
            .tb
            .read()
            .map_err(|_| StencilError::InternalInvariant("tb lock".into()))?
            .clone();
        // Region bounds for the current total shift.
        let (mut begin, mut end, mut ok) = self.shift_region(
            region_base_start,
            region_base_stop,
            region_shift_total,
            Some(pack),
        )?;

        for j in 0..nd {
            if !ok {
                break;
            }
            let fold = self.dims.fold_val(j);
            let tb_angle = tb.tb_angles[j];

            let is_first_blk = block_base_start[j] <= group_region_begin[j];
            let is_last_blk = block_base_stop[j] >= group_region_end[j];
            let is_one_blk = is_first_blk && is_last_blk;

            let mut blk_start = block_base_start[j];
            let mut blk_stop = block_base_stop[j];

            // With more than one phase the base block is split roughly
            // in half plus one shift distance, making the up and down
            // trapezoids about the same size.
            if nphases > 1 && !is_one_blk {
                let sa = (tb.num_tb_shifts + 1) * tb_angle;
                let mut blk_width =
                    round_up(ceil_div(blk_stop - blk_start, 2) + sa, fold);
                blk_width = blk_width.max(2 * sa + fold);
                blk_stop = (blk_start + blk_width).min(block_base_stop[j]);
            }
            let mut next_blk_start = block_base_stop[j];

            // TB shifts narrow the trapezoid from both sides; first and
            // last blocks clamp to the region.
            blk_start += tb_angle * block_shift_num;
            if is_first_blk {
                blk_start = begin[j];
            }
            blk_stop -= tb_angle * block_shift_num;
            if (nphases == 1 || is_one_blk) && is_last_blk {
                blk_stop = end[j];
            }
            next_blk_start += tb_angle * block_shift_num;
            if is_last_blk {
                next_blk_start = end[j];
            }

            // Phase 0 keeps the base; a bridged dim spans from this
            // block's stop to the start of the next block.
            let mut shape_start = blk_start;
            let mut shape_stop = blk_stop;
            if phase > 0 && bridge_dims.contains(&j) {
                shape_start = blk_stop.max(blk_start);
                shape_stop = next_blk_start;
            }
            if shape_stop <= shape_start {
                ok = false;
                break;
            }

            // Mini-block wave-front within the shape.
            let is_first_mb = mb_base_start[j] <= adj_base_start[j];
            let is_last_mb = mb_base_stop[j] >= adj_base_stop[j];
            let is_one_mb = is_first_mb && is_last_mb;

            let mut mbs = mb_base_start[j];
            let mut mbe = mb_base_stop[j];
            if !is_one_mb {
                mbs -= tb.mb_angles[j] * mb_shift_num;
                mbe -= tb.mb_angles[j] * mb_shift_num;
            }
            if is_first_mb {
                mbs = shape_start;
            }
            if is_last_mb {
                mbe = shape_stop;
            }
            mbs = mbs.max(begin[j]).max(shape_start);
            mbe = mbe.min(end[j]).min(shape_stop);

            begin[j] = mbs;
            end[j] = mbe;
            if mbe <= mbs {
                ok = false;
                break;
            }
        }
        Ok((begin, end, ok))
    }

    /// Run one bundle (with its scratch prerequisites) over the span,
    /// sub-block by sub-block within each of its sub-rects.
    fn calc_bundle_span(
        &self,
        bundle_idx: usize,
        span_begin: &[i64],
        span_end: &[i64],
        sub_stride: &[i64],
        sub_group: &[i64],
        t: i64,
        worker: usize,
    ) -> StencilResult<()> {
        let ev = self.eval_vars(worker)?;
        let reqd = &self.reqd_bundles[bundle_idx];
        for &cb in &reqd[..reqd.len() - 1] {
            // Scratch prerequisite: evaluate over the span expanded by
            // the scratch halo, repositioning the worker's copy first.
            let bundle = &self.bundles[cb];
            let (lo, hi) = self.scratch_span(cb, span_begin, span_end);
            // Anchor the scratch domain at the span begin; the halo
            // expansion lands in the scratch pads on both sides.
            self.position_scratch(cb, worker, span_begin)?;
            let check = bundle.has_sub_domain();
            if check {
                let mut err = None;
                visit_span(&lo, &hi, |pt| {
                    if err.is_none() && bundle.in_valid_domain(pt) {
                        if let Err(e) = bundle.calc_point(&ev, pt, t) {
                            err = Some(e);
                        }
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            } else {
                bundle.calc_block(&ev, &lo, &hi, t)?;
            }
        }

        let bundle = &self.bundles[bundle_idx];
        for bb in &self.bundle_bbs[bundle_idx].list {
            if let Some((lo, hi)) = bb.trim_range(span_begin, span_end) {
                self.for_each_tile_grouped(&lo, &hi, sub_stride, sub_group, &mut |ss, se| {
                    bundle.calc_block(&ev, ss, se, t)
                })?;
            }
        }
        Ok(())
    }

    /// Span a scratch bundle must cover so its consumer can read the
    /// scratch halo over the consumer's span.
    fn scratch_span(&self, cb: usize, begin: &[i64], end: &[i64]) -> (Vec<i64>, Vec<i64>) {
        let mut lo = begin.to_vec();
        let mut hi = end.to_vec();
        for v in self.bundles[cb].outputs() {
            let spec = &self.var_specs[v.0];
            for d in &spec.dims {
                if d.kind == DimType::Domain {
                    if let Some(j) = self.dims.domain_posn(&d.name) {
                        lo[j] = lo[j].min(begin[j] - d.left_halo);
                        hi[j] = hi[j].max(end[j] + d.right_halo);
                    }
                }
            }
        }
        (lo, hi)
    }

    /// Move the worker's copies of a scratch bundle's outputs over the
    /// given span start.
    fn position_scratch(&self, cb: usize, worker: usize, begin: &[i64]) -> StencilResult<()> {
        let geom = self.geom_ref()?;
        let scratch = self
            .scratch
            .read()
            .map_err(|_| StencilError::InternalInvariant("scratch lock".into()))?;
        for v in self.bundles[cb].outputs() {
            if let Some(insts) = scratch.get(&v.0) {
                let var = insts.get(worker).ok_or_else(|| {
                    StencilError::InternalInvariant(format!(
                        "no scratch copy of '{}' for worker {worker}",
                        self.vars[v.0].name()
                    ))
                })?;
                update_scratch_offsets(var, &self.dims, &geom.rank_offsets, begin);
            }
        }
        Ok(())
    }

    /// Resolved var table for one worker: scratch handles point at the
    /// worker's private copies.
    fn eval_vars(&self, worker: usize) -> StencilResult<EvalVars> {
        let scratch = self
            .scratch
            .read()
            .map_err(|_| StencilError::InternalInvariant("scratch lock".into()))?;
        let mut table = Vec::with_capacity(self.vars.len());
        for (vi, v) in self.vars.iter().enumerate() {
            if v.is_scratch() {
                let inst = scratch
                    .get(&vi)
                    .and_then(|insts| insts.get(worker))
                    .ok_or_else(|| {
                        StencilError::InternalInvariant(format!(
                            "scratch var '{}' has no copy for worker {worker}",
                            v.name()
                        ))
                    })?;
                table.push(Arc::clone(inst));
            } else {
                table.push(Arc::clone(v));
            }
        }
        Ok(EvalVars::new(table))
    }

    /// Serial walk of tiles honoring group-size iteration hints: all
    /// tiles inside one group tile are visited before the next group.
    fn for_each_tile_grouped(
        &self,
        begin: &[i64],
        end: &[i64],
        stride: &[i64],
        group: &[i64],
        f: &mut dyn FnMut(&[i64], &[i64]) -> StencilResult<()>,
    ) -> StencilResult<()> {
        let nd = begin.len();
        if (0..nd).any(|j| end[j] <= begin[j]) {
            return Ok(());
        }
        let gstride: Vec<i64> = (0..nd)
            .map(|j| {
                let g = group[j].max(stride[j]).max(1);
                // Group tiles hold whole sub-tiles.
                round_up(g, stride[j].max(1))
            })
            .collect();
        let gcounts: Vec<i64> = (0..nd)
            .map(|j| ceil_div(end[j] - begin[j], gstride[j]))
            .collect();
        let mut gidx = vec![0i64; nd];
        loop {
            let gs: Vec<i64> = (0..nd).map(|j| begin[j] + gidx[j] * gstride[j]).collect();
            let ge: Vec<i64> = (0..nd).map(|j| (gs[j] + gstride[j]).min(end[j])).collect();
            // Tiles within this group tile.
            let counts: Vec<i64> = (0..nd)
                .map(|j| ceil_div(ge[j] - gs[j], stride[j].max(1)))
                .collect();
            let mut idx = vec![0i64; nd];
            loop {
                let ts: Vec<i64> = (0..nd).map(|j| gs[j] + idx[j] * stride[j].max(1)).collect();
                let te: Vec<i64> = (0..nd)
                    .map(|j| (ts[j] + stride[j].max(1)).min(ge[j]))
                    .collect();
                f(&ts, &te)?;
                let mut i = nd;
                let mut done = false;
                loop {
                    if i == 0 {
                        done = true;
                        break;
                    }
                    i -= 1;
                    idx[i] += 1;
                    if idx[i] < counts[i] {
                        break;
                    }
                    idx[i] = 0;
                }
                if done {
                    break;
                }
            }
            let mut i = nd;
            loop {
                if i == 0 {
                    return Ok(());
                }
                i -= 1;
                gidx[i] += 1;
                if gidx[i] < gcounts[i] {
                    break;
                }
                gidx[i] = 0;
            }
        }
    }

    // ── Auto-tuning ──────────────────────────────────────────────────

    pub fn reset_auto_tuner(&self, enable: bool) -> StencilResult<()> {
        if self.use_pack_tuners {
            for p in &self.packs {
                p.tuner
                    .lock()
                    .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?
                    .reset(enable);
            }
            self.tuner
                .lock()
                .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?
                .reset(false);
        } else {
            self.tuner
                .lock()
                .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?
                .reset(enable);
        }
        Ok(())
    }

    pub fn is_auto_tuner_enabled(&self) -> StencilResult<bool> {
        if self.use_pack_tuners {
            for p in &self.packs {
                if !p
                    .tuner
                    .lock()
                    .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?
                    .is_done()
                {
                    return Ok(true);
                }
            }
            Ok(false)
        } else {
            Ok(!self
                .tuner
                .lock()
                .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?
                .is_done())
        }
    }

    /// Feed the tuner(s) the time of the step group just finished and
    /// apply any proposed sizes.
    fn eval_auto_tuner(&self, num_steps: i64) -> StencilResult<()> {
        let now = {
            let tbank = self
                .timers
                .lock()
                .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
            tbank.run.elapsed_secs()
        };
        let delta = {
            let mut last = self
                .tuner_last_secs
                .lock()
                .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?;
            let d = (now - *last).max(0.0);
            *last = now;
            d
        };

        if self.use_pack_tuners {
            let mut changed = false;
            for p in &self.packs {
                let proposal = p
                    .tuner
                    .lock()
                    .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?
                    .eval(num_steps, delta);
                if let Some(sizes) = proposal {
                    let mut ps = p.settings.write().map_err(|_| {
                        StencilError::InternalInvariant("pack settings lock".into())
                    })?;
                    apply_tile_sizes(&mut ps, &sizes);
                    changed = true;
                }
            }
            if changed {
                self.after_tile_size_change()?;
            }
        } else {
            let proposal = self
                .tuner
                .lock()
                .map_err(|_| StencilError::InternalInvariant("tuner lock".into()))?
                .eval(num_steps, delta);
            if let Some(sizes) = proposal {
                {
                    let mut s = self
                        .settings
                        .write()
                        .map_err(|_| StencilError::InternalInvariant("settings lock".into()))?;
                    apply_tile_sizes(&mut s, &sizes);
                }
                let s = self.snapshot_settings()?;
                for p in &self.packs {
                    *p.settings.write().map_err(|_| {
                        StencilError::InternalInvariant("pack settings lock".into())
                    })? = s.clone();
                }
                self.after_tile_size_change()?;
            }
        }
        Ok(())
    }

    fn after_tile_size_change(&self) -> StencilResult<()> {
        let s = self.snapshot_settings()?;
        let geom = self.geom_ref()?.clone();
        self.update_tb_info(&geom, &s)?;
        self.alloc_scratch(&s)
    }

    /// Exclusive tuning pass: step repeatedly with halo exchange and
    /// step conditions disabled until every tuner settles. Alters var
    /// contents.
    pub fn run_auto_tuner_now(&self) -> StencilResult<()> {
        self.require_prepared()?;
        debug!("auto-tuning...");
        self.enable_halo_exchange.store(false, Ordering::Relaxed);
        self.check_step_conds.store(false, Ordering::Relaxed);
        self.reset_auto_tuner(true)?;

        let wf = self.geom_ref()?.wf_steps.max(1);
        let mut t = 0i64;
        while self.is_auto_tuner_enabled()? {
            self.run_solution(t, t + wf - 1)?;
            t += wf;
        }
        self.enable_halo_exchange.store(true, Ordering::Relaxed);
        self.check_step_conds.store(true, Ordering::Relaxed);
        self.env.barrier()?;
        debug!("auto-tuner done after {} step(s)", self.steps_done());
        Ok(())
    }

    // ── Statistics ───────────────────────────────────────────────────

    /// Snapshot of work and timing counters.
    pub fn stats(&self) -> StencilResult<Stats> {
        let tbank = self
            .timers
            .lock()
            .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
        let steps = self.steps_done.load(Ordering::Relaxed);
        let npts = self.rank_bb.num_points;
        let mut overall = WorkStats {
            num_steps: steps,
            num_points: npts,
            run_secs: tbank.run.elapsed_secs(),
            ..WorkStats::default()
        };
        let mut per_pack = Vec::new();
        for p in &self.packs {
            let ns = p.steps_done.load(Ordering::Relaxed);
            let secs = p
                .timer
                .lock()
                .map_err(|_| StencilError::InternalInvariant("pack timer lock".into()))?
                .elapsed_secs();
            let ws = WorkStats {
                num_steps: ns,
                num_points: npts,
                num_reads: p.reads_per_step * ns,
                num_writes: p.writes_per_step * ns,
                num_fp_ops: p.fp_ops_per_step * ns,
                run_secs: secs,
            };
            overall.num_reads += ws.num_reads;
            overall.num_writes += ws.num_writes;
            overall.num_fp_ops += ws.num_fp_ops;
            per_pack.push((p.name.clone(), ws));
        }
        Ok(Stats {
            overall,
            per_pack,
            halo_secs: tbank.halo.elapsed_secs(),
            wait_secs: tbank.wait_secs,
            exterior_secs: tbank.ext.elapsed_secs(),
            interior_secs: tbank.int_.elapsed_secs(),
        })
    }

    /// Reset all counters and timers.
    pub fn clear_timers(&self) -> StencilResult<()> {
        let mut tbank = self
            .timers
            .lock()
            .map_err(|_| StencilError::InternalInvariant("timer lock".into()))?;
        tbank.run.clear();
        tbank.ext.clear();
        tbank.int_.clear();
        tbank.halo.clear();
        tbank.wait_secs = 0.0;
        self.steps_done.store(0, Ordering::Relaxed);
        for p in &self.packs {
            p.steps_done.store(0, Ordering::Relaxed);
            p.timer
                .lock()
                .map_err(|_| StencilError::InternalInvariant("pack timer lock".into()))?
                .clear();
        }
        Ok(())
    }
}

fn apply_tile_sizes(s: &mut SolverSettings, sizes: &TileSizes) {
    for j in 0..s.block_sizes.len() {
        s.block_sizes.set_val(j, sizes.block.val(j));
        s.mini_block_sizes
            .set_val(j, sizes.mini_block.val(j).min(sizes.block.val(j)));
        s.sub_block_sizes
            .set_val(j, sizes.sub_block.val(j).min(s.mini_block_sizes.val(j)));
        s.block_group_sizes.set_val(j, s.block_sizes.val(j));
        s.mini_block_group_sizes
            .set_val(j, s.mini_block_sizes.val(j));
        s.sub_block_group_sizes
            .set_val(j, s.sub_block_sizes.val(j));
    }
}

/// Binomial coefficient C(n, k).
pub fn choose(n: i64, k: i64) -> i64 {
    if k < 0 || k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut num = 1i64;
    let mut den = 1i64;
    for i in 0..k {
        num *= n - i;
        den *= i + 1;
    }
    num / den
}

/// The `m`-th `k`-element subset of `{0, .., n-1}` in lexicographic
/// order; `m` is 0-based.
pub fn combination(n: usize, k: usize, m: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(k);
    let mut m = m as i64;
    let mut start = 0usize;
    for remaining in (1..=k).rev() {
        for c in start..n {
            let count = choose((n - c - 1) as i64, (remaining - 1) as i64);
            if m < count {
                out.push(c);
                start = c + 1;
                break;
            }
            m -= count;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose() {
        assert_eq!(choose(2, 0), 1);
        assert_eq!(choose(2, 1), 2);
        assert_eq!(choose(2, 2), 1);
        assert_eq!(choose(3, 1), 3);
        assert_eq!(choose(3, 2), 3);
        assert_eq!(choose(4, 2), 6);
    }

    #[test]
    fn test_combination_enumerates_all_subsets() {
        // 2-subsets of {0,1,2} in lexicographic order.
        assert_eq!(combination(3, 2, 0), vec![0, 1]);
        assert_eq!(combination(3, 2, 1), vec![0, 2]);
        assert_eq!(combination(3, 2, 2), vec![1, 2]);
        // 1-subsets.
        for m in 0..3 {
            assert_eq!(combination(3, 1, m), vec![m]);
        }
        // Degenerate 0-subset.
        assert!(combination(3, 0, 0).is_empty());
    }

    #[test]
    fn test_combination_covers_each_dim_once_per_phase() {
        // In 2-D TB, phase 1 needs an x-bridge and a y-bridge.
        let shapes: Vec<Vec<usize>> = (0..choose(2, 1))
            .map(|m| combination(2, 1, m as usize))
            .collect();
        assert_eq!(shapes, vec![vec![0], vec![1]]);
        // Phase 2 needs the single xy-corner bridge.
        assert_eq!(combination(2, 2, 0), vec![0, 1]);
    }
}

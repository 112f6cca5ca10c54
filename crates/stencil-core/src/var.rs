// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Var Store
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Multi-dimensional vars with ring-buffered steps, halo/pad geometry,
//! per-step dirty flags, bulk slice access, and pooled allocation.
//!
//! Storage layout is row-major over the var's declared dims. Each domain
//! dim is padded on both sides; the step dim is a ring of `step_alloc`
//! slots; misc dims span `[first_misc, last_misc]`. The slot occupied by
//! logical step `t` is `t mod step_alloc` with symmetric wrapping for
//! negative `t`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use stencil_types::dims::{DimType, Dims};
use stencil_types::error::{StencilError, StencilResult};
use stencil_types::idx::{imod_flr, round_down_flr, round_up};

/// Handle for a var in its program's registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Construction-time description of one var dim.
#[derive(Clone, Debug)]
pub struct VarDimSpec {
    pub name: String,
    pub kind: DimType,
    pub left_halo: i64,
    pub right_halo: i64,
    /// Folding multiple; 0 means "use the solution fold for this dim".
    pub vec_len: i64,
    /// Explicit domain size for fixed-size vars (ignored otherwise).
    pub fixed_domain_size: i64,
    /// Misc dims: inclusive index range.
    pub first_misc: i64,
    pub last_misc: i64,
}

/// Construction-time description of a var.
#[derive(Clone, Debug)]
pub struct VarSpec {
    pub name: String,
    pub dims: Vec<VarDimSpec>,
    pub scratch: bool,
    pub fixed_size: bool,
    /// Explicit ring size; 0 means "computed from step offsets".
    pub step_alloc_override: i64,
    pub numa_preferred: i32,
}

impl VarSpec {
    /// A var over the named dims, resolved against the solution dims.
    /// Halos default to zero; use [`VarSpec::halo`] to set them.
    pub fn new(name: &str, dim_names: &[&str], dims: &Dims) -> StencilResult<Self> {
        let mut vdims = Vec::with_capacity(dim_names.len());
        for dn in dim_names {
            let kind = if *dn == dims.step_dim {
                DimType::Step
            } else if dims.domain_dims.iter().any(|d| d == dn) {
                DimType::Domain
            } else if dims.misc_dims.iter().any(|d| d == dn) {
                DimType::Misc
            } else {
                return Err(StencilError::Config(format!(
                    "var '{name}' uses undeclared dim '{dn}'"
                )));
            };
            let vec_len = match kind {
                DimType::Domain => dims.fold.get(dn)?,
                _ => 1,
            };
            vdims.push(VarDimSpec {
                name: dn.to_string(),
                kind,
                left_halo: 0,
                right_halo: 0,
                vec_len,
                fixed_domain_size: 0,
                first_misc: 0,
                last_misc: 0,
            });
        }
        Ok(VarSpec {
            name: name.to_string(),
            dims: vdims,
            scratch: false,
            fixed_size: false,
            step_alloc_override: 0,
            numa_preferred: -1,
        })
    }

    pub fn halo(mut self, dim: &str, left: i64, right: i64) -> Self {
        if let Some(d) = self.dims.iter_mut().find(|d| d.name == dim) {
            d.left_halo = left;
            d.right_halo = right;
        }
        self
    }

    pub fn misc_range(mut self, dim: &str, first: i64, last: i64) -> Self {
        if let Some(d) = self.dims.iter_mut().find(|d| d.name == dim) {
            d.first_misc = first;
            d.last_misc = last;
        }
        self
    }

    pub fn scratch(mut self) -> Self {
        self.scratch = true;
        self
    }

    pub fn fixed_size(mut self, dim: &str, size: i64) -> Self {
        self.fixed_size = true;
        if let Some(d) = self.dims.iter_mut().find(|d| d.name == dim) {
            d.fixed_domain_size = size;
        }
        self
    }

    pub fn step_alloc(mut self, n: i64) -> Self {
        self.step_alloc_override = n;
        self
    }
}

/// Finalized geometry of one var dim.
#[derive(Clone, Debug)]
pub struct VarDimInfo {
    pub name: String,
    pub kind: DimType,
    pub domain_size: i64,
    pub left_halo: i64,
    pub right_halo: i64,
    pub left_pad: i64,
    pub right_pad: i64,
    pub left_wf_ext: i64,
    pub right_wf_ext: i64,
    pub vec_len: i64,
    pub first_misc: i64,
    pub last_misc: i64,
}

impl VarDimInfo {
    /// Allocated length of this dim.
    pub fn alloc_len(&self) -> i64 {
        match self.kind {
            DimType::Domain => self.left_pad + self.domain_size + self.right_pad,
            DimType::Step => 1, // step handled separately via the ring
            DimType::Misc => self.last_misc - self.first_misc + 1,
        }
    }
}

/// Elements of one NUMA preference pool, stored as atomic bit patterns
/// so concurrent workers can share the pool without locks. Workers
/// write disjoint elements by construction (scheduler contract); the
/// var APIs below uphold bounds.
pub struct StoragePool {
    cells: Vec<AtomicU64>,
}

impl StoragePool {
    pub fn new(num_elems: usize) -> StencilResult<Arc<Self>> {
        let mut v = Vec::new();
        v.try_reserve_exact(num_elems)
            .map_err(|e| StencilError::Allocation(format!("pool of {num_elems} elems: {e}")))?;
        for _ in 0..num_elems {
            v.push(AtomicU64::new(0.0f64.to_bits()));
        }
        Ok(Arc::new(StoragePool { cells: v }))
    }

    #[inline]
    fn read(&self, idx: usize) -> f64 {
        f64::from_bits(self.cells[idx].load(Ordering::Relaxed))
    }

    #[inline]
    fn write(&self, idx: usize, val: f64) {
        self.cells[idx].store(val.to_bits(), Ordering::Relaxed);
    }
}

/// Shared storage of a var: pool slice plus per-slot ring metadata.
/// After [`Var::fuse`], two vars share one of these.
pub struct VarData {
    pool: Arc<StoragePool>,
    base: usize,
    len: usize,
    /// Per ring-slot: an outgoing halo may be stale on neighbors.
    dirty: Vec<AtomicBool>,
    /// Per ring-slot: the logical step currently resident.
    slot_step: Vec<AtomicI64>,
}

/// One multi-dimensional array of the solution.
pub struct Var {
    name: String,
    dims: Vec<VarDimInfo>,
    step_posn: Option<usize>,
    scratch: bool,
    fixed_size: bool,
    numa_preferred: i32,
    step_alloc: i64,
    /// Global index of local 0 per var dim (domain dims only, else 0).
    rank_offsets: Vec<AtomicI64>,
    /// Extra offset of this var's storage relative to the rank; moves
    /// per block for scratch vars, stays 0 otherwise.
    local_offsets: Vec<AtomicI64>,
    strides: Vec<i64>,
    data: Option<Arc<VarData>>,
}

impl Var {
    /// Build an unallocated var from its finalized dim geometry.
    pub(crate) fn new(
        name: &str,
        dims: Vec<VarDimInfo>,
        scratch: bool,
        fixed_size: bool,
        numa_preferred: i32,
        step_alloc: i64,
    ) -> StencilResult<Self> {
        let step_posn = dims.iter().position(|d| d.kind == DimType::Step);
        if step_alloc < 1 {
            return Err(StencilError::InternalInvariant(format!(
                "var '{name}' has ring size {step_alloc}"
            )));
        }
        let n = dims.len();
        Ok(Var {
            name: name.to_string(),
            dims,
            step_posn,
            scratch,
            fixed_size,
            numa_preferred,
            step_alloc,
            rank_offsets: (0..n).map(|_| AtomicI64::new(0)).collect(),
            local_offsets: (0..n).map(|_| AtomicI64::new(0)).collect(),
            strides: vec![0; n],
            data: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[VarDimInfo] {
        &self.dims
    }

    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scratch(&self) -> bool {
        self.scratch
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }

    pub fn numa_preferred(&self) -> i32 {
        self.numa_preferred
    }

    pub fn step_alloc_size(&self) -> i64 {
        self.step_alloc
    }

    /// Position of the step dim among this var's dims, if used.
    pub fn dim_posn_of_step(&self) -> Option<usize> {
        self.step_posn
    }

    pub fn is_dim_used(&self, name: &str) -> bool {
        self.dims.iter().any(|d| d.name == name)
    }

    pub fn dim_posn(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn rank_offset(&self, posn: usize) -> i64 {
        self.rank_offsets[posn].load(Ordering::Relaxed)
    }

    pub fn set_rank_offset(&self, posn: usize, ofs: i64) {
        self.rank_offsets[posn].store(ofs, Ordering::Relaxed);
    }

    pub fn local_offset(&self, posn: usize) -> i64 {
        self.local_offsets[posn].load(Ordering::Relaxed)
    }

    pub fn set_local_offset(&self, posn: usize, ofs: i64) {
        self.local_offsets[posn].store(ofs, Ordering::Relaxed);
    }

    /// First allocated global index in a domain dim.
    pub fn first_local_index(&self, posn: usize) -> i64 {
        let d = &self.dims[posn];
        self.rank_offset(posn) + self.local_offset(posn) - d.left_pad
    }

    /// Last allocated global index in a domain dim.
    pub fn last_local_index(&self, posn: usize) -> i64 {
        let d = &self.dims[posn];
        self.rank_offset(posn) + self.local_offset(posn) + d.domain_size + d.right_pad - 1
    }

    /// Total elements in the allocation.
    pub fn num_storage_elems(&self) -> usize {
        let mut n: i64 = self.step_alloc;
        for d in &self.dims {
            if d.kind != DimType::Step {
                n *= d.alloc_len();
            }
        }
        n.max(0) as usize
    }

    pub fn num_storage_bytes(&self) -> usize {
        self.num_storage_elems() * std::mem::size_of::<f64>()
    }

    pub fn is_storage_allocated(&self) -> bool {
        self.data.is_some()
    }

    /// Attach a slice of `pool` as this var's storage and freeze strides.
    pub(crate) fn set_storage(&mut self, pool: Arc<StoragePool>, base: usize) -> StencilResult<()> {
        let len = self.num_storage_elems();
        // Row-major strides over declared dims; step dim length is the
        // ring size.
        let n = self.dims.len();
        let mut strides = vec![1i64; n];
        for i in (0..n).rev() {
            let dim_len = if Some(i) == self.step_posn {
                self.step_alloc
            } else {
                self.dims[i].alloc_len()
            };
            if i + 1 < n {
                strides[i] = strides[i + 1]
                    * if Some(i + 1) == self.step_posn {
                        self.step_alloc
                    } else {
                        self.dims[i + 1].alloc_len()
                    };
            }
            if dim_len < 0 {
                return Err(StencilError::Allocation(format!(
                    "var '{}' has negative length in dim '{}'",
                    self.name, self.dims[i].name
                )));
            }
        }
        self.strides = strides;
        let s = self.step_alloc as usize;
        self.data = Some(Arc::new(VarData {
            pool,
            base,
            len,
            dirty: (0..s).map(|_| AtomicBool::new(false)).collect(),
            slot_step: (0..s).map(|i| AtomicI64::new(i as i64)).collect(),
        }));
        Ok(())
    }

    fn data(&self) -> StencilResult<&Arc<VarData>> {
        self.data.as_ref().ok_or_else(|| {
            StencilError::InternalInvariant(format!("var '{}' has no storage", self.name))
        })
    }

    /// Ring slot for logical step `t`; symmetric for negative `t`.
    #[inline]
    pub fn wrap_step(&self, t: i64) -> usize {
        imod_flr(t, self.step_alloc) as usize
    }

    /// Take on another var's storage. Both handles then observe the same
    /// data. The dim sets and folding multiples must agree.
    pub fn fuse(&mut self, other: &Var) -> StencilResult<()> {
        if self.dims.len() != other.dims.len()
            || self
                .dims
                .iter()
                .zip(other.dims.iter())
                .any(|(a, b)| a.name != b.name || a.vec_len != b.vec_len)
        {
            return Err(StencilError::Config(format!(
                "cannot fuse var '{}' with incompatible var '{}'",
                self.name, other.name
            )));
        }
        if self.num_storage_elems() != other.num_storage_elems()
            || self.step_alloc != other.step_alloc
        {
            return Err(StencilError::Config(format!(
                "cannot fuse var '{}' with differently-sized var '{}'",
                self.name, other.name
            )));
        }
        self.strides = other.strides.clone();
        self.data = Some(Arc::clone(other.data()?));
        Ok(())
    }

    /// Flat element index and ring slot for the given indices (declared
    /// dim order; global indices for domain dims, logical step for the
    /// step dim, misc values for misc dims).
    fn flat_index(&self, idxs: &[i64]) -> StencilResult<(usize, Option<usize>)> {
        if idxs.len() != self.dims.len() {
            return Err(StencilError::IndexOutOfRange {
                var: self.name.clone(),
                message: format!(
                    "got {} index(es) for {} dim(s)",
                    idxs.len(),
                    self.dims.len()
                ),
            });
        }
        let mut flat = 0i64;
        let mut slot = None;
        for (i, (d, &ix)) in self.dims.iter().zip(idxs).enumerate() {
            let rel = match d.kind {
                DimType::Step => {
                    let s = self.wrap_step(ix);
                    slot = Some(s);
                    s as i64
                }
                DimType::Domain => {
                    let rel =
                        ix - self.rank_offset(i) - self.local_offset(i) + d.left_pad;
                    if rel < 0 || rel >= d.alloc_len() {
                        return Err(StencilError::IndexOutOfRange {
                            var: self.name.clone(),
                            message: format!(
                                "index {ix} outside allocation [{}, {}] in dim '{}'",
                                self.first_local_index(i),
                                self.last_local_index(i),
                                d.name
                            ),
                        });
                    }
                    rel
                }
                DimType::Misc => {
                    let rel = ix - d.first_misc;
                    if rel < 0 || rel > d.last_misc - d.first_misc {
                        return Err(StencilError::IndexOutOfRange {
                            var: self.name.clone(),
                            message: format!(
                                "misc index {ix} outside [{}, {}] in dim '{}'",
                                d.first_misc, d.last_misc, d.name
                            ),
                        });
                    }
                    rel
                }
            };
            flat += rel * self.strides[i];
        }
        Ok((flat as usize, slot))
    }

    #[inline]
    fn check_step_resident(&self, data: &VarData, slot: usize, idxs: &[i64]) -> StencilResult<()> {
        if let Some(sp) = self.step_posn {
            let t = idxs[sp];
            if data.slot_step[slot].load(Ordering::Acquire) != t {
                return Err(StencilError::StaleStep {
                    var: self.name.clone(),
                    step: t,
                });
            }
        }
        Ok(())
    }

    /// Read one element; fails with `IndexOutOfRange` outside the
    /// allocation and `StaleStep` if the step is not resident.
    pub fn get_element(&self, idxs: &[i64]) -> StencilResult<f64> {
        let data = self.data()?;
        let (flat, slot) = self.flat_index(idxs)?;
        if let Some(s) = slot {
            self.check_step_resident(data, s, idxs)?;
        }
        debug_assert!(flat < data.len);
        Ok(data.pool.read(data.base + flat))
    }

    /// Kernel-path read: bounds-checked but without the step-residency
    /// check. During a wave-front, spatially disjoint parts of one ring
    /// slot legitimately hold different logical steps; the tile
    /// scheduler guarantees the requested point is current.
    pub fn read_elem(&self, idxs: &[i64]) -> StencilResult<f64> {
        let data = self.data()?;
        let (flat, _) = self.flat_index(idxs)?;
        debug_assert!(flat < data.len);
        Ok(data.pool.read(data.base + flat))
    }

    /// Write one element and mark the step dirty. With `strict` false,
    /// out-of-range writes are silently ignored (returns 0).
    pub fn set_element(&self, val: f64, idxs: &[i64], strict: bool) -> StencilResult<usize> {
        let data = self.data()?;
        let (flat, slot) = match self.flat_index(idxs) {
            Ok(x) => x,
            Err(e) => {
                return if strict { Err(e) } else { Ok(0) };
            }
        };
        data.pool.write(data.base + flat, val);
        if let Some(s) = slot {
            let sp = self.step_posn.unwrap_or(0);
            data.slot_step[s].store(idxs[sp], Ordering::Release);
            data.dirty[s].store(true, Ordering::Release);
        }
        Ok(1)
    }

    /// Read-modify-write one element; requires the step to be resident.
    pub fn add_to_element(&self, val: f64, idxs: &[i64], strict: bool) -> StencilResult<usize> {
        let data = self.data()?;
        let (flat, slot) = match self.flat_index(idxs) {
            Ok(x) => x,
            Err(e) => {
                return if strict { Err(e) } else { Ok(0) };
            }
        };
        if let Some(s) = slot {
            self.check_step_resident(data, s, idxs)?;
        }
        let idx = data.base + flat;
        data.pool.write(idx, data.pool.read(idx) + val);
        if let Some(s) = slot {
            data.dirty[s].store(true, Ordering::Release);
        }
        Ok(1)
    }

    /// Count of elements in the inclusive slice `[first, last]`.
    fn slice_len(&self, first: &[i64], last: &[i64]) -> StencilResult<usize> {
        if first.len() != self.dims.len() || last.len() != self.dims.len() {
            return Err(StencilError::IndexOutOfRange {
                var: self.name.clone(),
                message: "slice bounds have wrong arity".to_string(),
            });
        }
        let mut n = 1usize;
        for (f, l) in first.iter().zip(last) {
            if l < f {
                return Err(StencilError::IndexOutOfRange {
                    var: self.name.clone(),
                    message: format!("slice bound {l} precedes {f}"),
                });
            }
            n *= (l - f + 1) as usize;
        }
        Ok(n)
    }

    fn visit_slice(
        &self,
        first: &[i64],
        last: &[i64],
        mut f: impl FnMut(&[i64], usize) -> StencilResult<()>,
    ) -> StencilResult<usize> {
        let n = self.slice_len(first, last)?;
        let nd = self.dims.len();
        let mut point = first.to_vec();
        let mut linear = 0usize;
        loop {
            f(&point, linear)?;
            linear += 1;
            let mut i = nd;
            loop {
                if i == 0 {
                    debug_assert_eq!(linear, n);
                    return Ok(n);
                }
                i -= 1;
                point[i] += 1;
                if point[i] <= last[i] {
                    break;
                }
                point[i] = first[i];
            }
        }
    }

    /// Bulk copy from the var into `buf`, ordered by declared dim order.
    /// The whole slice must be within the allocation.
    pub fn get_elements_in_slice(
        &self,
        buf: &mut [f64],
        first: &[i64],
        last: &[i64],
    ) -> StencilResult<usize> {
        let data = self.data()?;
        let n = self.slice_len(first, last)?;
        if buf.len() < n {
            return Err(StencilError::IndexOutOfRange {
                var: self.name.clone(),
                message: format!("buffer of {} for slice of {n}", buf.len()),
            });
        }
        self.visit_slice(first, last, |pt, li| {
            let (flat, slot) = self.flat_index(pt)?;
            if let Some(s) = slot {
                self.check_step_resident(data, s, pt)?;
            }
            buf[li] = data.pool.read(data.base + flat);
            Ok(())
        })
    }

    /// Bulk copy from `buf` into the var; marks dirty flags over the
    /// covered step range.
    pub fn set_elements_in_slice(
        &self,
        buf: &[f64],
        first: &[i64],
        last: &[i64],
    ) -> StencilResult<usize> {
        let data = self.data()?;
        let n = self.slice_len(first, last)?;
        if buf.len() < n {
            return Err(StencilError::IndexOutOfRange {
                var: self.name.clone(),
                message: format!("buffer of {} for slice of {n}", buf.len()),
            });
        }
        self.claim_slice_steps(data, first, last);
        self.visit_slice(first, last, |pt, li| {
            let (flat, _) = self.flat_index(pt)?;
            data.pool.write(data.base + flat, buf[li]);
            Ok(())
        })
    }

    /// Fill the inclusive slice with one value.
    pub fn set_elements_in_slice_same(
        &self,
        val: f64,
        first: &[i64],
        last: &[i64],
    ) -> StencilResult<usize> {
        let data = self.data()?;
        self.claim_slice_steps(data, first, last);
        self.visit_slice(first, last, |pt, _| {
            let (flat, _) = self.flat_index(pt)?;
            data.pool.write(data.base + flat, val);
            Ok(())
        })
    }

    /// Fill the entire allocation (all ring slots, pads included).
    pub fn set_all_elements_same(&self, val: f64) -> StencilResult<()> {
        let data = self.data()?;
        for i in 0..data.len {
            data.pool.write(data.base + i, val);
        }
        for s in 0..self.step_alloc as usize {
            data.dirty[s].store(true, Ordering::Release);
        }
        Ok(())
    }

    fn claim_slice_steps(&self, data: &VarData, first: &[i64], last: &[i64]) {
        if let Some(sp) = self.step_posn {
            for t in first[sp]..=last[sp] {
                let s = self.wrap_step(t);
                data.slot_step[s].store(t, Ordering::Release);
                data.dirty[s].store(true, Ordering::Release);
            }
        }
    }

    /// Re-label the ring window to end at `last`: each slot is claimed
    /// by the step in `(last - S, last]` that maps to it. Data is not
    /// touched; a run starting from `last` can then read its inputs
    /// from whatever the slots hold. A no-op when the window already
    /// ends there.
    pub fn rebase_ring(&self, last: i64) {
        let Some(data) = &self.data else {
            return;
        };
        if self.step_posn.is_none() {
            return;
        }
        let s = self.step_alloc;
        for w in (last - s + 1)..=last {
            let slot = self.wrap_step(w);
            data.slot_step[slot].store(w, Ordering::Release);
        }
    }

    // ── Dirty-flag bookkeeping ───────────────────────────────────────

    pub fn is_dirty(&self, t: i64) -> bool {
        match &self.data {
            Some(d) => d.dirty[self.wrap_step(t)].load(Ordering::Acquire),
            None => false,
        }
    }

    pub fn set_dirty(&self, flag: bool, t: i64) {
        if let Some(d) = &self.data {
            let s = self.wrap_step(t);
            if flag {
                // Claiming a step as dirty also claims its ring slot;
                // all ranks agree on this claim even when a rank wrote
                // nothing (sub-domains), keeping exchange lists global.
                d.slot_step[s].store(t, Ordering::Release);
            }
            d.dirty[s].store(flag, Ordering::Release);
        }
    }

    /// Logical step resident in each ring slot, in slot order.
    pub fn resident_steps(&self) -> Vec<i64> {
        match &self.data {
            Some(d) => d
                .slot_step
                .iter()
                .map(|s| s.load(Ordering::Acquire))
                .collect(),
            None => Vec::new(),
        }
    }
}

// ── Registry construction helpers ────────────────────────────────────

/// Finalize a var's dim geometry from its spec plus rank sizing.
///
/// For each domain dim the actual pad is
/// `round_up(max(halo + wf_ext, min_pad, extra_pad), vec_len)`, which
/// also satisfies `actual_pad >= halo + wf_ext`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn finalize_var_dims(
    spec: &VarSpec,
    dims: &Dims,
    rank_sizes: &[i64],
    rank_offsets: &[i64],
    left_wf_exts: &[i64],
    right_wf_exts: &[i64],
    min_pads: &[i64],
    extra_pads: &[i64],
) -> (Vec<VarDimInfo>, Vec<i64>) {
    let mut infos = Vec::with_capacity(spec.dims.len());
    let mut offsets = vec![0i64; spec.dims.len()];
    for (i, ds) in spec.dims.iter().enumerate() {
        let mut info = VarDimInfo {
            name: ds.name.clone(),
            kind: ds.kind,
            domain_size: 0,
            left_halo: ds.left_halo,
            right_halo: ds.right_halo,
            left_pad: 0,
            right_pad: 0,
            left_wf_ext: 0,
            right_wf_ext: 0,
            vec_len: ds.vec_len.max(1),
            first_misc: ds.first_misc,
            last_misc: ds.last_misc,
        };
        if ds.kind == DimType::Domain {
            let j = dims.domain_posn(&ds.name).unwrap_or(0);
            if spec.fixed_size {
                info.domain_size = ds.fixed_domain_size;
            } else {
                info.domain_size = rank_sizes[j];
                offsets[i] = rank_offsets[j];
                if !spec.scratch {
                    info.left_wf_ext = left_wf_exts[j];
                    info.right_wf_ext = right_wf_exts[j];
                }
            }
            let lp = (info.left_halo + info.left_wf_ext)
                .max(min_pads[j])
                .max(extra_pads[j]);
            let rp = (info.right_halo + info.right_wf_ext)
                .max(min_pads[j])
                .max(extra_pads[j]);
            info.left_pad = round_up(lp, info.vec_len);
            info.right_pad = round_up(rp, info.vec_len);
        }
        infos.push(info);
    }
    (infos, offsets)
}

/// Reposition a scratch var over the block starting at `block_begin`
/// (domain-dim order). Offsets are rounded down to the folding multiple
/// so vec-aligned indexing stays valid.
pub fn update_scratch_offsets(var: &Var, dims: &Dims, rank_offsets: &[i64], block_begin: &[i64]) {
    for (i, d) in var.dims().iter().enumerate() {
        if d.kind != DimType::Domain {
            continue;
        }
        if let Some(j) = dims.domain_posn(&d.name) {
            let rofs = rank_offsets[j];
            let lofs = round_down_flr(block_begin[j] - rofs, d.vec_len);
            var.set_rank_offset(i, rofs);
            var.set_local_offset(i, lofs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims_1d() -> Dims {
        Dims::simple("t", &["x"]).expect("dims")
    }

    fn make_var(step_alloc: i64, left_pad: i64, right_pad: i64) -> Var {
        let dims = vec![
            VarDimInfo {
                name: "t".into(),
                kind: DimType::Step,
                domain_size: 0,
                left_halo: 0,
                right_halo: 0,
                left_pad: 0,
                right_pad: 0,
                left_wf_ext: 0,
                right_wf_ext: 0,
                vec_len: 1,
                first_misc: 0,
                last_misc: 0,
            },
            VarDimInfo {
                name: "x".into(),
                kind: DimType::Domain,
                domain_size: 8,
                left_halo: 1,
                right_halo: 1,
                left_pad,
                right_pad,
                left_wf_ext: 0,
                right_wf_ext: 0,
                vec_len: 1,
                first_misc: 0,
                last_misc: 0,
            },
        ];
        let mut v = Var::new("u", dims, false, false, -1, step_alloc).expect("var");
        let pool = StoragePool::new(v.num_storage_elems()).expect("pool");
        v.set_storage(pool, 0).expect("storage");
        v
    }

    #[test]
    fn test_wrap_step_symmetric_for_negative_steps() {
        let v = make_var(3, 1, 1);
        assert_eq!(v.wrap_step(0), 0);
        assert_eq!(v.wrap_step(4), 1);
        assert_eq!(v.wrap_step(-1), 2);
        assert_eq!(v.wrap_step(-3), 0);
    }

    #[test]
    fn test_element_roundtrip_and_halo_access() {
        let v = make_var(2, 1, 1);
        v.set_element(2.5, &[0, 3], true).expect("set");
        assert_eq!(v.get_element(&[0, 3]).expect("get"), 2.5);
        // Halo points are inside the allocation.
        v.set_element(-1.0, &[0, -1], true).expect("halo set");
        assert_eq!(v.get_element(&[0, -1]).expect("halo get"), -1.0);
        // Beyond the pad is out of range.
        let err = v.get_element(&[0, -2]).expect_err("oob");
        assert!(matches!(err, StencilError::IndexOutOfRange { .. }));
    }

    #[test]
    fn test_non_strict_write_ignores_out_of_range() {
        let v = make_var(2, 1, 1);
        assert_eq!(v.set_element(9.0, &[0, 99], false).expect("lenient"), 0);
        let err = v.set_element(9.0, &[0, 99], true).expect_err("strict");
        assert!(matches!(err, StencilError::IndexOutOfRange { .. }));
    }

    #[test]
    fn test_stale_step_detection() {
        let v = make_var(2, 1, 1);
        // Slots initially hold steps 0 and 1.
        v.get_element(&[1, 0]).expect("step 1 resident");
        let err = v.get_element(&[2, 0]).expect_err("step 2 not resident");
        assert!(matches!(err, StencilError::StaleStep { step: 2, .. }));
        // Writing step 2 claims the slot and evicts step 0.
        v.set_element(1.0, &[2, 0], true).expect("write step 2");
        v.get_element(&[2, 0]).expect("step 2 now resident");
        let err = v.get_element(&[0, 0]).expect_err("step 0 evicted");
        assert!(matches!(err, StencilError::StaleStep { step: 0, .. }));
    }

    #[test]
    fn test_add_to_element_requires_resident_step() {
        let v = make_var(2, 1, 1);
        v.set_element(1.0, &[1, 2], true).expect("seed");
        v.add_to_element(0.5, &[1, 2], true).expect("add");
        assert_eq!(v.get_element(&[1, 2]).expect("get"), 1.5);
        let err = v.add_to_element(1.0, &[3, 2], true).expect_err("stale");
        assert!(matches!(err, StencilError::StaleStep { .. }));
    }

    #[test]
    fn test_slice_roundtrip() {
        let v = make_var(2, 1, 1);
        let vals: Vec<f64> = (0..6).map(|i| i as f64 * 0.5).collect();
        let n = v
            .set_elements_in_slice(&vals, &[0, 1], &[0, 6])
            .expect("set slice");
        assert_eq!(n, 6);
        let mut back = vec![0.0; 6];
        v.get_elements_in_slice(&mut back, &[0, 1], &[0, 6])
            .expect("get slice");
        assert_eq!(back, vals);
    }

    #[test]
    fn test_slice_fill_same_value() {
        let v = make_var(2, 1, 1);
        let n = v
            .set_elements_in_slice_same(4.25, &[1, 2], &[1, 5])
            .expect("fill");
        assert_eq!(n, 4);
        for x in 2..=5 {
            assert_eq!(v.get_element(&[1, x]).expect("get"), 4.25);
        }
        assert_eq!(v.get_element(&[1, 1]).expect("get"), 0.0);
        assert!(v.is_dirty(1));
    }

    #[test]
    fn test_writes_set_dirty_flags() {
        let v = make_var(2, 1, 1);
        assert!(!v.is_dirty(0));
        v.set_element(1.0, &[0, 0], true).expect("set");
        assert!(v.is_dirty(0));
        assert!(!v.is_dirty(1));
        v.set_dirty(false, 0);
        assert!(!v.is_dirty(0));
    }

    #[test]
    fn test_first_last_local_index() {
        let v = make_var(2, 2, 3);
        let x = v.dim_posn("x").expect("x posn");
        assert_eq!(v.first_local_index(x), -2);
        assert_eq!(v.last_local_index(x), 8 + 3 - 1);
    }

    #[test]
    fn test_fuse_shares_storage() {
        let mut a = make_var(2, 1, 1);
        let b = make_var(2, 1, 1);
        b.set_element(7.0, &[0, 4], true).expect("set via b");
        a.fuse(&b).expect("fuse");
        assert_eq!(a.get_element(&[0, 4]).expect("read via a"), 7.0);
        a.set_element(8.0, &[0, 5], true).expect("set via a");
        assert_eq!(b.get_element(&[0, 5]).expect("read via b"), 8.0);
        // Dirty flags are shared too.
        b.set_dirty(false, 0);
        assert!(!a.is_dirty(0));
    }

    #[test]
    fn test_fuse_rejects_incompatible() {
        let mut a = make_var(2, 1, 1);
        let b = make_var(3, 1, 1);
        assert!(a.fuse(&b).is_err());
    }

    #[test]
    fn test_finalize_pads_cover_halo_and_wf_ext() {
        let dims = dims_1d();
        let spec = VarSpec::new("u", &["t", "x"], &dims)
            .expect("spec")
            .halo("x", 2, 1);
        let (infos, offsets) =
            finalize_var_dims(&spec, &dims, &[16], &[32], &[4], &[0], &[1], &[0]);
        let x = &infos[1];
        assert_eq!(x.domain_size, 16);
        assert_eq!(offsets[1], 32);
        assert!(x.left_pad >= x.left_halo + x.left_wf_ext);
        assert_eq!(x.left_pad, 6); // halo 2 + ext 4
        assert_eq!(x.right_pad, 1);
    }

    #[test]
    fn test_scratch_offsets_follow_block() {
        let dims = dims_1d();
        let spec = VarSpec::new("s", &["t", "x"], &dims)
            .expect("spec")
            .halo("x", 1, 1)
            .scratch();
        let (infos, _) = finalize_var_dims(&spec, &dims, &[4], &[0], &[0], &[0], &[0], &[0]);
        let mut v = Var::new("s", infos, true, false, -1, 1).expect("var");
        let pool = StoragePool::new(v.num_storage_elems()).expect("pool");
        v.set_storage(pool, 0).expect("storage");
        update_scratch_offsets(&v, &dims, &[8], &[12]);
        let x = v.dim_posn("x").expect("x");
        assert_eq!(v.rank_offset(x), 8);
        assert_eq!(v.local_offset(x), 4);
        // Block-local point 12 is now index 0 of the scratch domain.
        v.set_element(3.0, &[0, 12], true).expect("set in block");
        assert_eq!(v.get_element(&[0, 12]).expect("get"), 3.0);
    }

    #[test]
    fn test_misc_dim_indexing() {
        let step = VarDimInfo {
            name: "t".into(),
            kind: DimType::Step,
            domain_size: 0,
            left_halo: 0,
            right_halo: 0,
            left_pad: 0,
            right_pad: 0,
            left_wf_ext: 0,
            right_wf_ext: 0,
            vec_len: 1,
            first_misc: 0,
            last_misc: 0,
        };
        let x = VarDimInfo {
            name: "x".into(),
            kind: DimType::Domain,
            domain_size: 4,
            left_halo: 0,
            right_halo: 0,
            left_pad: 0,
            right_pad: 0,
            left_wf_ext: 0,
            right_wf_ext: 0,
            vec_len: 1,
            first_misc: 0,
            last_misc: 0,
        };
        let c = VarDimInfo {
            name: "c".into(),
            kind: DimType::Misc,
            domain_size: 0,
            left_halo: 0,
            right_halo: 0,
            left_pad: 0,
            right_pad: 0,
            left_wf_ext: 0,
            right_wf_ext: 0,
            vec_len: 1,
            first_misc: -1,
            last_misc: 1,
        };
        let mut v = Var::new("m", vec![step, x, c], false, false, -1, 1).expect("var");
        let pool = StoragePool::new(v.num_storage_elems()).expect("pool");
        v.set_storage(pool, 0).expect("storage");
        v.set_element(5.0, &[0, 2, -1], true).expect("set");
        assert_eq!(v.get_element(&[0, 2, -1]).expect("get"), 5.0);
        let err = v.get_element(&[0, 2, 2]).expect_err("misc oob");
        assert!(matches!(err, StencilError::IndexOutOfRange { .. }));
    }
}

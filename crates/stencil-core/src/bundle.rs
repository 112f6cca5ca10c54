// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Bundles & Packs
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! The compiler-to-engine handoff: update rules (bundles) behind a
//! narrow capability interface, ordered groups of them (packs), and the
//! static program tables.
//!
//! The engine never inspects the per-point update function; it only
//! drives `calc_point`/`calc_block` over scheduled spans.

use std::sync::Arc;

use stencil_types::dims::Dims;
use stencil_types::error::StencilResult;

use crate::var::{Var, VarId, VarSpec};

/// How a bundle touches one var at one step offset. Feeds ring sizing
/// and halo bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct StepUse {
    pub step_ofs: i64,
    /// Max halo read at this offset across sides and dims; 0 when the
    /// access is point-local.
    pub max_halo: i64,
    pub is_write: bool,
}

/// Read-only view resolving var handles for one worker; scratch vars
/// resolve to the worker's private copy.
pub struct EvalVars {
    vars: Vec<Arc<Var>>,
}

impl EvalVars {
    pub(crate) fn new(vars: Vec<Arc<Var>>) -> Self {
        EvalVars { vars }
    }

    #[inline]
    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0]
    }
}

/// One update rule. `pt` is a point in domain-dim order (declaration
/// order of the solution's domain dims); `t` is the logical input step.
pub trait Bundle: Send + Sync {
    fn name(&self) -> &str;

    fn is_scratch(&self) -> bool {
        false
    }

    fn inputs(&self) -> Vec<VarId>;
    fn outputs(&self) -> Vec<VarId>;

    /// Indices (into the program bundle list) of scratch bundles that
    /// must run over a span before this bundle runs on it.
    fn required_scratch(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Optional sub-domain predicate. Overriders must also return true
    /// from [`Bundle::has_sub_domain`].
    fn in_valid_domain(&self, _pt: &[i64]) -> bool {
        true
    }

    fn has_sub_domain(&self) -> bool {
        false
    }

    /// Optional step predicate.
    fn is_in_valid_step(&self, _t: i64) -> bool {
        true
    }

    /// The step written when evaluating input step `t`, if any.
    fn output_step_index(&self, t: i64) -> Option<i64>;

    /// Step-offset usage for `var`; empty when the var is untouched.
    fn step_uses(&self, var: VarId) -> Vec<StepUse>;

    /// Evaluate the update at one point.
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()>;

    /// Evaluate the update over the half-open span `[begin, end)`.
    /// The default is the scalar loop; implementations may override
    /// with a blocked or vectorized path.
    fn calc_block(&self, vars: &EvalVars, begin: &[i64], end: &[i64], t: i64) -> StencilResult<()> {
        let nd = begin.len();
        if (0..nd).any(|i| end[i] <= begin[i]) {
            return Ok(());
        }
        let mut pt = begin.to_vec();
        loop {
            self.calc_point(vars, &pt, t)?;
            let mut i = nd;
            loop {
                if i == 0 {
                    return Ok(());
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

    // Work estimates per evaluated point, used only for statistics.
    fn est_reads_per_point(&self) -> i64 {
        0
    }
    fn est_writes_per_point(&self) -> i64 {
        1
    }
    fn est_fp_ops_per_point(&self) -> i64 {
        0
    }
}

/// Ordered group of bundles evaluated as a unit per shift.
#[derive(Clone, Debug)]
pub struct PackDef {
    pub name: String,
    /// Indices into the program's bundle list, in evaluation order.
    pub bundles: Vec<usize>,
}

/// Static tables handed from the stencil compiler to the engine.
pub struct StencilProgram {
    pub dims: Dims,
    pub var_specs: Vec<VarSpec>,
    pub bundles: Vec<Arc<dyn Bundle>>,
    pub packs: Vec<PackDef>,
}

impl StencilProgram {
    pub fn new(dims: Dims) -> Self {
        StencilProgram {
            dims,
            var_specs: Vec::new(),
            bundles: Vec::new(),
            packs: Vec::new(),
        }
    }

    pub fn add_var(&mut self, spec: VarSpec) -> VarId {
        self.var_specs.push(spec);
        VarId(self.var_specs.len() - 1)
    }

    /// Register a bundle; returns its index for `required_scratch` and
    /// pack lists.
    pub fn add_bundle(&mut self, bundle: Arc<dyn Bundle>) -> usize {
        self.bundles.push(bundle);
        self.bundles.len() - 1
    }

    pub fn add_pack(&mut self, name: &str, bundles: Vec<usize>) {
        self.packs.push(PackDef {
            name: name.to_string(),
            bundles,
        });
    }

    /// The bundle indices needed to evaluate bundle `b` over a span:
    /// its scratch prerequisites (depth-first, deduplicated) then `b`.
    pub fn required_bundles(&self, b: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = self.bundles[b].required_scratch();
        while let Some(s) = stack.pop() {
            if !out.contains(&s) {
                stack.extend(self.bundles[s].required_scratch());
                out.push(s);
            }
        }
        out.sort_unstable();
        out.push(b);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_types::dims::Dims;

    struct Nop {
        name: String,
        scratch: bool,
        prereq: Vec<usize>,
    }

    impl Bundle for Nop {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_scratch(&self) -> bool {
            self.scratch
        }
        fn required_scratch(&self) -> Vec<usize> {
            self.prereq.clone()
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
        fn calc_point(&self, _vars: &EvalVars, _pt: &[i64], _t: i64) -> StencilResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_required_bundles_expands_scratch_dag() {
        let dims = Dims::simple("t", &["x"]).expect("dims");
        let mut prog = StencilProgram::new(dims);
        let s0 = prog.add_bundle(Arc::new(Nop {
            name: "s0".into(),
            scratch: true,
            prereq: vec![],
        }));
        let s1 = prog.add_bundle(Arc::new(Nop {
            name: "s1".into(),
            scratch: true,
            prereq: vec![s0],
        }));
        let b = prog.add_bundle(Arc::new(Nop {
            name: "b".into(),
            scratch: false,
            prereq: vec![s1, s0],
        }));
        let req = prog.required_bundles(b);
        assert_eq!(req, vec![s0, s1, b]);
    }

    #[test]
    fn test_default_calc_block_visits_whole_span() {
        use std::sync::atomic::{AtomicI64, Ordering};
        struct Count {
            hits: AtomicI64,
        }
        impl Bundle for Count {
            fn name(&self) -> &str {
                "count"
            }
            fn inputs(&self) -> Vec<VarId> {
                Vec::new()
            }
            fn outputs(&self) -> Vec<VarId> {
                Vec::new()
            }
            fn output_step_index(&self, t: i64) -> Option<i64> {
                Some(t)
            }
            fn step_uses(&self, _var: VarId) -> Vec<StepUse> {
                Vec::new()
            }
            fn calc_point(&self, _vars: &EvalVars, _pt: &[i64], _t: i64) -> StencilResult<()> {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
        let c = Count {
            hits: AtomicI64::new(0),
        };
        let vars = EvalVars::new(Vec::new());
        c.calc_block(&vars, &[1, 2], &[4, 5], 0).expect("block");
        assert_eq!(c.hits.load(Ordering::Relaxed), 9);
        c.calc_block(&vars, &[0, 0], &[0, 3], 0).expect("empty");
        assert_eq!(c.hits.load(Ordering::Relaxed), 9);
    }
}

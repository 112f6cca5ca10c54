// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Shared Test Stencils
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Small hand-written stencils standing in for compiler output.
#![allow(dead_code)]

use std::sync::Arc;

use stencil_comm::{NullTransport, Transport};
use stencil_core::bundle::{Bundle, EvalVars, StencilProgram, StepUse};
use stencil_core::context::SolverContext;
use stencil_core::var::{VarId, VarSpec};
use stencil_types::dims::Dims;
use stencil_types::error::StencilResult;
use stencil_types::settings::SolverSettings;

/// 1-D three-point diffusion:
/// u[t+1, x] = 0.25 u[t, x-1] + 0.5 u[t, x] + 0.25 u[t, x+1].
pub struct Diffusion1D {
    pub u: VarId,
}

impl Bundle for Diffusion1D {
    fn name(&self) -> &str {
        "diffusion_1d"
    }
    fn inputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn outputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn output_step_index(&self, t: i64) -> Option<i64> {
        Some(t + 1)
    }
    fn step_uses(&self, var: VarId) -> Vec<StepUse> {
        if var != self.u {
            return Vec::new();
        }
        vec![
            StepUse {
                step_ofs: 0,
                max_halo: 1,
                is_write: false,
            },
            StepUse {
                step_ofs: 1,
                max_halo: 0,
                is_write: true,
            },
        ]
    }
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()> {
        let u = vars.var(self.u);
        let x = pt[0];
        let v = 0.25 * u.read_elem(&[t, x - 1])?
            + 0.5 * u.read_elem(&[t, x])?
            + 0.25 * u.read_elem(&[t, x + 1])?;
        u.set_element(v, &[t + 1, x], true)?;
        Ok(())
    }
    fn est_reads_per_point(&self) -> i64 {
        3
    }
    fn est_fp_ops_per_point(&self) -> i64 {
        5
    }
}

/// 2-D five-point mean: u[t+1] = (c + n + s + e + w) / 5.
pub struct FivePoint2D {
    pub u: VarId,
}

impl Bundle for FivePoint2D {
    fn name(&self) -> &str {
        "five_point"
    }
    fn inputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn outputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn output_step_index(&self, t: i64) -> Option<i64> {
        Some(t + 1)
    }
    fn step_uses(&self, var: VarId) -> Vec<StepUse> {
        if var != self.u {
            return Vec::new();
        }
        vec![
            StepUse {
                step_ofs: 0,
                max_halo: 1,
                is_write: false,
            },
            StepUse {
                step_ofs: 1,
                max_halo: 0,
                is_write: true,
            },
        ]
    }
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()> {
        let u = vars.var(self.u);
        let (x, y) = (pt[0], pt[1]);
        let v = (u.read_elem(&[t, x, y])?
            + u.read_elem(&[t, x - 1, y])?
            + u.read_elem(&[t, x + 1, y])?
            + u.read_elem(&[t, x, y - 1])?
            + u.read_elem(&[t, x, y + 1])?)
            / 5.0;
        u.set_element(v, &[t + 1, x, y], true)?;
        Ok(())
    }
    fn est_reads_per_point(&self) -> i64 {
        5
    }
    fn est_fp_ops_per_point(&self) -> i64 {
        5
    }
}

/// 2-D nine-point weighted average over the full 3x3 neighborhood.
pub struct NinePoint2D {
    pub u: VarId,
}

impl Bundle for NinePoint2D {
    fn name(&self) -> &str {
        "nine_point"
    }
    fn inputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn outputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn output_step_index(&self, t: i64) -> Option<i64> {
        Some(t + 1)
    }
    fn step_uses(&self, var: VarId) -> Vec<StepUse> {
        if var != self.u {
            return Vec::new();
        }
        vec![
            StepUse {
                step_ofs: 0,
                max_halo: 1,
                is_write: false,
            },
            StepUse {
                step_ofs: 1,
                max_halo: 0,
                is_write: true,
            },
        ]
    }
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()> {
        let u = vars.var(self.u);
        let (x, y) = (pt[0], pt[1]);
        let mut acc = 0.0;
        for dx in -1..=1 {
            for dy in -1..=1 {
                let w = if dx == 0 && dy == 0 {
                    0.5
                } else if dx == 0 || dy == 0 {
                    0.1
                } else {
                    0.025
                };
                acc += w * u.read_elem(&[t, x + dx, y + dy])?;
            }
        }
        u.set_element(acc, &[t + 1, x, y], true)?;
        Ok(())
    }
    fn est_reads_per_point(&self) -> i64 {
        9
    }
    fn est_fp_ops_per_point(&self) -> i64 {
        17
    }
}

/// Scratch producer: s[x] = 2 u[t, x].
pub struct ScratchDouble {
    pub u: VarId,
    pub s: VarId,
}

impl Bundle for ScratchDouble {
    fn name(&self) -> &str {
        "scratch_double"
    }
    fn is_scratch(&self) -> bool {
        true
    }
    fn inputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn outputs(&self) -> Vec<VarId> {
        vec![self.s]
    }
    fn output_step_index(&self, t: i64) -> Option<i64> {
        Some(t)
    }
    fn step_uses(&self, var: VarId) -> Vec<StepUse> {
        if var == self.u {
            // The producer runs over the consumer's span expanded by
            // the scratch halo, so its input carries that halo.
            vec![StepUse {
                step_ofs: 0,
                max_halo: 1,
                is_write: false,
            }]
        } else {
            Vec::new()
        }
    }
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()> {
        let u = vars.var(self.u);
        let s = vars.var(self.s);
        let v = 2.0 * u.read_elem(&[t, pt[0]])?;
        s.set_element(v, &[pt[0]], true)?;
        Ok(())
    }
}

/// Scratch consumer: u[t+1, x] = s[x-1] + s[x] + s[x+1].
pub struct ScratchSum {
    pub u: VarId,
    pub s: VarId,
    pub producer: usize,
}

impl Bundle for ScratchSum {
    fn name(&self) -> &str {
        "scratch_sum"
    }
    fn inputs(&self) -> Vec<VarId> {
        vec![self.s]
    }
    fn outputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn required_scratch(&self) -> Vec<usize> {
        vec![self.producer]
    }
    fn output_step_index(&self, t: i64) -> Option<i64> {
        Some(t + 1)
    }
    fn step_uses(&self, var: VarId) -> Vec<StepUse> {
        if var == self.u {
            vec![StepUse {
                step_ofs: 1,
                max_halo: 0,
                is_write: true,
            }]
        } else {
            Vec::new()
        }
    }
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()> {
        let u = vars.var(self.u);
        let s = vars.var(self.s);
        let x = pt[0];
        let v = s.read_elem(&[x - 1])? + s.read_elem(&[x])? + s.read_elem(&[x + 1])?;
        u.set_element(v, &[t + 1, x], true)?;
        Ok(())
    }
}

/// Five-point mean restricted to a disc.
pub struct DiscFivePoint {
    pub u: VarId,
    pub center: (i64, i64),
    pub radius_sq: i64,
}

impl Bundle for DiscFivePoint {
    fn name(&self) -> &str {
        "disc_five_point"
    }
    fn inputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn outputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn has_sub_domain(&self) -> bool {
        true
    }
    fn in_valid_domain(&self, pt: &[i64]) -> bool {
        let dx = pt[0] - self.center.0;
        let dy = pt[1] - self.center.1;
        dx * dx + dy * dy <= self.radius_sq
    }
    fn output_step_index(&self, t: i64) -> Option<i64> {
        Some(t + 1)
    }
    fn step_uses(&self, var: VarId) -> Vec<StepUse> {
        if var != self.u {
            return Vec::new();
        }
        vec![
            StepUse {
                step_ofs: 0,
                max_halo: 1,
                is_write: false,
            },
            StepUse {
                step_ofs: 1,
                max_halo: 0,
                is_write: true,
            },
        ]
    }
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()> {
        let u = vars.var(self.u);
        let (x, y) = (pt[0], pt[1]);
        let v = (u.read_elem(&[t, x, y])?
            + u.read_elem(&[t, x - 1, y])?
            + u.read_elem(&[t, x + 1, y])?
            + u.read_elem(&[t, x, y - 1])?
            + u.read_elem(&[t, x, y + 1])?)
            / 5.0;
        u.set_element(v, &[t + 1, x, y], true)?;
        Ok(())
    }
}

/// Copy stencil that records every point it writes, for checking that
/// no point is evaluated twice per (pack, step).
pub struct CountingCopy {
    pub u: VarId,
    pub hits: Arc<std::sync::Mutex<std::collections::HashMap<(i64, Vec<i64>), u32>>>,
}

impl Bundle for CountingCopy {
    fn name(&self) -> &str {
        "counting_copy"
    }
    fn inputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn outputs(&self) -> Vec<VarId> {
        vec![self.u]
    }
    fn output_step_index(&self, t: i64) -> Option<i64> {
        Some(t + 1)
    }
    fn step_uses(&self, var: VarId) -> Vec<StepUse> {
        if var != self.u {
            return Vec::new();
        }
        vec![
            StepUse {
                step_ofs: 0,
                max_halo: 1,
                is_write: false,
            },
            StepUse {
                step_ofs: 1,
                max_halo: 0,
                is_write: true,
            },
        ]
    }
    fn calc_point(&self, vars: &EvalVars, pt: &[i64], t: i64) -> StencilResult<()> {
        let u = vars.var(self.u);
        let v = u.read_elem(&[t, pt[0]])? + 1.0;
        u.set_element(v, &[t + 1, pt[0]], true)?;
        let mut hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        *hits.entry((t, pt.to_vec())).or_insert(0) += 1;
        Ok(())
    }
}

// ── Program builders ─────────────────────────────────────────────────

pub fn diffusion_1d_program() -> (StencilProgram, VarId) {
    let dims = Dims::simple("t", &["x"]).expect("dims");
    let mut prog = StencilProgram::new(dims.clone());
    let u = prog.add_var(
        VarSpec::new("u", &["t", "x"], &dims)
            .expect("spec")
            .halo("x", 1, 1),
    );
    let b = prog.add_bundle(Arc::new(Diffusion1D { u }));
    prog.add_pack("main", vec![b]);
    (prog, u)
}

pub fn five_point_2d_program() -> (StencilProgram, VarId) {
    let dims = Dims::simple("t", &["x", "y"]).expect("dims");
    let mut prog = StencilProgram::new(dims.clone());
    let u = prog.add_var(
        VarSpec::new("u", &["t", "x", "y"], &dims)
            .expect("spec")
            .halo("x", 1, 1)
            .halo("y", 1, 1),
    );
    let b = prog.add_bundle(Arc::new(FivePoint2D { u }));
    prog.add_pack("main", vec![b]);
    (prog, u)
}

pub fn nine_point_2d_program() -> (StencilProgram, VarId) {
    let dims = Dims::simple("t", &["x", "y"]).expect("dims");
    let mut prog = StencilProgram::new(dims.clone());
    let u = prog.add_var(
        VarSpec::new("u", &["t", "x", "y"], &dims)
            .expect("spec")
            .halo("x", 1, 1)
            .halo("y", 1, 1),
    );
    let b = prog.add_bundle(Arc::new(NinePoint2D { u }));
    prog.add_pack("main", vec![b]);
    (prog, u)
}

pub fn scratch_program() -> (StencilProgram, VarId, VarId) {
    let dims = Dims::simple("t", &["x"]).expect("dims");
    let mut prog = StencilProgram::new(dims.clone());
    let u = prog.add_var(
        VarSpec::new("u", &["t", "x"], &dims)
            .expect("spec")
            .halo("x", 1, 1),
    );
    let s = prog.add_var(
        VarSpec::new("s", &["x"], &dims)
            .expect("spec")
            .halo("x", 1, 1)
            .scratch(),
    );
    let a = prog.add_bundle(Arc::new(ScratchDouble { u, s }));
    let b = prog.add_bundle(Arc::new(ScratchSum { u, s, producer: a }));
    prog.add_pack("main", vec![b]);
    (prog, u, s)
}

// ── Context helpers ──────────────────────────────────────────────────

static TRACING: std::sync::Once = std::sync::Once::new();

/// Route engine tracing to the test output; warnings and up only.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

pub fn single_rank_settings(dims: &Dims, rank_sizes: &[i64]) -> SolverSettings {
    let mut s = SolverSettings::new(dims);
    s.rank_sizes.set_vals(rank_sizes);
    s
}

pub fn make_context(
    prog: StencilProgram,
    settings: SolverSettings,
) -> StencilResult<SolverContext> {
    init_tracing();
    let env: Arc<dyn Transport> = Arc::new(NullTransport);
    let mut ctx = SolverContext::new(prog, settings, env)?;
    ctx.prepare()?;
    Ok(ctx)
}

/// Write `vals` into the var at step `t` over the 1-D rank span
/// starting at `x0`.
pub fn set_line(ctx: &SolverContext, u: VarId, t: i64, x0: i64, vals: &[f64]) {
    let var = ctx.var(u).expect("var");
    var.set_elements_in_slice(vals, &[t, x0], &[t, x0 + vals.len() as i64 - 1])
        .expect("set slice");
}

/// Read the var at step `t` over the 1-D span `[x0, x0+n)`.
pub fn get_line(ctx: &SolverContext, u: VarId, t: i64, x0: i64, n: usize) -> Vec<f64> {
    let var = ctx.var(u).expect("var");
    let mut out = vec![0.0; n];
    var.get_elements_in_slice(&mut out, &[t, x0], &[t, x0 + n as i64 - 1])
        .expect("get slice");
    out
}

/// Assert two runs produced bitwise-equal lines.
pub fn assert_bits_equal(a: &[f64], b: &[f64], what: &str) {
    assert_eq!(a.len(), b.len(), "{what}: length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert_eq!(
            x.to_bits(),
            y.to_bits(),
            "{what}: mismatch at {i}: {x} vs {y}"
        );
    }
}

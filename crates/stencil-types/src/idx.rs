// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Index Algebra
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Named-dimension integer tuples and the integer helpers the tile
//! arithmetic is built on.
//!
//! Layout and unlayout are row-major by declaration order (first dim
//! slowest). `round_down_flr` floors toward -inf, which is load-bearing
//! for vec-aligned begin points of exchange buffers at negative indices.

use crate::error::{StencilError, StencilResult};
use serde::{Deserialize, Serialize};

/// Ceiling division for non-negative operands.
#[inline]
pub fn ceil_div(numer: i64, denom: i64) -> i64 {
    debug_assert!(numer >= 0 && denom > 0);
    (numer + denom - 1) / denom
}

/// Round `n` up to the next multiple of `mult` (non-negative `n`).
#[inline]
pub fn round_up(n: i64, mult: i64) -> i64 {
    ceil_div(n, mult) * mult
}

/// Round `n` down to a multiple of `mult`, flooring toward -inf.
#[inline]
pub fn round_down_flr(n: i64, mult: i64) -> i64 {
    debug_assert!(mult > 0);
    n.div_euclid(mult) * mult
}

/// Round `n` up to a multiple of `mult`, valid for negative `n` as well.
#[inline]
pub fn round_up_flr(n: i64, mult: i64) -> i64 {
    let d = round_down_flr(n, mult);
    if d == n {
        n
    } else {
        d + mult
    }
}

/// Non-negative remainder of `n` modulo `mult`.
#[inline]
pub fn imod_flr(n: i64, mult: i64) -> i64 {
    n.rem_euclid(mult)
}

/// Size of part `n` when dividing `num` items into `nparts` as equally
/// as possible; the first `num % nparts` parts get one extra item.
///
/// div_equally_size_n(6, 4, 0..3) -> 2, 2, 1, 1.
#[inline]
pub fn div_equally_size_n(num: i64, nparts: i64, n: i64) -> i64 {
    debug_assert!(nparts > 0 && n >= 0 && n < nparts);
    let mut p = num / nparts;
    if n < num % nparts {
        p += 1;
    }
    p
}

/// Cumulative size of parts `0..=n`; `n == -1` returns 0, handy for the
/// starting offset of part 0.
///
/// div_equally_cumu_size_n(6, 4, -1..3) -> 0, 2, 4, 5, 6.
#[inline]
pub fn div_equally_cumu_size_n(num: i64, nparts: i64, n: i64) -> i64 {
    if n < 0 {
        return 0;
    }
    debug_assert!(nparts > 0 && n < nparts);
    let mut p = (num / nparts) * (n + 1);
    let rem = num % nparts;
    p += if n < rem { n + 1 } else { rem };
    p
}

/// An ordered sequence of named integer values with unique names.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdxTuple {
    dims: Vec<(String, i64)>,
}

impl IdxTuple {
    pub fn new() -> Self {
        IdxTuple { dims: Vec::new() }
    }

    /// Build a tuple from names, all values zero.
    pub fn with_names<S: AsRef<str>>(names: &[S]) -> Self {
        IdxTuple {
            dims: names
                .iter()
                .map(|n| (n.as_ref().to_string(), 0))
                .collect(),
        }
    }

    /// Build a tuple from (name, value) pairs.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[(S, i64)]) -> Self {
        IdxTuple {
            dims: pairs
                .iter()
                .map(|(n, v)| (n.as_ref().to_string(), *v))
                .collect(),
        }
    }

    pub fn add_dim_back(&mut self, name: &str, val: i64) -> StencilResult<()> {
        if self.lookup_posn(name).is_some() {
            return Err(StencilError::Config(format!(
                "duplicate dim '{name}' in tuple"
            )));
        }
        self.dims.push((name.to_string(), val));
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    #[inline]
    pub fn name(&self, posn: usize) -> &str {
        &self.dims[posn].0
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dims.iter().map(|(n, _)| n.as_str())
    }

    #[inline]
    pub fn val(&self, posn: usize) -> i64 {
        self.dims[posn].1
    }

    #[inline]
    pub fn set_val(&mut self, posn: usize, v: i64) {
        self.dims[posn].1 = v;
    }

    pub fn vals(&self) -> Vec<i64> {
        self.dims.iter().map(|(_, v)| *v).collect()
    }

    pub fn set_vals(&mut self, vals: &[i64]) {
        debug_assert_eq!(vals.len(), self.dims.len());
        for (d, v) in self.dims.iter_mut().zip(vals) {
            d.1 = *v;
        }
    }

    pub fn set_vals_same(&mut self, v: i64) {
        for d in self.dims.iter_mut() {
            d.1 = v;
        }
    }

    pub fn lookup_posn(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|(n, _)| n == name)
    }

    pub fn lookup(&self, name: &str) -> Option<i64> {
        self.dims
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Value by name; configuration error if the dim is unknown.
    pub fn get(&self, name: &str) -> StencilResult<i64> {
        self.lookup(name).ok_or_else(|| {
            StencilError::Config(format!("unknown dim '{name}' in tuple"))
        })
    }

    pub fn set(&mut self, name: &str, v: i64) -> StencilResult<()> {
        match self.lookup_posn(name) {
            Some(p) => {
                self.dims[p].1 = v;
                Ok(())
            }
            None => Err(StencilError::Config(format!(
                "unknown dim '{name}' in tuple"
            ))),
        }
    }

    fn zip_map(&self, other: &IdxTuple, f: impl Fn(i64, i64) -> i64) -> IdxTuple {
        debug_assert_eq!(self.len(), other.len());
        IdxTuple {
            dims: self
                .dims
                .iter()
                .zip(other.dims.iter())
                .map(|((n, a), (_, b))| (n.clone(), f(*a, *b)))
                .collect(),
        }
    }

    pub fn add_elements(&self, other: &IdxTuple) -> IdxTuple {
        self.zip_map(other, |a, b| a + b)
    }

    pub fn sub_elements(&self, other: &IdxTuple) -> IdxTuple {
        self.zip_map(other, |a, b| a - b)
    }

    pub fn min_elements(&self, other: &IdxTuple) -> IdxTuple {
        self.zip_map(other, i64::min)
    }

    pub fn max_elements(&self, other: &IdxTuple) -> IdxTuple {
        self.zip_map(other, i64::max)
    }

    pub fn mul_elements(&self, other: &IdxTuple) -> IdxTuple {
        self.zip_map(other, |a, b| a * b)
    }

    pub fn map_elements(&self, f: impl Fn(i64) -> i64) -> IdxTuple {
        IdxTuple {
            dims: self.dims.iter().map(|(n, v)| (n.clone(), f(*v))).collect(),
        }
    }

    /// Per-dim `round_up` against a tuple of multiples.
    pub fn round_up_elements(&self, mults: &IdxTuple) -> IdxTuple {
        self.zip_map(mults, round_up)
    }

    /// Per-dim floor rounding against a tuple of multiples.
    pub fn round_down_flr_elements(&self, mults: &IdxTuple) -> IdxTuple {
        self.zip_map(mults, round_down_flr)
    }

    pub fn product(&self) -> i64 {
        self.dims.iter().map(|(_, v)| *v).product()
    }

    pub fn min_val(&self) -> i64 {
        self.dims.iter().map(|(_, v)| *v).min().unwrap_or(0)
    }

    pub fn max_val(&self) -> i64 {
        self.dims.iter().map(|(_, v)| *v).max().unwrap_or(0)
    }

    /// Linearize a point (given as values of this tuple's dims) against
    /// this tuple's values treated as sizes. Row-major: first dim slowest.
    pub fn layout(&self, point: &[i64]) -> i64 {
        debug_assert_eq!(point.len(), self.dims.len());
        let mut idx = 0i64;
        for (p, (_, sz)) in point.iter().zip(self.dims.iter()) {
            debug_assert!(*p >= 0 && p < sz);
            idx = idx * sz + p;
        }
        idx
    }

    /// Inverse of [`IdxTuple::layout`]: delinearize `idx` into a point.
    pub fn unlayout(&self, idx: i64) -> Vec<i64> {
        let n = self.dims.len();
        let mut point = vec![0i64; n];
        let mut rem = idx;
        for i in (0..n).rev() {
            let sz = self.dims[i].1;
            debug_assert!(sz > 0);
            point[i] = rem % sz;
            rem /= sz;
        }
        point
    }

    /// Visit every point of the Cartesian product of `[0, size)` per dim
    /// in layout order, calling `f(point, linear_index)`. Stops early when
    /// `f` returns false. Returns false iff stopped early.
    pub fn visit_all_points(&self, mut f: impl FnMut(&[i64], i64) -> bool) -> bool {
        let n = self.dims.len();
        if self.dims.iter().any(|(_, sz)| *sz <= 0) {
            return true;
        }
        let mut point = vec![0i64; n];
        let mut linear = 0i64;
        loop {
            if !f(&point, linear) {
                return false;
            }
            linear += 1;
            // Odometer increment, last dim fastest.
            let mut i = n;
            loop {
                if i == 0 {
                    return true;
                }
                i -= 1;
                point[i] += 1;
                if point[i] < self.dims[i].1 {
                    break;
                }
                point[i] = 0;
            }
        }
    }

    pub fn make_dim_val_str(&self, sep: &str) -> String {
        self.dims
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(sep)
    }
}

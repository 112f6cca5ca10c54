// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Dims
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Dimension declarations for a solution: exactly one step dim, any
//! number of domain dims (what tiles cover), and misc dims (non-tiled
//! enumerations). Frozen before the run loop.

use crate::error::{StencilError, StencilResult};
use crate::idx::IdxTuple;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DimType {
    Step,
    Domain,
    Misc,
}

#[derive(Clone, Debug)]
pub struct DimDef {
    pub name: String,
    pub dim_type: DimType,
}

/// The declared dims of a solution plus the fold (vector length per
/// domain dim) and cluster (unroll factor per domain dim) tuples.
#[derive(Clone, Debug)]
pub struct Dims {
    pub step_dim: String,
    pub domain_dims: Vec<String>,
    pub misc_dims: Vec<String>,
    pub fold: IdxTuple,
    pub cluster: IdxTuple,
}

impl Dims {
    /// Validate and assemble the dim declarations. `fold` and `cluster`
    /// must name exactly the domain dims; entries < 1 are rejected.
    pub fn new(decls: &[DimDef], fold: IdxTuple, cluster: IdxTuple) -> StencilResult<Self> {
        let mut step = None;
        let mut domain = Vec::new();
        let mut misc = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for d in decls {
            if !seen.insert(d.name.clone()) {
                return Err(StencilError::Config(format!(
                    "dim '{}' declared more than once",
                    d.name
                )));
            }
            match d.dim_type {
                DimType::Step => {
                    if step.is_some() {
                        return Err(StencilError::Config(
                            "more than one step dim declared".to_string(),
                        ));
                    }
                    step = Some(d.name.clone());
                }
                DimType::Domain => domain.push(d.name.clone()),
                DimType::Misc => misc.push(d.name.clone()),
            }
        }
        let step_dim = step.ok_or_else(|| {
            StencilError::Config("exactly one step dim is required".to_string())
        })?;
        if domain.is_empty() {
            return Err(StencilError::Config(
                "at least one domain dim is required".to_string(),
            ));
        }
        for (tuple, what) in [(&fold, "fold"), (&cluster, "cluster")] {
            if tuple.len() != domain.len() {
                return Err(StencilError::Config(format!(
                    "{what} tuple must cover every domain dim"
                )));
            }
            for d in &domain {
                match tuple.lookup(d) {
                    Some(v) if v >= 1 => {}
                    Some(v) => {
                        return Err(StencilError::Config(format!(
                            "{what} length for dim '{d}' must be >= 1, got {v}"
                        )))
                    }
                    None => {
                        return Err(StencilError::Config(format!(
                            "{what} tuple is missing domain dim '{d}'"
                        )))
                    }
                }
            }
        }
        Ok(Dims {
            step_dim,
            domain_dims: domain,
            misc_dims: misc,
            fold,
            cluster,
        })
    }

    /// Convenience constructor: fold and cluster all ones.
    pub fn simple(step: &str, domain: &[&str]) -> StencilResult<Self> {
        let mut decls = vec![DimDef {
            name: step.to_string(),
            dim_type: DimType::Step,
        }];
        for d in domain {
            decls.push(DimDef {
                name: d.to_string(),
                dim_type: DimType::Domain,
            });
        }
        let mut ones = IdxTuple::with_names(domain);
        ones.set_vals_same(1);
        Dims::new(&decls, ones.clone(), ones)
    }

    #[inline]
    pub fn num_domain_dims(&self) -> usize {
        self.domain_dims.len()
    }

    pub fn domain_posn(&self, name: &str) -> Option<usize> {
        self.domain_dims.iter().position(|d| d == name)
    }

    /// A zeroed tuple over the domain dims.
    pub fn domain_tuple(&self) -> IdxTuple {
        IdxTuple::with_names(&self.domain_dims)
    }

    pub fn fold_val(&self, posn: usize) -> i64 {
        self.fold.val(posn)
    }

    pub fn cluster_val(&self, posn: usize) -> i64 {
        self.cluster.val(posn)
    }
}

// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Stencil Core
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Execution engine: var store, bounding boxes, rank geometry, halo
//! exchange, the nested tile scheduler, and the top-level run loop.

pub mod autotune;
pub mod bbox;
pub mod bundle;
pub mod context;
pub mod geometry;
pub mod halo;
pub mod parallel;
pub mod stats;
pub mod var;

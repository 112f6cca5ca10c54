// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Stencil Types
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Shared leaf types for the stencil engine: dimension declarations,
//! named-tuple index algebra, solver settings, and the error taxonomy.

pub mod dims;
pub mod error;
pub mod idx;
pub mod settings;

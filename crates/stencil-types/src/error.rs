// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Error
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StencilError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Index out of range in var '{var}': {message}")]
    IndexOutOfRange { var: String, message: String },

    #[error("Step {step} is not currently allocated in the ring of var '{var}'")]
    StaleStep { var: String, step: i64 },

    #[error("Allocation failure: {0}")]
    Allocation(String),

    #[error("Messaging failure: {0}")]
    Messaging(String),

    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StencilResult<T> = Result<T, StencilError>;

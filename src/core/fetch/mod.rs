// src/core/fetch/mod.rs

//! The backend fetch pipeline: the VFP filter chain (C4), conditional
//! refresh (C5), the VBF state machine (C6), and the entry point (C8)
//! that ties them together for a caller outside this module.

pub mod condfetch;
pub mod entry;
pub mod filters;
pub mod state_machine;

pub use entry::{backend_fetch, FetchCollaborators, FetchMode};
pub use state_machine::{FetchContext, FetchOutcome};

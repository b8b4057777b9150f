//! Configuration of a coverage evaluator and the names of its shared regions.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Env var the target reads the edge region name from
pub const SHM_ID_ENV: &str = "SHM_ID";
/// Env var the target reads the IR region name from
pub const SHM_ID3_ENV: &str = "SHM_ID3";
/// Env var the target reads the line region name from
pub const SHM_ID4_ENV: &str = "SHM_ID4";

/// How often an edge may be forgotten before it is considered non-deterministic.
pub const DEFAULT_MAX_RESET_COUNT: u64 = 1000;

/// Options for a [`crate::evaluator::ProgramCoverageEvaluator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct CoverageOptions {
    /// Distinguishes the regions of several evaluators in one process
    #[builder(default = 0_u32)]
    pub context_id: u32,
    /// Count hits per edge. Costs a second pass over the bitmap on every evaluation.
    #[builder(default = false)]
    pub track_edges: bool,
    /// Resets of a single edge above this limit are ignored, and the edge drops out of hit counts
    #[builder(default = DEFAULT_MAX_RESET_COUNT)]
    pub max_reset_count: u64,
}

impl Default for CoverageOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The names of the edge, IR and line regions for `context_id` in process `pid`.
#[must_use]
pub fn region_names(pid: u32, context_id: u32) -> [String; 3] {
    let base = format!("shm_id_{pid}_{context_id}");
    [base.clone(), format!("{base}_3"), format!("{base}_4")]
}

//! Run specification and identity.

use quayside_core::{StageKind, StagePlan, TriggerEvent};
use quayside_state::ContentDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What a run will do, fixed before any stage starts.
///
/// Its digest links runs of the same commit, event and plan in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    pub pipeline: String,

    pub commit_sha: String,

    pub event: TriggerEvent,

    pub planned: Vec<StageKind>,

    /// Build matrix platforms, in configured order.
    pub platforms: Vec<String>,

    /// SHA-256 over the planned stage names (ordered).
    pub stages_digest: String,
}

impl RunSpec {
    pub fn new(
        pipeline: impl Into<String>,
        commit_sha: impl Into<String>,
        event: TriggerEvent,
        plan: &StagePlan,
        platforms: &[String],
    ) -> Self {
        let names: Vec<&str> = plan.planned.iter().map(|s| s.name()).collect();
        Self {
            pipeline: pipeline.into(),
            commit_sha: commit_sha.into(),
            event,
            planned: plan.planned.clone(),
            platforms: platforms.to_vec(),
            stages_digest: compute_stages_digest(&names),
        }
    }

    /// Deterministic digest of the whole spec.
    pub fn digest(&self) -> ContentDigest {
        let event = self.event.to_string();
        let mut hasher = Sha256::new();
        for part in [
            self.pipeline.as_str(),
            self.commit_sha.as_str(),
            event.as_str(),
            self.stages_digest.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"\0");
        }
        for platform in &self.platforms {
            hasher.update(platform.as_bytes());
            hasher.update(b"\0");
        }
        ContentDigest::from_bytes(&hasher.finalize())
    }
}

/// Compute deterministic digest of ordered stage names.
fn compute_stages_digest(stages: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for stage in stages {
        hasher.update(stage.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

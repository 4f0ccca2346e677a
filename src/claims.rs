//! Per-project feature claim table: `featureId -> agentIndex`. The orchestrator
//! keeps one of these per running project; it is the authoritative
//! in-progress signal even though `feature_list.json`'s `inProgress` flag is
//! mirrored best-effort for external readers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::persistence::{Feature, FeatureList};

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("no claimable feature available")]
    NoneAvailable,
    #[error("feature {0} is already claimed")]
    AlreadyClaimed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedFeature {
    pub id: String,
    pub description: String,
    pub steps: Vec<String>,
}

impl From<&Feature> for ClaimedFeature {
    fn from(f: &Feature) -> Self {
        Self { id: f.id.clone(), description: f.description.clone(), steps: f.steps.clone() }
    }
}

/// Mutex-guarded claim map. A single mutex around lookup+insert is
/// sufficient because the orchestrator is process-local per project.
#[derive(Debug, Default)]
pub struct ClaimTable {
    inner: Mutex<BTreeMap<String, u32>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the first feature with `passes=false` and no existing claim,
    /// atomically inserting the claim before returning it.
    pub fn claim(&self, features: &FeatureList, agent_index: u32) -> Result<ClaimedFeature, ClaimError> {
        let mut claims = self.inner.lock().unwrap();
        let feature = features
            .features
            .iter()
            .find(|f| !f.passes && !claims.contains_key(&f.id))
            .ok_or(ClaimError::NoneAvailable)?;
        claims.insert(feature.id.clone(), agent_index);
        Ok(ClaimedFeature::from(feature))
    }

    /// Idempotent: releasing an unclaimed id is not an error.
    pub fn release(&self, feature_id: &str) {
        self.inner.lock().unwrap().remove(feature_id);
    }

    pub fn is_claimed(&self, feature_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(feature_id)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.inner.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

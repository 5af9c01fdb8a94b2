//! Importance-based tier routing.
//!
//! New entries are placed by an ordered table of `(lower_bound, stage)`
//! pairs. A score belongs to the last row whose lower bound it reaches, so
//! every boundary is inclusive on the upper tier.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::Stage;
use crate::memory::types::clamp_importance;

/// Default cut-points for working, episodic, semantic and persistent.
pub const DEFAULT_THRESHOLDS: [f64; 4] = [0.0, 0.3, 0.6, 0.9];

/// One row of the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub lower_bound: f64,
    pub stage: Stage,
}

/// Ordered routing table, lowest bound first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    /// Build a table from four cut-points mapped to the stages in rank order.
    ///
    /// The first cut-point must be 0.0 and the sequence strictly increasing
    /// within [0.0, 1.0].
    pub fn from_thresholds(thresholds: &[f64]) -> Result<Self> {
        if thresholds.len() != Stage::ALL.len() {
            return Err(Error::Config(format!(
                "routing.thresholds needs {} cut-points, got {}",
                Stage::ALL.len(),
                thresholds.len()
            )));
        }
        if thresholds[0] != 0.0 {
            return Err(Error::Config(format!(
                "routing.thresholds must start at 0.0, got {}",
                thresholds[0]
            )));
        }
        for pair in thresholds.windows(2) {
            if !(pair[1] > pair[0]) || pair[1] > 1.0 {
                return Err(Error::Config(format!(
                    "routing.thresholds must be strictly increasing within [0, 1]: {:?}",
                    thresholds
                )));
            }
        }

        let routes = thresholds
            .iter()
            .zip(Stage::ALL)
            .map(|(&lower_bound, stage)| Route { lower_bound, stage })
            .collect();
        Ok(Self { routes })
    }

    /// Stage for an importance score. Out-of-range scores are clamped first.
    pub fn route(&self, importance: f64) -> Stage {
        let importance = clamp_importance(importance);
        self.routes
            .iter()
            .rev()
            .find(|r| importance >= r.lower_bound)
            .map(|r| r.stage)
            .unwrap_or(Stage::Working)
    }

    /// Inclusive lower bound for a stage.
    pub fn lower_bound(&self, stage: Stage) -> f64 {
        self.routes
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.lower_bound)
            .unwrap_or(0.0)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            routes: DEFAULT_THRESHOLDS
                .iter()
                .zip(Stage::ALL)
                .map(|(&lower_bound, stage)| Route { lower_bound, stage })
                .collect(),
        }
    }
}

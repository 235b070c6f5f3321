//! Configuration surface exposed by the driver loop (spec.md §6).

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Per-factor multipliers for the assignment scorer (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub workload: f64,
    pub error_history: f64,
    pub context_headroom: f64,
    pub cost_efficiency: f64,
    pub capability_match: f64,
    pub role_match: f64,
    pub repo_familiarity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            workload: 1.0,
            error_history: 1.0,
            context_headroom: 0.5,
            cost_efficiency: 0.3,
            capability_match: 1.0,
            role_match: 0.8,
            repo_familiarity: 0.7,
        }
    }
}

/// Full orchestrator configuration. Built with the `typed_builder`-derived
/// builder; every key defaults to the value spec.md §6's table prescribes.
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[builder(default = 5_000)]
    pub cycle_interval_ms: u64,
    #[builder(default = 10)]
    pub max_global_workers: u32,
    #[builder(default = 3)]
    pub max_workers_per_repo: u32,
    #[builder(default = 5)]
    pub max_workers_per_user: u32,
    #[builder(default = 3)]
    pub max_retry_attempts: u32,
    #[builder(default = 1_000)]
    pub retry_base_delay_ms: u64,
    #[builder(default = 60_000)]
    pub retry_max_delay_ms: u64,
    #[builder(default = false)]
    pub auto_spawn_workers: bool,
    #[builder(default, setter(strip_option))]
    pub default_template_id: Option<String>,
    #[builder(default)]
    pub scoring_weights: ScoringWeights,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig::builder().build()
    }
}

/// A partial update to [`OrchestratorConfig`]. Only `Some` fields replace the
/// corresponding current value (`updateConfig`'s merge semantics, spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialOrchestratorConfig {
    pub cycle_interval_ms: Option<u64>,
    pub max_global_workers: Option<u32>,
    pub max_workers_per_repo: Option<u32>,
    pub max_workers_per_user: Option<u32>,
    pub max_retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub auto_spawn_workers: Option<bool>,
    pub default_template_id: Option<Option<String>>,
    pub scoring_weights: Option<ScoringWeights>,
}

impl OrchestratorConfig {
    /// Applies a partial update in place, replacing only fields present.
    pub fn apply(&mut self, patch: PartialOrchestratorConfig) {
        if let Some(v) = patch.cycle_interval_ms {
            self.cycle_interval_ms = v;
        }
        if let Some(v) = patch.max_global_workers {
            self.max_global_workers = v;
        }
        if let Some(v) = patch.max_workers_per_repo {
            self.max_workers_per_repo = v;
        }
        if let Some(v) = patch.max_workers_per_user {
            self.max_workers_per_user = v;
        }
        if let Some(v) = patch.max_retry_attempts {
            self.max_retry_attempts = v;
        }
        if let Some(v) = patch.retry_base_delay_ms {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = patch.retry_max_delay_ms {
            self.retry_max_delay_ms = v;
        }
        if let Some(v) = patch.auto_spawn_workers {
            self.auto_spawn_workers = v;
        }
        if let Some(v) = patch.default_template_id {
            self.default_template_id = v;
        }
        if let Some(v) = patch.scoring_weights {
            self.scoring_weights = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.cycle_interval_ms, 5_000);
        assert_eq!(cfg.max_global_workers, 10);
        assert_eq!(cfg.max_workers_per_repo, 3);
        assert_eq!(cfg.max_workers_per_user, 5);
        assert_eq!(cfg.max_retry_attempts, 3);
        assert_eq!(cfg.retry_base_delay_ms, 1_000);
        assert_eq!(cfg.retry_max_delay_ms, 60_000);
        assert!(!cfg.auto_spawn_workers);
        assert!(cfg.default_template_id.is_none());
    }

    #[test]
    fn apply_only_replaces_present_fields() {
        let mut cfg = OrchestratorConfig::default();
        cfg.apply(PartialOrchestratorConfig {
            max_global_workers: Some(20),
            ..Default::default()
        });
        assert_eq!(cfg.max_global_workers, 20);
        assert_eq!(cfg.cycle_interval_ms, 5_000);
    }
}

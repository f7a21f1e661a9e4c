//! Per-run outcome report

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::driver::ApplyError;
use crate::domain::{ChangeSummary, Generation, RunId, StackName, StackStatus};
use crate::storage::HistoryEntry;

fn serialize_display<S: Serializer>(error: &ApplyError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// What happened to one stack during a run
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StackOutcome {
    /// Engine applied changes and outputs were published
    Applied {
        generation: Generation,
        summary: ChangeSummary,
    },

    /// Nothing to change; existing outputs were reused
    Unchanged { generation: Generation },

    Failed {
        #[serde(serialize_with = "serialize_display")]
        error: ApplyError,
    },

    /// Not attempted because an upstream stack failed
    Blocked { upstream: StackName },

    /// The plan was shown and not approved
    Declined,

    /// Not attempted because the run was cancelled
    Skipped,
}

impl StackOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StackOutcome::Applied { .. } => "applied",
            StackOutcome::Unchanged { .. } => "unchanged",
            StackOutcome::Failed { .. } => "failed",
            StackOutcome::Blocked { .. } => "blocked",
            StackOutcome::Declined => "declined",
            StackOutcome::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StackOutcome::Applied { .. } | StackOutcome::Unchanged { .. })
    }

    pub fn generation(&self) -> Option<Generation> {
        match self {
            StackOutcome::Applied { generation, .. } | StackOutcome::Unchanged { generation } => {
                Some(*generation)
            }
            _ => None,
        }
    }

    /// Human-readable detail, free of secret values
    pub fn detail(&self) -> Option<String> {
        match self {
            StackOutcome::Applied { summary, .. } => Some(summary.to_string()),
            StackOutcome::Failed { error } => Some(error.to_string()),
            StackOutcome::Blocked { upstream } => Some(format!("blocked by failed dependency '{}'", upstream)),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StackReport {
    pub stack: StackName,
    pub status: StackStatus,
    #[serde(flatten)]
    pub outcome: StackOutcome,
}

/// Result of one driver run, in execution order
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stacks: Vec<StackReport>,
}

impl RunReport {
    /// True when every stack applied or was already up to date
    pub fn succeeded(&self) -> bool {
        self.stacks.iter().all(|s| s.outcome.is_success())
    }

    pub fn get(&self, stack: &StackName) -> Option<&StackReport> {
        self.stacks.iter().find(|s| &s.stack == stack)
    }

    /// Stacks that failed, with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&StackName, &ApplyError)> {
        self.stacks.iter().filter_map(|s| match &s.outcome {
            StackOutcome::Failed { error } => Some((&s.stack, error)),
            _ => None,
        })
    }

    /// Number of stacks the engine applied
    pub fn applied_count(&self) -> usize {
        self.stacks
            .iter()
            .filter(|s| matches!(s.outcome, StackOutcome::Applied { .. }))
            .count()
    }

    pub fn history_entries(&self) -> Vec<HistoryEntry> {
        self.stacks
            .iter()
            .map(|s| HistoryEntry {
                run_id: self.run_id.clone(),
                environment: self.environment.clone(),
                stack: s.stack.clone(),
                outcome: s.outcome.label().to_string(),
                generation: s.outcome.generation().map(|g| g.value()),
                detail: s.outcome.detail(),
                recorded_at: self.finished_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    fn report() -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: RunId::new("dev", now),
            environment: "dev".to_string(),
            started_at: now,
            finished_at: now,
            stacks: vec![
                StackReport {
                    stack: name("vpc"),
                    status: StackStatus::Applied,
                    outcome: StackOutcome::Unchanged {
                        generation: Generation::new(3),
                    },
                },
                StackReport {
                    stack: name("aurora"),
                    status: StackStatus::Failed,
                    outcome: StackOutcome::Failed {
                        error: ApplyError::Cancelled(name("aurora")),
                    },
                },
                StackReport {
                    stack: name("ecs"),
                    status: StackStatus::Pending,
                    outcome: StackOutcome::Blocked {
                        upstream: name("aurora"),
                    },
                },
            ],
        }
    }

    #[test]
    fn failures_and_success() {
        let report = report();

        assert!(!report.succeeded());
        assert_eq!(report.applied_count(), 0);
        let failed: Vec<_> = report.failures().map(|(stack, _)| stack.as_str()).collect();
        assert_eq!(failed, vec!["aurora"]);
    }

    #[test]
    fn history_entries_carry_outcomes() {
        let entries = report().history_entries();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].outcome, "unchanged");
        assert_eq!(entries[0].generation, Some(3));
        assert_eq!(entries[2].outcome, "blocked");
        assert!(entries[2].detail.as_deref().unwrap().contains("aurora"));
    }

    #[test]
    fn serializes_flat_outcome() {
        let report = report();
        let value = serde_json::to_value(&report.stacks[1]).unwrap();

        assert_eq!(value["stack"], json!("aurora"));
        assert_eq!(value["status"], json!("failed"));
        assert_eq!(value["outcome"], json!("failed"));
        assert!(value["error"].as_str().unwrap().contains("cancelled"));
    }
}

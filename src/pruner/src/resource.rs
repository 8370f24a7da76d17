//! Completed workflow-run resources as seen by the pruner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation holding the advisory processing lock.
pub const LOCK_ANNOTATION: &str = "pruner.tekton.dev/processing-lock";

/// Annotation recording when history-limit evaluation last examined a run.
pub const PROCESSED_ANNOTATION: &str = "pruner.tekton.dev/historyLimitCheckProcessed";

/// Label that groups pipeline runs under the pipeline that produced them.
pub const PIPELINE_LABEL: &str = "tekton.dev/pipeline";

/// Label that groups task runs under the task that produced them.
pub const TASK_LABEL: &str = "tekton.dev/task";

/// Kind of workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    PipelineRun,
    TaskRun,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::PipelineRun => "pipelinerun",
            ResourceKind::TaskRun => "taskrun",
        }
    }

    /// Label key whose value names the logical workflow of a run.
    pub fn grouping_label(&self) -> &'static str {
        match self {
            ResourceKind::PipelineRun => PIPELINE_LABEL,
            ResourceKind::TaskRun => TASK_LABEL,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pipelinerun" | "pipelineruns" | "pr" => Ok(ResourceKind::PipelineRun),
            "taskrun" | "taskruns" | "tr" => Ok(ResourceKind::TaskRun),
            other => Err(format!(
                "unknown resource kind '{other}' (expected pipelinerun or taskrun)"
            )),
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Still running, or finished without a recognisable condition.
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a run supplied by the resource store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Optimistic-concurrency token, when the store has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ResourceRecord {
    pub fn new(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            created_at,
            completed_at: None,
            status: RunStatus::Unknown,
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            resource_version: None,
        }
    }

    /// Mark the run as finished with `status` at `completed_at`.
    pub fn completed(mut self, status: RunStatus, completed_at: DateTime<Utc>) -> Self {
        self.status = status;
        self.completed_at = Some(completed_at);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// A run is completed once it reached success or failure.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some() && matches!(self.status, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn is_processed(&self) -> bool {
        self.annotations.contains_key(PROCESSED_ANNOTATION)
    }

    /// Name of the logical workflow this run belongs to, if labelled.
    pub fn grouping_name(&self) -> Option<&str> {
        self.labels
            .get(self.kind.grouping_label())
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Name used for policy selector matching: the workflow name when
    /// known, the run's own name otherwise.
    pub fn policy_name(&self) -> &str {
        self.grouping_name().unwrap_or(&self.name)
    }

    pub fn display(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_completion_requires_terminal_status() {
        let run = ResourceRecord::new(ResourceKind::TaskRun, "ns", "run-1", at(0));
        assert!(!run.is_completed());

        let done = run.clone().completed(RunStatus::Failed, at(10));
        assert!(done.is_completed());

        let odd = ResourceRecord {
            completed_at: Some(at(10)),
            ..run
        };
        assert!(!odd.is_completed());
    }

    #[test]
    fn test_grouping_name_uses_kind_label() {
        let pr = ResourceRecord::new(ResourceKind::PipelineRun, "ns", "build-abc", at(0))
            .with_label(PIPELINE_LABEL, "build")
            .with_label(TASK_LABEL, "compile");
        assert_eq!(pr.grouping_name(), Some("build"));
        assert_eq!(pr.policy_name(), "build");

        let tr = ResourceRecord::new(ResourceKind::TaskRun, "ns", "standalone", at(0));
        assert_eq!(tr.grouping_name(), None);
        assert_eq!(tr.policy_name(), "standalone");
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("PipelineRun".parse::<ResourceKind>(), Ok(ResourceKind::PipelineRun));
        assert_eq!("taskruns".parse::<ResourceKind>(), Ok(ResourceKind::TaskRun));
        assert!("deployment".parse::<ResourceKind>().is_err());
    }
}

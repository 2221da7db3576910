pub mod plan;
pub mod retention;
pub mod run;

use crate::model::EncryptionRecipe;
use crate::sys::shell::Shell;
use derivative::Derivative;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Snapshot {
    pub dataset: String,
    pub name: String,
}

impl Snapshot {
    pub fn new<D: Into<String>, N: Into<String>>(dataset: D, name: N) -> Self {
        Self {
            dataset: dataset.into(),
            name: name.into(),
        }
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}@{}", self.dataset, self.name))
    }
}

/// A dataset is its own child, and the child of every ancestor.
pub fn is_child_of(dataset: &str, parent: &str) -> bool {
    dataset == parent
        || (dataset.len() > parent.len()
            && dataset.starts_with(parent)
            && dataset.as_bytes()[parent.len()] == b'/')
}

pub fn parent_dataset(dataset: &str) -> Option<&str> {
    dataset.rfind('/').map(|index| &dataset[..index])
}

/// Map a source dataset onto the destination tree by its path relative to
/// the replicated source root.
pub fn target_dataset(target_root: &str, source_root: &str, src_dataset: &str) -> String {
    debug_assert!(is_child_of(src_dataset, source_root));
    if src_dataset == source_root {
        target_root.to_string()
    } else {
        format!("{}/{}", target_root, &src_dataset[source_root.len() + 1..])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepTemplateId {
    pub task: Uuid,
    pub src_dataset: String,
    pub dst_dataset: String,
}

/// What is to be replicated between these two datasets. Reused across
/// retries and resume discovery; contexts are passed alongside by the
/// runner, never owned here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStepTemplate {
    pub task_id: Uuid,
    pub src_dataset: String,
    pub dst_dataset: String,
}

impl ReplicationStepTemplate {
    pub fn new(task_id: Uuid, src_dataset: String, dst_dataset: String) -> Self {
        Self {
            task_id,
            src_dataset,
            dst_dataset,
        }
    }

    pub fn id(&self) -> StepTemplateId {
        StepTemplateId {
            task: self.task_id,
            src_dataset: self.src_dataset.clone(),
            dst_dataset: self.dst_dataset.clone(),
        }
    }
}

/// Step modes are mutually exclusive by construction: a resume step can
/// never carry an incremental base, and an encryption recipe only
/// accompanies an initial send.
#[derive(Debug, Clone)]
pub enum StepMode {
    Initial { encryption: Option<EncryptionRecipe> },
    Incremental { base: String },
    Resume { token: String },
}

#[derive(Debug, Clone)]
pub struct ReplicationStep {
    pub template: ReplicationStepTemplate,
    pub snapshot: Option<String>,
    pub mode: StepMode,
}

impl ReplicationStep {
    pub fn initial(template: ReplicationStepTemplate, snapshot: String, encryption: Option<EncryptionRecipe>) -> Self {
        Self {
            template,
            snapshot: Some(snapshot),
            mode: StepMode::Initial { encryption },
        }
    }

    pub fn incremental(template: ReplicationStepTemplate, snapshot: String, base: String) -> Self {
        Self {
            template,
            snapshot: Some(snapshot),
            mode: StepMode::Incremental { base },
        }
    }

    pub fn resume(template: ReplicationStepTemplate, snapshot: Option<String>, token: String) -> Self {
        Self {
            template,
            snapshot,
            mode: StepMode::Resume { token },
        }
    }

    pub fn snapshot_label(&self) -> &str {
        self.snapshot.as_deref().unwrap_or("unknown snapshot")
    }

    pub fn incremental_base(&self) -> Option<&str> {
        match &self.mode {
            StepMode::Incremental { base } => Some(base),
            _ => None,
        }
    }
}

/// One side of a replication task. The maps are populated lazily while a
/// part runs and thrown away when the part ends.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ReplicationContext {
    #[derivative(Debug = "ignore")]
    pub shell: Arc<dyn Shell>,
    pub remote: bool,
    pub datasets: BTreeMap<String, Vec<String>>,
    pub datasets_encrypted: HashMap<String, bool>,
    pub datasets_readonly: HashMap<String, bool>,
    pub datasets_receive_resume_tokens: HashMap<String, Option<String>>,
}

impl ReplicationContext {
    pub fn new(shell: Arc<dyn Shell>, remote: bool) -> Self {
        Self {
            shell,
            remote,
            datasets: BTreeMap::default(),
            datasets_encrypted: HashMap::default(),
            datasets_readonly: HashMap::default(),
            datasets_receive_resume_tokens: HashMap::default(),
        }
    }

    pub fn dataset_exists(&self, dataset: &str) -> bool {
        self.datasets.contains_key(dataset)
    }

    pub fn forget_dataset(&mut self, dataset: &str) {
        self.datasets.remove(dataset);
        self.datasets_encrypted.remove(dataset);
        self.datasets_readonly.remove(dataset);
        self.datasets_receive_resume_tokens.remove(dataset);
    }
}

/// Progress counters shared by both sides of a task, keyed by step
/// template identity with a zero default.
#[derive(Debug, Default)]
pub struct GlobalReplicationContext {
    snapshots_sent: HashMap<StepTemplateId, usize>,
    snapshots_total: HashMap<StepTemplateId, usize>,
}

impl GlobalReplicationContext {
    pub fn sent(&self, id: &StepTemplateId) -> usize {
        self.snapshots_sent.get(id).copied().unwrap_or(0)
    }

    pub fn total(&self, id: &StepTemplateId) -> usize {
        self.snapshots_total.get(id).copied().unwrap_or(0)
    }

    pub fn increment_sent(&mut self, id: &StepTemplateId) {
        *self.snapshots_sent.entry(id.clone()).or_default() += 1;
    }

    pub fn set_total(&mut self, id: &StepTemplateId, total: usize) {
        self.snapshots_total.insert(id.clone(), total);
    }

    pub fn zero(&mut self, id: &StepTemplateId) {
        self.snapshots_sent.insert(id.clone(), 0);
        self.snapshots_total.insert(id.clone(), 0);
    }

    pub fn sent_sum(&self) -> usize {
        self.snapshots_sent.values().sum()
    }

    pub fn total_sum(&self) -> usize {
        self.snapshots_total.values().sum()
    }
}

#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    TaskStart {
        task_id: Uuid,
    },
    TaskSuccess {
        task_id: Uuid,
    },
    TaskError {
        task_id: Uuid,
        message: String,
    },
    SnapshotStart {
        task_id: Uuid,
        dataset: String,
        snapshot: String,
        snapshots_sent: usize,
        snapshots_total: usize,
    },
    SnapshotProgress {
        task_id: Uuid,
        dataset: String,
        snapshot: String,
        snapshots_sent: usize,
        snapshots_total: usize,
        bytes_sent: u64,
        bytes_total: Option<u64>,
    },
    SnapshotSuccess {
        task_id: Uuid,
        dataset: String,
        snapshot: String,
        snapshots_sent: usize,
        snapshots_total: usize,
    },
    DataProgress {
        task_id: Uuid,
        dataset: String,
        src_used: Option<u64>,
        dst_used: Option<u64>,
    },
}

/// Observer callbacks are invoked synchronously from the runner and must
/// not block.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(ReplicationEvent) + Send + Sync>);

impl EventSink {
    pub fn new(observer: impl Fn(ReplicationEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(observer))
    }

    pub fn emit(&self, event: ReplicationEvent) {
        (self.0.as_ref())(event);
    }
}

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("{0}")]
    Recoverable(String),
    #[error("no incremental base and replication from scratch is not allowed")]
    NoIncrementalBase,
    #[error("{0}")]
    Terminal(String),
}

pub enum Failure {
    Recoverable(String),
    Terminal(String),
}

/// Decide retry policy structurally: typed replication errors carry their
/// own class, bare I/O anywhere in the chain is worth retrying, anything
/// else fails the task.
pub fn classify_failure(error: &anyhow::Error) -> Failure {
    for cause in error.chain() {
        if let Some(replication_error) = cause.downcast_ref::<ReplicationError>() {
            return match replication_error {
                ReplicationError::Recoverable(message) => Failure::Recoverable(normalize_message(message)),
                other => Failure::Terminal(other.to_string()),
            };
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return Failure::Recoverable(normalize_message(&error.to_string()));
        }
    }
    Failure::Terminal(error.to_string())
}

fn normalize_message(message: &str) -> String {
    message.strip_prefix("[Errno None] ").unwrap_or(message).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn child_relation() {
        assert!(is_child_of("tank/a/b", "tank/a"));
        assert!(is_child_of("tank/a", "tank/a"));
        assert!(!is_child_of("tank/ab", "tank/a"));
        assert!(!is_child_of("tank", "tank/a"));
    }

    #[test]
    fn target_dataset_mapping() {
        assert_eq!(target_dataset("backup/data", "tank/data", "tank/data"), "backup/data");
        assert_eq!(
            target_dataset("backup/data", "tank/data", "tank/data/work"),
            "backup/data/work"
        );
    }

    #[test]
    fn counters_default_to_zero() {
        let mut global = GlobalReplicationContext::default();
        let id = StepTemplateId {
            task: Uuid::new_v4(),
            src_dataset: "tank/data".to_string(),
            dst_dataset: "backup/data".to_string(),
        };
        assert_eq!(global.sent(&id), 0);
        global.increment_sent(&id);
        global.set_total(&id, 2);
        assert_eq!(global.sent(&id), 1);
        assert_eq!(global.sent_sum(), 1);
        assert_eq!(global.total_sum(), 2);
        global.zero(&id);
        assert_eq!(global.total_sum(), 0);
    }

    #[test]
    fn steps_hold_mode_exclusivity() {
        let template = ReplicationStepTemplate::new(Uuid::new_v4(), "tank/a".to_string(), "backup/a".to_string());
        let resume = ReplicationStep::resume(template.clone(), None, "1-abcd".to_string());
        assert!(resume.incremental_base().is_none());
        assert_eq!(resume.snapshot_label(), "unknown snapshot");

        let incremental =
            ReplicationStep::incremental(template, "auto-2024-01-02".to_string(), "auto-2024-01-01".to_string());
        assert_eq!(incremental.incremental_base(), Some("auto-2024-01-01"));
    }

    #[test]
    fn io_errors_classify_recoverable() {
        let error = anyhow!(std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"));
        match classify_failure(&error) {
            Failure::Recoverable(_) => {}
            Failure::Terminal(message) => panic!("expected recoverable, got terminal: {}", message),
        }

        let error = anyhow!(ReplicationError::Terminal("source is a volume".to_string()));
        match classify_failure(&error) {
            Failure::Terminal(_) => {}
            Failure::Recoverable(message) => panic!("expected terminal, got recoverable: {}", message),
        }
    }
}

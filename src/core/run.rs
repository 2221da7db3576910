use super::plan::plan_snapshots;
use super::{
    classify_failure, is_child_of, parent_dataset, target_dataset, EventSink, Failure, GlobalReplicationContext,
    ReplicationContext, ReplicationError, ReplicationEvent, ReplicationStep, ReplicationStepTemplate, Snapshot,
    StepMode,
};
use crate::model::{EncryptionRecipe, ReadonlyBehavior, ReplicationDirection, ReplicationTaskEntity};
use crate::sys::shell::Shell;
use crate::sys::transport::{ReplicationProcess, ReplicationProcessSpec, Transport};
use crate::sys::zfs::{self, EncryptionStatus};
use anyhow::Result;
use slog_scope::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const MAX_BACKOFF_SECONDS: u64 = 60;

/// Run every part of every task serially, in `(source_dataset, recursive
/// first)` order, retrying recoverable failures with exponential backoff.
/// Failures surface as `TaskError` events; a task either completes every
/// part or is marked failed.
pub async fn run_replication_tasks(
    local_shell: Arc<dyn Shell>,
    transport: Arc<dyn Transport>,
    tasks: &[ReplicationTaskEntity],
    observer: EventSink,
) {
    let mut parts: Vec<(&ReplicationTaskEntity, &String)> = tasks
        .iter()
        .flat_map(|task| task.source_datasets.iter().map(move |source| (task, source)))
        .collect();
    // Recursive parts run before non-recursive ones over the same prefix
    // so broader plans land first.
    parts.sort_by_key(|(task, source_dataset)| ((**source_dataset).clone(), !task.recursive));

    let mut parts_left: HashMap<Uuid, usize> = HashMap::new();
    for (task, _) in &parts {
        *parts_left.entry(task.id()).or_insert(0) += 1;
    }

    let mut failed: HashSet<Uuid> = HashSet::new();
    let mut started: HashSet<Uuid> = HashSet::new();
    let mut global = GlobalReplicationContext::default();
    let remote_shell = transport.shell();

    for (task, source_dataset) in parts {
        if failed.contains(&task.id()) {
            continue;
        }
        if started.insert(task.id()) {
            observer.emit(ReplicationEvent::TaskStart { task_id: task.id() });
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (mut src_context, mut dst_context) = build_contexts(task, &local_shell, &remote_shell);
            let result = run_replication_task_part(
                task,
                source_dataset,
                &mut src_context,
                &mut dst_context,
                &mut global,
                transport.as_ref(),
                &observer,
            )
            .await;

            match result {
                Ok(()) => {
                    let left = parts_left.get_mut(&task.id()).expect("every part is counted");
                    *left -= 1;
                    if *left == 0 {
                        observer.emit(ReplicationEvent::TaskSuccess { task_id: task.id() });
                    }
                    break;
                }
                Err(error) => match classify_failure(&error) {
                    Failure::Recoverable(message) if attempt < task.retries.get() => {
                        // The remote session may be left unusable by the
                        // failure; drop it before the next attempt.
                        remote_shell.close();
                        let delay = backoff_delay(attempt);
                        warn!(
                            "replication of {} for task '{}' failed, retrying in {}: {}",
                            source_dataset,
                            task.name(),
                            humantime::format_duration(delay),
                            message
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Failure::Recoverable(message) | Failure::Terminal(message) => {
                        observer.emit(ReplicationEvent::TaskError {
                            task_id: task.id(),
                            message,
                        });
                        failed.insert(task.id());
                        break;
                    }
                },
            }
        }
    }
}

fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exponent).min(MAX_BACKOFF_SECONDS))
}

fn build_contexts(
    task: &ReplicationTaskEntity,
    local_shell: &Arc<dyn Shell>,
    remote_shell: &Arc<dyn Shell>,
) -> (ReplicationContext, ReplicationContext) {
    match task.direction {
        ReplicationDirection::Push => (
            ReplicationContext::new(Arc::clone(local_shell), false),
            ReplicationContext::new(Arc::clone(remote_shell), true),
        ),
        ReplicationDirection::Pull => (
            ReplicationContext::new(Arc::clone(remote_shell), true),
            ReplicationContext::new(Arc::clone(local_shell), false),
        ),
    }
}

async fn run_replication_task_part(
    task: &ReplicationTaskEntity,
    source_dataset: &str,
    src_context: &mut ReplicationContext,
    dst_context: &mut ReplicationContext,
    global: &mut GlobalReplicationContext,
    transport: &dyn Transport,
    observer: &EventSink,
) -> Result<()> {
    check_dataset_shape(task, source_dataset, src_context, dst_context)?;

    let mut templates = build_step_templates(task, source_dataset, src_context, dst_context)?;
    check_require_readonly(task, &templates, dst_context)?;

    let resumed = resume_replications(task, &templates, src_context, dst_context, global, transport, observer).await?;
    if resumed {
        // A resumed receive changed the destination; reconcile fresh
        // state before planning.
        *src_context = ReplicationContext::new(Arc::clone(&src_context.shell), src_context.remote);
        *dst_context = ReplicationContext::new(Arc::clone(&dst_context.shell), dst_context.remote);
        templates = build_step_templates(task, source_dataset, src_context, dst_context)?;
    }

    run_replication_steps(task, source_dataset, &templates, src_context, dst_context, global, transport, observer).await
}

/// Type match and encrypted-empty-target disposal, once per part before
/// any planning.
fn check_dataset_shape(
    task: &ReplicationTaskEntity,
    source_dataset: &str,
    src_context: &ReplicationContext,
    dst_context: &mut ReplicationContext,
) -> Result<()> {
    let src_type = zfs::get_property(&*src_context.shell, source_dataset, "type")?;
    let target = &task.target_dataset;
    let dst_type = match zfs::get_property(&*dst_context.shell, target, "type") {
        Ok(value) => Some(value),
        Err(error) if zfs::is_missing_dataset(&error) => None,
        Err(error) => return Err(error),
    };

    if let Some(dst_type) = dst_type {
        if dst_type != src_type {
            return Err(ReplicationError::Terminal(format!(
                "source {} is a {}, destination {} already exists as a {}",
                source_dataset, src_type, target, dst_type
            ))
            .into());
        }
        dispose_encrypted_empty_target(task, target, dst_context)?;
    }
    Ok(())
}

fn dispose_encrypted_empty_target(
    task: &ReplicationTaskEntity,
    target: &str,
    dst_context: &mut ReplicationContext,
) -> Result<()> {
    let status: EncryptionStatus = match zfs::get_properties(
        &*dst_context.shell,
        target,
        &["encryption", "encryptionroot", "mounted", "mountpoint"],
    ) {
        Ok(status) => status,
        Err(error) if zfs::is_missing_dataset(&error) => return Ok(()),
        Err(error) => {
            // Pools without the encryption feature reject the query.
            debug!("destination {} does not support encryption properties: {:#}", target, error);
            return Ok(());
        }
    };

    if status.encryption == "off" {
        if task.encryption.is_some() {
            return Err(ReplicationError::Terminal(format!(
                "task requests encryption but destination dataset {} exists with encryption=off",
                target
            ))
            .into());
        }
        return Ok(());
    }

    // An encrypted destination that already received data, or holds a
    // partial receive, stays as it is.
    let snapshots = zfs::list_snapshots(&*dst_context.shell, target, false)?;
    let token = zfs::get_property(&*dst_context.shell, target, "receive_resume_token")
        .ok()
        .filter(|value| value != "-" && !value.is_empty());
    if !snapshots.is_empty() || token.is_some() {
        return Ok(());
    }

    if status.encryption_root.as_deref() == Some(target) {
        return Err(ReplicationError::Terminal(format!(
            "encrypted destination dataset {} is its own encryption root; only destinations inheriting their key \
             from a parent are supported",
            target
        ))
        .into());
    }

    if status.mounted.as_deref() == Some("yes") {
        if let Some(mountpoint) = &status.mountpoint {
            let listing = dst_context
                .shell
                .exec(&[String::from("ls"), String::from("-A"), mountpoint.clone()])?;
            if listing.trim().is_empty() {
                info!("destroying empty encrypted destination dataset {} before replication", target);
                zfs::destroy_dataset(&*dst_context.shell, target)?;
                dst_context.forget_dataset(target);
            }
        }
    }
    Ok(())
}

fn excluded(task: &ReplicationTaskEntity, dataset: &str) -> bool {
    task.exclude.iter().any(|excluded| is_child_of(dataset, excluded))
}

/// Reconcile both dataset trees and emit one template per source dataset
/// to be replicated.
fn build_step_templates(
    task: &ReplicationTaskEntity,
    source_dataset: &str,
    src_context: &mut ReplicationContext,
    dst_context: &mut ReplicationContext,
) -> Result<Vec<ReplicationStepTemplate>> {
    let src_shell = Arc::clone(&src_context.shell);
    let datasets = zfs::list_datasets(&*src_shell, source_dataset, task.recursive)?;
    let mut snapshots = zfs::list_snapshot_names_by_dataset(&*src_shell, source_dataset, task.recursive)?;
    for dataset in datasets {
        if excluded(task, &dataset) {
            continue;
        }
        let dataset_snapshots = snapshots.remove(&dataset).unwrap_or_default();
        src_context.datasets.insert(dataset, dataset_snapshots);
    }

    if task.properties {
        for (dataset, properties) in
            zfs::list_datasets_with_properties(&*src_shell, source_dataset, task.recursive, &["encryption"])?
        {
            if excluded(task, &dataset) {
                continue;
            }
            let encrypted = properties.get("encryption").map_or(false, |value| value != "off");
            src_context.datasets_encrypted.insert(dataset, encrypted);
        }
    }

    // A full-tree stream replicates everything below the root in one
    // send, so only the root gets a template.
    let emit: Vec<String> = if task.replicate {
        vec![source_dataset.to_string()]
    } else {
        src_context.datasets.keys().cloned().collect()
    };

    let dst_shell = Arc::clone(&dst_context.shell);
    let mut templates = Vec::new();
    for src_dataset in emit {
        let dst_dataset = target_dataset(&task.target_dataset, source_dataset, &src_dataset);
        if !dst_context.datasets.contains_key(&dst_dataset) {
            match zfs::list_datasets_with_properties(
                &*dst_shell,
                &dst_dataset,
                true,
                &["readonly", "receive_resume_token"],
            ) {
                Ok(listing) => {
                    let mut dst_snapshots = zfs::list_snapshot_names_by_dataset(&*dst_shell, &dst_dataset, true)?;
                    for (dataset, properties) in listing {
                        dst_context
                            .datasets_readonly
                            .insert(dataset.clone(), properties.get("readonly").map_or(false, |value| value == "on"));
                        dst_context
                            .datasets_receive_resume_tokens
                            .insert(dataset.clone(), properties.get("receive_resume_token").cloned());
                        let snapshots = dst_snapshots.remove(&dataset).unwrap_or_default();
                        dst_context.datasets.insert(dataset, snapshots);
                    }
                }
                Err(error) if zfs::is_missing_dataset(&error) => {}
                Err(error) => return Err(error),
            }
        }
        templates.push(ReplicationStepTemplate::new(task.id(), src_dataset, dst_dataset));
    }
    Ok(templates)
}

fn check_require_readonly(
    task: &ReplicationTaskEntity,
    templates: &[ReplicationStepTemplate],
    dst_context: &ReplicationContext,
) -> Result<()> {
    if task.readonly != ReadonlyBehavior::Require {
        return Ok(());
    }
    for template in templates {
        if dst_context.datasets_readonly.get(&template.dst_dataset) == Some(&false) {
            return Err(ReplicationError::Terminal(format!(
                "destination dataset {} exists with readonly=off; refusing to replicate with readonly=require",
                template.dst_dataset
            ))
            .into());
        }
    }
    Ok(())
}

/// Act on receive-resume tokens before planning. Obsolete tokens are
/// discarded with `zfs receive -A`; a successful resume asks the caller
/// to refresh its snapshot lists and re-plan.
async fn resume_replications(
    task: &ReplicationTaskEntity,
    templates: &[ReplicationStepTemplate],
    src_context: &ReplicationContext,
    dst_context: &mut ReplicationContext,
    global: &mut GlobalReplicationContext,
    transport: &dyn Transport,
    observer: &EventSink,
) -> Result<bool> {
    let mut any_resumed = false;
    for template in templates {
        let token = match dst_context.datasets_receive_resume_tokens.get(&template.dst_dataset) {
            Some(Some(token)) => token.clone(),
            _ => continue,
        };

        let src_snapshots = src_context.datasets.get(&template.src_dataset).cloned().unwrap_or_default();
        let dst_snapshots = dst_context.datasets.get(&template.dst_dataset).cloned().unwrap_or_default();
        let (_, to_send) = plan_snapshots(&src_snapshots, &dst_snapshots, task);
        let snapshot = to_send.first().cloned();
        if snapshot.is_none() {
            warn!(
                "resuming replication onto {} with an unknown snapshot; progress reporting for this dataset is \
                 degraded",
                template.dst_dataset
            );
        }

        let id = template.id();
        let planned = if snapshot.is_some() { to_send.len() } else { 1 };
        global.set_total(&id, global.sent(&id) + planned);

        let step = ReplicationStep::resume(template.clone(), snapshot, token);
        match run_replication_step(task, &step, src_context, dst_context, global, transport, observer).await {
            Ok(()) => {
                dst_context
                    .datasets_receive_resume_tokens
                    .insert(template.dst_dataset.clone(), None);
                any_resumed = true;
            }
            Err(error) => {
                let message = format!("{:#}", error);
                if message.contains("used in the initial send no longer exists")
                    || message.contains("destination has snapshots")
                {
                    warn!(
                        "discarding obsolete receive resume token on {}: {}",
                        template.dst_dataset, message
                    );
                    zfs::abort_receive(&*dst_context.shell, &template.dst_dataset)?;
                    global.zero(&id);
                    dst_context
                        .datasets_receive_resume_tokens
                        .insert(template.dst_dataset.clone(), None);
                } else {
                    return Err(error);
                }
            }
        }
    }
    Ok(any_resumed)
}

struct PlannedTemplate {
    template: ReplicationStepTemplate,
    incremental_base: Option<String>,
    snapshots: Vec<String>,
    encryption: Option<EncryptionRecipe>,
}

async fn run_replication_steps(
    task: &ReplicationTaskEntity,
    source_dataset: &str,
    templates: &[ReplicationStepTemplate],
    src_context: &ReplicationContext,
    dst_context: &mut ReplicationContext,
    global: &mut GlobalReplicationContext,
    transport: &dyn Transport,
    observer: &EventSink,
) -> Result<()> {
    let mut ignored_roots: HashSet<String> = HashSet::new();
    let mut planned: Vec<PlannedTemplate> = Vec::new();

    for (index, template) in templates.iter().enumerate() {
        let src_dataset = &template.src_dataset;
        let dst_dataset = &template.dst_dataset;
        if ignored_roots.iter().any(|root| is_child_of(src_dataset, root)) {
            continue;
        }

        let src_snapshots = src_context.datasets.get(src_dataset).cloned().unwrap_or_default();
        let dst_exists = dst_context.dataset_exists(dst_dataset);
        let dst_snapshots = dst_context.datasets.get(dst_dataset).cloned().unwrap_or_default();
        let (incremental_base, snapshots) = plan_snapshots(&src_snapshots, &dst_snapshots, task);

        if incremental_base.is_none() {
            if !dst_snapshots.is_empty() {
                if task.allow_from_scratch {
                    info!(
                        "no incremental base between {} and {}; destroying {} destination snapshots",
                        src_dataset,
                        dst_dataset,
                        dst_snapshots.len()
                    );
                    let doomed: Vec<Snapshot> = dst_snapshots
                        .iter()
                        .map(|name| Snapshot::new(dst_dataset.clone(), name.clone()))
                        .collect();
                    zfs::destroy_snapshots(&*dst_context.shell, &doomed)?;
                    dst_context.datasets.insert(dst_dataset.clone(), Vec::new());
                } else {
                    return Err(ReplicationError::NoIncrementalBase.into());
                }
            } else if dst_exists && index == 0 && !task.allow_from_scratch {
                ensure_empty_immediate_target(task, source_dataset, template, src_context, dst_context)?;
            }
        }

        if snapshots.is_empty() {
            if src_snapshots.is_empty() {
                debug!("source dataset {} has no snapshots; skipping its descendants", src_dataset);
                ignored_roots.insert(src_dataset.clone());
            }
            continue;
        }

        let mut encryption = None;
        if !dst_context.dataset_exists(dst_dataset) {
            ensure_parent_exists(dst_context, dst_dataset)?;
            encryption = task.encryption.clone();
        }

        let id = template.id();
        global.set_total(&id, global.sent(&id) + snapshots.len());
        planned.push(PlannedTemplate {
            template: template.clone(),
            incremental_base,
            snapshots,
            encryption,
        });
    }

    for item in planned {
        let mut base = item.incremental_base;
        let mut encryption = item.encryption;
        for snapshot in item.snapshots {
            let step = match &base {
                None => ReplicationStep::initial(item.template.clone(), snapshot.clone(), encryption.take()),
                Some(base_name) => {
                    ReplicationStep::incremental(item.template.clone(), snapshot.clone(), base_name.clone())
                }
            };
            let initial = base.is_none();
            run_replication_step(task, &step, src_context, dst_context, global, transport, observer).await?;
            if initial {
                // The destination may have just been created.
                handle_readonly(task, dst_context, &item.template.dst_dataset)?;
            }
            base = Some(snapshot);
        }
        handle_readonly(task, dst_context, &item.template.dst_dataset)?;
    }
    Ok(())
}

/// From-scratch guard for the immediate target: a destination that exists
/// without snapshots must hold no data of its own. Children that mirror
/// source datasets (after exclusions) are expected and exempt.
fn ensure_empty_immediate_target(
    task: &ReplicationTaskEntity,
    source_dataset: &str,
    template: &ReplicationStepTemplate,
    src_context: &ReplicationContext,
    dst_context: &ReplicationContext,
) -> Result<()> {
    let dst = &template.dst_dataset;
    let expected: HashSet<String> = src_context
        .datasets
        .keys()
        .map(|src| target_dataset(&task.target_dataset, source_dataset, src))
        .collect();

    for child in dst_context
        .datasets
        .keys()
        .filter(|dataset| *dataset != dst && is_child_of(dataset, dst))
    {
        if !expected.contains(child) {
            return Err(ReplicationError::Terminal(format!(
                "destination dataset {} already contains dataset {} with no counterpart on the source; refusing to \
                 replicate from scratch",
                dst, child
            ))
            .into());
        }
    }

    let status: EncryptionStatus = match zfs::get_properties(
        &*dst_context.shell,
        dst,
        &["encryption", "encryptionroot", "mounted", "mountpoint"],
    ) {
        Ok(status) => status,
        Err(error) => {
            debug!("could not inspect destination dataset {}: {:#}", dst, error);
            return Ok(());
        }
    };
    if status.mounted.as_deref() != Some("yes") {
        return Ok(());
    }
    if let Some(mountpoint) = &status.mountpoint {
        let expected_names: HashSet<&str> = expected
            .iter()
            .filter_map(|dataset| dataset.strip_prefix(&format!("{}/", dst)))
            .map(|relative| relative.split('/').next().unwrap_or(relative))
            .collect();
        let listing = dst_context
            .shell
            .exec(&[String::from("ls"), String::from("-A"), mountpoint.clone()])?;
        for entry in listing.lines().map(str::trim).filter(|entry| !entry.is_empty()) {
            if !expected_names.contains(entry) {
                return Err(ReplicationError::Terminal(format!(
                    "destination dataset {} already contains data; refusing to replicate from scratch",
                    dst
                ))
                .into());
            }
        }
    }
    Ok(())
}

/// The ancestors of a dataset about to be created by an initial send must
/// exist for the receive to land.
fn ensure_parent_exists(dst_context: &mut ReplicationContext, dst_dataset: &str) -> Result<()> {
    let parent = match parent_dataset(dst_dataset) {
        Some(parent) => parent,
        None => return Ok(()),
    };
    if dst_context.dataset_exists(parent) {
        return Ok(());
    }
    match zfs::list_datasets(&*dst_context.shell, parent, false) {
        Ok(_) => {
            dst_context.datasets.insert(parent.to_string(), Vec::new());
        }
        Err(error) if zfs::is_missing_dataset(&error) => {
            info!("creating parent dataset {}", parent);
            zfs::create_dataset(&*dst_context.shell, parent)?;
            dst_context.datasets.insert(parent.to_string(), Vec::new());
        }
        Err(error) => return Err(error),
    }
    Ok(())
}

fn handle_readonly(
    task: &ReplicationTaskEntity,
    dst_context: &mut ReplicationContext,
    dst_dataset: &str,
) -> Result<()> {
    if !matches!(task.readonly, ReadonlyBehavior::Set | ReadonlyBehavior::Require) {
        return Ok(());
    }
    if dst_context.datasets_readonly.get(dst_dataset) == Some(&true) {
        return Ok(());
    }

    let parent_readonly = parent_dataset(dst_dataset)
        .and_then(|parent| dst_context.datasets_readonly.get(parent))
        .copied()
        .unwrap_or(false);
    if parent_readonly && dst_context.datasets_readonly.get(dst_dataset) == Some(&false) {
        // An inherited readonly does the job; clear the explicit off.
        zfs::inherit_readonly(&*dst_context.shell, dst_dataset)?;
    }
    dst_context.datasets_readonly.insert(dst_dataset.to_string(), true);
    if !parent_readonly {
        zfs::set_readonly_on(&*dst_context.shell, dst_dataset)?;
    }
    Ok(())
}

async fn run_replication_step(
    task: &ReplicationTaskEntity,
    step: &ReplicationStep,
    src_context: &ReplicationContext,
    dst_context: &ReplicationContext,
    global: &mut GlobalReplicationContext,
    transport: &dyn Transport,
    observer: &EventSink,
) -> Result<()> {
    let id = step.template.id();
    let dataset = step.template.src_dataset.clone();
    let label = step.snapshot_label().to_string();
    observer.emit(ReplicationEvent::SnapshotStart {
        task_id: task.id(),
        dataset: dataset.clone(),
        snapshot: label.clone(),
        snapshots_sent: global.sent_sum(),
        snapshots_total: global.total_sum(),
    });

    // The receive re-mounts the tree, so a failed unmount is not fatal.
    if let Err(error) = zfs::unmount(&*dst_context.shell, &step.template.dst_dataset) {
        debug!(
            "unmounting {} before receive failed: {:#}",
            step.template.dst_dataset, error
        );
    }

    let encrypted_source = task.properties
        && src_context
            .datasets_encrypted
            .get(&step.template.src_dataset)
            .copied()
            .unwrap_or(false);
    let spec = ReplicationProcessSpec {
        task_id: task.id(),
        direction: task.direction,
        src_dataset: step.template.src_dataset.clone(),
        dst_dataset: step.template.dst_dataset.clone(),
        snapshot: step.snapshot.clone(),
        incremental_base: step.incremental_base().map(str::to_string),
        receive_resume_token: match &step.mode {
            StepMode::Resume { token } => Some(token.clone()),
            _ => None,
        },
        replicate: task.replicate,
        properties: task.properties,
        properties_exclude: task.properties_exclude.clone(),
        properties_override: replication_overrides(task, step, dst_context)?,
        compression: task.compression.clone(),
        speed_limit: task.speed_limit,
        dedup: task.dedup,
        large_block: task.large_block,
        embed: task.embed,
        compressed: task.compressed,
        encrypted_source,
    };

    let mut process = transport.replication_process(spec)?;
    {
        let observer = observer.clone();
        let task_id = task.id();
        let dataset = dataset.clone();
        let snapshot = label.clone();
        let snapshots_sent = global.sent_sum();
        let snapshots_total = global.total_sum();
        process.add_progress_observer(Box::new(move |bytes_sent, bytes_total| {
            observer.emit(ReplicationEvent::SnapshotProgress {
                task_id,
                dataset: dataset.clone(),
                snapshot: snapshot.clone(),
                snapshots_sent,
                snapshots_total,
                bytes_sent,
                bytes_total,
            });
        }));
    }

    run_with_monitor(task, step, process.as_mut(), src_context, dst_context, observer).await?;

    global.increment_sent(&id);
    observer.emit(ReplicationEvent::SnapshotSuccess {
        task_id: task.id(),
        dataset,
        snapshot: label,
        snapshots_sent: global.sent_sum(),
        snapshots_total: global.total_sum(),
    });
    Ok(())
}

/// Wait for the transport process while a cooperative monitor watches
/// dataset sizes as a liveness signal.
async fn run_with_monitor(
    task: &ReplicationTaskEntity,
    step: &ReplicationStep,
    process: &mut dyn ReplicationProcess,
    src_context: &ReplicationContext,
    dst_context: &ReplicationContext,
    observer: &EventSink,
) -> Result<()> {
    let mut run = process.run();
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            result = &mut run => return result,
            _ = interval.tick() => {
                let src_used = zfs::dataset_used(&*src_context.shell, &step.template.src_dataset).ok();
                let dst_used = zfs::dataset_used(&*dst_context.shell, &step.template.dst_dataset).ok();
                observer.emit(ReplicationEvent::DataProgress {
                    task_id: task.id(),
                    dataset: step.template.src_dataset.clone(),
                    src_used,
                    dst_used,
                });
            }
        }
    }
}

/// Receive-side property overrides. An initial encrypted send stages the
/// key on the destination and points keylocation at it.
fn replication_overrides(
    task: &ReplicationTaskEntity,
    step: &ReplicationStep,
    dst_context: &ReplicationContext,
) -> Result<BTreeMap<String, String>> {
    let mut overrides = task.properties_override.clone();
    if let StepMode::Initial {
        encryption: Some(recipe),
    } = &step.mode
    {
        let location = match &recipe.key_location {
            Some(location) => location.clone(),
            None => stage_encryption_key(task, &*dst_context.shell, recipe)?,
        };
        overrides.insert(String::from("encryption"), recipe.scheme.clone());
        overrides.insert(String::from("keyformat"), recipe.key_format.to_string());
        overrides.insert(String::from("keylocation"), location);
    }
    Ok(overrides)
}

fn stage_encryption_key(task: &ReplicationTaskEntity, shell: &dyn Shell, recipe: &EncryptionRecipe) -> Result<String> {
    let path = format!("/etc/zfscapt/keys/{}.key", task.id());
    let script = format!("umask 077 && mkdir -p /etc/zfscapt/keys && cat > {}", path);
    shell.exec_with_input(
        &[String::from("sh"), String::from("-c"), script],
        &recipe.key,
    )?;
    Ok(format!("file://{}", path))
}

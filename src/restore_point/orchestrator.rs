//! Sequencing of `create`, `restore` and `delete`.
//!
//! Each call opens its own operation log, runs one flow to a terminal status and
//! hands back an [`OperationReport`]. Terminal interaction (picking volumes,
//! confirming destructive actions, drawing progress) is injected through the
//! collaborator traits below so the flows run unattended under test.

use crate::restore_point::archive::progress::{NoProgress, ProgressObserver};
use crate::restore_point::archive::tar_engine::TarArchiveEngine;
use crate::restore_point::archive::{ArchiveEngine, SkippedEntry};
use crate::restore_point::config::RestorePointConfig;
use crate::restore_point::oplog::{Action, OperationLog, OperationLogger, OperationStatus};
use crate::restore_point::registry::{
    Listing, Registry, RestorePoint, RestorePointKind, RestorePointRecord,
};
use crate::restore_point::result_error::error::Error;
use crate::restore_point::result_error::result::Result;
use crate::restore_point::result_error::WithMsg;
use crate::restore_point::validate::{validate_label, validate_writable_dir};
use crate::restore_point::volume::{SystemVolumeDetector, VolumeCandidate, VolumeDetector};
use bon::Builder;
use chrono::{Local, NaiveDateTime, SubsecRound};
use derive_more::Display;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use validator::Validate;

/// Chooses which detected removable volumes go into a restore point.
pub trait VolumePicker {
    fn pick(&self, candidates: &[VolumeCandidate]) -> Vec<PathBuf>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SelectAll;

impl VolumePicker for SelectAll {
    fn pick(&self, candidates: &[VolumeCandidate]) -> Vec<PathBuf> {
        candidates.iter().map(|c| c.mount_point().clone()).collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SelectNone;

impl VolumePicker for SelectNone {
    fn pick(&self, _candidates: &[VolumeCandidate]) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[derive(Debug, Display)]
pub enum DestructiveAction<'a> {
    #[display(
        "Restoring {} ({} restore point created {}, contains {}) overwrites files below {} with their archived versions",
        point.name(),
        point.record().kind(),
        point.record().created_at().format("%Y-%m-%d %H:%M:%S"),
        point.record().included_sources().iter().map(|p| p.display()).join(", "),
        target_root.display()
    )]
    Restore {
        point: &'a RestorePoint,
        target_root: &'a Path,
    },
    #[display(
        "Deleting {} permanently removes {}",
        point.name(),
        point.archive_path().display()
    )]
    Delete { point: &'a RestorePoint },
}

/// Asks the operator to approve a destructive action.
pub trait ConfirmationPrompter {
    fn confirm(&self, action: &DestructiveAction<'_>) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConfirm;

impl ConfirmationPrompter for AlwaysConfirm {
    fn confirm(&self, _action: &DestructiveAction<'_>) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysDecline;

impl ConfirmationPrompter for AlwaysDecline {
    fn confirm(&self, _action: &DestructiveAction<'_>) -> bool {
        false
    }
}

#[derive(Debug, Clone, Validate, Builder)]
pub struct CreateRequest {
    #[builder(into)]
    #[validate(custom(function = validate_label))]
    pub label: String,
    #[builder(default)]
    pub kind: RestorePointKind,
    /// Offer mounted removable volumes for inclusion
    #[builder(default)]
    pub include_removable: bool,
}

#[derive(Debug, Clone, Builder)]
pub struct RestoreRequest {
    #[builder(into)]
    pub name: String,
    /// Skip the confirmation prompt
    #[builder(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Builder)]
pub struct DeleteRequest {
    #[builder(into)]
    pub name: String,
    /// Skip the confirmation prompt
    #[builder(default)]
    pub force: bool,
}

#[derive(Debug)]
pub enum Outcome<T> {
    /// Completed; `warnings` lists entries skipped on the way
    Success { value: T, warnings: Vec<SkippedEntry> },
    Aborted,
    Failure(Error),
}

impl<T> Outcome<T> {
    pub fn status(&self) -> OperationStatus {
        match self {
            Outcome::Success { .. } => OperationStatus::Success,
            Outcome::Aborted => OperationStatus::Aborted,
            Outcome::Failure(_) => OperationStatus::Failure,
        }
    }
}

#[derive(Debug)]
pub struct OperationReport<T> {
    pub action: Action,
    /// `None` only when the log itself could not be opened or the request was
    /// rejected before any I/O
    pub log_file: Option<PathBuf>,
    pub outcome: Outcome<T>,
}

impl<T> OperationReport<T> {
    pub fn status(&self) -> OperationStatus {
        self.outcome.status()
    }

    pub fn exit_code(&self) -> i32 {
        match self.status() {
            OperationStatus::Success => 0,
            OperationStatus::Failure => 1,
            OperationStatus::Aborted => 2,
        }
    }

    fn unlogged(action: Action, error: Error) -> Self {
        Self {
            action,
            log_file: None,
            outcome: Outcome::Failure(error),
        }
    }
}

/// What a flow body hands back: `None` when the operator declined.
type FlowResult<T> = Result<Option<(T, Vec<SkippedEntry>)>>;

pub struct Orchestrator {
    config: RestorePointConfig,
    registry: Registry,
    logger: OperationLogger,
    engine: Box<dyn ArchiveEngine>,
    volume_detector: Box<dyn VolumeDetector>,
    picker: Box<dyn VolumePicker>,
    prompter: Box<dyn ConfirmationPrompter>,
    progress: Box<dyn ProgressObserver>,
    clock: Box<dyn Fn() -> NaiveDateTime>,
}

impl Orchestrator {
    /// Wires the production collaborators for `config`. Volume selection defaults to
    /// none and confirmation to decline until real ones are plugged in.
    pub fn new(config: RestorePointConfig) -> Result<Self> {
        let engine = TarArchiveEngine::builder()
            .compressor(config.compressor().clone())
            .excludes(config.exclude_set()?)
            .preserve_ownership(*config.preserve_ownership())
            .build();
        Ok(Self {
            registry: Registry::new(config.backup_root()),
            logger: OperationLogger::new(config.log_dir_or_default()),
            engine: Box::new(engine),
            volume_detector: Box::new(SystemVolumeDetector::new(config.backup_root())),
            picker: Box::new(SelectNone),
            prompter: Box::new(AlwaysDecline),
            progress: Box::new(NoProgress),
            clock: Box::new(|| Local::now().naive_local().trunc_subsecs(0)),
            config,
        })
    }

    pub fn with_engine(mut self, engine: Box<dyn ArchiveEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_volume_detector(mut self, volume_detector: Box<dyn VolumeDetector>) -> Self {
        self.volume_detector = volume_detector;
        self
    }

    pub fn with_picker(mut self, picker: Box<dyn VolumePicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn with_prompter(mut self, prompter: Box<dyn ConfirmationPrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Fn() -> NaiveDateTime>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RestorePointConfig {
        &self.config
    }

    pub fn list(&self) -> Result<Listing> {
        self.registry.list()
    }

    pub fn create(&self, request: &CreateRequest) -> OperationReport<RestorePoint> {
        let started_at = (self.clock)();
        if let Err(e) = request.validate() {
            tracing::error!("Rejected create request: {}", e);
            return OperationReport::unlogged(Action::Create, e.into());
        }

        let mut log = match self.logger.begin(Action::Create, started_at) {
            Ok(log) => log,
            Err(e) => return OperationReport::unlogged(Action::Create, e),
        };
        let res = self.run_create(&mut log, request, started_at);
        conclude(log, res)
    }

    pub fn restore(&self, request: &RestoreRequest) -> OperationReport<RestorePoint> {
        let mut log = match self.logger.begin(Action::Restore, (self.clock)()) {
            Ok(log) => log,
            Err(e) => return OperationReport::unlogged(Action::Restore, e),
        };
        let res = self.run_restore(&mut log, request);
        conclude(log, res)
    }

    pub fn delete(&self, request: &DeleteRequest) -> OperationReport<RestorePoint> {
        let mut log = match self.logger.begin(Action::Delete, (self.clock)()) {
            Ok(log) => log,
            Err(e) => return OperationReport::unlogged(Action::Delete, e),
        };
        let res = self.run_delete(&mut log, request);
        conclude(log, res)
    }

    fn run_create(
        &self,
        log: &mut OperationLog,
        request: &CreateRequest,
        started_at: NaiveDateTime,
    ) -> FlowResult<RestorePoint> {
        let name = Registry::make_name(&request.label, started_at);
        log.info(format!("Creating {} restore point {}", request.kind, name));

        self.registry.ensure_root()?;
        if self.registry.contains(&name) {
            return Err(Error::Conflict(name).with_msg("Retry in a second to get a fresh timestamp"));
        }

        let mut sources = vec![self.config.system_path().clone()];
        if request.kind == RestorePointKind::Full {
            sources.push(self.config.user_data_path().clone());
        }
        let removable = if request.include_removable {
            self.select_removable(log)
        } else {
            Vec::new()
        };
        sources.extend(removable.iter().cloned());
        let sources = sources.into_iter().unique().collect_vec();
        log.info(format!(
            "Sources: {}",
            sources.iter().map(|s| s.display()).join(", ")
        ));

        let estimate = self.engine.estimate_size(&sources);
        match estimate {
            Some(total) => log.info(format!("Estimated archive stream size: {} bytes", total)),
            None => log.info("Size estimate unavailable, progress is indeterminate"),
        }

        let staged = self.registry.staging_file(&name)?;
        let report = match self
            .engine
            .create_archive(&sources, &staged, self.progress.as_ref(), estimate)
        {
            Ok(report) => report,
            Err(e) => {
                log.error(format!("Archiving failed, discarding partial artifact {:?}", &*staged));
                return match staged.close() {
                    Ok(()) => Err(e),
                    Err(cleanup) => Err(e.chain(Error::from(cleanup))),
                };
            }
        };

        for skipped in report.skipped() {
            log.warn(format!("Skipped {}", skipped));
        }
        log.info(format!(
            "Archived {} entries, {} bytes written",
            report.entries(),
            report.bytes_written()
        ));

        let ext = self.engine.file_ext().unwrap_or_else(|| "tar".into());
        let record =
            RestorePointRecord::new(name, request.kind, sources, removable, started_at, &ext);
        let point = self.registry.publish(record, staged)?;
        log.info(format!(
            "Restore point {} published at {}",
            point.name(),
            point.archive_path().display()
        ));

        Ok(Some((point, report.into_skipped())))
    }

    fn select_removable(&self, log: &mut OperationLog) -> Vec<PathBuf> {
        let candidates = self.volume_detector.detect();
        if candidates.is_empty() {
            log.info("No removable volumes found");
            return Vec::new();
        }

        let selected = self
            .picker
            .pick(&candidates)
            .into_iter()
            .filter(|p| candidates.iter().any(|c| c.mount_point() == p))
            .collect_vec();
        log.info(format!(
            "Found {} removable volume(s), selected {}",
            candidates.len(),
            selected.len()
        ));
        for mount_point in &selected {
            log.info(format!("Including removable volume {}", mount_point.display()));
        }
        selected
    }

    fn run_restore(&self, log: &mut OperationLog, request: &RestoreRequest) -> FlowResult<RestorePoint> {
        log.info(format!("Restore requested for {}", request.name));
        let point = self.registry.resolve(&request.name)?;
        let target_root = self.config.restore_root();
        validate_writable_dir(target_root)
            .map_err(|e| Error::validation(e.to_string()))
            .with_msg(format!("Cannot restore into {:?}", target_root))?;

        let action = DestructiveAction::Restore {
            point: &point,
            target_root,
        };
        if !self.confirmed(log, request.force, &action) {
            return Ok(None);
        }

        log.info(format!(
            "Extracting {} into {}",
            point.archive_path().display(),
            target_root.display()
        ));
        let report = self
            .engine
            .extract_archive(point.archive_path(), target_root, self.progress.as_ref())
            .with_msg(format!(
                "Restore of {} aborted, {} may be partially restored",
                point.name(),
                target_root.display()
            ))?;

        for skipped in report.skipped() {
            log.warn(format!("Not restored {}", skipped));
        }
        log.info(format!("Restored {} entries from {}", report.entries(), point.name()));
        Ok(Some((point, report.into_skipped())))
    }

    fn run_delete(&self, log: &mut OperationLog, request: &DeleteRequest) -> FlowResult<RestorePoint> {
        log.info(format!("Delete requested for {}", request.name));
        let point = self.registry.resolve(&request.name)?;

        let action = DestructiveAction::Delete { point: &point };
        if !self.confirmed(log, request.force, &action) {
            return Ok(None);
        }

        self.registry.remove(point.name())?;
        log.info(format!("Deleted restore point {}", point.name()));
        Ok(Some((point, Vec::new())))
    }

    fn confirmed(&self, log: &mut OperationLog, force: bool, action: &DestructiveAction<'_>) -> bool {
        if force {
            log.info(format!("{} (confirmation skipped by force flag)", action));
            return true;
        }
        if self.prompter.confirm(action) {
            log.info(format!("{} (confirmed)", action));
            true
        } else {
            log.info(format!("{} (declined, nothing changed)", action));
            false
        }
    }
}

fn conclude<T>(mut log: OperationLog, res: FlowResult<T>) -> OperationReport<T> {
    let outcome = match res {
        Ok(Some((value, warnings))) => Outcome::Success { value, warnings },
        Ok(None) => Outcome::Aborted,
        Err(e) => {
            log.error(format!("[{}] {}", e.category(), e));
            Outcome::Failure(e)
        }
    };
    let action = log.action();
    let log_file = log.end(outcome.status());
    OperationReport {
        action,
        log_file: Some(log_file),
        outcome,
    }
}

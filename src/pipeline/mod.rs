// src/pipeline/mod.rs

//! Phase-driven pipeline engine
//!
//! A run is a fixed sequence of phases, each returning a tagged outcome:
//! success, retryable failure, or fatal failure. Retryable failures are
//! retried in place with a growing delay; after the attempt budget they
//! escalate to fatal. Fatal outcomes and cancellation both route through
//! the cleanup step, which must tolerate any partial state.
//!
//! One worker thread owns all pipeline state and emits an ordered event
//! stream over a channel. The consumer only renders; dropping the
//! receiver turns the run headless. A lock file makes runs mutually
//! exclusive on the whole machine, since a run owns the mounted image and
//! the hardware token.

pub mod cache;
pub mod phases;

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// What a run does with the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    /// Extract, decrypt, and collect assets
    Decrypt,
    /// Re-encrypt modified assets and rebuild the image
    Modify,
}

/// Pipeline phases, in execution order per mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Phase {
    Scan,
    Extract,
    Mount,
    Chroot,
    Authenticate,
    Compile,
    Transform,
    Collect,
    Convert,
    Assemble,
    Cleanup,
}

impl RunMode {
    /// Phases before the final cleanup, in order
    pub fn phases(self) -> &'static [Phase] {
        match self {
            RunMode::Decrypt => &[
                Phase::Extract,
                Phase::Mount,
                Phase::Chroot,
                Phase::Authenticate,
                Phase::Compile,
                Phase::Transform,
                Phase::Collect,
            ],
            RunMode::Modify => &[
                Phase::Scan,
                Phase::Extract,
                Phase::Mount,
                Phase::Chroot,
                Phase::Authenticate,
                Phase::Compile,
                Phase::Transform,
                Phase::Convert,
                Phase::Assemble,
            ],
        }
    }
}

/// Result of one phase attempt
#[derive(Debug)]
pub enum PhaseOutcome {
    Success,
    /// Worth retrying in place (token hiccup, busy resource)
    Retryable(Error),
    /// Abort the run and clean up
    Fatal(Error),
}

impl PhaseOutcome {
    /// Classify an error by its retryability
    pub fn from_error(err: Error) -> Self {
        if err.is_retryable() {
            PhaseOutcome::Retryable(err)
        } else {
            PhaseOutcome::Fatal(err)
        }
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResultCode {
    Success,
    AuthenticationFailed,
    CompileFailed,
    IntegrityCheckFailed,
    MountFailed,
    Cancelled,
    InternalInvariantViolation,
}

impl ResultCode {
    pub fn exit_code(self) -> i32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::AuthenticationFailed => 2,
            ResultCode::CompileFailed => 3,
            ResultCode::IntegrityCheckFailed => 4,
            ResultCode::MountFailed => 5,
            ResultCode::Cancelled => 6,
            ResultCode::InternalInvariantViolation => 7,
        }
    }

    /// Map a fatal error to the code reported for the run. Error kind
    /// wins over phase; external-tool failures fall back to the phase
    /// that was running.
    pub fn for_failure(phase: Phase, err: &Error) -> Self {
        match err {
            Error::Cancelled(_) => ResultCode::Cancelled,
            Error::Authentication(_) | Error::Format(_) => ResultCode::AuthenticationFailed,
            Error::Integrity(_) => ResultCode::IntegrityCheckFailed,
            Error::InvariantViolation(_) => ResultCode::InternalInvariantViolation,
            Error::Unsupported(_) => ResultCode::InternalInvariantViolation,
            _ => match phase {
                Phase::Compile => ResultCode::CompileFailed,
                _ => ResultCode::MountFailed,
            },
        }
    }
}

/// Final report of a run, sent as the last event
#[derive(Debug, Clone)]
pub struct RunReport {
    pub code: ResultCode,
    /// Phase that terminated the run. A cancel between phases is charged
    /// to the last phase that completed; None for a clean success or a
    /// cancel before the first phase.
    pub failed_phase: Option<Phase>,
    pub message: String,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.code == ResultCode::Success
    }
}

/// Severity of a log event line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Ordered events emitted by the worker thread
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PhaseChange {
        phase: Phase,
        index: usize,
        total: usize,
    },
    Progress {
        current: u64,
        total: u64,
        detail: String,
    },
    Log {
        level: EventLevel,
        line: String,
    },
    Done(RunReport),
}

/// Sending half of the event stream; all sends are best-effort so a
/// dropped receiver never stalls the worker
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<PipelineEvent>,
}

impl EventSender {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn phase(&self, phase: Phase, index: usize, total: usize) {
        info!("phase {}/{}: {}", index + 1, total, phase);
        self.send(PipelineEvent::PhaseChange { phase, index, total });
    }

    pub fn progress(&self, current: u64, total: u64, detail: impl Into<String>) {
        self.send(PipelineEvent::Progress {
            current,
            total,
            detail: detail.into(),
        });
    }

    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.send(PipelineEvent::Log {
            level: EventLevel::Info,
            line,
        });
    }

    pub fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        warn!("{}", line);
        self.send(PipelineEvent::Log {
            level: EventLevel::Warn,
            line,
        });
    }

    pub fn error(&self, line: impl Into<String>) {
        let line = line.into();
        error!("{}", line);
        self.send(PipelineEvent::Log {
            level: EventLevel::Error,
            line,
        });
    }
}

/// Exclusive lock for the machine-wide resources a run owns
///
/// A second concurrent run is rejected outright rather than queued; the
/// operator should know two runs were asked for.
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> crate::error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::TransientResource(format!(
                "another run is active (lock held at {})",
                path.display()
            ))
        })?;
        debug!("acquired run lock at {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // The file stays behind: unlinking it would let a waiter that
        // just opened this path hold a lock on a dead inode while a
        // third run locks a fresh file at the same path.
        let _ = self.file.unlock();
        debug!("released run lock at {}", self.path.display());
    }
}

/// Retry policy for retryable phase outcomes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt N (1-based) waits N times this before retrying
    pub base_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_wait: Duration::from_secs(5),
        }
    }
}

/// One phase plus its implementation, boxed so test runs can inject
/// synthetic phases
pub struct PhaseStep<C> {
    pub phase: Phase,
    pub run: Box<dyn FnMut(&mut C) -> PhaseOutcome + Send>,
}

impl<C> PhaseStep<C> {
    pub fn new(
        phase: Phase,
        run: impl FnMut(&mut C) -> PhaseOutcome + Send + 'static,
    ) -> Self {
        Self {
            phase,
            run: Box::new(run),
        }
    }
}

/// Drive a phase list to completion
///
/// `recover` is called after each failed attempt of a retryable phase,
/// before the backoff wait (the production pipeline reseats the token
/// there). `cleanup` always runs, exactly once, whatever the outcome; it
/// must be idempotent against partial state.
pub fn run_phases<C>(
    policy: &RetryPolicy,
    ctx: &mut C,
    mut steps: Vec<PhaseStep<C>>,
    mut recover: impl FnMut(&mut C, Phase, &Error),
    mut cleanup: impl FnMut(&mut C, &EventSender),
    events: &EventSender,
    cancel: &AtomicBool,
) -> RunReport {
    let started = Instant::now();
    // Cleanup counts as a phase for display purposes.
    let total = steps.len() + 1;

    let mut failure: Option<(Option<Phase>, Error)> = None;
    let mut completed: Option<Phase> = None;

    'phases: for (index, step) in steps.iter_mut().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            failure = Some((completed, Error::Cancelled("cancelled between phases".into())));
            break;
        }
        events.phase(step.phase, index, total);

        let mut attempt: u32 = 0;
        loop {
            match (step.run)(ctx) {
                PhaseOutcome::Success => break,
                PhaseOutcome::Fatal(err) => {
                    events.error(format!("{} failed: {}", step.phase, err));
                    failure = Some((Some(step.phase), err));
                    break 'phases;
                }
                PhaseOutcome::Retryable(err) => {
                    attempt += 1;
                    if attempt >= policy.max_attempts {
                        events.error(format!(
                            "{} failed after {} attempts: {}",
                            step.phase, attempt, err
                        ));
                        failure = Some((Some(step.phase), err));
                        break 'phases;
                    }
                    events.warn(format!(
                        "{} attempt {}/{} failed, retrying: {}",
                        step.phase, attempt, policy.max_attempts, err
                    ));
                    recover(ctx, step.phase, &err);
                    if cancel.load(Ordering::SeqCst) {
                        failure = Some((
                            Some(step.phase),
                            Error::Cancelled("cancelled during retry".into()),
                        ));
                        break 'phases;
                    }
                    std::thread::sleep(policy.base_wait * attempt);
                }
            }
        }
        completed = Some(step.phase);
    }

    events.phase(Phase::Cleanup, total - 1, total);
    cleanup(ctx, events);

    let report = match failure {
        None => RunReport {
            code: ResultCode::Success,
            failed_phase: None,
            message: "run completed".to_string(),
            duration: started.elapsed(),
        },
        Some((phase, err)) => RunReport {
            code: match phase {
                Some(phase) => ResultCode::for_failure(phase, &err),
                // Only a cancel can land before the first phase.
                None => ResultCode::Cancelled,
            },
            failed_phase: phase,
            message: err.to_string(),
            duration: started.elapsed(),
        },
    };
    events.send(PipelineEvent::Done(report.clone()));
    report
}

/// Handle to a spawned pipeline run
pub struct PipelineHandle {
    pub events: Receiver<PipelineEvent>,
    cancel: Arc<AtomicBool>,
    join: std::thread::JoinHandle<RunReport>,
}

impl PipelineHandle {
    pub fn new(
        events: Receiver<PipelineEvent>,
        cancel: Arc<AtomicBool>,
        join: std::thread::JoinHandle<RunReport>,
    ) -> Self {
        Self {
            events,
            cancel,
            join,
        }
    }

    /// Request cooperative cancellation; honored between phases
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Wait for the worker to finish and return its report
    pub fn wait(self) -> RunReport {
        self.join.join().unwrap_or(RunReport {
            code: ResultCode::InternalInvariantViolation,
            failed_phase: None,
            message: "pipeline worker panicked".to_string(),
            duration: Duration::ZERO,
        })
    }
}

//! Execution backend contract.
//!
//! The backend runs code; the session only tells it what to run. Calls are
//! fire-and-forget: results come back later as [`BackendEvent`]s pushed
//! through a [`BackendSink`], and the session turns them into operations.
//!
//! ```text
//!   Session ── Action ──▶ dispatcher ── evaluate / stop / forget / drop ──▶ backend
//!      ▲                                                                     │
//!      └──────────── BackendEvent (output, response, down) ◀── BackendSink ──┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use techo_types::{CellOutput, EvaluationResult, Locator, SectionId};

use crate::operation::Action;

/// Options passed with every evaluation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationOptions {
    /// Notebook file, when saved, for backends that resolve relative paths.
    pub file: Option<PathBuf>,
}

/// One evaluation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    /// Run number to echo in every report for this evaluation.
    pub run: u64,
    pub locator: Locator,
    /// Evaluation whose context this one continues from, if any.
    pub prev_locator: Option<Locator>,
    pub code: String,
    pub options: EvaluationOptions,
}

/// Trait for execution backends.
///
/// `evaluate` must eventually report exactly one
/// [`BackendEvent::EvaluationResponse`] for the request's locator and run,
/// preceded by any number of outputs. Reports for a run that was stopped or
/// superseded are discarded by the session.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Get the backend name.
    fn name(&self) -> &str;

    /// Start evaluating. Returns once the request is accepted.
    async fn evaluate(&self, request: EvaluationRequest) -> anyhow::Result<()>;

    /// Interrupt whatever the container is running.
    async fn stop_evaluation(&self, container: SectionId) -> anyhow::Result<()> {
        let _ = container;
        Ok(())
    }

    /// Release the state held for one evaluation.
    async fn forget_evaluation(&self, locator: Locator) -> anyhow::Result<()>;

    /// Tear down a container.
    async fn drop_container(&self, container: SectionId) -> anyhow::Result<()>;

    /// Completion candidates for `hint` in the context of `locator`.
    async fn request_completion(&self, locator: Locator, hint: &str) -> anyhow::Result<Vec<String>> {
        let _ = (locator, hint);
        Ok(Vec::new())
    }
}

/// Events the backend reports back to the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    EvaluationOutput {
        locator: Locator,
        run: u64,
        output: CellOutput,
    },
    EvaluationResponse {
        locator: Locator,
        run: u64,
        result: EvaluationResult,
    },
    ContainerDown {
        container: SectionId,
        reason: String,
    },
    BackendDown {
        reason: String,
    },
}

/// Sending half of the backend event channel.
#[derive(Clone, Debug)]
pub struct BackendSink {
    tx: mpsc::Sender<BackendEvent>,
}

impl BackendSink {
    pub(crate) fn new(tx: mpsc::Sender<BackendEvent>) -> Self {
        Self { tx }
    }

    /// Report an event. Returns false once the session is gone.
    pub async fn send(&self, event: BackendEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub async fn output(&self, locator: Locator, run: u64, output: CellOutput) -> bool {
        self.send(BackendEvent::EvaluationOutput {
            locator,
            run,
            output,
        })
        .await
    }

    pub async fn response(&self, locator: Locator, run: u64, result: EvaluationResult) -> bool {
        self.send(BackendEvent::EvaluationResponse {
            locator,
            run,
            result,
        })
        .await
    }

    pub async fn container_down(&self, container: SectionId, reason: impl Into<String>) -> bool {
        self.send(BackendEvent::ContainerDown {
            container,
            reason: reason.into(),
        })
        .await
    }

    pub async fn backend_down(&self, reason: impl Into<String>) -> bool {
        self.send(BackendEvent::BackendDown {
            reason: reason.into(),
        })
        .await
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Carry out actions against the backend, one at a time, in order.
///
/// A failed `evaluate` means the backend is unusable and is reported as
/// [`BackendEvent::BackendDown`]. Failed cleanup calls are only logged.
pub(crate) async fn run_dispatcher(
    backend: Arc<dyn ExecutionBackend>,
    mut actions: mpsc::UnboundedReceiver<(Action, EvaluationOptions)>,
    sink: BackendSink,
) {
    while let Some((action, options)) = actions.recv().await {
        match action {
            Action::StartEvaluation {
                locator,
                prev_locator,
                code,
                run,
            } => {
                let request = EvaluationRequest {
                    run,
                    locator,
                    prev_locator,
                    code,
                    options,
                };
                if let Err(e) = backend.evaluate(request).await {
                    warn!(backend = backend.name(), error = %e, "evaluate failed");
                    sink.backend_down(e.to_string()).await;
                }
            }
            Action::StopEvaluation { section_id } => {
                if let Err(e) = backend.stop_evaluation(section_id).await {
                    warn!(backend = backend.name(), %section_id, error = %e, "stop_evaluation failed");
                }
            }
            Action::ForgetEvaluation { locator } => {
                if let Err(e) = backend.forget_evaluation(locator).await {
                    warn!(backend = backend.name(), error = %e, "forget_evaluation failed");
                }
            }
            Action::DropContainer { section_id } => {
                if let Err(e) = backend.drop_container(section_id).await {
                    warn!(backend = backend.name(), %section_id, error = %e, "drop_container failed");
                }
            }
        }
    }
}

// ============================================================================
// Stock backends
// ============================================================================

/// Accepts every call and never reports back.
#[derive(Debug, Default)]
pub struct NullBackend;

#[async_trait]
impl ExecutionBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    async fn evaluate(&self, _request: EvaluationRequest) -> anyhow::Result<()> {
        Ok(())
    }

    async fn forget_evaluation(&self, _locator: Locator) -> anyhow::Result<()> {
        Ok(())
    }

    async fn drop_container(&self, _container: SectionId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A call observed by [`RecordingBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Evaluate(EvaluationRequest),
    Stop(SectionId),
    Forget(Locator),
    Drop(SectionId),
    Complete(Locator, String),
}

/// Records every call; optionally fails evaluations.
///
/// Used by tests to drive a session without a real runtime.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    fail_evaluations: Mutex<Option<String>>,
    completions: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls seen so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Evaluation requests seen so far.
    pub fn evaluations(&self) -> Vec<EvaluationRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Evaluate(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make every later `evaluate` fail with `reason`.
    pub fn fail_evaluations(&self, reason: impl Into<String>) {
        *self.fail_evaluations.lock() = Some(reason.into());
    }

    pub fn set_completions(&self, items: Vec<String>) {
        *self.completions.lock() = items;
    }
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn evaluate(&self, request: EvaluationRequest) -> anyhow::Result<()> {
        self.calls.lock().push(BackendCall::Evaluate(request));
        if let Some(reason) = self.fail_evaluations.lock().clone() {
            anyhow::bail!(reason);
        }
        Ok(())
    }

    async fn stop_evaluation(&self, container: SectionId) -> anyhow::Result<()> {
        self.calls.lock().push(BackendCall::Stop(container));
        Ok(())
    }

    async fn forget_evaluation(&self, locator: Locator) -> anyhow::Result<()> {
        self.calls.lock().push(BackendCall::Forget(locator));
        Ok(())
    }

    async fn drop_container(&self, container: SectionId) -> anyhow::Result<()> {
        self.calls.lock().push(BackendCall::Drop(container));
        Ok(())
    }

    async fn request_completion(&self, locator: Locator, hint: &str) -> anyhow::Result<Vec<String>> {
        self.calls
            .lock()
            .push(BackendCall::Complete(locator, hint.to_string()));
        let items = self.completions.lock().clone();
        Ok(items.into_iter().filter(|item| item.starts_with(hint)).collect())
    }
}

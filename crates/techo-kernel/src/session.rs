//! The session orchestrator: one task per open notebook.
//!
//! All mutation funnels through a single consumer loop. Handles send commands
//! over mpsc and await oneshot replies; the loop applies operations through
//! the reducer one at a time, broadcasts each accepted operation on the
//! session bus, and hands the resulting actions to the backend dispatcher.
//!
//! ```text
//!   SessionHandle (Clone)     mpsc       Session task
//!   ┌─────────────────┐  ──────────▶  ┌───────────────────────────┐
//!   │ .join()         │               │ NotebookState (owned)     │──▶ SessionBus
//!   │ .submit()       │  ◀──────────  │ reducer, seq counter      │
//!   │ .save()         │   oneshot     │ autosave interval         │──▶ dispatcher ──▶ backend
//!   └─────────────────┘               └───────────────────────────┘
//!                                        ▲
//!   BackendSink ── BackendEvent ─────────┘
//! ```
//!
//! Backend failures are data: a lost container or backend cancels the
//! affected evaluations through ordinary operations and publishes a notice.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use techo_types::{CellId, ClientId, Locator, SectionId, SessionId};

use crate::backend::{
    BackendEvent, BackendSink, EvaluationOptions, ExecutionBackend, run_dispatcher,
};
use crate::config::SessionConfig;
use crate::constants::{BACKEND_CHANNEL_CAPACITY, COMMAND_CHANNEL_CAPACITY};
use crate::data::NotebookState;
use crate::error::{OperationError, SessionError};
use crate::export::{Exporter, write_export};
use crate::flows::{Notice, SessionBus, SessionFlow, Subscription};
use crate::operation::{Action, Operation};

// ============================================================================
// Public types
// ============================================================================

/// What a joining client receives.
#[derive(Debug)]
pub struct JoinReply {
    pub client_id: ClientId,
    /// State before the client's own join operation.
    pub state: NotebookState,
    /// Every broadcast from the join operation onwards, in order.
    pub subscription: Subscription<SessionFlow>,
}

/// A consistent restart point for a replica that missed broadcasts.
#[derive(Debug)]
pub struct ResyncReply {
    /// Sequence number of the last operation reflected in `state`.
    pub seq: u64,
    pub state: NotebookState,
    /// Every broadcast after `seq`, in order.
    pub subscription: Subscription<SessionFlow>,
}

/// A short description of an open session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub name: String,
    pub file: Option<PathBuf>,
    pub section_count: usize,
    pub cell_count: usize,
    pub source_bytes: usize,
    pub client_count: usize,
    pub dirty: bool,
}

// ============================================================================
// Commands (internal)
// ============================================================================

enum SessionCommand {
    Join {
        reply: oneshot::Sender<Result<JoinReply, OperationError>>,
    },
    Leave {
        client_id: ClientId,
        reply: oneshot::Sender<Result<(), OperationError>>,
    },
    Submit {
        client_id: ClientId,
        operation: Operation,
        reply: oneshot::Sender<Result<u64, OperationError>>,
    },
    Snapshot {
        reply: oneshot::Sender<NotebookState>,
    },
    Resync {
        reply: oneshot::Sender<ResyncReply>,
    },
    Summary {
        reply: oneshot::Sender<SessionSummary>,
    },
    Save {
        reply: oneshot::Sender<Result<PathBuf, SessionError>>,
    },
    RequestCompletion {
        cell_id: CellId,
        hint: String,
        reply: oneshot::Sender<Result<Vec<String>, SessionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// SessionHandle
// ============================================================================

/// Cloneable handle to a running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<SessionCommand>,
    bus: SessionBus,
    sink: BackendSink,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Channel the execution backend reports on.
    pub fn backend_sink(&self) -> BackendSink {
        self.sink.clone()
    }

    /// Observe broadcasts without joining as a client.
    pub fn subscribe(&self, pattern: &str) -> Subscription<SessionFlow> {
        self.bus.subscribe(pattern)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    // ── Clients ──────────────────────────────────────────────────────────

    /// Attach a new client.
    pub async fn join(&self) -> Result<JoinReply, SessionError> {
        Ok(self.request(|reply| SessionCommand::Join { reply }).await??)
    }

    pub async fn leave(&self, client_id: ClientId) -> Result<(), SessionError> {
        Ok(self
            .request(|reply| SessionCommand::Leave { client_id, reply })
            .await??)
    }

    /// Submit an operation on behalf of a joined client.
    ///
    /// Returns the broadcast sequence number it was accepted under.
    pub async fn submit(&self, client_id: ClientId, operation: Operation) -> Result<u64, SessionError> {
        Ok(self
            .request(|reply| SessionCommand::Submit {
                client_id,
                operation,
                reply,
            })
            .await??)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> Result<NotebookState, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Fresh state plus a subscription that continues exactly where it ends.
    ///
    /// A client whose subscription reported
    /// [`FlowError::Lagged`](crate::error::FlowError::Lagged) replaces its
    /// replica and subscription with these.
    pub async fn resync(&self) -> Result<ResyncReply, SessionError> {
        self.request(|reply| SessionCommand::Resync { reply }).await
    }

    pub async fn summary(&self) -> Result<SessionSummary, SessionError> {
        self.request(|reply| SessionCommand::Summary { reply }).await
    }

    pub async fn request_completion(
        &self,
        cell_id: CellId,
        hint: &str,
    ) -> Result<Vec<String>, SessionError> {
        self.request(|reply| SessionCommand::RequestCompletion {
            cell_id,
            hint: hint.to_string(),
            reply,
        })
        .await?
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Export the notebook to the configured file.
    pub async fn save(&self) -> Result<PathBuf, SessionError> {
        self.request(|reply| SessionCommand::Save { reply }).await?
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await
    }
}

// ============================================================================
// Session task
// ============================================================================

/// Exclusive owner of one notebook's state.
pub struct Session {
    id: SessionId,
    state: NotebookState,
    seq: u64,
    config: SessionConfig,
    backend: Arc<dyn ExecutionBackend>,
    exporter: Arc<dyn Exporter>,
    bus: SessionBus,
    actions: mpsc::UnboundedSender<(Action, EvaluationOptions)>,
}

impl Session {
    /// Start a session task and its backend dispatcher.
    pub fn spawn(
        state: NotebookState,
        backend: Arc<dyn ExecutionBackend>,
        exporter: Arc<dyn Exporter>,
        config: SessionConfig,
    ) -> SessionHandle {
        let id = SessionId::new();
        let bus = SessionBus::new(config.event_capacity.max(1));
        let (tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, events) = mpsc::channel(BACKEND_CHANNEL_CAPACITY);
        let sink = BackendSink::new(event_tx);
        let (action_tx, action_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_dispatcher(backend.clone(), action_rx, sink.clone()));

        let session = Session {
            id,
            state: state.with_bin_limit(config.bin_limit),
            seq: 0,
            config,
            backend,
            exporter,
            bus: bus.clone(),
            actions: action_tx,
        };
        info!(session_id = %id, name = %session.state.notebook.name, "session started");
        tokio::spawn(session.run(commands, events));

        SessionHandle { id, tx, bus, sink }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut events: mpsc::Receiver<BackendEvent>,
    ) {
        let mut autosave = self.config.autosave_interval().map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if let SessionCommand::Shutdown { reply } = command {
                        let _ = reply.send(());
                        break;
                    }
                    self.handle_command(command).await;
                }
                Some(event) = events.recv() => self.handle_event(event),
                () = next_tick(&mut autosave) => self.autosave().await,
            }
        }

        info!(session_id = %self.id, "session stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join { reply } => {
                let _ = reply.send(self.join());
            }
            SessionCommand::Leave { client_id, reply } => {
                let result = self.process(None, Operation::ClientLeave { client_id });
                if result.is_ok() {
                    info!(session_id = %self.id, %client_id, "client left");
                }
                let _ = reply.send(result.map(|_| ()));
            }
            SessionCommand::Submit {
                client_id,
                operation,
                reply,
            } => {
                let _ = reply.send(self.submit(client_id, operation));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.clone());
            }
            SessionCommand::Resync { reply } => {
                debug!(session_id = %self.id, seq = self.seq, "replica resync");
                let _ = reply.send(ResyncReply {
                    seq: self.seq,
                    state: self.state.clone(),
                    subscription: self.bus.subscribe(">"),
                });
            }
            SessionCommand::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
            SessionCommand::Save { reply } => {
                let _ = reply.send(self.save().await);
            }
            SessionCommand::RequestCompletion {
                cell_id,
                hint,
                reply,
            } => self.request_completion(cell_id, hint, reply),
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Apply, broadcast, then dispatch actions. Rejections are neither
    /// applied nor broadcast.
    fn process(&mut self, origin: Option<ClientId>, operation: Operation) -> Result<u64, OperationError> {
        let actions = match self.state.apply(&operation) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(
                    session_id = %self.id,
                    operation = operation.name(),
                    error = %e,
                    "operation rejected"
                );
                return Err(e);
            }
        };

        self.seq += 1;
        let seq = self.seq;
        debug!(
            session_id = %self.id,
            seq,
            operation = operation.name(),
            actions = actions.len(),
            "operation applied"
        );
        self.bus.publish(SessionFlow::Operation {
            seq,
            origin,
            operation,
        });

        let options = EvaluationOptions {
            file: self.config.file.clone(),
        };
        for action in actions {
            debug!(session_id = %self.id, ?action, "dispatching action");
            if self.actions.send((action, options.clone())).is_err() {
                warn!(session_id = %self.id, "backend dispatcher is gone");
            }
        }
        Ok(seq)
    }

    fn join(&mut self) -> Result<JoinReply, OperationError> {
        let client_id = ClientId::new();
        let state = self.state.clone();
        let subscription = self.bus.subscribe(">");
        self.process(None, Operation::ClientJoin { client_id })?;
        info!(session_id = %self.id, %client_id, "client joined");
        Ok(JoinReply {
            client_id,
            state,
            subscription,
        })
    }

    fn submit(&mut self, client_id: ClientId, operation: Operation) -> Result<u64, OperationError> {
        if !self.state.clients.contains(&client_id) {
            return Err(OperationError::UnknownClient(client_id));
        }
        if operation.is_internal() || operation.client_id().is_some_and(|id| id != client_id) {
            return Err(OperationError::NotPermitted(operation.name()));
        }
        self.process(Some(client_id), operation)
    }

    // ── Backend events ───────────────────────────────────────────────────

    fn handle_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::EvaluationOutput {
                locator,
                run,
                output,
            } => {
                if !self.accepts_report(&locator, run) {
                    return;
                }
                let _ = self.process(
                    None,
                    Operation::AddCellEvaluationOutput {
                        id: locator.evaluation,
                        output,
                    },
                );
            }
            BackendEvent::EvaluationResponse {
                locator,
                run,
                result,
            } => {
                if !self.accepts_report(&locator, run) {
                    return;
                }
                let _ = self.process(
                    None,
                    Operation::AddCellEvaluationResponse {
                        id: locator.evaluation,
                        result,
                    },
                );
            }
            BackendEvent::ContainerDown { container, reason } => {
                warn!(session_id = %self.id, section_id = %container, %reason, "container down");
                if self.state.notebook.find_section(&container).is_some() {
                    self.fail_evaluations(Some(container));
                }
                self.publish_notice(Notice::ContainerDown {
                    section_id: container,
                    reason,
                });
            }
            BackendEvent::BackendDown { reason } => {
                warn!(session_id = %self.id, %reason, "backend down");
                self.fail_evaluations(None);
                self.publish_notice(Notice::BackendDown { reason });
            }
        }
    }

    /// Reports count only for the run currently evaluating at their locator.
    fn accepts_report(&self, locator: &Locator, run: u64) -> bool {
        let current = self.state.is_current_run(locator, run);
        if !current {
            debug!(
                session_id = %self.id,
                cell_id = %locator.evaluation,
                run,
                "discarding report from a finished run"
            );
        }
        current
    }

    /// Cancel every evaluating or queued cell in scope, then mark results
    /// whose container is gone as aborted.
    ///
    /// Sections are walked last to first and queues back to front, so no
    /// cancellation unblocks a queue head that is still waiting to be
    /// cancelled.
    fn fail_evaluations(&mut self, scope: Option<SectionId>) {
        let sections: Vec<SectionId> = match scope {
            Some(id) => vec![id],
            None => self.state.notebook.sections.iter().map(|s| s.id).collect(),
        };

        let mut busy = Vec::new();
        for section_id in sections.iter().rev() {
            if let Some(info) = self.state.section_info(section_id) {
                busy.extend(info.evaluation_queue.iter().rev().copied());
                busy.extend(info.evaluating_cell_id);
            }
        }

        for id in busy {
            let still_busy = self
                .state
                .cell_info(&id)
                .is_some_and(|info| info.is_busy());
            if still_busy {
                let _ = self.process(None, Operation::CancelCellEvaluation { id });
            }
        }
        let _ = self.process(None, Operation::ReflectEvaluationFailure { section_id: scope });
    }

    fn publish_notice(&self, notice: Notice) {
        self.bus.publish(SessionFlow::Notice { notice });
    }

    // ── Queries ──────────────────────────────────────────────────────────

    fn summary(&self) -> SessionSummary {
        let notebook = &self.state.notebook;
        SessionSummary {
            session_id: self.id,
            name: notebook.name.clone(),
            file: self.config.file.clone(),
            section_count: notebook.sections.len(),
            cell_count: notebook.cell_count(),
            source_bytes: notebook.source_bytes(),
            client_count: self.state.clients.len(),
            dirty: self.state.dirty,
        }
    }

    fn request_completion(
        &self,
        cell_id: CellId,
        hint: String,
        reply: oneshot::Sender<Result<Vec<String>, SessionError>>,
    ) {
        let Some((_, section)) = self.state.notebook.find_cell_with_section(&cell_id) else {
            let _ = reply.send(Err(OperationError::CellNotFound(cell_id).into()));
            return;
        };
        let locator = Locator::new(section.id, cell_id);
        let backend = self.backend.clone();

        tokio::spawn(async move {
            let result = backend
                .request_completion(locator, &hint)
                .await
                .map_err(|e| SessionError::Backend(e.to_string()));
            let _ = reply.send(result);
        });
    }

    // ── Persistence ──────────────────────────────────────────────────────

    async fn save(&mut self) -> Result<PathBuf, SessionError> {
        let Some(path) = self.config.file.clone() else {
            return Err(SessionError::NoSaveTarget);
        };

        match write_export(self.exporter.as_ref(), &self.state.notebook, &path).await {
            Ok(bytes) => {
                info!(
                    session_id = %self.id,
                    path = %path.display(),
                    exporter = self.exporter.name(),
                    bytes,
                    "notebook saved"
                );
                self.process(None, Operation::MarkAsSaved)?;
                self.publish_notice(Notice::Saved { path: path.clone() });
                Ok(path)
            }
            Err(e) => {
                warn!(session_id = %self.id, path = %path.display(), error = %e, "save failed");
                self.publish_notice(Notice::SaveFailed {
                    reason: e.to_string(),
                });
                Err(SessionError::Save(e.to_string()))
            }
        }
    }

    async fn autosave(&mut self) {
        if !self.state.dirty || self.config.file.is_none() {
            return;
        }
        if let Err(e) = self.save().await {
            debug!(session_id = %self.id, error = %e, "autosave skipped");
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

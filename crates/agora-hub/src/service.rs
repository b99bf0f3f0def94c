// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `HubService` — the single-writer loop that owns all coordination state.
//!
//! Transport tasks (HTTP handlers, WebSocket bridges, the dialer) talk to the
//! service exclusively through [`HubHandle`]: commands go in over a shared
//! mpsc channel and are processed sequentially; observability events come
//! back on a broadcast channel.  Handler invocations are the only work that
//! may suspend, so they run in spawned tasks and report back through an
//! internal completion channel — the service then finalizes the task state
//! *before* the HTTP caller sees the reply.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agora_config::HubConfig;
use agora_proto::{
    builtin_skills, now_ms, AgentDescriptor, AgentKind, AgentMessage, CompletedPayload,
    ContributionPayload, InvitePayload, MessageSendParams, MessageType, PatternKind, PeerMessage,
    SendResult, TaskState, TaskView, BROADCAST,
};

use crate::conn::{ConnectionHandle, ConnectionId};
use crate::error::HubError;
use crate::handler::{Handler, HandlerError, HandlerRequest, ProgressSink, RequestKind};
use crate::metrics::{HealthSnapshot, Metrics};
use crate::patterns::{Coordination, MergeVerdict};
use crate::registry::Registry;
use crate::router::{Routed, Router};
use crate::scheduler::{Deadline, Scheduler};
use crate::tasks::{Task, TaskStore};

/// How often timed-out pending replies are swept.
const PENDING_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

// ── Commands and events ───────────────────────────────────────────────────────

/// A coordination task request (the programmatic twin of `task:invite`).
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub required_capabilities: Vec<String>,
    pub context_id: Option<String>,
    pub payload: serde_json::Value,
    pub pattern: Option<PatternKind>,
    pub requester: Option<String>,
}

/// Commands sent by transport tasks to the service loop.
pub enum HubCommand {
    /// A new peer connection (inbound or dialed) came up.
    Connected { handle: ConnectionHandle },
    /// One frame arrived on a connection.
    Inbound {
        message: PeerMessage,
        via: Option<ConnectionId>,
    },
    /// The connection closed or a write to it failed.
    Disconnected { id: ConnectionId },
    /// `message/send` and `message/stream`.  With `progress` set,
    /// intermediate and final agent messages are forwarded for streaming.
    SendMessage {
        params: MessageSendParams,
        progress: Option<mpsc::Sender<AgentMessage>>,
        reply: oneshot::Sender<Result<SendResult, HubError>>,
    },
    GetTask {
        task_id: String,
        reply: oneshot::Sender<Option<TaskView>>,
    },
    CancelTask {
        task_id: String,
        reply: oneshot::Sender<Result<TaskView, HubError>>,
    },
    /// Start a multi-agent coordination task.
    CreateTask {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<TaskView, HubError>>,
    },
    Health {
        reply: oneshot::Sender<HealthSnapshot>,
    },
    Shutdown,
}

/// Observability events broadcast to every subscriber.
#[derive(Debug, Clone)]
pub enum HubEvent {
    AgentRegistered { identity: String },
    AgentExpired { identity: String },
    TaskStateChanged { task_id: String, state: TaskState },
    /// A peer invited this hub to participate in its task; whoever embeds
    /// the hub decides whether to contribute.
    InviteReceived {
        from: String,
        invite: InvitePayload,
    },
    /// A peer announced the terminal result of a task it owns.
    ForeignTaskCompleted { task_id: String, from: String },
    UnknownMessage { message_type: String },
    MessageRejected { reason: String },
    DiscoveryBroadcast,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to the running [`HubService`].
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::Sender<HubCommand>,
    event_tx: broadcast::Sender<HubEvent>,
    host: Arc<AgentDescriptor>,
}

impl HubHandle {
    pub async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| HubError::ServiceClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.event_tx.subscribe()
    }

    /// Identity of the local host agent.
    pub fn host_identity(&self) -> &str {
        &self.host.identity
    }

    /// Descriptor sent as `agent:register` on dialed connections.
    pub fn host_descriptor(&self) -> AgentDescriptor {
        let mut desc = (*self.host).clone();
        desc.timestamp = now_ms();
        desc
    }

    pub async fn send_message(
        &self,
        params: MessageSendParams,
        progress: Option<mpsc::Sender<AgentMessage>>,
    ) -> Result<SendResult, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::SendMessage {
            params,
            progress,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::ServiceClosed)?
    }

    pub async fn get_task(&self, task_id: impl Into<String>) -> Result<Option<TaskView>, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::GetTask {
            task_id: task_id.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::ServiceClosed)
    }

    pub async fn cancel_task(&self, task_id: impl Into<String>) -> Result<TaskView, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::CancelTask {
            task_id: task_id.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| HubError::ServiceClosed)?
    }

    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskView, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::CreateTask { spec, reply: tx }).await?;
        rx.await.map_err(|_| HubError::ServiceClosed)?
    }

    pub async fn health(&self) -> Result<HealthSnapshot, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Health { reply: tx }).await?;
        rx.await.map_err(|_| HubError::ServiceClosed)
    }

    pub async fn deliver(&self, message: PeerMessage, via: Option<ConnectionId>) {
        let _ = self.send(HubCommand::Inbound { message, via }).await;
    }

    pub async fn connected(&self, handle: ConnectionHandle) {
        let _ = self.send(HubCommand::Connected { handle }).await;
    }

    pub async fn disconnected(&self, id: ConnectionId) {
        let _ = self.send(HubCommand::Disconnected { id }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.send(HubCommand::Shutdown).await;
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

struct HandlerCompletion {
    task_id: String,
    outcome: Result<AgentMessage, HandlerError>,
    reply: oneshot::Sender<Result<SendResult, HubError>>,
}

enum Finalize {
    Complete(serde_json::Value),
    Fail(String),
    Expire,
    Cancel,
}

/// The coordination core. Owns registry, task store, router and timers.
pub struct HubService {
    config: Arc<HubConfig>,
    handler: Arc<dyn Handler>,
    registry: Registry,
    store: TaskStore,
    router: Router,
    scheduler: Scheduler,
    metrics: Metrics,
    cmd_rx: mpsc::Receiver<HubCommand>,
    completion_tx: mpsc::Sender<HandlerCompletion>,
    completion_rx: mpsc::Receiver<HandlerCompletion>,
    event_tx: broadcast::Sender<HubEvent>,
}

impl HubService {
    /// Construct the service and a cheap [`HubHandle`] to it.  The handle
    /// must be distributed to transport tasks before calling [`run`].
    ///
    /// [`run`]: HubService::run
    pub fn new(config: Arc<HubConfig>, handler: Arc<dyn Handler>) -> (Self, HubHandle) {
        let identity = Uuid::new_v4().to_string();
        let skills = builtin_skills();
        let host = AgentDescriptor {
            identity,
            name: Some(config.agent.name.clone()),
            kind: AgentKind::Host,
            capabilities: skills.iter().map(|s| s.id.clone()).collect(),
            endpoint: Some(format!(
                "http://{}:{}/",
                config.network.host, config.network.port
            )),
            version: Some(
                config
                    .agent
                    .version
                    .clone()
                    .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            ),
            metadata: None,
            timestamp: now_ms(),
        };

        // Command capacity absorbs bursts without blocking transports;
        // the broadcast side is fan-out only.
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(1024);
        let (completion_tx, completion_rx) = mpsc::channel(64);

        let handle = HubHandle {
            cmd_tx,
            event_tx: event_tx.clone(),
            host: Arc::new(host.clone()),
        };

        let svc = Self {
            registry: Registry::new(host),
            store: TaskStore::default(),
            router: Router::new(
                handle.host_identity().to_string(),
                config.messaging.validate_schema,
                config.messaging.message_history,
            ),
            scheduler: Scheduler::new(),
            metrics: Metrics::new(),
            handler,
            config,
            cmd_rx,
            completion_tx,
            completion_rx,
            event_tx,
        };

        (svc, handle)
    }

    /// Run the service loop.  Returns on [`HubCommand::Shutdown`] or when
    /// every handle is gone.
    pub async fn run(mut self) {
        info!(identity = %self.registry.host_identity(), "hub service started");
        self.seed_timers();

        loop {
            let next = self.scheduler.next_due();
            tokio::select! {
                maybe = self.cmd_rx.recv() => {
                    match maybe {
                        Some(HubCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                Some(done) = self.completion_rx.recv() => {
                    self.finish_handler_run(done);
                }
                _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)),
                    if next.is_some() =>
                {
                    for deadline in self.scheduler.pop_due(Instant::now()) {
                        self.fire(deadline);
                    }
                }
            }
        }
        info!("hub service stopped");
    }

    fn seed_timers(&mut self) {
        self.scheduler
            .push_after(self.reap_interval(), Deadline::ReapAgents);
        self.scheduler
            .push_after(PENDING_SWEEP_INTERVAL, Deadline::PendingSweep);
        if self.config.discovery.enabled {
            self.scheduler.push_after(
                self.config.discovery.broadcast_interval(),
                Deadline::DiscoveryBroadcast,
            );
        }
    }

    fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs((self.config.discovery.agent_ttl / 2).max(5))
    }

    // ── Command dispatch ──────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connected { handle } => self.handle_connected(handle),
            HubCommand::Inbound { message, via } => self.handle_inbound(message, via),
            HubCommand::Disconnected { id } => self.handle_disconnected(id),
            HubCommand::SendMessage {
                params,
                progress,
                reply,
            } => self.handle_send_message(params, progress, reply),
            HubCommand::GetTask { task_id, reply } => {
                let _ = reply.send(self.store.get(&task_id).map(Task::view));
            }
            HubCommand::CancelTask { task_id, reply } => {
                let _ = reply.send(self.handle_cancel(&task_id));
            }
            HubCommand::CreateTask { spec, reply } => {
                let _ = reply.send(self.handle_create_task(spec));
            }
            HubCommand::Health { reply } => {
                let _ = reply.send(self.snapshot());
            }
            HubCommand::Shutdown => {}
        }
    }

    fn handle_connected(&mut self, handle: ConnectionHandle) {
        if self.router.connection_count() >= self.config.network.max_connections {
            warn!(conn = %handle.id, "connection limit reached, refusing peer");
            handle.close();
            return;
        }
        debug!(conn = %handle.id, "peer connection attached");
        self.router.attach(handle);
    }

    fn handle_disconnected(&mut self, id: ConnectionId) {
        if let Some(identity) = self.router.connections().detach(id) {
            self.registry.mark_expired(&identity);
            info!(%identity, conn = %id, "peer disconnected, record expired");
            self.emit(HubEvent::AgentExpired { identity });
        } else {
            debug!(conn = %id, "unregistered connection closed");
        }
    }

    // ── Inbound routing ───────────────────────────────────────────────────────

    fn handle_inbound(&mut self, message: PeerMessage, via: Option<ConnectionId>) {
        let from = message.from.clone();
        let routed = match self.router.ingest(message, via) {
            Err(e) => {
                self.metrics.errors += 1;
                warn!(%from, error = %e, "dropping invalid message");
                self.emit(HubEvent::MessageRejected {
                    reason: e.to_string(),
                });
                return;
            }
            Ok(routed) => routed,
        };

        self.metrics.messages_processed += 1;
        self.registry.touch(&from);

        match routed {
            Routed::Register { descriptor, via } => {
                let identity = descriptor.identity.clone();
                let is_new = self.registry.register(descriptor);
                if let Some(id) = via {
                    self.router.connections().bind(identity.clone(), id);
                }
                if is_new {
                    info!(%identity, "agent registered");
                } else {
                    debug!(%identity, "agent registration refreshed");
                }
                self.emit(HubEvent::AgentRegistered { identity });
            }
            Routed::Discovery {
                from,
                request_id,
                probe,
                via,
            } => {
                debug!(%from, probe_ts = probe.timestamp, "discovery probe");
                self.answer_discovery(&from, &request_id, via);
            }
            Routed::DiscoveryResponse { descriptor, via } => {
                let identity = descriptor.identity.clone();
                self.registry.register(descriptor);
                if let Some(id) = via {
                    self.router.connections().bind(identity, id);
                }
            }
            Routed::Invite { from, invite } => {
                debug!(%from, task = %invite.task_id, "invited to a peer task");
                self.emit(HubEvent::InviteReceived { from, invite });
            }
            Routed::Contribution { from, contribution } => {
                self.handle_contribution(&from, contribution);
            }
            Routed::Completed { from, completed } => {
                if self.store.contains(&completed.task_id) {
                    // Only the creating engine may complete a task.
                    self.metrics.errors += 1;
                    warn!(
                        %from,
                        task = %completed.task_id,
                        "rejecting completion of a task this hub owns"
                    );
                } else {
                    debug!(%from, task = %completed.task_id, "peer task completed");
                    self.emit(HubEvent::ForeignTaskCompleted {
                        task_id: completed.task_id,
                        from,
                    });
                }
            }
            Routed::Vote { from, vote } => {
                // Votes are contributions of the consensus pattern; the
                // proposal id is the task being voted on.
                let participation = serde_json::json!({
                    "proposal": vote.vote,
                    "score": vote.score.unwrap_or(1.0),
                    "rationale": vote.rationale,
                });
                self.handle_contribution(
                    &from,
                    ContributionPayload {
                        task_id: vote.proposal_id,
                        participation,
                    },
                );
            }
            Routed::ConsensusNotice { from, data } => {
                debug!(%from, ?data, "consensus notice observed");
            }
            Routed::Reply => {}
            Routed::Unknown { message_type } => {
                debug!(%from, %message_type, "unknown message type");
                self.emit(HubEvent::UnknownMessage { message_type });
            }
        }
    }

    fn answer_discovery(&mut self, to: &str, request_id: &str, via: Option<ConnectionId>) {
        let mut data =
            serde_json::to_value(self.registry.host_descriptor()).unwrap_or_default();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("replyTo".to_string(), serde_json::json!(request_id));
        }
        let reply = PeerMessage::new(
            MessageType::AgentDiscoveryResponse,
            self.registry.host_identity(),
            to,
            data,
        );
        let sent = match via {
            Some(id) => self.router.send_via(id, reply, false),
            None => self.router.unicast(to, reply, false),
        };
        match sent {
            Ok(outcome) if outcome.dropped() => self.metrics.dropped_messages += 1,
            Ok(_) => {}
            Err(e) => debug!(%to, error = %e, "discovery response undeliverable"),
        }
    }

    fn handle_contribution(&mut self, from: &str, contribution: ContributionPayload) {
        let task_id = contribution.task_id.clone();
        let Some(task) = self.store.get_mut(&task_id) else {
            self.metrics.errors += 1;
            warn!(%from, task = %task_id, "contribution for unknown task");
            return;
        };
        if task.state.is_terminal() {
            debug!(%from, task = %task_id, "late contribution ignored");
            return;
        }

        let before = task.state;
        if let Err(e) = task.record_contribution(from, contribution.participation) {
            self.metrics.errors += 1;
            warn!(%from, task = %task_id, error = %e, "contribution rejected");
            return;
        }
        let after = task.state;
        let verdict = task
            .pattern
            .evaluate(task, &self.config.coordination, false);

        if after != before {
            self.emit(HubEvent::TaskStateChanged {
                task_id: task_id.clone(),
                state: after,
            });
        }
        self.apply_verdict(&task_id, verdict);
    }

    fn apply_verdict(&mut self, task_id: &str, verdict: MergeVerdict) {
        match verdict {
            MergeVerdict::Pending => {}
            MergeVerdict::Completed(result) => self.finalize(task_id, Finalize::Complete(result)),
            MergeVerdict::Failed(reason) => self.finalize(task_id, Finalize::Fail(reason)),
            MergeVerdict::Expired => self.finalize(task_id, Finalize::Expire),
        }
    }

    /// Drive a task into a terminal state, announce it to the invitees and
    /// schedule its retention drop.  No-op when the task is already terminal.
    fn finalize(&mut self, task_id: &str, how: Finalize) {
        let Some(task) = self.store.get_mut(task_id) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }

        let outcome = match how {
            Finalize::Complete(result) => task.complete(result),
            Finalize::Fail(reason) => task.fail(reason),
            Finalize::Expire => task.expire(),
            Finalize::Cancel => task.cancel_by_request(),
        };
        if let Err(e) = outcome {
            warn!(task = %task_id, error = %e, "finalize failed");
            return;
        }

        let state = task.state;
        let payload = CompletedPayload {
            task_id: task.id.clone(),
            state,
            final_result: task.result.clone().unwrap_or(serde_json::Value::Null),
        };
        let invitees = task.invitees.clone();
        let host = self.registry.host_identity().to_string();

        for invitee in invitees {
            let msg = PeerMessage::new(
                MessageType::TaskCompleted,
                host.clone(),
                invitee.clone(),
                serde_json::to_value(&payload).unwrap_or_default(),
            );
            // Terminal task traffic is never dropped by backpressure.
            if let Err(e) = self.router.unicast(&invitee, msg, true) {
                debug!(%invitee, task = %task_id, error = %e, "completion undeliverable");
            }
        }

        if state == TaskState::Completed {
            self.metrics.tasks_completed += 1;
        }
        info!(task = %task_id, ?state, "task finalized");
        self.emit(HubEvent::TaskStateChanged {
            task_id: task_id.to_string(),
            state,
        });
        self.scheduler.push_after(
            self.config.coordination.task_retention(),
            Deadline::TaskRetention(task_id.to_string()),
        );
    }

    // ── Front-door operations ─────────────────────────────────────────────────

    fn handle_send_message(
        &mut self,
        params: MessageSendParams,
        progress: Option<mpsc::Sender<AgentMessage>>,
        reply: oneshot::Sender<Result<SendResult, HubError>>,
    ) {
        let meta = params.message.metadata.as_ref();
        let kind = meta
            .and_then(|m| m.get("kind"))
            .and_then(|k| k.as_str())
            .and_then(RequestKind::parse)
            .unwrap_or(RequestKind::ProblemSolving);
        let requester = meta
            .and_then(|m| m.get("agentId"))
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| self.registry.host_identity())
            .to_string();

        let mut task = Task::new(
            requester,
            params.message.context_id.clone(),
            Vec::new(),
            self.config.coordination.default_pattern,
            serde_json::to_value(&params.message).unwrap_or_default(),
        );
        // The handler picks the task up immediately.
        if let Err(e) = task.transition(TaskState::Working) {
            let _ = reply.send(Err(e));
            return;
        }

        let task_id = task.id.clone();
        let context_id = task.context_id.clone();
        let cancel = task.cancel.clone();
        let parts = params.message.parts.clone();

        self.scheduler.push_after(
            self.config.coordination.task_timeout(),
            Deadline::TaskDeadline(task_id.clone()),
        );
        self.store.insert(task);
        self.emit(HubEvent::TaskStateChanged {
            task_id: task_id.clone(),
            state: TaskState::Working,
        });

        let handler = Arc::clone(&self.handler);
        let completion_tx = self.completion_tx.clone();
        // Streamed progress messages get stamped with the task and context
        // ids before the caller sees them.
        let sink = match progress {
            Some(tx) => {
                let (stamped_tx, mut stamped_rx) = mpsc::channel::<AgentMessage>(64);
                let tid = task_id.clone();
                let cid = context_id.clone();
                tokio::spawn(async move {
                    while let Some(mut msg) = stamped_rx.recv().await {
                        msg.task_id.get_or_insert_with(|| tid.clone());
                        msg.context_id.get_or_insert_with(|| cid.clone());
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
                ProgressSink::new(stamped_tx)
            }
            None => ProgressSink::none(),
        };

        tokio::spawn(async move {
            let request = HandlerRequest {
                kind,
                parts,
                context_id: context_id.clone(),
                task_id: task_id.clone(),
            };
            let outcome = handler.handle(request, &sink, &cancel).await.map(|mut msg| {
                msg.task_id = Some(task_id.clone());
                msg.context_id = Some(context_id);
                msg
            });
            if let Ok(ref msg) = outcome {
                // The final message closes the stream for streaming callers.
                sink.emit(msg.clone()).await;
            }
            let _ = completion_tx
                .send(HandlerCompletion {
                    task_id,
                    outcome,
                    reply,
                })
                .await;
        });
    }

    /// Runs on the service loop after a spawned handler finished, so the
    /// caller's reply is sent only once the task store reflects the outcome.
    fn finish_handler_run(&mut self, done: HandlerCompletion) {
        let HandlerCompletion {
            task_id,
            outcome,
            reply,
        } = done;

        match outcome {
            Ok(message) => {
                let result = serde_json::to_value(&message).unwrap_or_default();
                self.finalize(&task_id, Finalize::Complete(result));
                let _ = reply.send(Ok(SendResult { task_id, message }));
            }
            Err(HandlerError::Canceled) => {
                // tasks/cancel already drove the task terminal.
                debug!(task = %task_id, "handler observed cancellation");
                let _ = reply.send(Err(HubError::Handler("task canceled".to_string())));
            }
            Err(HandlerError::Failed(e)) => {
                self.metrics.errors += 1;
                self.finalize(&task_id, Finalize::Fail(format!("handler failure: {e}")));
                let _ = reply.send(Err(HubError::Handler(e)));
            }
        }
    }

    fn handle_cancel(&mut self, task_id: &str) -> Result<TaskView, HubError> {
        let Some(task) = self.store.get(task_id) else {
            return Err(HubError::TaskNotFound(task_id.to_string()));
        };
        if task.state.is_terminal() {
            return Err(HubError::TaskNotCancelable(task_id.to_string()));
        }
        self.finalize(task_id, Finalize::Cancel);
        self.store
            .get(task_id)
            .map(Task::view)
            .ok_or_else(|| HubError::TaskNotFound(task_id.to_string()))
    }

    fn handle_create_task(&mut self, spec: TaskSpec) -> Result<TaskView, HubError> {
        let pattern = spec
            .pattern
            .unwrap_or(self.config.coordination.default_pattern);
        let requester = spec
            .requester
            .unwrap_or_else(|| self.registry.host_identity().to_string());
        let mut task = Task::new(
            requester,
            spec.context_id,
            spec.required_capabilities,
            pattern,
            spec.payload,
        );
        let task_id = task.id.clone();

        let candidates = self
            .registry
            .find(&task.required_capabilities, self.config.discovery.agent_ttl());

        if candidates.is_empty() {
            // Even an empty requirement needs at least one live peer.
            warn!(task = %task_id, "no suitable agents");
            self.store.insert(task);
            self.finalize(&task_id, Finalize::Fail("no suitable agents".to_string()));
            return self
                .store
                .get(&task_id)
                .map(Task::view)
                .ok_or_else(|| HubError::TaskNotFound(task_id));
        }

        let selection = Coordination::select(
            &pattern,
            &candidates,
            self.config.coordination.max_agents_per_task,
        );
        task.invitees = selection.invitees.clone();
        task.coordinator = selection.coordinator.clone();
        task.transition(TaskState::Working)?;

        let invites: Vec<PeerMessage> = selection
            .invitees
            .iter()
            .map(|invitee| {
                let payload = InvitePayload {
                    task_id: task.id.clone(),
                    task_data: task.payload.clone(),
                    capabilities: task.required_capabilities.clone(),
                    pattern,
                    coordinator: selection.coordinator.as_deref() == Some(invitee.as_str()),
                };
                PeerMessage::new(
                    MessageType::TaskInvite,
                    self.registry.host_identity(),
                    invitee.clone(),
                    serde_json::to_value(&payload).unwrap_or_default(),
                )
            })
            .collect();

        self.scheduler.push_after(
            self.config.coordination.task_timeout(),
            Deadline::TaskDeadline(task_id.clone()),
        );
        self.store.insert(task);
        self.emit(HubEvent::TaskStateChanged {
            task_id: task_id.clone(),
            state: TaskState::Working,
        });

        for (invitee, msg) in selection.invitees.iter().zip(invites) {
            match self.router.unicast(invitee, msg, false) {
                Ok(outcome) if outcome.dropped() => self.metrics.dropped_messages += 1,
                Ok(_) => {}
                // Best-effort: a silent invitee is handled by the deadline.
                Err(e) => warn!(%invitee, task = %task_id, error = %e, "invite undeliverable"),
            }
        }

        self.store
            .get(&task_id)
            .map(Task::view)
            .ok_or_else(|| HubError::TaskNotFound(task_id))
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            identity: self.registry.host_identity().to_string(),
            uptime: self.metrics.uptime_secs(),
            messages_processed: self.metrics.messages_processed,
            tasks_completed: self.metrics.tasks_completed,
            errors: self.metrics.errors,
            dropped_messages: self.metrics.dropped_messages,
            active_agents: self
                .registry
                .active_count(self.config.discovery.agent_ttl()),
            active_tasks: self.store.active_count(),
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    fn fire(&mut self, deadline: Deadline) {
        match deadline {
            Deadline::ReapAgents => {
                let ttl = self.config.discovery.agent_ttl();
                for identity in self.registry.reap(ttl) {
                    self.router.connections().detach_identity(&identity);
                    info!(%identity, "agent record reaped");
                    self.emit(HubEvent::AgentExpired { identity });
                }
                self.scheduler
                    .push_after(self.reap_interval(), Deadline::ReapAgents);
            }
            Deadline::DiscoveryBroadcast => {
                if self.config.discovery.enabled {
                    let msg = PeerMessage::new(
                        MessageType::AgentDiscoveryResponse,
                        self.registry.host_identity(),
                        BROADCAST,
                        serde_json::to_value(self.registry.host_descriptor())
                            .unwrap_or_default(),
                    );
                    let (sent, dropped) = self.router.broadcast(&msg, false);
                    self.metrics.dropped_messages += dropped;
                    debug!(peers = sent, "discovery broadcast");
                    self.emit(HubEvent::DiscoveryBroadcast);
                }
                self.scheduler.push_after(
                    self.config.discovery.broadcast_interval(),
                    Deadline::DiscoveryBroadcast,
                );
            }
            Deadline::PendingSweep => {
                self.router.sweep_pending(Instant::now());
                self.scheduler
                    .push_after(PENDING_SWEEP_INTERVAL, Deadline::PendingSweep);
            }
            Deadline::TaskDeadline(task_id) => {
                let verdict = match self.store.get(&task_id) {
                    Some(task) if !task.state.is_terminal() => {
                        if task.invitees.is_empty() {
                            // Handler-backed task that never finished.
                            MergeVerdict::Expired
                        } else {
                            task.pattern
                                .evaluate(task, &self.config.coordination, true)
                        }
                    }
                    _ => return,
                };
                debug!(task = %task_id, "task deadline fired");
                self.apply_verdict(&task_id, verdict);
            }
            Deadline::TaskRetention(task_id) => {
                if self
                    .store
                    .get(&task_id)
                    .is_some_and(|t| t.state.is_terminal())
                {
                    self.store.remove(&task_id);
                    debug!(task = %task_id, "terminal task dropped from store");
                }
            }
        }
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine (nothing connected yet).
        let _ = self.event_tx.send(event);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::StubHandler;
    use agora_proto::Part;
    use serde_json::json;
    use std::time::Duration;

    fn spawn_hub() -> HubHandle {
        let config = Arc::new(HubConfig::default());
        let (svc, handle) = HubService::new(config, Arc::new(StubHandler));
        tokio::spawn(svc.run());
        handle
    }

    fn send_params(text: &str) -> MessageSendParams {
        MessageSendParams {
            message: AgentMessage {
                kind: "message".to_string(),
                message_id: "m1".to_string(),
                role: agora_proto::Role::User,
                parts: vec![Part::text(text)],
                context_id: None,
                task_id: None,
                metadata: None,
            },
            configuration: None,
            metadata: None,
        }
    }

    fn register_from(identity: &str, caps: &[&str], host: &str) -> PeerMessage {
        PeerMessage::new(
            MessageType::AgentRegister,
            identity,
            host,
            json!({
                "identity": identity,
                "kind": "specialist",
                "capabilities": caps,
                "timestamp": now_ms(),
            }),
        )
    }

    async fn connect_peer(
        hub: &HubHandle,
        identity: &str,
        caps: &[&str],
    ) -> ConnectionHandle {
        let conn = ConnectionHandle::new(32);
        hub.connected(conn.clone()).await;
        hub.deliver(
            register_from(identity, caps, hub.host_identity()),
            Some(conn.id),
        )
        .await;
        conn
    }

    #[tokio::test]
    async fn send_message_with_the_stub_completes_the_task() {
        let hub = spawn_hub();

        let result = hub
            .send_message(send_params("TypeError: x is not defined"), None)
            .await
            .unwrap();

        assert!(result.message.text().contains("JavaScript runtime error"));
        assert_eq!(result.message.role, agora_proto::Role::Agent);
        assert_eq!(result.message.metadata.as_ref().unwrap()["confidence"], 0.85);

        // The reply only arrives after the store was updated.
        let view = hub.get_task(&result.task_id).await.unwrap().unwrap();
        assert_eq!(view.state, TaskState::Completed);
        assert_eq!(view.status_history.first().unwrap().state, TaskState::Submitted);
        assert!(view.result.is_some());
    }

    #[tokio::test]
    async fn two_sends_create_two_independent_tasks() {
        let hub = spawn_hub();
        let a = hub.send_message(send_params("one"), None).await.unwrap();
        let b = hub.send_message(send_params("two"), None).await.unwrap();
        assert_ne!(a.task_id, b.task_id);
        assert!(hub.get_task(&a.task_id).await.unwrap().is_some());
        assert!(hub.get_task(&b.task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn streaming_send_emits_progress_then_the_final_analysis() {
        let hub = spawn_hub();
        let (tx, mut rx) = mpsc::channel(32);

        let result = hub
            .send_message(send_params("TypeError: boom"), Some(tx))
            .await
            .unwrap();

        let mut streamed = Vec::new();
        while let Some(msg) = rx.recv().await {
            streamed.push(msg);
        }
        assert!(streamed.len() >= 4, "got {} events", streamed.len());
        assert_eq!(streamed[0].text(), "Starting analysis…");
        let last = streamed.last().unwrap();
        assert!(last.text().contains("JavaScript runtime error"));
        assert_eq!(last.task_id.as_deref(), Some(result.task_id.as_str()));
    }

    #[tokio::test]
    async fn cancel_of_unknown_task_is_task_not_found() {
        let hub = spawn_hub();
        let err = hub.cancel_task("does-not-exist").await.unwrap_err();
        assert!(matches!(err, HubError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_of_a_completed_task_is_rejected_without_mutation() {
        let hub = spawn_hub();
        let done = hub.send_message(send_params("hello"), None).await.unwrap();

        let before = hub.get_task(&done.task_id).await.unwrap().unwrap();
        let err = hub.cancel_task(&done.task_id).await.unwrap_err();
        assert!(matches!(err, HubError::TaskNotCancelable(_)));

        let after = hub.get_task(&done.task_id).await.unwrap().unwrap();
        assert_eq!(after.state, TaskState::Completed);
        assert_eq!(after.status_history.len(), before.status_history.len());
    }

    #[tokio::test]
    async fn cancel_of_a_running_coordination_task_lands_in_canceled() {
        let hub = spawn_hub();
        let _conn = connect_peer(&hub, "peer-a", &["code-analysis"]).await;

        let view = hub
            .create_task(TaskSpec {
                required_capabilities: vec!["code-analysis".to_string()],
                payload: json!({"description": "review"}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(view.state, TaskState::Working);

        let canceled = hub.cancel_task(&view.id).await.unwrap();
        assert_eq!(canceled.state, TaskState::Canceled);
        assert_eq!(
            canceled.status_history.last().unwrap().state,
            TaskState::Canceled
        );
    }

    #[tokio::test]
    async fn coordination_with_no_suitable_agents_fails_immediately() {
        let hub = spawn_hub();
        let view = hub
            .create_task(TaskSpec {
                required_capabilities: vec!["code-analysis".to_string()],
                payload: json!({"description": "review"}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();

        assert_eq!(view.state, TaskState::Failed);
        let reason = view.result.unwrap()["reason"].as_str().unwrap().to_string();
        assert!(reason.contains("no suitable agents"));
    }

    #[tokio::test]
    async fn empty_requirement_still_needs_a_live_peer() {
        let hub = spawn_hub();
        let view = hub
            .create_task(TaskSpec {
                payload: json!({}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(view.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn peer_to_peer_round_trip_completes_and_notifies_the_invitee() {
        let hub = spawn_hub();
        let conn = connect_peer(&hub, "peer-a", &["code-analysis"]).await;

        let view = hub
            .create_task(TaskSpec {
                required_capabilities: vec!["code-analysis".to_string()],
                payload: json!({"description": "review"}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();

        // The invitee sees the invite on its queue.
        let invite = tokio::time::timeout(Duration::from_secs(1), conn.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invite.message_type, "task:invite");
        assert_eq!(invite.data["taskId"], view.id.as_str());

        // It contributes, which completes the single-invitee task.
        hub.deliver(
            PeerMessage::new(
                MessageType::TaskContribution,
                "peer-a",
                hub.host_identity(),
                json!({"taskId": view.id, "participation": {"answer": 42}}),
            ),
            Some(conn.id),
        )
        .await;

        let completed = tokio::time::timeout(Duration::from_secs(1), conn.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.message_type, "task:completed");
        assert_eq!(completed.data["state"], "completed");

        let view = hub.get_task(&view.id).await.unwrap().unwrap();
        assert_eq!(view.state, TaskState::Completed);
        assert_eq!(view.participants.len(), 1);
        assert_eq!(view.participants[0].identity, "peer-a");
        assert_eq!(view.result.as_ref().unwrap()["confidence"], 0.8);
    }

    #[tokio::test]
    async fn contributions_from_uninvited_agents_are_rejected() {
        let hub = spawn_hub();
        let conn_a = connect_peer(&hub, "peer-a", &["code-analysis"]).await;
        let _conn_b = connect_peer(&hub, "peer-b", &[]).await;

        let view = hub
            .create_task(TaskSpec {
                required_capabilities: vec!["code-analysis".to_string()],
                payload: json!({}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), conn_a.pop()).await;

        hub.deliver(
            PeerMessage::new(
                MessageType::TaskContribution,
                "peer-b",
                hub.host_identity(),
                json!({"taskId": view.id, "participation": {}}),
            ),
            None,
        )
        .await;

        let view = hub.get_task(&view.id).await.unwrap().unwrap();
        assert!(view.participants.is_empty());
        assert_eq!(view.state, TaskState::Working);
    }

    #[tokio::test]
    async fn discovery_probe_gets_exactly_one_response_with_reply_correlation() {
        let hub = spawn_hub();
        let conn = connect_peer(&hub, "peer-a", &[]).await;

        let probe = PeerMessage::new(
            MessageType::AgentDiscovery,
            "peer-a",
            hub.host_identity(),
            json!({"agentId": "peer-a", "timestamp": now_ms()}),
        );
        let probe_id = probe.id.clone();
        hub.deliver(probe, Some(conn.id)).await;

        let response = tokio::time::timeout(Duration::from_secs(1), conn.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.message_type, "agent:discovery:response");
        assert_eq!(response.data["replyTo"], probe_id.as_str());
        assert_eq!(response.data["identity"], hub.host_identity());
        assert!(conn.is_empty(), "exactly one response per probe");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peers_are_not_selected_after_the_ttl() {
        let hub = spawn_hub();
        let _conn = connect_peer(&hub, "peer-a", &["any"]).await;
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(121)).await;

        let view = hub
            .create_task(TaskSpec {
                required_capabilities: vec!["any".to_string()],
                payload: json!({}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(view.state, TaskState::Failed);
        assert!(view.participants.is_empty());
    }

    #[tokio::test]
    async fn foreign_completion_attempts_are_rejected() {
        let hub = spawn_hub();
        let conn = connect_peer(&hub, "peer-a", &["code-analysis"]).await;

        let view = hub
            .create_task(TaskSpec {
                required_capabilities: vec!["code-analysis".to_string()],
                payload: json!({}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), conn.pop()).await;

        // peer-a claims the hub's task is done — only the creator's engine
        // may complete it.
        hub.deliver(
            PeerMessage::new(
                MessageType::TaskCompleted,
                "peer-a",
                hub.host_identity(),
                json!({"taskId": view.id, "state": "completed", "finalResult": {}}),
            ),
            Some(conn.id),
        )
        .await;

        let after = hub.get_task(&view.id).await.unwrap().unwrap();
        assert_eq!(after.state, TaskState::Working);

        let health = hub.health().await.unwrap();
        assert!(health.errors >= 1);
    }

    #[tokio::test]
    async fn health_reflects_traffic_and_registrations() {
        let hub = spawn_hub();
        let _conn = connect_peer(&hub, "peer-a", &[]).await;
        let _ = hub.send_message(send_params("hello"), None).await.unwrap();

        let health = hub.health().await.unwrap();
        assert_eq!(health.identity, hub.host_identity());
        assert_eq!(health.active_agents, 1);
        assert!(health.messages_processed >= 1);
        assert_eq!(health.tasks_completed, 1);
    }

    #[tokio::test]
    async fn invalid_peer_messages_bump_the_error_counter() {
        let hub = spawn_hub();
        let mut bad = register_from("peer-a", &[], hub.host_identity());
        bad.to = String::new();
        hub.deliver(bad, None).await;

        let health = hub.health().await.unwrap();
        assert_eq!(health.errors, 1);
        assert_eq!(health.messages_processed, 0);
    }

    #[tokio::test]
    async fn invites_from_peers_surface_as_events() {
        let hub = spawn_hub();
        let mut events = hub.subscribe();
        let conn = connect_peer(&hub, "peer-a", &[]).await;

        hub.deliver(
            PeerMessage::new(
                MessageType::TaskInvite,
                "peer-a",
                hub.host_identity(),
                json!({"taskId": "their-task", "taskData": {}, "capabilities": []}),
            ),
            Some(conn.id),
        )
        .await;

        loop {
            let ev = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("no event received")
                .unwrap();
            if let HubEvent::InviteReceived { from, invite } = ev {
                assert_eq!(from, "peer-a");
                assert_eq!(invite.task_id, "their-task");
                break;
            }
        }
    }

    #[tokio::test]
    async fn consensus_votes_flow_into_the_merge() {
        let mut config = HubConfig::default();
        config.coordination.default_pattern = PatternKind::Consensus;
        let (svc, hub) = HubService::new(Arc::new(config), Arc::new(StubHandler));
        tokio::spawn(svc.run());

        let conn_a = connect_peer(&hub, "peer-a", &["vote"]).await;
        let _conn_b = connect_peer(&hub, "peer-b", &["vote"]).await;

        let view = hub
            .create_task(TaskSpec {
                required_capabilities: vec!["vote".to_string()],
                payload: json!({"proposal": "adopt"}),
                ..TaskSpec::default()
            })
            .await
            .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), conn_a.pop()).await;

        for peer in ["peer-a", "peer-b"] {
            hub.deliver(
                PeerMessage::new(
                    MessageType::CoordinationVote,
                    peer,
                    hub.host_identity(),
                    json!({"proposalId": view.id, "vote": "adopt", "score": 1.0}),
                ),
                None,
            )
            .await;
        }

        let view = hub.get_task(&view.id).await.unwrap().unwrap();
        assert_eq!(view.state, TaskState::Completed);
        assert_eq!(view.result.as_ref().unwrap()["proposal"], "adopt");
    }
}

//! Agent execution relay.
//!
//! A run is validated against the agent catalog, bound to one sandbox, and its upstream event
//! stream is forwarded either verbatim or as classified events. Cancellation happens
//! out-of-band through the pid-file and done-marker convention of the sandbox runner.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Bytes;
use futures::StreamExt;
use sandbox_relay_agent_stream::{classify_payload, ClassifiedEvent, FrameBatch, FrameReassembler};
use sandbox_relay_error::SandboxError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;

use crate::config::RelayConfig;
use crate::project_state::{timestamp_now, ProjectStateStore};
use crate::provider::{AgentInvocation, AgentStreamStart, ByteStream, ProviderError, SandboxProvider};
use crate::registry::SandboxRegistry;

pub const AGENT_PID_FILE: &str = "/tmp/sandbox-relay/agent.pid";
pub const AGENT_DONE_MARKER: &str = "/tmp/sandbox-relay/agent.done";

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunRequest {
    pub sandbox_id: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub sandbox_id: String,
    /// Whether this process was relaying a run for the sandbox when the cancel arrived.
    pub was_running: bool,
    pub grace: Duration,
}

#[derive(Debug)]
pub struct AgentRelay {
    registry: Arc<SandboxRegistry>,
    config: Arc<RelayConfig>,
    state_store: ProjectStateStore,
    active: Arc<Mutex<HashSet<String>>>,
}

fn lock_active(active: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a sandbox as running an agent until dropped.
struct ActiveRun {
    sandbox_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.sandbox_id);
        tracing::debug!(sandbox_id = %self.sandbox_id, "relay: run released");
    }
}

/// An upstream agent stream that has started and is ready to be forwarded.
pub struct AgentRun {
    provider: Arc<dyn SandboxProvider>,
    stream: ByteStream,
    agent: String,
    model: String,
    prompt: String,
    budget: Duration,
    deadline: Instant,
    state_store: ProjectStateStore,
    _active: ActiveRun,
}

impl fmt::Debug for AgentRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRun")
            .field("sandbox_id", &self.provider.sandbox_id())
            .field("agent", &self.agent)
            .field("model", &self.model)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl AgentRelay {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        config: Arc<RelayConfig>,
        state_store: ProjectStateStore,
    ) -> Self {
        Self {
            registry,
            config,
            state_store,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_running(&self, sandbox_id: &str) -> bool {
        lock_active(&self.active).contains(sandbox_id)
    }

    fn claim(&self, sandbox_id: &str) -> Result<ActiveRun, SandboxError> {
        let mut active = lock_active(&self.active);
        if !active.insert(sandbox_id.to_string()) {
            return Err(SandboxError::SandboxBusy {
                sandbox_id: sandbox_id.to_string(),
            });
        }
        Ok(ActiveRun {
            sandbox_id: sandbox_id.to_string(),
            active: self.active.clone(),
        })
    }

    /// Validates the request and opens the upstream stream.
    ///
    /// Nothing is sent to the backend until agent, model and prompt are known to be valid. A
    /// non-success upstream status becomes an `Upstream` error instead of a stream.
    pub async fn start(&self, request: AgentRunRequest) -> Result<AgentRun, SandboxError> {
        let (spec, model) = self
            .config
            .resolve_agent(&request.agent, request.model.as_deref())?;
        let agent = spec.id.clone();
        if request.prompt.trim().is_empty() {
            return Err(SandboxError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }
        let budget = self.config.run.run_budget(request.duration_secs);

        let provider = self.registry.resolve(&request.sandbox_id).await?;
        let active = self.claim(provider.sandbox_id())?;

        // A marker left by an earlier cancel would end this run immediately.
        provider
            .run_command(&format!("rm -f {AGENT_DONE_MARKER} {AGENT_PID_FILE}"))
            .await?;

        let invocation = AgentInvocation {
            agent: agent.clone(),
            model: model.clone(),
            prompt: request.prompt.clone(),
            pid_file: AGENT_PID_FILE.to_string(),
            done_marker: AGENT_DONE_MARKER.to_string(),
            timeout_secs: budget.as_secs().max(1),
        };
        let started = Instant::now();
        let stream = match provider.run_agent(&invocation, budget).await? {
            AgentStreamStart::Streaming(stream) => stream,
            AgentStreamStart::Rejected { status, body } => {
                tracing::warn!(
                    sandbox_id = provider.sandbox_id(),
                    status,
                    "relay: upstream rejected agent run"
                );
                return Err(SandboxError::Upstream { status, body });
            }
        };
        tracing::info!(
            sandbox_id = provider.sandbox_id(),
            agent = %agent,
            model = %model,
            budget_secs = budget.as_secs(),
            "relay: agent run started"
        );

        Ok(AgentRun {
            provider,
            stream,
            agent,
            model,
            prompt: request.prompt,
            budget,
            deadline: started + budget,
            state_store: self.state_store.clone(),
            _active: active,
        })
    }

    /// Signals the running agent and writes the done marker so the open stream ends.
    ///
    /// The pid is captured here; if that process survives the grace period it is killed
    /// outright. A run started in the meantime owns a different pid and is left alone.
    pub async fn cancel(&self, sandbox_id: &str) -> Result<CancelOutcome, SandboxError> {
        let provider = self.registry.resolve(sandbox_id).await?;
        let was_running = self.is_running(sandbox_id);

        let pid = read_agent_pid(&*provider).await;
        if let Some(pid) = pid {
            provider
                .run_command(&format!("kill -TERM {pid} 2>/dev/null; true"))
                .await?;
        }
        provider
            .write_file(AGENT_DONE_MARKER, "cancelled\n")
            .await?;

        let grace = self.config.run.cancel_grace();
        tracing::info!(
            sandbox_id,
            was_running,
            pid,
            grace_ms = grace.as_millis() as u64,
            "relay: cancel signalled"
        );
        if let Some(pid) = pid {
            tokio::spawn(escalate_cancel(provider, pid, grace));
        }

        Ok(CancelOutcome {
            sandbox_id: sandbox_id.to_string(),
            was_running,
            grace,
        })
    }
}

async fn read_agent_pid(provider: &dyn SandboxProvider) -> Option<u32> {
    match provider.read_file(AGENT_PID_FILE).await {
        Ok(raw) => {
            let pid = raw.trim().parse::<u32>().ok().filter(|pid| *pid > 1);
            if pid.is_none() {
                tracing::warn!(
                    sandbox_id = provider.sandbox_id(),
                    content = %raw.trim(),
                    "relay: pid file does not hold a pid"
                );
            }
            pid
        }
        Err(err) => {
            if !err.is_not_found() {
                tracing::warn!(
                    sandbox_id = provider.sandbox_id(),
                    error = %err,
                    "relay: pid file unreadable"
                );
            }
            None
        }
    }
}

async fn escalate_cancel(provider: Arc<dyn SandboxProvider>, pid: u32, grace: Duration) {
    tokio::time::sleep(grace).await;
    if provider.is_terminated() {
        return;
    }
    let kill = format!(
        "if kill -0 {pid} 2>/dev/null; then kill -KILL {pid}; echo killed; fi"
    );
    match provider.run_command(&kill).await {
        Ok(output) if output.stdout.trim() == "killed" => {
            tracing::warn!(
                sandbox_id = provider.sandbox_id(),
                pid,
                "relay: agent ignored SIGTERM, killed"
            );
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(
                sandbox_id = provider.sandbox_id(),
                pid,
                error = %err,
                "relay: hard kill after cancel failed"
            );
        }
    }
}

enum RunEnd {
    Finished,
    Disconnected,
    TimedOut,
    Failed(ProviderError),
}

impl RunEnd {
    fn as_str(&self) -> &'static str {
        match self {
            RunEnd::Finished => "finished",
            RunEnd::Disconnected => "disconnected",
            RunEnd::TimedOut => "timed_out",
            RunEnd::Failed(_) => "failed",
        }
    }
}

impl AgentRun {
    pub fn sandbox_id(&self) -> &str {
        self.provider.sandbox_id()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Classified events in arrival order. Skips and blank events are never yielded.
    pub fn into_classified(self) -> ReceiverStream<ClassifiedEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(self.pump_classified(tx));
        ReceiverStream::new(rx)
    }

    /// The upstream bytes untouched, plus a final error frame if the run fails mid-way.
    pub fn into_raw(self) -> ByteStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(self.pump_raw(tx));
        Box::pin(ReceiverStream::new(rx))
    }

    fn budget_exceeded(&self) -> ClassifiedEvent {
        ClassifiedEvent::error(format!(
            "agent run exceeded its {}s budget",
            self.budget.as_secs()
        ))
    }

    async fn next_chunk<T>(
        &mut self,
        tx: &mpsc::Sender<T>,
    ) -> Result<Bytes, RunEnd> {
        let deadline = self.deadline;
        tokio::select! {
            _ = tx.closed() => Err(RunEnd::Disconnected),
            next = tokio::time::timeout_at(deadline, self.stream.next()) => match next {
                Err(_) => Err(RunEnd::TimedOut),
                Ok(None) => Err(RunEnd::Finished),
                Ok(Some(Err(err))) => Err(RunEnd::Failed(err)),
                Ok(Some(Ok(bytes))) => Ok(bytes),
            },
        }
    }

    async fn pump_classified(mut self, tx: mpsc::Sender<ClassifiedEvent>) {
        let mut reassembler = FrameReassembler::new();
        let mut transcript = Vec::new();
        let end = loop {
            match self.next_chunk(&tx).await {
                Ok(bytes) => {
                    let batch = reassembler.push_bytes(&bytes);
                    if !forward(&tx, batch, &mut transcript).await {
                        break RunEnd::Disconnected;
                    }
                }
                Err(end) => break end,
            }
        };

        let tail = reassembler.flush();
        if !matches!(end, RunEnd::Disconnected) && forward(&tx, tail, &mut transcript).await {
            let closing = match &end {
                RunEnd::TimedOut => Some(self.budget_exceeded()),
                RunEnd::Failed(err) => Some(ClassifiedEvent::error(format!(
                    "agent stream failed: {err}"
                ))),
                _ => None,
            };
            if let Some(event) = closing {
                let _ = tx.send(event).await;
            }
        }

        record_snapshot(
            &self.state_store,
            self.provider.as_ref(),
            &self.agent,
            &self.model,
            &self.prompt,
            &transcript,
        )
        .await;
        tracing::info!(
            sandbox_id = self.sandbox_id(),
            end = end.as_str(),
            messages = transcript.len(),
            "relay: agent run ended"
        );
    }

    async fn pump_raw(mut self, tx: mpsc::Sender<Result<Bytes, ProviderError>>) {
        let end = loop {
            match self.next_chunk(&tx).await {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        break RunEnd::Disconnected;
                    }
                }
                Err(end) => break end,
            }
        };

        let closing = match &end {
            RunEnd::TimedOut => Some(self.budget_exceeded()),
            RunEnd::Failed(err) => Some(ClassifiedEvent::error(format!(
                "agent stream failed: {err}"
            ))),
            _ => None,
        };
        if let Some(event) = closing {
            if let Ok(json) = serde_json::to_string(&event) {
                let _ = tx.send(Ok(Bytes::from(format!("\ndata: {json}\n\n")))).await;
            }
        }
        tracing::info!(
            sandbox_id = self.sandbox_id(),
            end = end.as_str(),
            "relay: raw agent run ended"
        );
    }
}

/// Appends the prompt and the assistant's reply to the project's conversation.
async fn record_snapshot(
    store: &ProjectStateStore,
    provider: &dyn SandboxProvider,
    agent: &str,
    model: &str,
    prompt: &str,
    transcript: &[String],
) {
    let now = timestamp_now();
    let mut entries = vec![json!({
        "role": "user",
        "content": prompt,
        "timestamp": now,
    })];
    if !transcript.is_empty() {
        entries.push(json!({
            "role": "assistant",
            "content": transcript.join("\n"),
            "agent": agent,
            "model": model,
            "timestamp": now,
        }));
    }

    let result = store
        .update(provider, provider.sandbox_id(), move |state| {
            state.messages.extend(entries);
        })
        .await;
    if let Err(err) = result {
        tracing::warn!(
            sandbox_id = provider.sandbox_id(),
            error = %err,
            "relay: conversation snapshot not persisted"
        );
    }
}

/// Classifies a batch and sends every displayable event. Returns `false` once the caller is gone.
async fn forward(
    tx: &mpsc::Sender<ClassifiedEvent>,
    batch: FrameBatch,
    transcript: &mut Vec<String>,
) -> bool {
    for payload in &batch.payloads {
        let event = classify_payload(payload);
        if !event.is_displayable() {
            continue;
        }
        if let ClassifiedEvent::Message { content } = &event {
            transcript.push(content.clone());
        }
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    for line in &batch.passthrough {
        tracing::trace!(line = %line, "relay: passthrough line");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_state::PROJECT_STATE_PATH;
    use crate::provider::mock::MockBackend;
    use serde_json::Value;

    const SANDBOX: &str = "sbx-relay-0001";

    fn frames() -> Vec<&'static str> {
        vec![
            "data: {\"type\":\"system\",\"subtype\":\"init\"}\n\n",
            "data: {\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"thinking\",\"thinking\":\"Plan the page\"}]}}\n\n",
            "data: {\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Write\",\"input\":{\"file_path\":\"src/App.tsx\"}}]}}\n\n",
            "data: {\"type\":\"assistant\",\"message\":{\"con",
            "tent\":[{\"type\":\"text\",\"text\":\"Hero section added.\"}]}}\n\n",
            "data: {\"type\":\"result\",\"duration_ms\":4200}",
        ]
    }

    fn relay_for(backend: &MockBackend) -> AgentRelay {
        let registry = Arc::new(SandboxRegistry::new(Arc::new(backend.clone())));
        AgentRelay::new(
            registry,
            Arc::new(RelayConfig::default()),
            ProjectStateStore::default(),
        )
    }

    fn request(agent: &str) -> AgentRunRequest {
        AgentRunRequest {
            sandbox_id: SANDBOX.to_string(),
            agent: agent.to_string(),
            model: None,
            prompt: "Add a hero section".to_string(),
            duration_secs: None,
        }
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected_before_any_backend_call() {
        let backend = MockBackend::new();
        let sandbox = backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let err = relay
            .start(request("not-a-real-agent"))
            .await
            .expect_err("unknown agent");
        assert!(matches!(err, SandboxError::UnsupportedAgent { .. }));
        assert_eq!(backend.attach_calls(), 0);
        assert!(sandbox.commands().is_empty());
    }

    #[tokio::test]
    async fn classified_run_streams_in_order_and_records_snapshot() {
        let backend = MockBackend::new().with_agent_frames(frames());
        let sandbox = backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let run = relay.start(request("claude")).await.expect("start");
        assert_eq!(run.model(), "sonnet");
        let events: Vec<ClassifiedEvent> = run.into_classified().collect().await;
        let kinds: Vec<&str> = events.iter().map(ClassifiedEvent::kind).collect();
        assert_eq!(kinds, vec!["thinking", "tool", "message", "status"]);
        assert_eq!(events[1].content(), Some("Writing src/App.tsx"));
        assert_eq!(events[3].content(), Some("Completed in 4.2s"));

        let state: Value =
            serde_json::from_str(&sandbox.file(PROJECT_STATE_PATH).expect("state")).expect("json");
        assert_eq!(state["messages"][0]["role"], json!("user"));
        assert_eq!(state["messages"][1]["content"], json!("Hero section added."));
        assert_eq!(state["messages"][1]["model"], json!("sonnet"));
        assert!(!relay.is_running(SANDBOX));
    }

    #[tokio::test]
    async fn upstream_rejection_surfaces_status() {
        let backend = MockBackend::new().with_agent_rejection(503, "runner unavailable");
        backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let err = relay.start(request("codex")).await.expect_err("rejected");
        match err {
            SandboxError::Upstream { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "runner unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!relay.is_running(SANDBOX));
    }

    #[tokio::test]
    async fn second_run_on_busy_sandbox_is_refused_until_first_is_dropped() {
        let backend = MockBackend::new()
            .with_agent_frames(frames())
            .hold_agent_open(true);
        backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let first = relay.start(request("claude")).await.expect("first");
        let err = relay.start(request("claude")).await.expect_err("busy");
        assert!(matches!(err, SandboxError::SandboxBusy { .. }));

        let stream = first.into_classified();
        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.is_running(SANDBOX) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("guard released");
        relay.start(request("claude")).await.expect("free again");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_ends_open_stream_and_escalates() {
        let backend = MockBackend::new()
            .with_agent_frames(frames())
            .hold_agent_open(true);
        let sandbox = backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let mut stream = relay
            .start(request("claude"))
            .await
            .expect("start")
            .into_classified();
        for _ in 0..3 {
            stream.next().await.expect("event before cancel");
        }

        let outcome = relay.cancel(SANDBOX).await.expect("cancel");
        assert!(outcome.was_running);

        let rest: Vec<ClassifiedEvent> =
            tokio::time::timeout(Duration::from_secs(1), stream.collect())
                .await
                .expect("stream ends within grace");
        let kinds: Vec<&str> = rest.iter().map(ClassifiedEvent::kind).collect();
        assert_eq!(kinds, vec!["status"]);
        assert_eq!(sandbox.file(AGENT_DONE_MARKER).as_deref(), Some("cancelled\n"));

        tokio::time::sleep(outcome.grace + Duration::from_millis(10)).await;
        let commands = sandbox.commands();
        assert!(commands.iter().any(|command| command.contains("kill -TERM 4242")));
        assert!(commands.iter().any(|command| command.contains("kill -KILL 4242")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_escalation_spares_a_run_started_during_grace() {
        let backend = MockBackend::new()
            .with_agent_frames(frames())
            .hold_agent_open(true);
        let sandbox = backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let first = relay
            .start(request("claude"))
            .await
            .expect("first run")
            .into_classified();
        let outcome = relay.cancel(SANDBOX).await.expect("cancel");
        let _: Vec<ClassifiedEvent> = tokio::time::timeout(Duration::from_secs(1), first.collect())
            .await
            .expect("first run ends");
        tokio::time::timeout(Duration::from_secs(1), async {
            while relay.is_running(SANDBOX) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("guard released");

        let _second = relay
            .start(request("claude"))
            .await
            .expect("second run")
            .into_classified();
        assert_eq!(sandbox.file(AGENT_PID_FILE).as_deref(), Some("4243"));

        tokio::time::sleep(outcome.grace + Duration::from_millis(10)).await;
        let commands = sandbox.commands();
        assert!(commands.iter().any(|command| command.contains("kill -KILL 4242")));
        assert!(!commands.iter().any(|command| command.contains("4243")));
        assert!(relay.is_running(SANDBOX));
    }

    #[tokio::test]
    async fn cancel_without_pid_file_only_writes_marker() {
        let backend = MockBackend::new();
        let sandbox = backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let outcome = relay.cancel(SANDBOX).await.expect("cancel");
        assert!(!outcome.was_running);
        assert_eq!(sandbox.file(AGENT_DONE_MARKER).as_deref(), Some("cancelled\n"));
        assert!(!sandbox.commands().iter().any(|command| command.contains("kill")));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_overrun_ends_with_error_event() {
        let backend = MockBackend::new()
            .with_agent_frames(frames())
            .hold_agent_open(true);
        backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let mut req = request("claude");
        req.duration_secs = Some(2);
        let events: Vec<ClassifiedEvent> = relay
            .start(req)
            .await
            .expect("start")
            .into_classified()
            .collect()
            .await;
        let last = events.last().expect("events");
        assert_eq!(last.kind(), "error");
        assert_eq!(last.content(), Some("agent run exceeded its 2s budget"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stream_is_cut_at_the_budget() {
        let backend = MockBackend::new()
            .with_agent_frames(frames())
            .with_frame_delay(Duration::from_millis(1500));
        backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let mut req = request("claude");
        req.duration_secs = Some(2);
        let events: Vec<ClassifiedEvent> = relay
            .start(req)
            .await
            .expect("start")
            .into_classified()
            .collect()
            .await;
        let kinds: Vec<&str> = events.iter().map(ClassifiedEvent::kind).collect();
        assert_eq!(kinds, vec!["thinking", "error"]);
        assert!(!relay.is_running(SANDBOX));
    }

    #[tokio::test]
    async fn raw_mode_forwards_bytes_verbatim() {
        let backend = MockBackend::new().with_agent_frames(frames());
        backend.insert_existing(SANDBOX);
        let relay = relay_for(&backend);

        let chunks: Vec<Bytes> = relay
            .start(request("gemini"))
            .await
            .expect("start")
            .into_raw()
            .map(|chunk| chunk.expect("chunk"))
            .collect()
            .await;
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, frames().concat().into_bytes());
    }
}

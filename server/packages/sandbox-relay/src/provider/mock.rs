//! In-process backend with an in-memory filesystem and scripted failures.
//!
//! Used for local development (`--backend mock`) and throughout the test suite.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

use super::{
    ensure_live, AgentInvocation, AgentStreamStart, BackendKind, CommandOutput,
    PackageInstallOutput, ProviderError, ProviderFuture, SandboxBackend, SandboxInfo,
    SandboxProvider,
};

/// Outcome of one scripted backend step. Unscripted steps succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    Ok,
    Fail(String),
    Hang,
}

#[derive(Debug, Default)]
struct MockPlan {
    create: VecDeque<MockStep>,
    setup: VecDeque<MockStep>,
    health: VecDeque<MockStep>,
    read: VecDeque<MockStep>,
    terminate: VecDeque<MockStep>,
    agent_frames: Vec<String>,
    agent_rejection: Option<(u16, String)>,
    hold_agent_open: bool,
    frame_delay: Duration,
}

#[derive(Debug, Default)]
struct MockShared {
    plan: Mutex<MockPlan>,
    sandboxes: Mutex<HashMap<String, Arc<MockSandbox>>>,
    next_id: AtomicU64,
    agent_runs: AtomicU64,
    create_calls: AtomicUsize,
    attach_calls: AtomicUsize,
    terminated: Mutex<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    shared: Arc<MockShared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_plan(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        lock(&self.shared.plan).create = steps.into_iter().collect();
        self
    }

    pub fn with_setup_plan(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        lock(&self.shared.plan).setup = steps.into_iter().collect();
        self
    }

    /// Steps applied to `echo` commands. `Fail` makes the echo print the wrong text.
    pub fn with_health_plan(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        lock(&self.shared.plan).health = steps.into_iter().collect();
        self
    }

    /// Steps applied to file reads. `Fail` reports a backend error instead of the content.
    pub fn with_read_plan(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        lock(&self.shared.plan).read = steps.into_iter().collect();
        self
    }

    pub fn with_terminate_plan(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        lock(&self.shared.plan).terminate = steps.into_iter().collect();
        self
    }

    /// Raw SSE text chunks emitted by every agent run, in order.
    pub fn with_agent_frames(self, frames: impl IntoIterator<Item = impl Into<String>>) -> Self {
        lock(&self.shared.plan).agent_frames = frames.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agent_rejection(self, status: u16, body: impl Into<String>) -> Self {
        lock(&self.shared.plan).agent_rejection = Some((status, body.into()));
        self
    }

    /// Keeps agent streams open after their frames until the run's done marker is written.
    pub fn hold_agent_open(self, hold: bool) -> Self {
        lock(&self.shared.plan).hold_agent_open = hold;
        self
    }

    pub fn with_frame_delay(self, delay: Duration) -> Self {
        lock(&self.shared.plan).frame_delay = delay;
        self
    }

    /// Registers a sandbox the backend already knows, as if created by an earlier process.
    pub fn insert_existing(&self, sandbox_id: &str) -> Arc<MockSandbox> {
        let sandbox = Arc::new(MockSandbox::new(self.shared.clone(), sandbox_id));
        lock(&self.shared.sandboxes).insert(sandbox_id.to_string(), sandbox.clone());
        sandbox
    }

    pub fn sandbox(&self, sandbox_id: &str) -> Option<Arc<MockSandbox>> {
        lock(&self.shared.sandboxes).get(sandbox_id).cloned()
    }

    pub fn create_calls(&self) -> usize {
        self.shared.create_calls.load(Ordering::SeqCst)
    }

    pub fn attach_calls(&self) -> usize {
        self.shared.attach_calls.load(Ordering::SeqCst)
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        lock(&self.shared.terminated).clone()
    }

    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.sandboxes).keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl MockShared {
    fn next_step(&self, pick: impl FnOnce(&mut MockPlan) -> &mut VecDeque<MockStep>) -> MockStep {
        let mut plan = lock(&self.plan);
        pick(&mut plan).pop_front().unwrap_or(MockStep::Ok)
    }
}

async fn apply_step(step: MockStep) -> Result<(), ProviderError> {
    match step {
        MockStep::Ok => Ok(()),
        MockStep::Fail(message) => Err(ProviderError::Backend(message)),
        MockStep::Hang => std::future::pending().await,
    }
}

impl SandboxBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn create_sandbox(&self) -> ProviderFuture<'_, Arc<dyn SandboxProvider>> {
        Box::pin(async move {
            self.shared.create_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.shared.next_step(|plan| &mut plan.create);
            apply_step(step).await?;

            let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let sandbox_id = format!("mock-sbx-{id:06}");
            let sandbox: Arc<dyn SandboxProvider> = self.insert_existing(&sandbox_id);
            Ok(sandbox)
        })
    }

    fn attach<'a>(
        &'a self,
        sandbox_id: &'a str,
    ) -> ProviderFuture<'a, Option<Arc<dyn SandboxProvider>>> {
        Box::pin(async move {
            self.shared.attach_calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent attach attempts genuinely interleave.
            tokio::task::yield_now().await;
            Ok(self
                .sandbox(sandbox_id)
                .filter(|sandbox| !sandbox.is_terminated())
                .map(|sandbox| sandbox as Arc<dyn SandboxProvider>))
        })
    }
}

#[derive(Debug, Default)]
struct MockFs {
    files: Mutex<HashMap<String, String>>,
    written: Notify,
}

impl MockFs {
    fn contains(&self, path: &str) -> bool {
        lock(&self.files).contains_key(path)
    }
}

#[derive(Debug)]
pub struct MockSandbox {
    shared: Arc<MockShared>,
    info: SandboxInfo,
    fs: Arc<MockFs>,
    commands: Mutex<Vec<String>>,
    terminated: AtomicBool,
}

impl MockSandbox {
    fn new(shared: Arc<MockShared>, sandbox_id: &str) -> Self {
        Self {
            shared,
            info: SandboxInfo {
                sandbox_id: sandbox_id.to_string(),
                url: format!("https://{sandbox_id}.sandbox.test"),
                backend: BackendKind::Mock,
            },
            fs: Arc::new(MockFs::default()),
            commands: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Every command run in this sandbox, oldest first.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.fs.files).get(path).cloned()
    }

    pub fn put_file(&self, path: &str, content: &str) {
        lock(&self.fs.files).insert(path.to_string(), content.to_string());
        self.fs.written.notify_waiters();
    }
}

impl SandboxProvider for MockSandbox {
    fn info(&self) -> &SandboxInfo {
        &self.info
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn setup(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            ensure_live(self)?;
            let step = self.shared.next_step(|plan| &mut plan.setup);
            apply_step(step).await
        })
    }

    fn run_command<'a>(&'a self, command: &'a str) -> ProviderFuture<'a, CommandOutput> {
        Box::pin(async move {
            ensure_live(self)?;
            lock(&self.commands).push(command.to_string());

            if let Some(paths) = command.trim().strip_prefix("rm -f ") {
                let mut files = lock(&self.fs.files);
                for path in paths.split_whitespace() {
                    files.remove(path);
                }
                return Ok(CommandOutput::default());
            }
            let Some(text) = command.trim().strip_prefix("echo ") else {
                return Ok(CommandOutput::default());
            };
            match self.shared.next_step(|plan| &mut plan.health) {
                MockStep::Ok => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: format!("{}\n", text.trim().trim_matches(|c| c == '\'' || c == '"')),
                    stderr: String::new(),
                }),
                MockStep::Fail(message) => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: format!("{message}\n"),
                    stderr: String::new(),
                }),
                MockStep::Hang => std::future::pending().await,
            }
        })
    }

    fn read_file<'a>(&'a self, path: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            ensure_live(self)?;
            let step = self.shared.next_step(|plan| &mut plan.read);
            apply_step(step).await?;
            self.file(path).ok_or_else(|| ProviderError::NotFound {
                path: path.to_string(),
            })
        })
    }

    fn write_file<'a>(&'a self, path: &'a str, content: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            ensure_live(self)?;
            self.put_file(path, content);
            Ok(())
        })
    }

    fn install_packages<'a>(
        &'a self,
        packages: &'a [String],
    ) -> ProviderFuture<'a, PackageInstallOutput> {
        Box::pin(async move {
            ensure_live(self)?;
            lock(&self.commands).push(format!("npm install {}", packages.join(" ")));
            Ok(PackageInstallOutput {
                success: true,
                stdout: format!("added {} packages\n", packages.len()),
                stderr: String::new(),
            })
        })
    }

    fn describe(&self) -> ProviderFuture<'_, Option<SandboxInfo>> {
        Box::pin(async move {
            if self.is_terminated() {
                return Ok(None);
            }
            Ok(Some(self.info.clone()))
        })
    }

    fn run_agent<'a>(
        &'a self,
        invocation: &'a AgentInvocation,
        _timeout: Duration,
    ) -> ProviderFuture<'a, AgentStreamStart> {
        Box::pin(async move {
            ensure_live(self)?;
            let (frames, rejection, hold_open, frame_delay) = {
                let plan = lock(&self.shared.plan);
                (
                    plan.agent_frames.clone(),
                    plan.agent_rejection.clone(),
                    plan.hold_agent_open,
                    plan.frame_delay,
                )
            };
            if let Some((status, body)) = rejection {
                return Ok(AgentStreamStart::Rejected { status, body });
            }

            // Every run gets its own pid, starting at 4242.
            let pid = 4242 + self.shared.agent_runs.fetch_add(1, Ordering::SeqCst);
            self.put_file(&invocation.pid_file, &pid.to_string());
            let fs = self.fs.clone();
            let done_marker = invocation.done_marker.clone();
            let (tx, rx) = mpsc::channel::<Result<Bytes, ProviderError>>(16);
            tokio::spawn(async move {
                for frame in frames {
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        return;
                    }
                    if !frame_delay.is_zero() {
                        tokio::time::sleep(frame_delay).await;
                    }
                }
                if hold_open {
                    loop {
                        let written = fs.written.notified();
                        if fs.contains(&done_marker) || tx.is_closed() {
                            break;
                        }
                        tokio::select! {
                            _ = written => {}
                            _ = tx.closed() => break,
                        }
                    }
                }
            });
            Ok(AgentStreamStart::Streaming(Box::pin(ReceiverStream::new(rx))))
        })
    }

    fn terminate(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if self.is_terminated() {
                return Ok(());
            }
            let step = self.shared.next_step(|plan| &mut plan.terminate);
            apply_step(step).await?;
            if self.terminated.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            lock(&self.shared.sandboxes).remove(&self.info.sandbox_id);
            lock(&self.shared.terminated).push(self.info.sandbox_id.clone());
            Ok(())
        })
    }
}

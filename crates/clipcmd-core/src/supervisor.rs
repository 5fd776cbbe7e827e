use crate::error::EngineError;
use crate::pipeline::PipelineSpec;
use crate::runner::{self, CompletionHook, RunnerPolicy};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type RunId = u64;

/// Extra time `cancel_all` waits past the grace period for killed stages to be reaped.
const SHUTDOWN_DRAIN_SLACK: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Starting,
    Running,
    Finished,
    Failed,
    Terminated,
}

impl ProcessState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Terminated)
    }

    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    total: u64,
}

impl CappedBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total = self.total.saturating_add(chunk.len() as u64);
        let room = self.limit.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.bytes.len() as u64
    }
}

/// Read-only copy of a run, taken under the run's lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSnapshot {
    pub id: RunId,
    pub command_name: String,
    pub command_line: String,
    pub item_id: Option<u64>,
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub awaiting_confirmation: bool,
    pub stages_spawned: usize,
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr: Vec<u8>,
    pub stderr_truncated: bool,
    pub exit_code: Option<i32>,
    pub error: Option<EngineError>,
    pub force_killed: bool,
}

impl RunSnapshot {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug)]
struct RunRecord {
    state: ProcessState,
    awaiting_confirmation: bool,
    stages_spawned: usize,
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    exit_code: Option<i32>,
    error: Option<EngineError>,
    finished_at: Option<DateTime<Utc>>,
    force_killed: bool,
}

/// Shared, tracked state of one pipeline execution.
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    command_name: String,
    command_line: String,
    item_id: Option<u64>,
    started_at: DateTime<Utc>,
    item_data: BTreeMap<String, Vec<u8>>,
    record: Mutex<RunRecord>,
    changed: Condvar,
    cancel_requested: AtomicBool,
    confirmed: AtomicBool,
}

impl RunHandle {
    pub(crate) fn new(
        id: RunId,
        spec: &PipelineSpec,
        item_id: Option<u64>,
        item_data: BTreeMap<String, Vec<u8>>,
        max_captured_bytes: usize,
    ) -> Self {
        Self {
            id,
            command_name: spec.command_name.clone(),
            command_line: spec.display(),
            item_id,
            started_at: Utc::now(),
            item_data,
            record: Mutex::new(RunRecord {
                state: ProcessState::Starting,
                awaiting_confirmation: spec.requires_confirmation,
                stages_spawned: 0,
                stdout: CappedBuffer::with_limit(max_captured_bytes),
                stderr: CappedBuffer::with_limit(max_captured_bytes),
                exit_code: None,
                error: None,
                finished_at: None,
                force_killed: false,
            }),
            changed: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            confirmed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let record = self.record.lock();
        RunSnapshot {
            id: self.id,
            command_name: self.command_name.clone(),
            command_line: self.command_line.clone(),
            item_id: self.item_id,
            state: record.state,
            started_at: self.started_at,
            finished_at: record.finished_at,
            awaiting_confirmation: record.awaiting_confirmation,
            stages_spawned: record.stages_spawned,
            stdout: record.stdout.as_bytes().to_vec(),
            stdout_truncated: record.stdout.is_truncated(),
            stderr: record.stderr.as_bytes().to_vec(),
            stderr_truncated: record.stderr.is_truncated(),
            exit_code: record.exit_code,
            error: record.error.clone(),
            force_killed: record.force_killed,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.record.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let _record = self.record.lock();
        self.changed.notify_all();
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
        let _record = self.record.lock();
        self.changed.notify_all();
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Data the run was started with; `"?"` lists the available formats.
    pub fn data(&self, mime: &str) -> Option<Vec<u8>> {
        if mime == "?" {
            let mut listing = self
                .item_data
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n");
            listing.push('\n');
            return Some(listing.into_bytes());
        }
        self.item_data.get(mime).cloned()
    }

    /// Blocks until the run is terminal; returns false on timeout.
    pub fn wait_terminal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut record = self.record.lock();
        while !record.state.is_terminal() {
            if self.changed.wait_until(&mut record, deadline).timed_out() {
                return record.state.is_terminal();
            }
        }
        true
    }

    pub(crate) fn wait_for_signal(&self, timeout: Duration) {
        let mut record = self.record.lock();
        if self.cancel_requested() || self.is_confirmed() {
            return;
        }
        let _ = self.changed.wait_for(&mut record, timeout);
    }

    pub(crate) fn set_awaiting_confirmation(&self, awaiting: bool) {
        let mut record = self.record.lock();
        record.awaiting_confirmation = awaiting;
        self.changed.notify_all();
    }

    pub(crate) fn note_stage_spawned(&self) {
        let mut record = self.record.lock();
        record.stages_spawned += 1;
        if record.state == ProcessState::Starting {
            record.state = ProcessState::Running;
        }
        self.changed.notify_all();
    }

    pub(crate) fn note_force_killed(&self) {
        self.record.lock().force_killed = true;
    }

    pub(crate) fn append_stdout(&self, chunk: &[u8]) {
        let mut record = self.record.lock();
        if !record.state.is_terminal() {
            record.stdout.push(chunk);
        }
    }

    pub(crate) fn append_stderr(&self, chunk: &[u8]) {
        let mut record = self.record.lock();
        if !record.state.is_terminal() {
            record.stderr.push(chunk);
        }
    }

    /// Moves the run to a terminal state once; later calls are ignored.
    pub(crate) fn finish(
        &self,
        state: ProcessState,
        exit_code: Option<i32>,
        error: Option<EngineError>,
    ) -> bool {
        debug_assert!(state.is_terminal());
        let mut record = self.record.lock();
        if record.state.is_terminal() {
            return false;
        }
        record.state = state;
        record.exit_code = exit_code;
        record.error = error;
        record.awaiting_confirmation = false;
        record.finished_at = Some(Utc::now());
        self.changed.notify_all();
        true
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cancelled: usize,
    pub force_killed: usize,
    pub still_running: usize,
}

/// Process-wide registry of runs that have not been dismissed.
pub struct Supervisor {
    runs: RwLock<BTreeMap<RunId, Arc<RunHandle>>>,
    next_id: AtomicU64,
    policy: RunnerPolicy,
    max_retained_runs: usize,
}

impl Supervisor {
    pub fn new(policy: RunnerPolicy, max_retained_runs: usize) -> Self {
        Self {
            runs: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            policy,
            max_retained_runs: max_retained_runs.max(1),
        }
    }

    pub fn policy(&self) -> &RunnerPolicy {
        &self.policy
    }

    /// Registers a run and starts it on its own thread; returns immediately.
    pub fn launch(
        &self,
        spec: PipelineSpec,
        item_id: Option<u64>,
        item_data: BTreeMap<String, Vec<u8>>,
        on_complete: Option<CompletionHook>,
    ) -> Arc<RunHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Arc::new(RunHandle::new(
            id,
            &spec,
            item_id,
            item_data,
            self.policy.max_captured_bytes,
        ));
        self.insert(handle.clone());
        runner::run(handle.clone(), spec, self.policy.clone(), on_complete);
        handle
    }

    fn insert(&self, handle: Arc<RunHandle>) {
        let mut runs = self.runs.write();
        runs.insert(handle.id(), handle);

        let terminal = runs
            .values()
            .filter(|run| run.is_terminal())
            .map(|run| run.id())
            .collect::<Vec<_>>();
        let excess = terminal.len().saturating_sub(self.max_retained_runs);
        for id in terminal.into_iter().take(excess) {
            runs.remove(&id);
        }
    }

    pub fn handle(&self, id: RunId) -> Option<Arc<RunHandle>> {
        self.runs.read().get(&id).cloned()
    }

    pub fn get(&self, id: RunId) -> Option<RunSnapshot> {
        self.handle(id).map(|handle| handle.snapshot())
    }

    pub fn list(&self) -> Vec<RunSnapshot> {
        let handles = self.runs.read().values().cloned().collect::<Vec<_>>();
        handles.iter().map(|handle| handle.snapshot()).collect()
    }

    pub fn running_count(&self) -> usize {
        self.runs
            .read()
            .values()
            .filter(|run| !run.is_terminal())
            .count()
    }

    pub fn has_running(&self) -> bool {
        self.running_count() > 0
    }

    pub fn cancel(&self, id: RunId) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        if !handle.is_terminal() {
            log::info!("cancelling run {} ({})", id, handle.command_name());
            handle.request_cancel();
        }
        true
    }

    pub fn confirm(&self, id: RunId) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        handle.confirm();
        true
    }

    pub fn dismiss(&self, id: RunId) -> bool {
        let mut runs = self.runs.write();
        match runs.get(&id) {
            Some(run) if run.is_terminal() => {
                runs.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn wait(&self, id: RunId, timeout: Duration) -> Option<RunSnapshot> {
        let handle = self.handle(id)?;
        handle.wait_terminal(timeout);
        Some(handle.snapshot())
    }

    pub fn run_data(&self, id: RunId, mime: &str) -> Option<Vec<u8>> {
        self.handle(id).and_then(|handle| handle.data(mime))
    }

    /// Cancels every live run and waits for them within the grace period.
    pub fn cancel_all(&self) -> ShutdownReport {
        let live = self
            .runs
            .read()
            .values()
            .filter(|run| !run.is_terminal())
            .cloned()
            .collect::<Vec<_>>();
        if live.is_empty() {
            return ShutdownReport::default();
        }

        log::info!("cancelling {} running command(s)", live.len());
        for handle in &live {
            handle.request_cancel();
        }

        let deadline = Instant::now() + self.policy.cancel_grace + SHUTDOWN_DRAIN_SLACK;
        let mut report = ShutdownReport::default();
        for handle in &live {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !handle.wait_terminal(remaining) {
                log::warn!(
                    "run {} ({}) did not stop before shutdown deadline",
                    handle.id(),
                    handle.command_name()
                );
                report.still_running += 1;
                continue;
            }
            let snapshot = handle.snapshot();
            if snapshot.state == ProcessState::Terminated {
                report.cancelled += 1;
            }
            if snapshot.force_killed {
                report.force_killed += 1;
            }
        }
        report
    }

    pub fn shutdown(&self) -> ShutdownReport {
        self.cancel_all()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for handle in self.runs.get_mut().values() {
            if !handle.is_terminal() {
                handle.request_cancel();
            }
        }
    }
}

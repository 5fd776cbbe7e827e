use crate::error::EngineError;
use crate::pipeline::PipelineSpec;
use crate::supervisor::{ProcessState, RunHandle, RunSnapshot};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const RUN_ID_ENV: &str = "CLIPCMD_RUN_ID";
pub const COMMAND_NAME_ENV: &str = "CLIPCMD_COMMAND";

const CHUNK_SIZE: usize = 8192;
const CONFIRMATION_POLL: Duration = Duration::from_millis(100);

pub type CompletionHook = Box<dyn FnOnce(RunSnapshot) + Send + 'static>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerPolicy {
    pub watchdog_interval: Duration,
    pub cancel_grace: Duration,
    pub max_captured_bytes: usize,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        Self {
            watchdog_interval: Duration::from_millis(10),
            cancel_grace: Duration::from_millis(2000),
            max_captured_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Executes `spec` on a dedicated thread, reporting through `handle`.
pub fn run(
    handle: Arc<RunHandle>,
    spec: PipelineSpec,
    policy: RunnerPolicy,
    on_complete: Option<CompletionHook>,
) {
    let worker_handle = handle.clone();
    let spawned = thread::Builder::new()
        .name(format!("clipcmd-run-{}", handle.id()))
        .spawn(move || {
            execute(&worker_handle, spec, &policy);
            let snapshot = worker_handle.snapshot();
            if let (ProcessState::Failed, Some(err)) = (snapshot.state, snapshot.error.as_ref()) {
                log::warn!("{err}");
            }
            if let Some(on_complete) = on_complete {
                on_complete(snapshot);
            }
        });

    if let Err(err) = spawned {
        log::error!(
            "command '{}' could not get a runner thread: {err}",
            handle.command_name()
        );
        handle.finish(
            ProcessState::Failed,
            None,
            Some(EngineError::Spawn {
                command: handle.command_name().to_string(),
                program: String::new(),
                detail: err.to_string(),
            }),
        );
    }
}

/// Executes `spec` on the calling thread without registering it anywhere.
pub fn run_blocking(spec: PipelineSpec, policy: &RunnerPolicy) -> RunSnapshot {
    let handle = Arc::new(RunHandle::new(
        0,
        &spec,
        None,
        BTreeMap::new(),
        policy.max_captured_bytes,
    ));
    execute(&handle, spec, policy);
    handle.snapshot()
}

fn execute(handle: &Arc<RunHandle>, spec: PipelineSpec, policy: &RunnerPolicy) {
    let command = spec.command_name.clone();
    if spec.requires_confirmation && !await_confirmation(handle) {
        log::info!("command '{command}' was declined before it started");
        handle.finish(
            ProcessState::Terminated,
            None,
            Some(EngineError::Cancelled { command }),
        );
        return;
    }
    if handle.cancel_requested() {
        handle.finish(
            ProcessState::Terminated,
            None,
            Some(EngineError::Cancelled { command }),
        );
        return;
    }

    log::debug!("executing '{}': {}", command, spec.display());
    let outcome = ActivePipeline::new(handle.clone(), spec, policy.clone()).drive();
    log::debug!("command '{}' ended {}", command, outcome.state.as_tag());
    handle.finish(outcome.state, outcome.exit_code, outcome.error);
}

fn await_confirmation(handle: &RunHandle) -> bool {
    loop {
        if handle.cancel_requested() {
            return false;
        }
        if handle.is_confirmed() {
            handle.set_awaiting_confirmation(false);
            return true;
        }
        handle.wait_for_signal(CONFIRMATION_POLL);
    }
}

struct RunOutcome {
    state: ProcessState,
    exit_code: Option<i32>,
    error: Option<EngineError>,
}

enum PipeEvent {
    FirstChunk { stage: usize },
    NoOutput { stage: usize },
    StreamClosed,
    ReadFailed { detail: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UpstreamOutput {
    Pending,
    Empty,
    Streaming,
}

#[derive(Clone, Copy)]
enum Capture {
    Stdout,
    Stderr,
}

struct Stage {
    child: Child,
    status: Option<ExitStatus>,
}

struct ActivePipeline {
    handle: Arc<RunHandle>,
    spec: PipelineSpec,
    policy: RunnerPolicy,
    stages: Vec<Stage>,
    events_tx: Sender<PipeEvent>,
    events_rx: Receiver<PipeEvent>,
    handoffs: Vec<Option<Sender<Option<ChildStdin>>>>,
    upstream: Vec<UpstreamOutput>,
    abort_forwarding: Arc<AtomicBool>,
    open_streams: usize,
    failure: Option<(EngineError, Option<i32>)>,
    cancel_started: Option<Instant>,
    force_killed: bool,
    stopped_at: Option<Instant>,
}

impl ActivePipeline {
    fn new(handle: Arc<RunHandle>, spec: PipelineSpec, policy: RunnerPolicy) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let stage_count = spec.stages.len();
        Self {
            handle,
            spec,
            policy,
            stages: Vec::with_capacity(stage_count),
            events_tx,
            events_rx,
            handoffs: (0..stage_count).map(|_| None).collect(),
            upstream: vec![UpstreamOutput::Pending; stage_count],
            abort_forwarding: Arc::new(AtomicBool::new(false)),
            open_streams: 0,
            failure: None,
            cancel_started: None,
            force_killed: false,
            stopped_at: None,
        }
    }

    fn drive(mut self) -> RunOutcome {
        let input = self.spec.input.take();
        let stdin = if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        if let Err(err) = self.spawn_stage(0, stdin) {
            return RunOutcome {
                state: ProcessState::Failed,
                exit_code: None,
                error: Some(err),
            };
        }
        if let (Some(input), Some(stdin)) = (input, self.stages[0].child.stdin.take()) {
            spawn_input_writer(stdin, input.bytes, self.spec.command_name.clone());
        }

        let tick = self.policy.watchdog_interval.max(Duration::from_millis(1));
        let deadline = self.spec.max_run.map(|limit| Instant::now() + limit);
        loop {
            self.check_cancellation();
            self.check_deadline(deadline);
            self.poll_exits();
            self.spawn_after_silent_upstream();
            if let Some(outcome) = self.outcome_if_done() {
                return outcome;
            }

            match self.events_rx.recv_timeout(tick) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {}
            }
        }
    }

    fn stopping(&self) -> bool {
        self.failure.is_some() || self.cancel_started.is_some()
    }

    fn spawn_stage(&mut self, index: usize, stdin: Stdio) -> Result<(), EngineError> {
        let stage = &self.spec.stages[index];
        let mut command = Command::new(&stage.program);
        command
            .args(&stage.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(RUN_ID_ENV, self.handle.id().to_string())
            .env(COMMAND_NAME_ENV, &self.spec.command_name);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|err| EngineError::Spawn {
            command: self.spec.command_name.clone(),
            program: stage.program.clone(),
            detail: err.to_string(),
        })?;
        self.handle.note_stage_spawned();

        if let Some(stderr) = child.stderr.take() {
            self.open_streams += 1;
            spawn_capture(
                stderr,
                self.handle.clone(),
                Capture::Stderr,
                self.events_tx.clone(),
            );
        }
        if let Some(stdout) = child.stdout.take() {
            if index + 1 == self.spec.stages.len() {
                self.open_streams += 1;
                spawn_capture(
                    stdout,
                    self.handle.clone(),
                    Capture::Stdout,
                    self.events_tx.clone(),
                );
            } else {
                let (sink_tx, sink_rx) = mpsc::channel();
                self.handoffs[index] = Some(sink_tx);
                spawn_forwarder(
                    index,
                    stdout,
                    sink_rx,
                    self.abort_forwarding.clone(),
                    self.events_tx.clone(),
                );
            }
        }

        self.stages.push(Stage {
            child,
            status: None,
        });
        Ok(())
    }

    fn handle_event(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::FirstChunk { stage } => {
                self.upstream[stage] = UpstreamOutput::Streaming;
                if self.stopping() {
                    self.handoffs[stage] = None;
                    return;
                }
                let next = stage + 1;
                if let Err(err) = self.spawn_stage(next, Stdio::piped()) {
                    self.fail(err, None);
                    return;
                }
                let stdin = self.stages.last_mut().and_then(|stage| stage.child.stdin.take());
                if let Some(handoff) = self.handoffs[stage].take() {
                    let _ = handoff.send(stdin);
                }
            }
            PipeEvent::NoOutput { stage } => {
                self.upstream[stage] = UpstreamOutput::Empty;
            }
            PipeEvent::StreamClosed => {
                self.open_streams = self.open_streams.saturating_sub(1);
            }
            PipeEvent::ReadFailed { detail } => {
                let err = EngineError::Read {
                    command: self.spec.command_name.clone(),
                    detail,
                };
                self.fail(err, None);
            }
        }
    }

    fn check_cancellation(&mut self) {
        if !self.handle.cancel_requested() {
            return;
        }
        match self.cancel_started {
            None => {
                self.cancel_started = Some(Instant::now());
                self.stop_forwarding();
                for stage in self.stages.iter_mut().filter(|s| s.status.is_none()) {
                    terminate_politely(&mut stage.child);
                }
            }
            Some(started) if !self.force_killed && started.elapsed() >= self.policy.cancel_grace => {
                if self.stages.iter().any(|s| s.status.is_none()) {
                    log::warn!(
                        "command '{}' ignored termination for {}ms, killing it",
                        self.spec.command_name,
                        self.policy.cancel_grace.as_millis()
                    );
                    self.kill_all();
                    self.handle.note_force_killed();
                }
                self.force_killed = true;
            }
            Some(_) => {}
        }
    }

    fn check_deadline(&mut self, deadline: Option<Instant>) {
        let Some(deadline) = deadline else {
            return;
        };
        if self.stopping() || Instant::now() < deadline {
            return;
        }
        let limit_ms = self
            .spec
            .max_run
            .map(|limit| limit.as_millis() as u64)
            .unwrap_or_default();
        let err = EngineError::Timeout {
            command: self.spec.command_name.clone(),
            limit_ms,
        };
        self.fail(err, None);
    }

    fn poll_exits(&mut self) {
        for index in 0..self.stages.len() {
            if self.stages[index].status.is_some() {
                continue;
            }
            match self.stages[index].child.try_wait() {
                Ok(Some(status)) => {
                    self.stages[index].status = Some(status);
                    if self.reader_went_away(index, status) {
                        log::debug!(
                            "stage {index} of '{}' stopped on a closed pipe",
                            self.spec.command_name
                        );
                        continue;
                    }
                    if !status.success() && !self.stopping() {
                        let err = EngineError::StageFailure {
                            command: self.spec.command_name.clone(),
                            stage: index,
                            exit_code: status.code(),
                        };
                        self.fail(err, status.code());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    let err = EngineError::Read {
                        command: self.spec.command_name.clone(),
                        detail: format!("wait for stage {index} failed: {err}"),
                    };
                    self.fail(err, None);
                }
            }
        }
    }

    /// A non-final stage killed by SIGPIPE once its downstream stage exists is
    /// not a failure; the downstream stage decides the outcome.
    fn reader_went_away(&self, index: usize, status: ExitStatus) -> bool {
        index + 1 < self.stages.len() && killed_by_broken_pipe(status)
    }

    /// Spawns the next stage with empty input once a silent upstream exits cleanly.
    fn spawn_after_silent_upstream(&mut self) {
        let next = self.stages.len();
        if next == 0 || next >= self.spec.stages.len() || self.stopping() {
            return;
        }
        let upstream = next - 1;
        let exited_cleanly = self.stages[upstream]
            .status
            .map(|status| status.success())
            .unwrap_or(false);
        if self.upstream[upstream] == UpstreamOutput::Empty && exited_cleanly {
            self.handoffs[upstream] = None;
            if let Err(err) = self.spawn_stage(next, Stdio::null()) {
                self.fail(err, None);
            }
        }
    }

    fn outcome_if_done(&mut self) -> Option<RunOutcome> {
        let all_exited = self.stages.iter().all(|stage| stage.status.is_some());
        if self.cancel_started.is_some() {
            if !all_exited || !self.streams_drained() {
                return None;
            }
            return Some(RunOutcome {
                state: ProcessState::Terminated,
                exit_code: None,
                error: Some(EngineError::Cancelled {
                    command: self.spec.command_name.clone(),
                }),
            });
        }
        if self.failure.is_some() {
            if !all_exited || !self.streams_drained() {
                return None;
            }
            let (err, exit_code) = self.failure.clone()?;
            return Some(RunOutcome {
                state: ProcessState::Failed,
                exit_code,
                error: Some(err),
            });
        }
        if self.stages.len() == self.spec.stages.len() && all_exited && self.open_streams == 0 {
            let exit_code = self
                .stages
                .last()
                .and_then(|stage| stage.status)
                .and_then(|status| status.code());
            return Some(RunOutcome {
                state: ProcessState::Finished,
                exit_code,
                error: None,
            });
        }
        None
    }

    /// Whether captured output has been fully read after every stage exited.
    /// A stopped run waits at most `cancel_grace` for its pipes to close.
    fn streams_drained(&mut self) -> bool {
        if self.open_streams == 0 {
            return true;
        }
        let stopped_at = *self.stopped_at.get_or_insert_with(Instant::now);
        if stopped_at.elapsed() < self.policy.cancel_grace {
            return false;
        }
        log::debug!(
            "command '{}' left {} output stream(s) open",
            self.spec.command_name,
            self.open_streams
        );
        true
    }

    fn fail(&mut self, err: EngineError, exit_code: Option<i32>) {
        if self.failure.is_none() {
            self.failure = Some((err, exit_code));
        }
        self.stop_forwarding();
        self.kill_all();
    }

    fn stop_forwarding(&mut self) {
        self.abort_forwarding.store(true, Ordering::SeqCst);
        for handoff in &mut self.handoffs {
            *handoff = None;
        }
    }

    fn kill_all(&mut self) {
        for stage in self.stages.iter_mut().filter(|s| s.status.is_none()) {
            force_kill(&mut stage.child);
        }
    }
}

fn spawn_input_writer(mut stdin: ChildStdin, bytes: Vec<u8>, command: String) {
    thread::spawn(move || {
        if let Err(err) = stdin.write_all(&bytes) {
            log::debug!("command '{command}' did not consume its input: {err}");
        }
    });
}

fn spawn_capture(
    mut source: impl Read + Send + 'static,
    handle: Arc<RunHandle>,
    capture: Capture,
    events: Sender<PipeEvent>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => match capture {
                    Capture::Stdout => handle.append_stdout(&buf[..n]),
                    Capture::Stderr => handle.append_stderr(&buf[..n]),
                },
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if matches!(capture, Capture::Stdout) {
                        let _ = events.send(PipeEvent::ReadFailed {
                            detail: err.to_string(),
                        });
                    }
                    break;
                }
            }
        }
        let _ = events.send(PipeEvent::StreamClosed);
    });
}

/// Streams one stage's stdout into the next stage, which is spawned only
/// after the first chunk arrives.
fn spawn_forwarder(
    stage: usize,
    mut stdout: ChildStdout,
    sink: Receiver<Option<ChildStdin>>,
    abort: Arc<AtomicBool>,
    events: Sender<PipeEvent>,
) {
    thread::spawn(move || {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let first = loop {
            match stdout.read(&mut buf) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = events.send(PipeEvent::ReadFailed {
                        detail: format!("read stage {stage} output failed: {err}"),
                    });
                    return;
                }
            }
        };
        if first == 0 {
            let _ = events.send(PipeEvent::NoOutput { stage });
            return;
        }
        if events.send(PipeEvent::FirstChunk { stage }).is_err() {
            return;
        }
        let Ok(Some(mut downstream)) = sink.recv() else {
            return;
        };
        if downstream.write_all(&buf[..first]).is_err() {
            return;
        }
        loop {
            if abort.load(Ordering::SeqCst) {
                return;
            }
            match stdout.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if abort.load(Ordering::SeqCst) || downstream.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    });
}

#[cfg(unix)]
fn killed_by_broken_pipe(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGPIPE)
}

#[cfg(not(unix))]
fn killed_by_broken_pipe(_status: ExitStatus) -> bool {
    false
}

#[cfg(unix)]
fn terminate_politely(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: the pid names a process group we created and have not reaped yet.
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_politely(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: the pid names a process group we created and have not reaped yet.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::{InputPayload, StageSpec};

    fn stage(program: &str, args: &[&str]) -> StageSpec {
        StageSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn sh(script: &str) -> StageSpec {
        stage("sh", &["-c", script])
    }

    fn spec(stages: Vec<StageSpec>) -> PipelineSpec {
        PipelineSpec {
            command_name: "test".to_string(),
            stages,
            input: None,
            substitutions: Vec::new(),
            max_run: None,
            requires_confirmation: false,
        }
    }

    fn policy() -> RunnerPolicy {
        RunnerPolicy {
            watchdog_interval: Duration::from_millis(5),
            cancel_grace: Duration::from_millis(300),
            max_captured_bytes: 1024,
        }
    }

    #[test]
    fn single_stage_captures_stdout_and_stderr() {
        let snapshot = run_blocking(spec(vec![sh("printf out; printf err >&2")]), &policy());
        assert_eq!(snapshot.state, ProcessState::Finished);
        assert_eq!(snapshot.stdout, b"out");
        assert_eq!(snapshot.stderr, b"err");
        assert_eq!(snapshot.exit_code, Some(0));
    }

    #[test]
    fn input_streams_through_two_stages() {
        let mut spec = spec(vec![stage("cat", &[]), stage("tr", &["a-z", "A-Z"])]);
        spec.input = Some(InputPayload {
            mime: "text/plain".to_string(),
            bytes: b"hello pipe".to_vec(),
        });
        let snapshot = run_blocking(spec, &policy());
        assert_eq!(snapshot.state, ProcessState::Finished);
        assert_eq!(snapshot.stdout_text(), "HELLO PIPE");
        assert_eq!(snapshot.stages_spawned, 2);
    }

    #[test]
    fn failing_first_stage_never_spawns_second() {
        let marker = std::env::temp_dir().join(format!(
            "clipcmd_runner_never_spawned_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&marker);
        let touch = format!("touch '{}'; cat", marker.display());

        let snapshot = run_blocking(spec(vec![sh("exit 3"), sh(&touch)]), &policy());
        assert_eq!(snapshot.state, ProcessState::Failed);
        assert_eq!(snapshot.exit_code, Some(3));
        assert_eq!(snapshot.stages_spawned, 1);
        assert!(matches!(
            snapshot.error,
            Some(EngineError::StageFailure { stage: 0, .. })
        ));
        assert!(!marker.exists());
    }

    #[test]
    fn silent_successful_stage_feeds_empty_input() {
        let snapshot = run_blocking(spec(vec![stage("true", &[]), sh("wc -c | tr -d ' '")]), &policy());
        assert_eq!(snapshot.state, ProcessState::Finished);
        assert_eq!(snapshot.stdout_text().trim(), "0");
    }

    #[test]
    fn reader_exiting_early_still_finishes() {
        let snapshot = run_blocking(spec(vec![stage("yes", &[]), stage("head", &["-n", "1"])]), &policy());
        assert_eq!(snapshot.state, ProcessState::Finished);
        assert_eq!(snapshot.stdout_text(), "y\n");
        assert_eq!(snapshot.exit_code, Some(0));
        assert_eq!(snapshot.error, None);
    }

    #[test]
    fn failed_run_keeps_its_stderr() {
        for _ in 0..20 {
            let snapshot = run_blocking(spec(vec![sh("echo oops >&2; exit 3")]), &policy());
            assert_eq!(snapshot.state, ProcessState::Failed);
            assert_eq!(snapshot.exit_code, Some(3));
            assert_eq!(snapshot.stderr_text(), "oops\n");
        }
    }

    #[test]
    fn later_stage_failure_fails_the_run() {
        let snapshot = run_blocking(spec(vec![sh("echo data"), sh("cat >/dev/null; exit 4")]), &policy());
        assert_eq!(snapshot.state, ProcessState::Failed);
        assert_eq!(snapshot.exit_code, Some(4));
    }

    #[test]
    fn missing_executable_is_spawn_failure() {
        let snapshot = run_blocking(
            spec(vec![stage("clipcmd-definitely-missing-program", &[])]),
            &policy(),
        );
        assert_eq!(snapshot.state, ProcessState::Failed);
        assert_eq!(snapshot.stages_spawned, 0);
        assert!(matches!(snapshot.error, Some(EngineError::Spawn { .. })));
    }

    #[test]
    fn captured_output_is_truncated_at_limit() {
        let mut policy = policy();
        policy.max_captured_bytes = 10;
        let snapshot = run_blocking(spec(vec![sh("head -c 5000 /dev/zero")]), &policy);
        assert_eq!(snapshot.state, ProcessState::Finished);
        assert_eq!(snapshot.stdout.len(), 10);
        assert!(snapshot.stdout_truncated);
    }

    #[test]
    fn max_run_time_kills_and_fails() {
        let mut spec = spec(vec![stage("sleep", &["5"])]);
        spec.max_run = Some(Duration::from_millis(50));
        let started = Instant::now();
        let snapshot = run_blocking(spec, &policy());
        assert_eq!(snapshot.state, ProcessState::Failed);
        assert!(matches!(snapshot.error, Some(EngineError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn stages_see_run_environment() {
        let snapshot = run_blocking(spec(vec![sh("printf \"$CLIPCMD_COMMAND\"")]), &policy());
        assert_eq!(snapshot.stdout_text(), "test");
    }
}

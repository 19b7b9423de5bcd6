//! Spawning and supervising local inference processes.

use super::output::{extract_reply, LineTail};
use super::template::{render_args, TemplateVars};
use crate::concurrency::Semaphore;
use crate::error::GrimoireError;
use crate::registry::{Backend, LocalProcessSpec, ModelDescriptor};
use crate::types::ModelParameters;
use dashmap::DashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_STDERR_TAIL_LINES: usize = 20;

/// Runs one inference request per spawned process.
///
/// Each model gets its own [`Semaphore`] sized by `max_concurrent`, so a
/// second request for a busy model waits for a slot. The child process is
/// owned by the call that spawned it and is killed if that call is dropped.
#[derive(Debug)]
pub struct LocalProcessRunner {
    gates: DashMap<String, Semaphore>,
    grace_period: Duration,
    stderr_tail_lines: usize,
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self {
            gates: DashMap::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }

    /// Time between SIGTERM and SIGKILL when a run is cancelled
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_stderr_tail_lines(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines.max(1);
        self
    }

    /// The admission gate of `model_id`, created on first use.
    pub fn gate(&self, model_id: &str, max_concurrent: usize) -> Semaphore {
        self.gates
            .entry(model_id.to_string())
            .or_insert_with(|| Semaphore::new(max_concurrent))
            .clone()
    }

    /// Generate a reply for `prompt` with a fresh process.
    pub async fn run(
        &self,
        descriptor: &ModelDescriptor,
        prompt: &str,
        overrides: &ModelParameters,
        cancel: &CancellationToken,
    ) -> Result<String, GrimoireError> {
        let Backend::LocalProcess(spec) = &descriptor.backend else {
            return Err(GrimoireError::configuration(format!(
                "model '{}' is not a local process model",
                descriptor.id
            )));
        };

        let params = descriptor.parameters.merged(overrides);
        let vars = template_vars(descriptor, spec, prompt, &params);
        let args = render_args(&spec.args_template, &vars)?;

        let gate = self.gate(&descriptor.id, spec.max_concurrent);
        if gate.available() == 0 {
            tracing::debug!(model = %descriptor.id, "waiting for a process slot");
        }
        let permit = gate.acquire_cancellable(cancel).await?;
        let result = self.spawn_and_wait(&descriptor.id, spec, args, cancel).await;
        permit.release();
        result
    }

    async fn spawn_and_wait(
        &self,
        model_id: &str,
        spec: &LocalProcessSpec,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<String, GrimoireError> {
        let started_at = Instant::now();

        let mut command = Command::new(&spec.binary_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| GrimoireError::ProcessFailed {
            exit_code: None,
            stderr_tail: format!(
                "failed to start '{}': {err}",
                spec.binary_path.display()
            ),
        })?;
        let group = ProcessGroup::new(child.id());

        tracing::info!(
            model = %model_id,
            pid = child.id(),
            binary = %spec.binary_path.display(),
            args = args.len(),
            "inference_process_started"
        );

        let stdout = child.stdout.take().ok_or_else(|| {
            GrimoireError::Io(std::io::Error::other("process stdout is unavailable"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            GrimoireError::Io(std::io::Error::other("process stderr is unavailable"))
        })?;

        let mut stdout_task = tokio::spawn(read_stdout(stdout));
        let mut stderr_task = tokio::spawn(read_stderr_tail(stderr, self.stderr_tail_lines));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                terminate(&mut child, &group, self.grace_period).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(cancelled(model_id, started_at));
            }
        };

        // descendants can keep the pipes open after the process itself exits
        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            output = tokio::time::timeout(
                self.grace_period,
                collect_output(&mut stdout_task, &mut stderr_task),
            ) => output.ok(),
        };
        let (stdout, stderr_tail) = match drained {
            Some(output) => output?,
            None => {
                group.kill();
                if cancel.is_cancelled() {
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(cancelled(model_id, started_at));
                }
                tracing::warn!(
                    model = %model_id,
                    "process output stayed open after exit; killed leftover processes"
                );
                match tokio::time::timeout(
                    self.grace_period,
                    collect_output(&mut stdout_task, &mut stderr_task),
                )
                .await
                {
                    Ok(output) => output?,
                    Err(_) => {
                        stdout_task.abort();
                        stderr_task.abort();
                        return Err(GrimoireError::ProcessFailed {
                            exit_code: status.code(),
                            stderr_tail: "process output did not close after exit".to_string(),
                        });
                    }
                }
            }
        };

        tracing::info!(
            model = %model_id,
            duration_ms = started_at.elapsed().as_millis() as u64,
            status = %status,
            stdout_bytes = stdout.len(),
            "inference_process_finished"
        );

        if !status.success() {
            return Err(GrimoireError::ProcessFailed {
                exit_code: status.code(),
                stderr_tail,
            });
        }

        extract_reply(&stdout, &spec.reply_delimiter)
    }
}

fn cancelled(model_id: &str, started_at: Instant) -> GrimoireError {
    tracing::warn!(
        model = %model_id,
        duration_ms = started_at.elapsed().as_millis() as u64,
        "inference_process_cancelled"
    );
    GrimoireError::cancelled(format!(
        "inference process for '{model_id}' was cancelled"
    ))
}

/// The process group led by a spawned child. Every member still running
/// is killed when the guard drops, so no descendant outlives the call.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// Ask the whole group to stop. False when nothing was signalled.
    #[cfg(unix)]
    fn terminate(&self) -> bool {
        self.signal(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn kill(&self) {
        self.signal(nix::sys::signal::Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    fn kill(&self) {}

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return false;
        };
        match killpg(Pid::from_raw(pgid as i32), signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(err) => {
                tracing::warn!(pgid, ?signal, error = %err, "failed to signal process group");
                false
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn template_vars(
    descriptor: &ModelDescriptor,
    spec: &LocalProcessSpec,
    prompt: &str,
    params: &ModelParameters,
) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.set("prompt", prompt).set("model_id", descriptor.id.as_str());

    if let Some(model_path) = &spec.model_path {
        vars.set("model_path", model_path.display().to_string());
    }
    if let Some(temperature) = params.temperature {
        vars.set("temperature", temperature.to_string());
    }
    if let Some(max_tokens) = params.max_tokens {
        vars.set("max_tokens", max_tokens.to_string());
    }
    if let Some(top_p) = params.top_p {
        vars.set("top_p", top_p.to_string());
    }
    for (name, value) in &params.extra {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        vars.set(name.clone(), value);
    }
    vars
}

async fn read_stdout(stdout: ChildStdout) -> String {
    let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'));
    let mut out = String::new();
    while let Some(line) = lines.next().await {
        match line {
            Ok(bytes) => {
                let line = String::from_utf8_lossy(&bytes);
                tracing::trace!(line = %line, "process stdout");
                out.push_str(&line);
                out.push('\n');
            }
            Err(err) => {
                tracing::warn!(error = %err, "process stdout read failed");
                break;
            }
        }
    }
    out
}

async fn read_stderr_tail(stderr: ChildStderr, max_lines: usize) -> String {
    let mut lines = SplitStream::new(BufReader::new(stderr).split(b'\n'));
    let mut tail = LineTail::new(max_lines);
    while let Some(line) = lines.next().await {
        match line {
            Ok(bytes) => {
                let line = String::from_utf8_lossy(&bytes).into_owned();
                tracing::debug!(line = %line, "process stderr");
                tail.push(line);
            }
            Err(err) => {
                tracing::warn!(error = %err, "process stderr read failed");
                break;
            }
        }
    }
    tail.into_string()
}

async fn join_reader(task: &mut JoinHandle<String>) -> Result<String, GrimoireError> {
    task.await
        .map_err(|err| GrimoireError::Io(std::io::Error::other(format!("output reader failed: {err}"))))
}

/// Wait for both pipes to reach EOF.
async fn collect_output(
    stdout: &mut JoinHandle<String>,
    stderr: &mut JoinHandle<String>,
) -> Result<(String, String), GrimoireError> {
    let stdout = join_reader(stdout).await?;
    let stderr = join_reader(stderr).await?;
    Ok((stdout, stderr))
}

/// SIGTERM the group, wait up to `grace` for the child, then SIGKILL.
async fn terminate(child: &mut Child, group: &ProcessGroup, grace: Duration) {
    if group.terminate() {
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            tracing::debug!(%status, "process exited after SIGTERM");
            group.kill();
            return;
        }
    }
    group.kill();

    if let Ok(None) = child.try_wait() {
        if let Err(err) = child.kill().await {
            tracing::warn!(error = %err, "failed to kill inference process");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::ModelDescriptor;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn model(binary: &Path) -> ModelDescriptor {
        let spec = LocalProcessSpec::new(binary).with_args(["{prompt}", "{max_tokens}"]);
        ModelDescriptor::local("local", spec)
            .with_parameters(ModelParameters::default().with_max_tokens(32))
    }

    #[tokio::test]
    async fn returns_text_after_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(
            dir.path(),
            "echo.sh",
            r#"printf '%s\n' "$1"; echo "tokens=$2" >&2; echo " Hi from local ($2)""#,
        );

        let reply = LocalProcessRunner::new()
            .run(&model(&binary), "user: Hello\nassistant:", &ModelParameters::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, "Hi from local (32)");
    }

    #[tokio::test]
    async fn overrides_reach_the_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "echo.sh", r#"echo "assistant: $2""#);

        let reply = LocalProcessRunner::new()
            .run(
                &model(&binary),
                "hi",
                &ModelParameters::default().with_max_tokens(7),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply, "7");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "fail.sh", "echo 'model file corrupt' >&2; exit 1");

        let err = LocalProcessRunner::new()
            .run(&model(&binary), "hi", &ModelParameters::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GrimoireError::ProcessFailed {
                exit_code,
                stderr_tail,
            } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr_tail.contains("model file corrupt"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_delimiter_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "noise.sh", "echo 'loading weights'");

        let err = LocalProcessRunner::new()
            .run(&model(&binary), "hi", &ModelParameters::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GrimoireError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "hang.sh", "sleep 30");

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = LocalProcessRunner::new()
            .with_grace_period(Duration::from_millis(500))
            .run(&model(&binary), "hi", &ModelParameters::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, GrimoireError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// False once `pid` has exited, zombies included.
    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancellation_reaches_child_processes() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let binary = script(
            dir.path(),
            "wrapper.sh",
            &format!("sleep 30 &\necho $! > {}\nwait", pid_file.display()),
        );

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let err = LocalProcessRunner::new()
            .with_grace_period(Duration::from_millis(500))
            .run(&model(&binary), "hi", &ModelParameters::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, GrimoireError::Cancelled(_)));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(pid), "background child {pid} survived cancellation");
    }

    #[tokio::test]
    async fn leftover_children_do_not_hold_the_reply() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "detach.sh", "(sleep 30 &)\necho 'assistant: hi'");

        let started = Instant::now();
        let reply = LocalProcessRunner::new()
            .with_grace_period(Duration::from_millis(200))
            .run(&model(&binary), "hi", &ModelParameters::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, "hi");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancel_while_output_is_held_open() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "detach.sh", "(sleep 30 &)\necho 'assistant: hi'");

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = LocalProcessRunner::new()
            .run(&model(&binary), "hi", &ModelParameters::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, GrimoireError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failed_exit_wins_over_undecodable_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "garbage.sh", "printf '\\377\\n'; echo 'bad weights' >&2; exit 1");

        let err = LocalProcessRunner::new()
            .run(&model(&binary), "hi", &ModelParameters::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GrimoireError::ProcessFailed {
                exit_code,
                stderr_tail,
            } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr_tail.contains("bad weights"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_in_reply_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "latin1.sh", "printf 'assistant: caf\\351\\n'");

        let reply = LocalProcessRunner::new()
            .run(&model(&binary), "hi", &ModelParameters::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, "caf\u{FFFD}");
    }

    #[tokio::test]
    async fn same_model_runs_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let binary = script(
            dir.path(),
            "slow.sh",
            &format!(
                "echo start >> {log}; sleep 0.3; echo end >> {log}; echo 'assistant: done'",
                log = log.display()
            ),
        );

        let runner = Arc::new(LocalProcessRunner::new());
        let descriptor = Arc::new(model(&binary));
        let run = |runner: Arc<LocalProcessRunner>, descriptor: Arc<ModelDescriptor>| async move {
            runner
                .run(&descriptor, "hi", &ModelParameters::default(), &CancellationToken::new())
                .await
        };

        let (a, b) = tokio::join!(
            run(runner.clone(), descriptor.clone()),
            run(runner.clone(), descriptor.clone())
        );
        assert_eq!(a.unwrap(), "done");
        assert_eq!(b.unwrap(), "done");

        let log = std::fs::read_to_string(&log).unwrap();
        assert_eq!(log.lines().collect::<Vec<_>>(), vec!["start", "end", "start", "end"]);
    }

    #[tokio::test]
    async fn unknown_placeholder_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(dir.path(), "never.sh", "echo 'assistant: unreachable'");
        let spec = LocalProcessSpec::new(&binary).with_args(["--seed", "{seed}"]);

        let err = LocalProcessRunner::new()
            .run(
                &ModelDescriptor::local("local", spec),
                "hi",
                &ModelParameters::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GrimoireError::Configuration(_)));
    }
}

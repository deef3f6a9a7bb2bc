//! Spawning and supervising one engine subprocess.
//!
//! The runner owns the child for its whole life: output capture, the hard
//! timeout, and the kill contract (SIGTERM, a 5 second grace, then SIGKILL;
//! idempotent and safe after exit).

use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{
    classify_error_type, looks_rate_limited, parse_envelope, EngineErrorKind, EngineResult,
};
use crate::config::EngineConfig;
use crate::{ForemanError, Result};

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Environment variables that would make a child recursively invoke the
/// product; always stripped from engine environments.
const RECURSION_GUARD_ENV: &[&str] = &["FOREMAN", "FOREMAN_RUN_LABEL", "FOREMAN_ISSUE"];

const ERROR_TAIL_CHARS: usize = 400;

// ---------------------------------------------------------------------------
// Kill handle
// ---------------------------------------------------------------------------

struct HandleInner {
    pid: u32,
    engine: String,
    issue: u64,
    exited: AtomicBool,
    kill_requested: AtomicBool,
    direct_kill: Notify,
}

/// Cloneable handle registered on a slot so supervisors and shutdown can
/// abort the engine from outside the owning task.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("pid", &self.inner.pid)
            .field("engine", &self.inner.engine)
            .field("issue", &self.inner.issue)
            .finish()
    }
}

impl EngineHandle {
    fn new(pid: u32, engine: String, issue: u64) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid,
                engine,
                issue,
                exited: AtomicBool::new(false),
                kill_requested: AtomicBool::new(false),
                direct_kill: Notify::new(),
            }),
        }
    }

    pub fn engine(&self) -> &str {
        &self.inner.engine
    }

    pub fn issue(&self) -> u64 {
        self.inner.issue
    }

    pub fn kill_requested(&self) -> bool {
        self.inner.kill_requested.load(Ordering::SeqCst)
    }

    /// Abort the engine: SIGTERM, then SIGKILL after [`KILL_GRACE`] if it is
    /// still alive. Idempotent and safe to call once the child has exited.
    pub async fn kill(&self) {
        if self.inner.kill_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.exited.load(Ordering::SeqCst) {
            return;
        }
        warn!(pid = self.inner.pid, engine = %self.inner.engine, "killing engine");

        #[cfg(unix)]
        {
            send_signal(self.inner.pid, nix::sys::signal::Signal::SIGTERM);
            let deadline = Instant::now() + KILL_GRACE;
            while Instant::now() < deadline {
                if self.inner.exited.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if !self.inner.exited.load(Ordering::SeqCst) {
                warn!(pid = self.inner.pid, "engine survived SIGTERM grace; sending SIGKILL");
                send_signal(self.inner.pid, nix::sys::signal::Signal::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            // No per-pid signals here; the owning runner kills the child.
            // notify_one stores a permit in case the runner is not yet
            // parked on the notification.
            self.inner.direct_kill.notify_one();
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(pid), signal);
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes one configured engine command.
pub struct EngineRunner {
    spec: EngineConfig,
    timeout: Duration,
}

/// A spawned engine, ready to be awaited.
pub struct RunningEngine {
    handle: EngineHandle,
    child: tokio::process::Child,
    stdout_task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    stderr_task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
    started: Instant,
    timeout: Duration,
    rate_limit_patterns: Vec<String>,
}

enum WaitOutcome {
    Exited(ExitStatus),
    IoError(std::io::Error),
    TimedOut,
    DirectKill,
}

impl EngineRunner {
    pub fn new(spec: EngineConfig, timeout: Duration) -> Self {
        Self { spec, timeout }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Spawn the engine with the prompt substituted into its args and the
    /// recursion-guard variables scrubbed from its environment.
    pub async fn spawn(&self, prompt: &str, cwd: &Path, issue: u64) -> Result<RunningEngine> {
        let issue_str = issue.to_string();
        let args: Vec<String> = self
            .spec
            .args
            .iter()
            .map(|a| a.replace("{prompt}", prompt).replace("{issue}", &issue_str))
            .collect();

        debug!(engine = %self.spec.name, program = %self.spec.program, issue, "spawning engine");

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for var in RECURSION_GUARD_ENV {
            cmd.env_remove(var);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ForemanError::Engine(format!("failed to spawn engine '{}': {e}", self.spec.name))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ForemanError::Engine("engine exited before pid was read".into()))?;

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Engine("stdout pipe missing".into()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| ForemanError::Engine("stderr pipe missing".into()))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_pipe.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_pipe.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        });

        Ok(RunningEngine {
            handle: EngineHandle::new(pid, self.spec.name.clone(), issue),
            child,
            stdout_task,
            stderr_task,
            started: Instant::now(),
            timeout: self.timeout,
            rate_limit_patterns: self.spec.rate_limit_patterns.clone(),
        })
    }

    /// Spawn and wait in one step.
    pub async fn run(&self, prompt: &str, cwd: &Path, issue: u64) -> Result<EngineResult> {
        let running = self.spawn(prompt, cwd, issue).await?;
        Ok(running.wait().await)
    }
}

impl RunningEngine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Drive the engine to completion and classify the outcome.
    pub async fn wait(mut self) -> EngineResult {
        let outcome = tokio::select! {
            res = self.child.wait() => match res {
                Ok(status) => WaitOutcome::Exited(status),
                Err(e) => WaitOutcome::IoError(e),
            },
            _ = tokio::time::sleep(self.timeout) => WaitOutcome::TimedOut,
            _ = self.handle.inner.direct_kill.notified() => WaitOutcome::DirectKill,
        };

        match outcome {
            WaitOutcome::TimedOut => terminate_child(&mut self.child).await,
            WaitOutcome::DirectKill => {
                let _ = self.child.kill().await;
                let _ = self.child.wait().await;
            }
            _ => {}
        }
        self.handle.inner.exited.store(true, Ordering::SeqCst);

        let stdout = collect_output(self.stdout_task).await;
        let stderr = collect_output(self.stderr_task).await;
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let engine = self.handle.inner.engine.clone();

        if self.handle.kill_requested() {
            return EngineResult {
                engine,
                success: false,
                no_changes: false,
                output: stdout,
                error: Some("engine killed".into()),
                error_kind: None,
                killed: true,
                duration_ms,
            };
        }

        match outcome {
            // Unreachable without a prior kill request, which returned above.
            WaitOutcome::DirectKill => EngineResult {
                engine,
                success: false,
                no_changes: false,
                output: stdout,
                error: Some("engine killed".into()),
                error_kind: None,
                killed: true,
                duration_ms,
            },
            WaitOutcome::TimedOut => EngineResult {
                engine,
                success: false,
                no_changes: false,
                output: stdout,
                error: Some(format!("engine timed out after {}s", self.timeout.as_secs())),
                error_kind: Some(EngineErrorKind::Timeout),
                killed: false,
                duration_ms,
            },
            WaitOutcome::IoError(e) => EngineResult {
                engine,
                success: false,
                no_changes: false,
                output: stdout,
                error: Some(format!("failed to wait on engine: {e}")),
                error_kind: Some(EngineErrorKind::Crash),
                killed: false,
                duration_ms,
            },
            WaitOutcome::Exited(status) if status.success() => {
                classify_success(engine, stdout, stderr, &self.rate_limit_patterns, duration_ms)
            }
            WaitOutcome::Exited(status) => {
                let combined = format!("{stdout}\n{stderr}");
                let kind = if looks_rate_limited(&combined, &self.rate_limit_patterns) {
                    EngineErrorKind::RateLimit
                } else {
                    EngineErrorKind::Crash
                };
                EngineResult {
                    engine,
                    success: false,
                    no_changes: false,
                    output: stdout,
                    error: Some(format!(
                        "engine exited with {:?}: {}",
                        status.code(),
                        tail(&stderr)
                    )),
                    error_kind: Some(kind),
                    killed: false,
                    duration_ms,
                }
            }
        }
    }
}

/// A zero exit still carries a verdict in the envelope, when one exists.
fn classify_success(
    engine: String,
    stdout: String,
    stderr: String,
    rate_limit_patterns: &[String],
    duration_ms: u64,
) -> EngineResult {
    let Some(envelope) = parse_envelope(&stdout) else {
        return EngineResult {
            engine,
            success: true,
            no_changes: false,
            output: stdout,
            error: None,
            error_kind: None,
            killed: false,
            duration_ms,
        };
    };

    match envelope.result.as_str() {
        "no_changes" | "no-changes" => EngineResult {
            engine,
            success: true,
            no_changes: true,
            output: stdout,
            error: None,
            error_kind: None,
            killed: false,
            duration_ms,
        },
        "error" => {
            let kind = match envelope.error_type.as_deref() {
                Some(t) => classify_error_type(t),
                None => {
                    let combined = format!("{stdout}\n{stderr}");
                    if looks_rate_limited(&combined, rate_limit_patterns) {
                        EngineErrorKind::RateLimit
                    } else {
                        EngineErrorKind::Unknown
                    }
                }
            };
            let error = envelope
                .message
                .unwrap_or_else(|| "engine reported an error".to_string());
            EngineResult {
                engine,
                success: false,
                no_changes: false,
                output: stdout,
                error: Some(error),
                error_kind: Some(kind),
                killed: false,
                duration_ms,
            }
        }
        _ => EngineResult {
            engine,
            success: true,
            no_changes: false,
            output: stdout,
            error: None,
            error_kind: None,
            killed: false,
            duration_ms,
        },
    }
}

async fn collect_output(task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>) -> String {
    match task.await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).to_string(),
        _ => String::new(),
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= ERROR_TAIL_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .skip(trimmed.chars().count() - ERROR_TAIL_CHARS)
        .collect();
    format!("...{tail}")
}

#[cfg(unix)]
async fn terminate_child(child: &mut tokio::process::Child) {
    use nix::sys::signal::Signal;

    if let Some(pid) = child.id() {
        send_signal(pid, Signal::SIGTERM);
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => (),
            Err(_) => {
                warn!(pid, "engine did not exit after SIGTERM; sending SIGKILL");
                send_signal(pid, Signal::SIGKILL);
                let _ = child.wait().await;
            }
        }
    } else {
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn terminate_child(child: &mut tokio::process::Child) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_engine(name: &str, script: &str) -> EngineConfig {
        EngineConfig {
            name: name.into(),
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            rate_limit_patterns: vec![],
        }
    }

    fn cwd() -> std::path::PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn success_envelope_is_parsed() {
        let runner = EngineRunner::new(
            sh_engine("ok", r#"echo '{"result": "success"}'"#),
            Duration::from_secs(10),
        );
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert!(result.success);
        assert!(!result.no_changes);
        assert!(!result.killed);
    }

    #[tokio::test]
    async fn no_changes_envelope_is_parsed() {
        let runner = EngineRunner::new(
            sh_engine("idle", r#"echo '{"result": "no_changes"}'"#),
            Duration::from_secs(10),
        );
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert!(result.success);
        assert!(result.no_changes);
    }

    #[tokio::test]
    async fn plain_zero_exit_without_envelope_is_success() {
        let runner = EngineRunner::new(
            sh_engine("plain", "echo did things"),
            Duration::from_secs(10),
        );
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("did things"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_crash() {
        let runner = EngineRunner::new(
            sh_engine("boom", "echo oops >&2; exit 3"),
            Duration::from_secs(10),
        );
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(EngineErrorKind::Crash));
        assert!(result.error.as_deref().unwrap_or("").contains("oops"));
    }

    #[tokio::test]
    async fn rate_limited_output_is_classified() {
        let runner = EngineRunner::new(
            sh_engine("limited", "echo 'HTTP 429 Too Many Requests' >&2; exit 1"),
            Duration::from_secs(10),
        );
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert_eq!(result.error_kind, Some(EngineErrorKind::RateLimit));
    }

    #[tokio::test]
    async fn envelope_error_type_wins() {
        let runner = EngineRunner::new(
            sh_engine(
                "env-error",
                r#"echo '{"result": "error", "error_type": "rate_limit", "message": "slow down"}'"#,
            ),
            Duration::from_secs(10),
        );
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(EngineErrorKind::RateLimit));
        assert_eq!(result.error.as_deref(), Some("slow down"));
    }

    #[tokio::test]
    async fn hard_timeout_kills_the_engine() {
        let runner = EngineRunner::new(
            sh_engine("slow", "sleep 600"),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert_eq!(result.error_kind, Some(EngineErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn kill_is_observed_and_idempotent() {
        let runner = EngineRunner::new(sh_engine("victim", "sleep 600"), Duration::from_secs(60));
        let running = runner.spawn("p", &cwd(), 9).await.unwrap();
        let handle = running.handle();

        let killer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                handle.kill().await;
                // Second call must be a no-op.
                handle.kill().await;
            })
        };

        let result = running.wait().await;
        killer.await.unwrap();

        assert!(result.killed);
        assert!(!result.success);

        // Safe to call after exit too.
        handle.kill().await;
    }

    #[tokio::test]
    async fn prompt_is_substituted_into_args() {
        let spec = EngineConfig {
            name: "echoer".into(),
            program: "echo".into(),
            args: vec!["{prompt}".into(), "#{issue}".into()],
            rate_limit_patterns: vec![],
        };
        let runner = EngineRunner::new(spec, Duration::from_secs(10));
        let result = runner.run("hello-world", &cwd(), 42).await.unwrap();
        assert!(result.output.contains("hello-world"));
        assert!(result.output.contains("#42"));
    }

    #[tokio::test]
    async fn recursion_guard_env_is_scrubbed() {
        std::env::set_var("FOREMAN", "1");
        let runner = EngineRunner::new(
            sh_engine("probe", "echo FOREMAN=${FOREMAN:-unset}"),
            Duration::from_secs(10),
        );
        let result = runner.run("p", &cwd(), 1).await.unwrap();
        assert!(result.output.contains("FOREMAN=unset"));
        std::env::remove_var("FOREMAN");
    }

    #[tokio::test]
    async fn missing_program_is_an_engine_error() {
        let spec = EngineConfig {
            name: "ghost".into(),
            program: "definitely-not-a-real-binary".into(),
            args: vec![],
            rate_limit_patterns: vec![],
        };
        let runner = EngineRunner::new(spec, Duration::from_secs(10));
        let err = runner.run("p", &cwd(), 1).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn tail_truncates_long_errors() {
        let long = "x".repeat(2000);
        let t = tail(&long);
        assert!(t.starts_with("..."));
        assert!(t.chars().count() <= ERROR_TAIL_CHARS + 3);
    }
}

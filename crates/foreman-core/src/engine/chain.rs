//! Primary-then-alternates engine execution.
//!
//! The chain retries classified transient failures (rate limiting, crashes)
//! on the next configured engine with the same prompt and cwd. Validation
//! failures and "stuck" results propagate unchanged; a kill aborts the
//! whole chain.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::runner::{EngineHandle, EngineRunner};
use super::{EngineErrorKind, EngineResult};
use crate::config::EngineConfig;
use crate::events::{EventBus, SchedulerEvent};

pub struct FallbackChain {
    engines: Vec<EngineConfig>,
    timeout: Duration,
}

impl FallbackChain {
    /// Chain over the configured engines in order: primary first, then
    /// alternates.
    pub fn new(engines: Vec<EngineConfig>, timeout: Duration) -> Self {
        Self { engines, timeout }
    }

    /// Run the chain for one attempt.
    ///
    /// `register` receives the live handle before each engine is awaited so
    /// the caller can expose it for external kill; it is invoked once per
    /// engine tried.
    pub async fn run<F>(
        &self,
        prompt: &str,
        cwd: &Path,
        issue: u64,
        slot_id: u64,
        bus: &EventBus,
        register: F,
    ) -> EngineResult
    where
        F: Fn(EngineHandle),
    {
        debug_assert!(!self.engines.is_empty(), "chain requires at least one engine");

        let mut last_result: Option<EngineResult> = None;

        for (idx, spec) in self.engines.iter().enumerate() {
            let runner = EngineRunner::new(spec.clone(), self.timeout);
            let result = match runner.spawn(prompt, cwd, issue).await {
                Ok(running) => {
                    register(running.handle());
                    running.wait().await
                }
                Err(e) => {
                    warn!(engine = %spec.name, issue, error = %e, "engine failed to spawn");
                    EngineResult {
                        engine: spec.name.clone(),
                        success: false,
                        no_changes: false,
                        output: String::new(),
                        error: Some(e.to_string()),
                        error_kind: Some(EngineErrorKind::Crash),
                        killed: false,
                        duration_ms: 0,
                    }
                }
            };

            if result.killed {
                info!(engine = %result.engine, issue, "engine killed; aborting chain");
                return result;
            }

            let next = self.engines.get(idx + 1);
            if result.triggers_fallback() {
                if let Some(next) = next {
                    let reason = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "classified transient failure".into());
                    info!(
                        from = %result.engine,
                        to = %next.name,
                        issue,
                        %reason,
                        "falling back to alternate engine"
                    );
                    bus.publish(SchedulerEvent::EngineSwitch {
                        slot_id,
                        issue,
                        from: result.engine.clone(),
                        to: next.name.clone(),
                        reason,
                        at: Utc::now(),
                    });
                    last_result = Some(result);
                    continue;
                }
            }

            return result;
        }

        // All engines exhausted on fallback triggers; surface the last one.
        last_result.unwrap_or_else(|| EngineResult {
            engine: "none".into(),
            success: false,
            no_changes: false,
            output: String::new(),
            error: Some("no engines configured".into()),
            error_kind: Some(EngineErrorKind::Unknown),
            killed: false,
            duration_ms: 0,
        })
    }
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
    async fn crash_falls_through_to_alternate() {
        let chain = FallbackChain::new(
            vec![
                sh_engine("flaky", "exit 1"),
                sh_engine("steady", r#"echo '{"result": "success"}'"#),
            ],
            Duration::from_secs(10),
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let result = chain.run("p", &cwd(), 1, 1, &bus, |_| {}).await;

        assert!(result.success);
        assert_eq!(result.engine, "steady");
        match rx.recv().await.unwrap() {
            SchedulerEvent::EngineSwitch { from, to, .. } => {
                assert_eq!(from, "flaky");
                assert_eq!(to, "steady");
            }
            other => panic!("expected EngineSwitch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_falls_through_to_alternate() {
        let chain = FallbackChain::new(
            vec![
                sh_engine("limited", "echo 'rate limit exceeded' >&2; exit 1"),
                sh_engine("steady", r#"echo '{"result": "success"}'"#),
            ],
            Duration::from_secs(10),
        );
        let bus = EventBus::default();
        let result = chain.run("p", &cwd(), 1, 1, &bus, |_| {}).await;
        assert!(result.success);
        assert_eq!(result.engine, "steady");
    }

    #[tokio::test]
    async fn stuck_result_does_not_fall_through() {
        let chain = FallbackChain::new(
            vec![
                sh_engine("idle", r#"echo '{"result": "no_changes"}'"#),
                sh_engine("never-reached", r#"echo '{"result": "success"}'"#),
            ],
            Duration::from_secs(10),
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let result = chain.run("p", &cwd(), 1, 1, &bus, |_| {}).await;

        assert!(result.success);
        assert!(result.no_changes);
        assert_eq!(result.engine, "idle");
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn exhausted_alternates_surface_last_failure() {
        let chain = FallbackChain::new(
            vec![sh_engine("a", "exit 1"), sh_engine("b", "exit 2")],
            Duration::from_secs(10),
        );
        let bus = EventBus::default();
        let result = chain.run("p", &cwd(), 1, 1, &bus, |_| {}).await;
        assert!(!result.success);
        assert_eq!(result.engine, "b");
    }

    #[tokio::test]
    async fn kill_aborts_the_chain() {
        let chain = FallbackChain::new(
            vec![
                sh_engine("victim", "sleep 600"),
                sh_engine("never-reached", r#"echo '{"result": "success"}'"#),
            ],
            Duration::from_secs(60),
        );
        let bus = EventBus::default();

        let (handle_tx, handle_rx) = tokio::sync::oneshot::channel::<EngineHandle>();
        let handle_tx = std::sync::Mutex::new(Some(handle_tx));

        let killer = tokio::spawn(async move {
            if let Ok(handle) = handle_rx.await {
                tokio::time::sleep(Duration::from_millis(100)).await;
                handle.kill().await;
            }
        });

        let result = chain
            .run("p", &cwd(), 1, 1, &bus, move |h| {
                if let Some(tx) = handle_tx.lock().unwrap().take() {
                    let _ = tx.send(h);
                }
            })
            .await;
        killer.await.unwrap();

        assert!(result.killed);
        assert_eq!(result.engine, "victim");
    }

    #[tokio::test]
    async fn register_sees_every_engine_tried() {
        let chain = FallbackChain::new(
            vec![
                sh_engine("first", "exit 1"),
                sh_engine("second", r#"echo '{"result": "success"}'"#),
            ],
            Duration::from_secs(10),
        );
        let bus = EventBus::default();
        let seen = std::sync::Mutex::new(Vec::new());

        let _ = chain
            .run("p", &cwd(), 1, 1, &bus, |h| {
                seen.lock().unwrap().push(h.engine().to_string());
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }
}

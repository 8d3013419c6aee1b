//! Job execution
//!
//! An action is an ordered list of steps. Steps run one after the other
//! through a [`StepRunner`]; the first failing step that is not optional
//! fails the job and every later non-optional step is skipped. Optional
//! steps still run and never fail the job.

use async_trait::async_trait;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use kiln_core::domain::job::{JobResult, JobStatus, Step, StepResult, StepStatus};
use kiln_core::domain::log::LogLevel;
use kiln_core::dto::job::JobInfo;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logs::LogBuffer;

/// Where and with what a step runs
#[derive(Debug, Clone)]
pub struct StepEnv {
    pub workdir: PathBuf,
    pub vars: Vec<(String, String)>,
    pub default_timeout: Duration,
}

impl StepEnv {
    /// Environment of a claimed job: parameters as `KILN_PARAM_<NAME>`,
    /// secrets under their own name
    pub fn for_job(info: &JobInfo, workdir: PathBuf, default_timeout: Duration) -> Self {
        let mut vars = vec![
            ("KILN_JOB_ID".to_string(), info.job.id.to_string()),
            ("KILN_RUN_ID".to_string(), info.job.run_id.to_string()),
            ("KILN_WORKER_ID".to_string(), info.worker_id.clone()),
        ];

        let mut parameters: Vec<_> = info.job.parameters.iter().collect();
        parameters.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in parameters {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.push((format!("KILN_PARAM_{}", env_name(name)), value));
        }

        for (name, value) in &info.secrets {
            vars.push((name.clone(), value.clone()));
        }

        Self {
            workdir,
            vars,
            default_timeout,
        }
    }

    fn timeout_for(&self, step: &Step) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub exit_code: Option<i32>,
}

/// Runs a single step, writing its output into the log buffer
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, index: usize, step: &Step, env: &StepEnv, logs: &LogBuffer) -> StepOutcome;
}

/// How long output is still collected once the step process is gone
///
/// Background processes of a step may keep its pipes open forever.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Kills the process group led by a step shell when dropped, unless disarmed
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        let Some(pid) = self.leader.take() else {
            return;
        };
        let group = Pid::from_raw(-(pid as i32));
        if let Err(e) = signal::kill(group, Signal::SIGKILL)
            && e != Errno::ESRCH
        {
            warn!("Cannot kill process group {}: {}", pid, e);
        }
    }

    fn disarm(&mut self) {
        self.leader = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs steps as `sh -c <script>` child processes
///
/// Each step leads its own process group, so a timeout or an interrupted
/// build also kills whatever the script started in the background.
pub struct ShellStepRunner;

#[async_trait]
impl StepRunner for ShellStepRunner {
    async fn run(&self, index: usize, step: &Step, env: &StepEnv, logs: &LogBuffer) -> StepOutcome {
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&step.script)
            .current_dir(&env.workdir)
            .envs(env.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                logs.push(index, LogLevel::Error, format!("Cannot start step: {}", e));
                return StepOutcome {
                    status: StepStatus::Fail,
                    exit_code: None,
                };
            }
        };

        let mut group = ProcessGroup { leader: child.id() };

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, index, LogLevel::Info, logs.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, index, LogLevel::Warning, logs.clone())));

        let timeout = env.timeout_for(step);
        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                group.disarm();
                StepOutcome {
                    status: if status.success() {
                        StepStatus::Success
                    } else {
                        StepStatus::Fail
                    },
                    exit_code: status.code(),
                }
            }
            Ok(Err(e)) => {
                group.kill();
                logs.push(index, LogLevel::Error, format!("Cannot wait for step: {}", e));
                StepOutcome {
                    status: StepStatus::Fail,
                    exit_code: None,
                }
            }
            Err(_) => {
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out step {}: {}", step.name, e);
                }
                logs.push(
                    index,
                    LogLevel::Error,
                    format!("Step timed out after {}s", timeout.as_secs()),
                );
                StepOutcome {
                    status: StepStatus::TimedOut,
                    exit_code: None,
                }
            }
        };

        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN;
        for reader in [stdout, stderr].into_iter().flatten() {
            let abort = reader.abort_handle();
            if tokio::time::timeout_at(deadline, reader).await.is_err() {
                debug!("Output of step {} still open, no longer collected", step.name);
                abort.abort();
            }
        }

        outcome
    }
}

async fn forward_lines<R>(reader: R, index: usize, level: LogLevel, logs: LogBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logs.push(index, level, line);
    }
}

/// Runs every step of the job and always produces a result
pub async fn execute(
    runner: &dyn StepRunner,
    info: &JobInfo,
    env: &StepEnv,
    logs: &LogBuffer,
    token: &CancellationToken,
) -> JobResult {
    let started = Instant::now();
    let mut steps = Vec::with_capacity(info.job.action.steps.len());
    let mut reason: Option<String> = None;

    info!(
        "Executing action {} of job {} ({} steps)",
        info.job.action.name,
        info.job.id,
        info.job.action.steps.len()
    );

    for (index, step) in info.job.action.steps.iter().enumerate() {
        let skip = token.is_cancelled() || (reason.is_some() && !step.optional);
        if skip {
            debug!("Skipping step {}", step.name);
            steps.push(StepResult {
                name: step.name.clone(),
                status: StepStatus::Skipped,
                exit_code: None,
                duration_ms: 0,
            });
            continue;
        }

        logs.push(index, LogLevel::Info, format!("Starting step {}", step.name));
        let step_started = Instant::now();

        let outcome = tokio::select! {
            outcome = runner.run(index, step, env, logs) => outcome,
            _ = token.cancelled() => {
                logs.push(index, LogLevel::Error, "Step interrupted, worker is stopping");
                StepOutcome { status: StepStatus::Fail, exit_code: None }
            }
        };

        let duration_ms = elapsed_ms(step_started);
        logs.push(
            index,
            LogLevel::Info,
            format!("Step {} finished: {:?}", step.name, outcome.status),
        );

        if outcome.status != StepStatus::Success {
            if step.optional {
                debug!("Optional step {} failed, continuing", step.name);
            } else if reason.is_none() {
                reason = Some(match outcome.status {
                    StepStatus::TimedOut => format!("Step {} timed out", step.name),
                    _ => format!("Step {} failed", step.name),
                });
            }
        }

        steps.push(StepResult {
            name: step.name.clone(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            duration_ms,
        });
    }

    if token.is_cancelled() && reason.is_none() && steps.iter().any(|s| s.status == StepStatus::Skipped) {
        reason = Some("Worker stopped before the action completed".to_string());
    }

    JobResult {
        status: if reason.is_some() {
            JobStatus::Fail
        } else {
            JobStatus::Success
        },
        duration_ms: elapsed_ms(started),
        steps,
        reason,
        log_lines: logs.total(),
        remote_time: Utc::now(),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::job::{Action, Job};
    use std::collections::HashMap;

    fn step(name: &str, script: &str, optional: bool) -> Step {
        Step {
            name: name.to_string(),
            script: script.to_string(),
            timeout_secs: None,
            optional,
        }
    }

    fn info(steps: Vec<Step>) -> JobInfo {
        JobInfo {
            job: Job {
                id: 9,
                run_id: 2,
                action: Action {
                    name: "build".to_string(),
                    steps,
                },
                requirements: vec![],
                status: JobStatus::Building,
                worker_id: Some("w1".to_string()),
                booked_by: None,
                model: None,
                parameters: HashMap::from([(
                    "git.branch".to_string(),
                    serde_json::json!("main"),
                )]),
                queued_at: Utc::now(),
                started_at: Some(Utc::now()),
                done_at: None,
            },
            worker_id: "w1".to_string(),
            secrets: HashMap::from([("DEPLOY_KEY".to_string(), "s3cr3t".to_string())]),
        }
    }

    fn env(info: &JobInfo) -> StepEnv {
        StepEnv::for_job(info, std::env::temp_dir(), Duration::from_secs(30))
    }

    /// Answers a fixed status per step name
    struct ScriptedRunner(HashMap<&'static str, StepStatus>);

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn run(&self, index: usize, step: &Step, _env: &StepEnv, logs: &LogBuffer) -> StepOutcome {
            logs.push(index, LogLevel::Info, format!("ran {}", step.name));
            let status = self.0.get(step.name.as_str()).copied().unwrap_or(StepStatus::Success);
            StepOutcome {
                status,
                exit_code: None,
            }
        }
    }

    #[test]
    fn test_step_env() {
        let info = info(vec![]);
        let env = env(&info);

        assert!(env.vars.contains(&("KILN_JOB_ID".to_string(), "9".to_string())));
        assert!(env.vars.contains(&("KILN_PARAM_GIT_BRANCH".to_string(), "main".to_string())));
        assert!(env.vars.contains(&("DEPLOY_KEY".to_string(), "s3cr3t".to_string())));
    }

    #[tokio::test]
    async fn test_failure_skips_later_steps_but_not_optional_ones() {
        let info = info(vec![
            step("compile", "", false),
            step("test", "", false),
            step("package", "", false),
            step("cleanup", "", true),
        ]);
        let runner = ScriptedRunner(HashMap::from([("test", StepStatus::Fail)]));
        let logs = LogBuffer::new();

        let result = execute(&runner, &info, &env(&info), &logs, &CancellationToken::new()).await;

        assert_eq!(result.status, JobStatus::Fail);
        assert_eq!(result.reason.as_deref(), Some("Step test failed"));
        let statuses: Vec<_> = result.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Success,
                StepStatus::Fail,
                StepStatus::Skipped,
                StepStatus::Success
            ]
        );
        assert_eq!(result.log_lines, logs.total());
    }

    #[tokio::test]
    async fn test_optional_failure_keeps_success() {
        let info = info(vec![step("lint", "", true), step("compile", "", false)]);
        let runner = ScriptedRunner(HashMap::from([("lint", StepStatus::Fail)]));

        let result = execute(&runner, &info, &env(&info), &LogBuffer::new(), &CancellationToken::new()).await;

        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.steps[0].status, StepStatus::Fail);
    }

    #[tokio::test]
    async fn test_cancelled_execution_fails() {
        let info = info(vec![step("compile", "", false)]);
        let token = CancellationToken::new();
        token.cancel();

        let result = execute(&ShellStepRunner, &info, &env(&info), &LogBuffer::new(), &token).await;

        assert_eq!(result.status, JobStatus::Fail);
        assert_eq!(result.steps[0].status, StepStatus::Skipped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_captures_output() {
        let info = info(vec![
            step("hello", "echo hello $KILN_PARAM_GIT_BRANCH", false),
            step("exit", "echo oops >&2; exit 3", true),
        ]);
        let logs = LogBuffer::new();

        let result = execute(&ShellStepRunner, &info, &env(&info), &logs, &CancellationToken::new()).await;

        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.steps[1].exit_code, Some(3));
        let messages: Vec<_> = logs.drain().into_iter().map(|l| l.message).collect();
        assert!(messages.contains(&"hello main".to_string()));
        assert!(messages.contains(&"oops".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let mut slow = step("slow", "sleep 5", false);
        slow.timeout_secs = Some(1);
        let info = info(vec![slow]);

        let result = execute(&ShellStepRunner, &info, &env(&info), &LogBuffer::new(), &CancellationToken::new()).await;

        assert_eq!(result.status, JobStatus::Fail);
        assert_eq!(result.steps[0].status, StepStatus::TimedOut);
        assert_eq!(result.reason.as_deref(), Some("Step slow timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_process_does_not_hold_the_step() {
        let info = info(vec![step("daemon", "sleep 20 & echo started", false)]);
        let logs = LogBuffer::new();
        let begin = Instant::now();

        let result = execute(&ShellStepRunner, &info, &env(&info), &logs, &CancellationToken::new()).await;

        assert!(begin.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, JobStatus::Success);
        let messages: Vec<_> = logs.drain().into_iter().map(|l| l.message).collect();
        assert!(messages.contains(&"started".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_background_processes() {
        let marker = std::env::temp_dir().join(format!("kiln-step-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let script = format!("(sleep 2; touch {}) & sleep 20", marker.display());
        let mut slow = step("slow", &script, false);
        slow.timeout_secs = Some(1);
        let info = info(vec![slow]);
        let begin = Instant::now();

        let result = execute(&ShellStepRunner, &info, &env(&info), &LogBuffer::new(), &CancellationToken::new()).await;

        assert!(begin.elapsed() < Duration::from_secs(5));
        assert_eq!(result.steps[0].status, StepStatus::TimedOut);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists());
    }
}

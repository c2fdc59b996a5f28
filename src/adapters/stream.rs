//! Streaming backend: supervised runtime subprocess with progress events.
//!
//! The runtime is started with `--output-format stream-json --verbose` and
//! its stdout is read line by line. Three windows are tracked independently:
//! - startup: no parseable event at all within the window
//! - stall: no event for the window after the stream got going
//! - overall: hard phase deadline regardless of activity
//!
//! A clean EOF is followed by the exit status check, so a crash is reported
//! as `exit_error` and never confused with a hang.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::direct::DirectBackend;
use super::live_status::write_live_status;
use super::stream_events::{PhaseProgress, StreamEvent};
use super::{
    command_label, runtime_command, PhaseExecutor, PhaseFailure, PhaseRequest, PhaseTimeouts,
};

/// Lower bound on the watchdog tick
const MIN_WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// Runs a phase while parsing the runtime's event stream
#[derive(Debug, Clone)]
pub struct StreamBackend {
    command: String,
    timeouts: PhaseTimeouts,
    scrub_env: Vec<String>,
    live_status_path: Option<PathBuf>,
    phase_names: Vec<String>,
    fallback: Option<DirectBackend>,
}

impl StreamBackend {
    pub fn new(command: impl Into<String>, timeouts: PhaseTimeouts) -> Self {
        Self {
            command: command.into(),
            timeouts,
            scrub_env: Vec::new(),
            live_status_path: None,
            phase_names: Vec::new(),
            fallback: None,
        }
    }

    pub fn with_scrubbed_env(mut self, scrub_env: Vec<String>) -> Self {
        self.scrub_env = scrub_env;
        self
    }

    pub fn with_live_status(mut self, path: PathBuf) -> Self {
        self.live_status_path = Some(path);
        self
    }

    pub fn with_phase_names(mut self, names: Vec<String>) -> Self {
        self.phase_names = names;
        self
    }

    /// Retry with `direct` when streaming fails to start or goes silent
    pub fn with_direct_fallback(mut self, direct: DirectBackend) -> Self {
        self.fallback = Some(direct);
        self
    }

    /// Watchdog period: the configured interval, tightened to a quarter of
    /// the shortest enabled window so detection lag stays proportional.
    fn watchdog_tick(&self) -> Duration {
        [self.timeouts.stall_timeout, self.timeouts.startup_timeout]
            .into_iter()
            .flatten()
            .map(|window| window / 4)
            .fold(self.timeouts.check_interval, Duration::min)
            .max(MIN_WATCHDOG_TICK)
    }

    /// Live-status rows and the index of the running phase
    fn progress_table(&self, request: &PhaseRequest) -> (Vec<PhaseProgress>, usize) {
        if self.phase_names.is_empty() {
            return (vec![PhaseProgress::new(request.phase_name.clone())], 0);
        }
        let table: Vec<PhaseProgress> = self.phase_names.iter().map(PhaseProgress::new).collect();
        let current = (request.phase as usize)
            .saturating_sub(1)
            .min(table.len().saturating_sub(1));
        (table, current)
    }

    fn publish(&self, table: &[PhaseProgress], current: usize) {
        if let Some(path) = &self.live_status_path {
            if let Err(err) = write_live_status(path, table, current) {
                warn!(path = %path.display(), error = %err, "Failed to write live status");
            }
        }
    }

    async fn run_stream(&self, request: &PhaseRequest) -> Result<PhaseProgress, PhaseFailure> {
        let label = command_label(&self.command);
        let args = [
            "-p",
            request.prompt.as_str(),
            "--output-format",
            "stream-json",
            "--verbose",
        ];
        let mut cmd = runtime_command(&self.command, &args, &request.cwd, &self.scrub_env)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|source| PhaseFailure::Spawn {
            command: label.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PhaseFailure::Spawn {
            command: label.clone(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "stdout was not captured"),
        })?;
        info!(backend = "stream", pid = ?child.id(), "Phase subprocess started");

        let mut lines = BufReader::new(stdout).lines();
        let (mut table, current) = self.progress_table(request);
        self.publish(&table, current);

        let started = Instant::now();
        let deadline = self.timeouts.phase_timeout.map(|limit| started + limit);
        let overall =
            sleep_until(deadline.unwrap_or_else(|| started + Duration::from_secs(86_400 * 365)));
        tokio::pin!(overall);

        let mut ticker = interval(self.watchdog_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut events = 0usize;
        let mut last_activity = started;

        let outcome: Result<(), PhaseFailure> = loop {
            tokio::select! {
                _ = &mut overall, if deadline.is_some() => {
                    break Err(PhaseFailure::Timeout {
                        phase: request.phase,
                        after: self.timeouts.phase_timeout.unwrap_or_default(),
                    });
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let Some(event) = StreamEvent::parse_line(&line) else {
                            continue;
                        };
                        events += 1;
                        last_activity = Instant::now();

                        let progress = &mut table[current];
                        progress.apply(&event);
                        progress.elapsed = progress.elapsed.max(started.elapsed());
                        progress.last_update = Some(Utc::now());
                        debug!(kind = %event.kind, action = %progress.current_action, "Stream event");
                        self.publish(&table, current);
                    }
                    Ok(None) => break Ok(()),
                    Err(source) => break Err(PhaseFailure::StreamRead { phase: request.phase, source }),
                },
                _ = ticker.tick() => {
                    if events == 0 {
                        if let Some(window) = self.timeouts.startup_timeout {
                            if started.elapsed() >= window {
                                break Err(PhaseFailure::StartupTimeout { phase: request.phase, after: window });
                            }
                            continue;
                        }
                    }
                    if let Some(window) = self.timeouts.stall_timeout {
                        let idle = last_activity.elapsed();
                        if idle >= window {
                            break Err(PhaseFailure::Stall { phase: request.phase, idle: display_precision(idle) });
                        }
                    }
                }
            }
        };

        if let Err(failure) = outcome {
            warn!(error = %failure, events, "Stream phase failed, killing subprocess");
            let _ = child.kill().await;
            return Err(failure);
        }

        let waited = match deadline {
            Some(at) => match timeout_at(at, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(PhaseFailure::Timeout {
                        phase: request.phase,
                        after: self.timeouts.phase_timeout.unwrap_or_default(),
                    });
                }
            },
            None => child.wait().await,
        };
        let status = waited.map_err(|source| PhaseFailure::Spawn {
            command: label.clone(),
            source,
        })?;

        if !status.success() {
            return Err(PhaseFailure::ExitError {
                command: label,
                code: status.code(),
            });
        }
        if events == 0 {
            return Err(PhaseFailure::EmptyStream {
                phase: request.phase,
            });
        }

        info!(events, "Stream phase completed");
        Ok(table.swap_remove(current))
    }
}

/// Whole seconds above one second, whole milliseconds below
fn display_precision(d: Duration) -> Duration {
    if d >= Duration::from_secs(1) {
        Duration::from_secs(d.as_secs())
    } else {
        Duration::from_millis(d.as_millis() as u64)
    }
}

#[async_trait]
impl PhaseExecutor for StreamBackend {
    fn name(&self) -> &str {
        "stream"
    }

    #[instrument(skip(self, request), fields(run_id = %request.run_id, phase = request.phase))]
    async fn execute(&self, request: &PhaseRequest) -> Result<(), PhaseFailure> {
        let failure = match self.run_stream(request).await {
            Ok(_) => return Ok(()),
            Err(failure) => failure,
        };

        match &self.fallback {
            Some(direct) if failure.warrants_direct_fallback() => {
                warn!(error = %failure, "Streaming failed, retrying phase with direct backend");
                direct
                    .execute(request)
                    .await
                    .map_err(|direct_failure| PhaseFailure::FallbackFailed {
                        stream: Box::new(failure),
                        direct: Box::new(direct_failure),
                    })
            }
            _ => Err(failure),
        }
    }
}

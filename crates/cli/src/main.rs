//! CLI for the Arbiter hierarchical access manager.
//!
//! Pipeline: load script -> apply steps to a manager -> wait for tasks -> report.

mod script;

use arbiter_core::{AccessState, CancelToken, Right, TaskExecutor, TaskExecutorExt, TaskHandle};
use arbiter_manager::sink::{record_access_events, record_state_events, EventSink};
use arbiter_manager::{AccessReport, AccessResult, AccessStateListener, HierarchicalAccessManager};
use arbiter_token::{released, AccessToken, TokioExecutor};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use script::{AcquireMode, Step};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "arbiter", version, about = "Hierarchical access manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a JSON access script against a fresh manager.
    Replay {
        #[arg(env = "ARBITER_SCRIPT")]
        script: PathBuf,

        /// Print the final rights as JSON instead of the report.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Sink output: "ndjson" writes access and state events to stdout,
        /// "ndjson:/path/to/file" writes to file.
        #[arg(long)]
        sink: Option<String>,
    },
}

type BoxError = Box<dyn std::error::Error>;
type DynSink = EventSink<Box<dyn Write + Send>>;

fn open_sink(target: &str) -> Result<DynSink, BoxError> {
    if target == "ndjson" {
        return Ok(EventSink::new(Box::new(std::io::stdout())));
    }
    match target.strip_prefix("ndjson:") {
        Some(path) => Ok(EventSink::new(Box::new(std::fs::File::create(path)?))),
        None => Err(format!("unknown sink: {target}. Use 'ndjson' or 'ndjson:/path'").into()),
    }
}

/// Applies script steps to one manager, keeping the live accesses by id.
struct Replay {
    manager: HierarchicalAccessManager<String>,
    executor: Arc<dyn TaskExecutor>,
    held: HashMap<String, AccessResult<String>>,
    tasks: Vec<(String, TaskHandle)>,
}

impl Replay {
    fn new(executor: Arc<dyn TaskExecutor>, sink: Option<Arc<Mutex<DynSink>>>) -> Self {
        let recorder = sink.map(record_state_events);
        let manager = HierarchicalAccessManager::with_state_listener(move |right: &Right, state: AccessState| {
            tracing::debug!(%right, ?state, "right state changed");
            match &recorder {
                Some(recorder) => recorder.on_enter_state(right, state),
                None => Ok(()),
            }
        });
        Self {
            manager,
            executor,
            held: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    async fn apply(&mut self, step: Step) -> Result<(), BoxError> {
        match step {
            Step::Acquire {
                id,
                mode,
                read,
                write,
            } => {
                let request = script::request(&id, &read, &write);
                let result = match mode {
                    AcquireMode::Try => self.manager.try_get_access(request),
                    AcquireMode::Scheduled => self.manager.get_scheduled_access(request),
                };
                let blocking = result.blocking_ids();
                match (result.token().is_some(), blocking.is_empty()) {
                    (true, true) => tracing::info!(access_id = %id, "granted"),
                    (true, false) => tracing::info!(access_id = %id, ?blocking, "scheduled"),
                    (false, _) => tracing::info!(access_id = %id, ?blocking, "denied"),
                }
                if result.token().is_some() {
                    if let Some(previous) = self.held.insert(id.clone(), result) {
                        tracing::warn!(access_id = %id, "id reused, releasing previous access");
                        previous.release();
                    }
                }
            }
            Step::Release { id } => match self.held.remove(&id) {
                Some(result) => {
                    result.release();
                    tracing::info!(access_id = %id, "release requested");
                }
                None => tracing::warn!(access_id = %id, "release of unknown access"),
            },
            Step::Cancel { id } => {
                let Some(result) = self.held.remove(&id) else {
                    tracing::warn!(access_id = %id, "cancel of unknown access");
                    return Ok(());
                };
                result.release_and_cancel();
                if let Some(token) = result.token() {
                    match tokio::time::timeout(WAIT_TIMEOUT, released(&**token)).await {
                        Ok(()) => tracing::info!(access_id = %id, "cancelled and released"),
                        Err(_) => tracing::warn!(access_id = %id, "still releasing after cancel"),
                    }
                }
            }
            Step::Check { read, write } => {
                let blocking: Vec<String> = self
                    .manager
                    .get_blocking_tokens(&read, &write)
                    .iter()
                    .map(|t| t.access_id().clone())
                    .collect();
                tracing::info!(available = blocking.is_empty(), ?blocking, "check");
            }
            Step::Run { id, millis, wait } => {
                let Some(token) = self.held.get(&id).and_then(|r| r.token()) else {
                    tracing::warn!(access_id = %id, "run under unknown access");
                    return Ok(());
                };
                let executor = token.create_executor(self.executor.clone());
                let handle = executor.submit(CancelToken::uncancelable(), busy_task(id.clone(), millis));
                tracing::debug!(access_id = %id, millis, "task submitted");
                if wait {
                    log_outcome(&id, wait_task(handle).await?);
                } else {
                    self.tasks.push((id, handle));
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), BoxError> {
        for (id, handle) in std::mem::take(&mut self.tasks) {
            log_outcome(&id, wait_task(handle).await?);
        }
        Ok(())
    }
}

/// Sleeps for `millis` in small steps, stopping early when cancelled.
fn busy_task(id: String, millis: u64) -> arbiter_core::Task {
    Box::new(move |cancel| {
        let deadline = Instant::now() + Duration::from_millis(millis);
        while Instant::now() < deadline {
            cancel.check()?;
            std::thread::sleep(Duration::from_millis(millis.min(10)));
        }
        tracing::debug!(access_id = %id, millis, "task body done");
        Ok(())
    })
}

/// `None` when the task did not finish within [`WAIT_TIMEOUT`].
async fn wait_task(handle: TaskHandle) -> Result<Option<arbiter_core::TaskOutcome>, BoxError> {
    let waited = tokio::task::spawn_blocking(move || {
        handle.try_wait(&CancelToken::uncancelable(), WAIT_TIMEOUT)
    })
    .await??;
    Ok(waited.ok())
}

fn log_outcome(id: &str, outcome: Option<arbiter_core::TaskOutcome>) {
    match outcome {
        Some(outcome) if outcome.is_success() => tracing::info!(access_id = %id, "task completed"),
        Some(outcome) if outcome.cancelled => tracing::info!(access_id = %id, "task cancelled"),
        Some(outcome) => tracing::warn!(access_id = %id, error = ?outcome.error, "task failed"),
        None => tracing::warn!(access_id = %id, "task still pending"),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay { script, json, sink } => {
            let t0 = Instant::now();
            let steps = script::load(&script)?;
            tracing::info!(script = %script.display(), steps = steps.len(), "starting replay");

            let sink = match sink.as_deref() {
                Some(target) => Some(Arc::new(Mutex::new(open_sink(target)?))),
                None => None,
            };
            let mut replay = Replay::new(Arc::new(TokioExecutor::current()?), sink.clone());
            let registration = sink
                .as_ref()
                .map(|s| record_access_events(&replay.manager, s.clone()));

            for step in steps {
                replay.apply(step).await?;
            }
            replay.finish().await?;

            tracing::info!(
                held = replay.held.len(),
                elapsed_ms = t0.elapsed().as_millis(),
                "replay complete"
            );

            if let Some(registration) = registration {
                registration.unregister();
            }
            if let Some(sink) = &sink {
                let mut sink = sink.lock();
                sink.flush()?;
                tracing::info!(rows = sink.rows_written(), "ndjson sink: flushed");
            }

            let report = AccessReport::build(&replay.manager);
            if json {
                println!("{}", serde_json::to_string_pretty(&report.rights)?);
            } else if sink.is_some() {
                // Keep stdout clean for the NDJSON stream.
                eprint!("{}", report.render());
            } else {
                print!("{}", report.render());
            }
        }
    }

    Ok(())
}

//! Cron scheduler.
//!
//! Runs only while the local instance is leader (or always, single-node).
//! A single ticker wakes every `eval_interval`; any schedule whose
//! `next_fire` has passed submits a run and advances to the smallest
//! future instant. Missed fires across restarts are not replayed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use conductor_types::config::ScheduleConfig;
use conductor_types::error::{CoreError, CoreResult};
use conductor_types::run::RunSource;
use conductor_types::schedule::ScheduleState;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::loader::WorkflowLoader;
use crate::runner::{Runner, SubmitRequest};

/// Default interval between schedule evaluations.
pub const DEFAULT_EVAL_INTERVAL: Duration = Duration::from_secs(1);

/// Normalize a cron expression to the 6-field (with seconds) form.
///
/// Standard 5-field expressions get `0` prepended for the seconds field;
/// 6-field expressions pass through.
pub fn normalize_cron(expr: &str) -> CoreResult<String> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {trimmed}")),
        6 => Ok(trimmed.to_string()),
        other => Err(CoreError::invalid_input(format!(
            "cron expression must have 5 or 6 fields, got {other}: '{trimmed}'"
        ))),
    }
}

/// Parse a schedule timezone. Only fixed offsets (`+HH:MM` / `-HH:MM`) and
/// "UTC" are evaluated; named zones fall back to UTC with a warning.
fn parse_timezone(tz: Option<&str>) -> Option<FixedOffset> {
    let tz = tz?;
    if tz.eq_ignore_ascii_case("utc") {
        return None;
    }
    match tz.parse::<FixedOffset>() {
        Ok(offset) => Some(offset),
        Err(_) => {
            tracing::warn!(timezone = tz, "unsupported timezone, evaluating in UTC");
            None
        }
    }
}

struct ScheduleEntry {
    config: ScheduleConfig,
    cron: croner::Cron,
    offset: Option<FixedOffset>,
    next_fire: Option<DateTime<Utc>>,
}

fn next_occurrence(
    cron: &croner::Cron,
    after: DateTime<Utc>,
    offset: Option<FixedOffset>,
) -> Option<DateTime<Utc>> {
    match offset {
        Some(offset) => cron
            .iter_after(after.with_timezone(&offset))
            .next()
            .map(|dt| dt.with_timezone(&Utc)),
        None => cron.iter_after(after).next(),
    }
}

/// Leader-gated cron scheduler submitting runs at fire time.
pub struct Scheduler<B: Backend + 'static> {
    runner: Arc<Runner<B>>,
    backend: Arc<B>,
    loader: Arc<WorkflowLoader>,
    eval_interval: Duration,
    entries: Arc<Mutex<Vec<ScheduleEntry>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<B: Backend + 'static> Scheduler<B> {
    /// Build a scheduler from configured schedules. Invalid cron
    /// expressions fail startup.
    pub fn new(
        runner: Arc<Runner<B>>,
        backend: Arc<B>,
        loader: Arc<WorkflowLoader>,
        configs: Vec<ScheduleConfig>,
    ) -> CoreResult<Self> {
        Self::with_interval(runner, backend, loader, configs, DEFAULT_EVAL_INTERVAL)
    }

    pub fn with_interval(
        runner: Arc<Runner<B>>,
        backend: Arc<B>,
        loader: Arc<WorkflowLoader>,
        configs: Vec<ScheduleConfig>,
        eval_interval: Duration,
    ) -> CoreResult<Self> {
        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            let normalized = normalize_cron(&config.cron)?;
            let cron = normalized.parse::<croner::Cron>().map_err(|e| {
                CoreError::invalid_input(format!(
                    "schedule '{}': invalid cron '{}': {e}",
                    config.name, config.cron
                ))
            })?;
            let offset = parse_timezone(config.timezone.as_deref());
            entries.push(ScheduleEntry {
                config,
                cron,
                offset,
                next_fire: None,
            });
        }
        Ok(Self {
            runner,
            backend,
            loader,
            eval_interval,
            entries: Arc::new(Mutex::new(entries)),
            task: Mutex::new(None),
        })
    }

    pub async fn schedule_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Start the evaluation ticker. Fires missed during downtime are
    /// skipped: each schedule starts at its next future instant.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let now = Utc::now();
        {
            let mut entries = self.entries.lock().await;
            for entry in entries.iter_mut() {
                entry.next_fire = next_occurrence(&entry.cron, now, entry.offset);
                tracing::info!(
                    schedule = entry.config.name.as_str(),
                    next_fire = ?entry.next_fire,
                    "schedule armed"
                );
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(evaluation_loop(
            Arc::clone(&self.runner),
            Arc::clone(&self.backend),
            Arc::clone(&self.loader),
            Arc::clone(&self.entries),
            self.eval_interval,
            token.clone(),
        ));
        *task = Some((token, handle));
        tracing::info!("scheduler started");
    }

    /// Halt the ticker; an in-flight evaluation completes first.
    pub async fn stop(&self) {
        let entry = self.task.lock().await.take();
        if let Some((token, handle)) = entry {
            token.cancel();
            let _ = handle.await;
            tracing::info!("scheduler stopped");
        }
    }
}

async fn evaluation_loop<B: Backend + 'static>(
    runner: Arc<Runner<B>>,
    backend: Arc<B>,
    loader: Arc<WorkflowLoader>,
    entries: Arc<Mutex<Vec<ScheduleEntry>>>,
    eval_interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(eval_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Utc::now();
        let mut entries = entries.lock().await;
        for entry in entries.iter_mut() {
            if !entry.config.enabled {
                continue;
            }
            let Some(next) = entry.next_fire else {
                continue;
            };
            if next > now {
                continue;
            }
            fire(&runner, &backend, &loader, &entry.config, now).await;
            entry.next_fire = next_occurrence(&entry.cron, now, entry.offset);
        }
    }
}

async fn fire<B: Backend + 'static>(
    runner: &Runner<B>,
    backend: &B,
    loader: &WorkflowLoader,
    config: &ScheduleConfig,
    now: DateTime<Utc>,
) {
    let submitted = match loader.load(&config.workflow).await {
        Ok(def) => {
            let request = SubmitRequest::definition(
                def,
                RunSource::Schedule {
                    name: config.name.clone(),
                },
            )
            .with_inputs(config.inputs.clone());
            match runner.submit(request).await {
                Ok(run) => {
                    tracing::info!(
                        schedule = config.name.as_str(),
                        run_id = %run.id,
                        "schedule fired"
                    );
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        schedule = config.name.as_str(),
                        error = %e,
                        "scheduled submission failed"
                    );
                    false
                }
            }
        }
        Err(e) => {
            tracing::warn!(
                schedule = config.name.as_str(),
                error = %e,
                "scheduled workflow not loadable"
            );
            false
        }
    };

    let mut state = match backend.get_schedule_state(&config.name).await {
        Ok(state) => state,
        Err(_) => ScheduleState::new(config.name.clone()),
    };
    state.last_fire = Some(now);
    if submitted {
        state.success_count += 1;
    } else {
        state.error_count += 1;
    }
    state.updated_at = now;
    if let Err(e) = backend.save_schedule_state(&state).await {
        tracing::warn!(schedule = config.name.as_str(), error = %e, "schedule state write failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

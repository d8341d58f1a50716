//! Monitoring pipeline - one fetch, parse, classify, decide and dispatch cycle.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::artifacts::{self, ColorSamples, ScrapeStats, StatusRecord};
use crate::classify::{self, ColorMap, Tally};
use crate::config::MonitorConfig;
use crate::dispatch::{DispatchResult, Dispatcher};
use crate::error::{MonitorError, Result};
use crate::state::{RunState, RunStateStore, StateLock};
use crate::threshold::{AlertDecision, ThresholdEvaluator};
use crate::window::WindowPolicy;
use crate::worklist::{FileSource, HttpSource, Modality, PageSource, WorklistParser};

/// Cycle completed, alert or not.
pub const EXIT_OK: i32 = 0;
/// Configuration or startup failure; no cycle ran.
pub const EXIT_STARTUP: i32 = 1;
/// The page could not be fetched or the worklist table was missing.
pub const EXIT_FETCH_PARSE: i32 = 2;

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Bypass the window, threshold and dedup checks.
    pub force_alert: bool,
    /// Send nothing and leave the run state untouched.
    pub dry_run: bool,
}

/// Result of a single cycle.
#[derive(Debug)]
pub struct CycleReport {
    /// What was written to the status artifact.
    pub status: StatusRecord,
    /// `None` when the cycle stopped before evaluation.
    pub decision: Option<AlertDecision>,
    /// Fetch or parse error that ended the cycle early.
    pub fatal: Option<String>,
}

impl CycleReport {
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.fatal.is_some() {
            EXIT_FETCH_PARSE
        } else {
            EXIT_OK
        }
    }
}

/// State access for one cycle.
struct StateSession {
    state: RunState,
    /// Held while the cycle runs; `None` for dry runs or when locking failed.
    lock: Option<StateLock>,
    /// Why the lock could not be taken.
    lock_error: Option<String>,
    /// Saving is allowed: we hold the lock and no unreadable file is in the way.
    writable: bool,
}

/// Worklist monitor.
pub struct Monitor {
    config: MonitorConfig,
    tz: Tz,
    window: WindowPolicy,
    evaluator: ThresholdEvaluator,
    parser: WorklistParser,
    source: Box<dyn PageSource>,
    dispatcher: Dispatcher,
    store: RunStateStore,
}

impl Monitor {
    /// Assemble a monitor from validated configuration and its collaborators.
    pub fn new(
        config: MonitorConfig,
        source: Box<dyn PageSource>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let tz = config
            .tz()
            .map_err(|e| MonitorError::Config(format!("{e:#}")))?;
        let window = WindowPolicy::new(&config.active_windows, tz)?;
        let parser = WorklistParser::new(config.selectors.clone(), tz)?;
        let store = RunStateStore::new(config.paths.state.clone());
        Ok(Self {
            evaluator: ThresholdEvaluator::new(config.threshold),
            config,
            tz,
            window,
            parser,
            source,
            dispatcher,
            store,
        })
    }

    /// Build the production wiring: live HTTP source (or a saved page) and
    /// the configured notification chain.
    pub fn from_config(config: MonitorConfig, html: Option<PathBuf>) -> Result<Self> {
        let tz = config
            .tz()
            .map_err(|e| MonitorError::Config(format!("{e:#}")))?;
        let source: Box<dyn PageSource> = match html {
            Some(path) => Box::new(FileSource::new(path)),
            None => Box::new(HttpSource::new(config.source.clone())?),
        };
        let dispatcher = Dispatcher::from_config(&config, tz)?;
        Self::new(config, source, dispatcher)
    }

    #[must_use]
    pub const fn window(&self) -> &WindowPolicy {
        &self.window
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run one cycle at `now`.
    ///
    /// Classification and the status artifact happen every cycle; alerts only
    /// go out inside the window. Run state is read once here and written at
    /// most once, after dispatch has concluded.
    pub async fn run_cycle(&self, now: DateTime<Utc>, options: RunOptions) -> CycleReport {
        let active = self.window.is_active(&now);
        let mut status = self.new_status(now, active, options);

        tracing::info!(
            run_id = %status.run_id,
            local = %status.last_run_local,
            active,
            "Starting monitoring cycle"
        );

        let mut session = self.open_state(now, options, &mut status);
        status.last_alert_at = session.state.last_alert_at;

        let tally = match self.ingest(now, &session.state, &mut status).await {
            Ok(tally) => tally,
            Err(e) => {
                tracing::error!(error = %e, "Cycle aborted before classification");
                status.push_error(e.to_string());
                self.write_status(&status);
                return CycleReport {
                    status,
                    decision: None,
                    fatal: Some(e.to_string()),
                };
            }
        };

        let learned = session.state.learn_colors(&tally.observed_color_buckets());
        if learned > 0 {
            tracing::debug!(learned, "Updated learned color hints");
        }
        self.write_artifacts(now, &tally, &mut status);

        let decision = self.evaluator.evaluate(&tally.counts, now);
        status.counts = decision.breakdown.clone();
        status.qualifying_total = decision.qualifying_total;
        status.threshold_met = decision.triggered;

        let should_alert = options.force_alert || (active && decision.triggered);
        status.alert_triggered = should_alert;

        let dispatch = if !should_alert {
            let reason = if decision.triggered {
                "outside active window"
            } else {
                "below threshold"
            };
            DispatchResult::skipped(reason)
        } else if options.dry_run {
            DispatchResult::skipped("dry run")
        } else if let Some(lock_error) = &session.lock_error {
            DispatchResult::skipped(format!("run state unavailable: {lock_error}"))
        } else {
            let result = self
                .dispatcher
                .dispatch(&decision, &mut session.state, options.force_alert)
                .await;
            if let Some(error) = result.error() {
                status.push_error(MonitorError::Notification(error).to_string());
            }
            result
        };
        status.dispatch = Some(dispatch);
        status.last_alert_at = session.state.last_alert_at;

        if session.writable {
            if let Err(e) = self.store.save(&session.state) {
                tracing::error!(error = %e, "Failed to save run state");
                status.push_error(e.to_string());
            }
        }
        drop(session.lock.take());

        self.write_status(&status);

        tracing::info!(
            total = decision.qualifying_total,
            threshold = decision.threshold,
            triggered = decision.triggered,
            active,
            errors = status.errors.len(),
            "Cycle complete"
        );

        CycleReport {
            status,
            decision: Some(decision),
            fatal: None,
        }
    }

    fn new_status(&self, now: DateTime<Utc>, active: bool, options: RunOptions) -> StatusRecord {
        StatusRecord {
            run_id: Uuid::new_v4(),
            last_run_local: now
                .with_timezone(&self.tz)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            last_run_utc: now,
            timezone: self.config.timezone.clone(),
            active_window: active,
            window_description: self.window.describe(),
            counts: classify::BucketCounts::default(),
            qualifying_total: 0,
            threshold: self.evaluator.threshold(),
            threshold_met: false,
            alert_triggered: false,
            forced: options.force_alert,
            dry_run: options.dry_run,
            notification_channels: self
                .dispatcher
                .channel_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            dispatch: None,
            last_alert_at: None,
            scrape: ScrapeStats::default(),
            errors: Vec::new(),
            last_error: None,
        }
    }

    fn open_state(
        &self,
        now: DateTime<Utc>,
        options: RunOptions,
        status: &mut StatusRecord,
    ) -> StateSession {
        let (lock, lock_error) = if options.dry_run {
            (None, None)
        } else {
            match self.store.lock() {
                Ok(lock) => (Some(lock), None),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not lock run state");
                    status.push_error(e.to_string());
                    (None, Some(e.to_string()))
                }
            }
        };

        let (state, clean) = match self.store.load() {
            Ok(state) => (state, true),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load run state, continuing with defaults");
                status.push_error(e.to_string());
                // Only the lock holder may move the file; the copy aside keeps
                // it inspectable and lets this cycle's save restore dedup.
                let moved = lock.is_some()
                    && match self.store.quarantine(now) {
                        Ok(_) => true,
                        Err(e) => {
                            status.push_error(e.to_string());
                            false
                        }
                    };
                (RunState::default(), moved)
            }
        };

        StateSession {
            state,
            writable: clean && lock.is_some(),
            lock,
            lock_error,
        }
    }

    /// Fetch, snapshot and parse the page, then classify its records.
    async fn ingest(
        &self,
        now: DateTime<Utc>,
        state: &RunState,
        status: &mut StatusRecord,
    ) -> Result<Tally> {
        let page = self.source.fetch().await?;
        status.scrape.source.clone_from(&page.source);

        if let Err(e) = artifacts::save_page(&self.config.paths.artifacts_dir, &page) {
            tracing::warn!(error = %e, "Failed to save page snapshot");
            status.push_error(format!("artifact: page snapshot: {e}"));
        }

        let parsed = self.parser.parse(&page.html)?;

        let mut color_map = ColorMap::new(&self.config.color_map);
        if self.config.use_learned_colors {
            color_map = color_map.with_hints(&state.color_hints);
        }
        let tally = classify::tally(&parsed.records, now, &color_map);

        let counted = tally
            .studies
            .iter()
            .filter(|s| matches!(s.record.modality, Modality::Ct | Modality::Mr))
            .count();
        let ambiguous = tally.ambiguous();
        if ambiguous > 0 {
            tracing::warn!(ambiguous, "Studies without timestamp or mapped color counted as other");
        }

        status.scrape = ScrapeStats {
            source: page.source,
            rows_seen: parsed.rows_seen,
            rows_skipped: parsed.rows_skipped,
            records: parsed.records.len(),
            counted,
            ambiguous,
            color_mismatches: tally.mismatches(),
            timestamp_errors: parsed.timestamp_errors.len(),
        };
        tracing::info!(
            counted,
            within_60 = tally.counts.within_60,
            within_90 = tally.counts.within_90,
            within_120 = tally.counts.within_120,
            other = tally.counts.other,
            "Classified worklist"
        );
        Ok(tally)
    }

    fn write_artifacts(&self, now: DateTime<Utc>, tally: &Tally, status: &mut StatusRecord) {
        let paths = &self.config.paths;

        if let Err(e) = artifacts::write_counts_csv(&paths.artifacts_dir, tally) {
            tracing::warn!(error = %e, "Failed to write counts CSV");
            status.push_error(format!("artifact: counts csv: {e}"));
        }

        let samples_path = paths.color_samples();
        let result = ColorSamples::load(&samples_path).and_then(|mut samples| {
            samples.merge(tally, now);
            samples.save(&samples_path)
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to update color samples");
            status.push_error(format!("artifact: color samples: {e}"));
        }
    }

    fn write_status(&self, status: &StatusRecord) {
        if let Err(e) = artifacts::write_status(&self.config.paths.status, status) {
            tracing::error!(error = %e, path = %self.config.paths.status.display(), "Failed to write status");
        }
    }
}

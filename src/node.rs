//! Streaming node.
//!
//! [`StreamingNode`] is the public face of the driver. `start()` loads the
//! platform's configuration, opens and configures the device, optionally
//! zeroes it, and spawns the sampling loop; `stop()` ends the loop, persists
//! the device configuration and releases the device.
//!
//! The sampling loop is one tokio task that exclusively owns the
//! [`DeviceHandle`]. On every tick of a fixed-rate `tokio::time::interval` it
//! either reads a sample or, while a tare is in flight, emits a gap record, so
//! every tick yields exactly one [`TaggedSample`]. Status polls, zero requests
//! and operator commands are all served on the same task, which is what keeps
//! reads, tares and status checks from overlapping on the device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::NodeOptions;
use crate::device::DeviceHandle;
use crate::diagnostics::{DiagnosticsMonitor, DiagnosticsState};
use crate::error::{DeviceError, ErrorKind, Result, SessionError, ZeroError};
use crate::hardware::capabilities::{DiagnosticStatus, OpenRequest, PlatformDriver, PlatformReport};
use crate::sample::{ChannelLayout, GapReason, Sample, TaggedSample};
use crate::store::{ConfigStore, DeviceConfig};
use crate::zero::{ZeroController, ZeroOutcome, ZeroRequest, ZeroTrigger};

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// After the first one, output overflows are logged once per this many.
const OVERFLOW_LOG_EVERY: u64 = 100;

/// Out-of-band notifications from a running node.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// The sampling loop is running.
    Started {
        serial: String,
        channels: usize,
        sample_rate: u32,
    },
    /// A tare was acknowledged.
    ZeroCompleted(ZeroOutcome),
    /// A tare timed out or was rejected; the previous offset stays in effect.
    ZeroFailed(ZeroOutcome),
    /// The diagnostics monitor changed state.
    Diagnostics {
        from: DiagnosticsState,
        to: DiagnosticsState,
        tick: u64,
    },
    /// Persisting the device configuration failed.
    PersistenceWarning { serial: String, message: String },
    /// The session ended on a fatal error.
    SessionFault { kind: ErrorKind, message: String },
    /// `stop()` finished.
    Stopped(SessionSummary),
}

/// Outcome of one session, returned by [`StreamingNode::stop`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Platform serial.
    pub serial: String,
    /// Ticks of the cadence, each of which produced one record.
    pub ticks: u64,
    /// Records carrying a sample.
    pub samples: u64,
    /// Records without a sample.
    pub gaps: u64,
    /// Records dropped because the consumer fell behind.
    pub overflows: u64,
    /// Reads that timed out.
    pub missed_reads: u64,
    /// Hardware counter discontinuities.
    pub discontinuities: u64,
    /// Zero episodes, including the automatic one.
    pub zero_episodes: u64,
    /// Zero episodes that failed.
    pub zero_failures: u64,
    /// Faults that stayed within the retry budget.
    pub transient_faults: u64,
    /// Diagnostics state when the loop ended.
    pub diagnostics: DiagnosticsState,
    /// Most recent status check.
    pub last_status: Option<DiagnosticStatus>,
    /// Fatal error that ended the session, if any.
    pub fault: Option<String>,
    /// `true` when teardown was forced after the grace period.
    pub forced: bool,
}

#[derive(Debug)]
struct SessionStats {
    ticks: AtomicU64,
    samples: AtomicU64,
    gaps: AtomicU64,
    overflows: AtomicU64,
    missed_reads: AtomicU64,
    discontinuities: AtomicU64,
    zero_episodes: AtomicU64,
    zero_failures: AtomicU64,
    transient_faults: AtomicU64,
    diagnostics: Mutex<DiagnosticsState>,
    last_status: Mutex<Option<DiagnosticStatus>>,
    fault: Mutex<Option<String>>,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            missed_reads: AtomicU64::new(0),
            discontinuities: AtomicU64::new(0),
            zero_episodes: AtomicU64::new(0),
            zero_failures: AtomicU64::new(0),
            transient_faults: AtomicU64::new(0),
            diagnostics: Mutex::new(DiagnosticsState::Idle),
            last_status: Mutex::new(None),
            fault: Mutex::new(None),
        }
    }

    fn summary(&self, serial: &str, forced: bool) -> SessionSummary {
        SessionSummary {
            serial: serial.to_string(),
            ticks: self.ticks.load(Ordering::SeqCst),
            samples: self.samples.load(Ordering::SeqCst),
            gaps: self.gaps.load(Ordering::SeqCst),
            overflows: self.overflows.load(Ordering::SeqCst),
            missed_reads: self.missed_reads.load(Ordering::SeqCst),
            discontinuities: self.discontinuities.load(Ordering::SeqCst),
            zero_episodes: self.zero_episodes.load(Ordering::SeqCst),
            zero_failures: self.zero_failures.load(Ordering::SeqCst),
            transient_faults: self.transient_faults.load(Ordering::SeqCst),
            diagnostics: *self.diagnostics.lock(),
            last_status: self.last_status.lock().clone(),
            fault: self.fault.lock().clone(),
            forced,
        }
    }
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

enum Command {
    SaveConfig(oneshot::Sender<Result<()>>),
}

struct Session {
    serial: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    commands: mpsc::Sender<Command>,
    stats: Arc<SessionStats>,
    last_known: Arc<Mutex<DeviceConfig>>,
}

/// Acquisition node for one force platform.
///
/// Control methods take `&self`; wrap the node in an `Arc` to call `stop()`
/// from another task.
///
/// # Example
///
/// ```rust,ignore
/// let node = StreamingNode::new(options, Arc::new(SimulatedPlatform::new()), store);
/// let mut samples = node.start().await?;
/// node.zero_trigger().request("operator");
/// while let Some(record) = samples.recv().await { /* ... */ }
/// let summary = node.stop().await?;
/// ```
pub struct StreamingNode {
    options: NodeOptions,
    driver: Arc<dyn PlatformDriver>,
    store: ConfigStore,
    trigger: ZeroTrigger,
    events: broadcast::Sender<NodeEvent>,
    session: AsyncMutex<Option<Session>>,
}

impl StreamingNode {
    /// Node that opens platforms through `driver` and persists configuration in `store`.
    pub fn new(options: NodeOptions, driver: Arc<dyn PlatformDriver>, store: ConfigStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            options,
            driver,
            store,
            trigger: ZeroController::new().trigger(),
            events,
            session: AsyncMutex::new(None),
        }
    }

    /// Session options.
    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    /// Control input for zero requests. Valid across sessions.
    pub fn zero_trigger(&self) -> ZeroTrigger {
        self.trigger.clone()
    }

    /// Subscribe to node events.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Whether a sampling loop is currently running.
    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }

    /// Open, configure and start streaming.
    ///
    /// Returns the output stream; it yields one record per tick until the
    /// session ends.
    ///
    /// # Errors
    /// `InvalidOptions` for bad options, `AlreadyRunning`, `Connection` when
    /// the platform cannot be opened, `ConfigMismatch` when the configuration
    /// does not fit the platform. The device is released on every error path.
    pub async fn start(&self) -> Result<mpsc::Receiver<TaggedSample>> {
        self.options.validate()?;

        let mut guard = self.session.lock().await;
        if let Some(previous) = guard.as_ref() {
            if !previous.task.is_finished() {
                return Err(SessionError::AlreadyRunning);
            }
        }
        if let Some(previous) = guard.take() {
            debug!(serial = %previous.serial, "Discarding finished session that was never stopped");
        }

        let persisted = self
            .options
            .device_serial
            .as_deref()
            .and_then(|serial| self.store.load(serial));

        let request = OpenRequest {
            serial: self.options.device_serial.clone(),
            index: self.options.device_index,
            sample_rate: self.options.sample_rate,
        };
        let mut handle =
            DeviceHandle::open(self.driver.as_ref(), &request, self.options.read_timeout).await?;
        let serial = handle.serial().to_string();
        let stats = Arc::new(SessionStats::new());
        let mut zero = ZeroController::attach(&self.trigger);

        let (config, report) = match self.prepare(&mut handle, persisted, &mut zero, &stats).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(serial = %serial, error = %e, "Session failed to start");
                zero.set_streaming(false);
                handle.close();
                return Err(e);
            }
        };

        handle.mark_streaming();
        let layout = Arc::new(ChannelLayout::new(handle.info(), &config));
        let mut monitor = DiagnosticsMonitor::new(
            self.options.status_policy.clone(),
            self.options.retry_budget,
            config.mask_bits(),
        );
        if let Some((from, to)) = monitor.arm() {
            let _ = self.events.send(NodeEvent::Diagnostics { from, to, tick: 0 });
        }
        *stats.diagnostics.lock() = monitor.state();

        let (tx, rx) = mpsc::channel(self.options.output_capacity);
        let (command_tx, command_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let last_known = Arc::new(Mutex::new(config));

        let sampling = SamplingLoop {
            handle,
            emitter: Emitter {
                tx,
                layout: Arc::clone(&layout),
                report: report.map(Arc::new),
                stats: Arc::clone(&stats),
            },
            zero,
            monitor,
            options: self.options.clone(),
            store: self.store.clone(),
            last_known: Arc::clone(&last_known),
            events: self.events.clone(),
            cancel: cancel.clone(),
            commands: command_rx,
            stats: Arc::clone(&stats),
            ticks: 0,
        };
        let span = info_span!("session", serial = %serial);
        let task = tokio::spawn(sampling.run().instrument(span));

        info!(
            serial = %serial,
            channels = layout.channel_count(),
            rate = self.options.sample_rate,
            "Streaming started"
        );
        let _ = self.events.send(NodeEvent::Started {
            serial: serial.clone(),
            channels: layout.channel_count(),
            sample_rate: self.options.sample_rate,
        });

        *guard = Some(Session {
            serial,
            cancel,
            task,
            commands: command_tx,
            stats,
            last_known,
        });
        Ok(rx)
    }

    /// Configuration, report, automatic zero and flush; everything between
    /// open and the first tick.
    async fn prepare(
        &self,
        handle: &mut DeviceHandle,
        persisted: Option<DeviceConfig>,
        zero: &mut ZeroController,
        stats: &SessionStats,
    ) -> Result<(DeviceConfig, Option<PlatformReport>)> {
        let serial = handle.serial().to_string();
        let channels = handle.channel_count();

        let from_options = || DeviceConfig::from_options(&self.options, &serial, channels);
        let config = match persisted {
            Some(config) => config,
            // Serial only known after open
            None if self.options.device_serial.is_none() => {
                self.store.load_or(&serial, from_options())
            }
            None => from_options(),
        };

        config
            .validate_for(channels)
            .map_err(|message| SessionError::ConfigMismatch {
                serial: serial.clone(),
                message,
            })?;
        match handle.write_config(&config).await {
            Ok(()) => {}
            Err(DeviceError::Rejected { message, .. }) => {
                return Err(SessionError::ConfigMismatch { serial, message })
            }
            Err(e) => return Err(e.into()),
        }

        let report = match handle.report().await {
            Ok(report) => {
                if let Ok(json) = serde_json::to_string_pretty(&report) {
                    info!(serial = %serial, "Platform diagnostics results:\n{}", json);
                }
                Some(report)
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(serial = %serial, error = %e, "Platform report unavailable");
                None
            }
        };

        zero.set_streaming(true);
        if self.options.auto_zero {
            self.auto_zero(handle, zero, stats).await?;
        }

        handle.flush().await?;
        Ok((config, report))
    }

    async fn auto_zero(
        &self,
        handle: &mut DeviceHandle,
        zero: &mut ZeroController,
        stats: &SessionStats,
    ) -> Result<()> {
        zero.begin_direct(ZeroRequest::new("auto"));
        let tare_timeout = self.options.tare_timeout;
        let started = Instant::now();

        let (result, fatal) = match timeout(tare_timeout, handle.tare()).await {
            Ok(Ok(())) => (Ok(()), None),
            Ok(Err(e)) if e.is_fatal() => (Err(ZeroError::Rejected(e.to_string())), Some(e)),
            Ok(Err(e)) => (Err(zero_error(e)), None),
            Err(_) => (Err(ZeroError::Timeout(tare_timeout)), None),
        };
        if let Some(outcome) = zero.finish(result, started.elapsed()) {
            record_zero(stats, &self.events, zero, outcome);
        }
        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Stop streaming, persist the configuration and release the device.
    ///
    /// Waits at most `stop_grace` for the sampling loop. Past that the loop
    /// is aborted (dropping the handle releases the device) and the last
    /// known configuration is persisted instead of a fresh snapshot.
    pub async fn stop(&self) -> Result<SessionSummary> {
        let session = self
            .session
            .lock()
            .await
            .take()
            .ok_or(SessionError::NotRunning)?;
        let Session {
            serial,
            cancel,
            mut task,
            stats,
            last_known,
            ..
        } = session;

        info!(serial = %serial, "Stopping streaming node");
        cancel.cancel();

        let grace = self.options.stop_grace;
        let forced = match timeout(grace, &mut task).await {
            Ok(Ok(())) => false,
            Ok(Err(join)) => {
                error!(serial = %serial, error = %join, "Sampling loop panicked; forcing teardown");
                true
            }
            Err(_) => {
                warn!(
                    serial = %serial,
                    ?grace,
                    "Sampling loop did not stop within grace period; forcing teardown"
                );
                task.abort();
                let _ = timeout(grace, task).await;
                true
            }
        };

        // An aborted loop never reaches its own teardown
        self.trigger.close();
        if forced {
            let config = last_known.lock().clone();
            let _ = persist(&self.store, &serial, &config, &self.events);
        }

        let summary = stats.summary(&serial, forced);
        info!(
            serial = %serial,
            ticks = summary.ticks,
            samples = summary.samples,
            gaps = summary.gaps,
            overflows = summary.overflows,
            zero_episodes = summary.zero_episodes,
            forced,
            "Streaming stopped"
        );
        let _ = self.events.send(NodeEvent::Stopped(summary.clone()));
        Ok(summary)
    }

    /// Persist the device's current configuration now.
    pub async fn save_config(&self) -> Result<()> {
        let commands = {
            let guard = self.session.lock().await;
            guard
                .as_ref()
                .filter(|session| !session.task.is_finished())
                .map(|session| session.commands.clone())
                .ok_or(SessionError::NotRunning)?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::SaveConfig(reply_tx))
            .await
            .map_err(|_| SessionError::NotRunning)?;
        reply_rx.await.map_err(|_| SessionError::NotRunning)?
    }
}

impl Drop for StreamingNode {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut() {
            warn!(serial = %session.serial, "Streaming node dropped while running; cancelling");
            session.cancel.cancel();
        }
    }
}

fn zero_error(err: DeviceError) -> ZeroError {
    match err {
        DeviceError::Rejected { message, .. } => ZeroError::Rejected(message),
        DeviceError::Timeout { timeout, .. } => ZeroError::Timeout(timeout),
        other => ZeroError::Rejected(other.to_string()),
    }
}

fn record_zero(
    stats: &SessionStats,
    events: &broadcast::Sender<NodeEvent>,
    zero: &ZeroController,
    outcome: ZeroOutcome,
) {
    stats.zero_episodes.store(zero.episodes(), Ordering::SeqCst);
    stats.zero_failures.store(zero.failures(), Ordering::SeqCst);
    let event = if outcome.error.is_some() {
        NodeEvent::ZeroFailed(outcome)
    } else {
        NodeEvent::ZeroCompleted(outcome)
    };
    let _ = events.send(event);
}

fn persist(
    store: &ConfigStore,
    serial: &str,
    config: &DeviceConfig,
    events: &broadcast::Sender<NodeEvent>,
) -> Result<()> {
    store.save(serial, config).map_err(|e| {
        warn!(serial, error = %e, "Failed to persist device configuration");
        let _ = events.send(NodeEvent::PersistenceWarning {
            serial: serial.to_string(),
            message: e.to_string(),
        });
        SessionError::from(e)
    })
}

/// Output side of the loop. Kept apart from the handle so a record can be
/// emitted while a tare holds the handle.
struct Emitter {
    tx: mpsc::Sender<TaggedSample>,
    layout: Arc<ChannelLayout>,
    report: Option<Arc<PlatformReport>>,
    stats: Arc<SessionStats>,
}

impl Emitter {
    /// Never waits on the consumer. A record that does not fit in the output
    /// buffer is dropped and counted; the report rides on the next one that
    /// fits. Returns `false` once the consumer is gone.
    fn send(&mut self, mut record: TaggedSample) -> bool {
        if let Some(report) = self.report.take() {
            record.report = Some(report);
        }
        let gap = record.gap;
        match self.tx.try_send(record) {
            Ok(()) => {
                if gap {
                    bump(&self.stats.gaps);
                }
                true
            }
            Err(TrySendError::Full(mut record)) => {
                self.report = record.report.take();
                let dropped = bump(&self.stats.overflows);
                if dropped == 1 || dropped % OVERFLOW_LOG_EVERY == 0 {
                    warn!(
                        tick = record.tick,
                        dropped,
                        "Output consumer is behind; dropping records"
                    );
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn sample(&mut self, tick: u64, sample: Sample) -> bool {
        let record = TaggedSample::with_sample(tick, Arc::clone(&self.layout), sample);
        self.send(record)
    }

    fn gap(&mut self, tick: u64, reason: GapReason) -> bool {
        let record = TaggedSample::gap(tick, Arc::clone(&self.layout), reason);
        self.send(record)
    }
}

struct SamplingLoop {
    handle: DeviceHandle,
    emitter: Emitter,
    zero: ZeroController,
    monitor: DiagnosticsMonitor,
    options: NodeOptions,
    store: ConfigStore,
    last_known: Arc<Mutex<DeviceConfig>>,
    events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
    commands: mpsc::Receiver<Command>,
    stats: Arc<SessionStats>,
    ticks: u64,
}

impl SamplingLoop {
    async fn run(mut self) {
        let period = self.options.tick_period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        debug!(?period, "Sampling loop running");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Stop requested");
                    break Ok(());
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.on_tick(&mut ticker).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Output consumer gone; ending session");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        self.finish(outcome).await;
    }

    fn next_tick(&mut self) -> u64 {
        let tick = self.ticks;
        self.ticks += 1;
        self.stats.ticks.store(self.ticks, Ordering::SeqCst);
        tick
    }

    /// Returns `Ok(false)` when the consumer is gone.
    async fn on_tick(&mut self, ticker: &mut Interval) -> Result<bool> {
        let tick = self.next_tick();

        if self.zero.take_request().is_some() {
            return self.run_zero(tick, ticker).await;
        }

        if tick % self.options.diagnostics_interval == 0 {
            self.poll_status(tick).await?;
        }

        let before = self.monitor.state();
        match self.handle.read().await {
            Ok(sample) => {
                bump(&self.stats.samples);
                self.stats
                    .discontinuities
                    .store(self.handle.discontinuities(), Ordering::SeqCst);
                self.monitor.record_read_ok();
                self.publish_transition(before, tick);
                Ok(self.emitter.sample(tick, sample))
            }
            Err(e) if e.is_fatal() => Err(self.fatal(&e, tick)),
            Err(e) => {
                bump(&self.stats.missed_reads);
                let result = self.monitor.record_read_fault(&e);
                self.publish_transition(before, tick);
                result?;
                Ok(self.emitter.gap(tick, GapReason::MissedRead))
            }
        }
    }

    async fn poll_status(&mut self, tick: u64) -> Result<()> {
        let before = self.monitor.state();
        let budget = self.options.diagnostics_budget;
        let result = match timeout(budget, self.handle.status()).await {
            Ok(Ok(status)) => {
                let result = self.monitor.observe_status(&status);
                *self.stats.last_status.lock() = self.monitor.last_status().cloned();
                result
            }
            Ok(Err(e)) if e.is_fatal() => return Err(self.fatal(&e, tick)),
            Ok(Err(e)) => self.monitor.record_poll_overrun(e.to_string()),
            Err(_) => self
                .monitor
                .record_poll_overrun(format!("status check exceeded {:?} budget", budget)),
        };
        self.publish_transition(before, tick);
        result.map(|_| ())
    }

    /// One zero episode. Emits a gap record for this tick and every tick that
    /// fires while the tare is in flight.
    async fn run_zero(&mut self, tick: u64, ticker: &mut Interval) -> Result<bool> {
        self.zero.begin();
        let started = Instant::now();
        let tare_timeout = self.options.tare_timeout;
        let mut consumer_alive = self.emitter.gap(tick, GapReason::Zeroing);

        // `None` means the tare timed out
        let outcome = {
            let tare = self.handle.tare();
            tokio::pin!(tare);
            let deadline = sleep(tare_timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    result = &mut tare => break Some(result),
                    _ = &mut deadline => break None,
                    _ = ticker.tick() => {
                        let gap_tick = self.ticks;
                        self.ticks += 1;
                        self.stats.ticks.store(self.ticks, Ordering::SeqCst);
                        if consumer_alive {
                            consumer_alive = self.emitter.gap(gap_tick, GapReason::Zeroing);
                        }
                    }
                }
            }
        };

        let (result, fatal) = match outcome {
            Some(Ok(())) => (Ok(()), None),
            Some(Err(e)) if e.is_fatal() => (Err(ZeroError::Rejected(e.to_string())), Some(e)),
            Some(Err(e)) => (Err(zero_error(e)), None),
            None => (Err(ZeroError::Timeout(tare_timeout)), None),
        };
        let succeeded = result.is_ok();
        if let Some(outcome) = self.zero.finish(result, started.elapsed()) {
            record_zero(&self.stats, &self.events, &self.zero, outcome);
        }
        if let Some(e) = fatal {
            return Err(self.fatal(&e, tick));
        }

        if succeeded {
            match self.handle.flush().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(self.fatal(&e, tick)),
                Err(e) => warn!(error = %e, "Flush after tare failed"),
            }
        }
        Ok(consumer_alive)
    }

    fn fatal(&mut self, err: &DeviceError, tick: u64) -> SessionError {
        let before = self.monitor.state();
        let (_, session_error) = self.monitor.record_fatal(err);
        self.publish_transition(before, tick);
        self.handle.mark_faulted();
        session_error
    }

    fn publish_transition(&self, before: DiagnosticsState, tick: u64) {
        self.stats
            .transient_faults
            .store(self.monitor.transient_faults(), Ordering::SeqCst);
        let after = self.monitor.state();
        if before != after {
            *self.stats.diagnostics.lock() = after;
            let _ = self.events.send(NodeEvent::Diagnostics {
                from: before,
                to: after,
                tick,
            });
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SaveConfig(reply) => {
                let serial = self.handle.serial().to_string();
                let config = self.snapshot().await;
                let _ = reply.send(persist(&self.store, &serial, &config, &self.events));
            }
        }
    }

    /// Current device settings, falling back to the last known ones.
    async fn snapshot(&mut self) -> DeviceConfig {
        match self.handle.read_config().await {
            Ok(config) => {
                *self.last_known.lock() = config.clone();
                config
            }
            Err(e) => {
                warn!(error = %e, "Could not read back device configuration; using last known");
                self.last_known.lock().clone()
            }
        }
    }

    /// Teardown: close the mailbox, settle diagnostics, persist, release.
    async fn finish(mut self, outcome: Result<()>) {
        self.zero.set_streaming(false);

        if let Err(e) = &outcome {
            error!(error = %e, kind = %e.kind(), "Session fault; tearing down");
            *self.stats.fault.lock() = Some(e.to_string());
            let _ = self.events.send(NodeEvent::SessionFault {
                kind: e.kind(),
                message: e.to_string(),
            });
        }

        let before = self.monitor.state();
        self.monitor.disarm();
        let last_tick = self.ticks;
        self.publish_transition(before, last_tick);

        let serial = self.handle.serial().to_string();
        let config = self.snapshot().await;
        let _ = persist(&self.store, &serial, &config, &self.events);
        self.handle.close();
        debug!(
            ticks = self.ticks,
            device_samples = self.handle.sample_index(),
            "Sampling loop finished"
        );
    }
}

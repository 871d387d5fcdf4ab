//! Beat-driven dispatch loop.
//!
//! One task owns the beat grid, the tap tracker and the latency estimate. It
//! plans each beat, waits for the compensated dispatch instant and hands the
//! command to a spawned task so that network I/O never stalls the grid.
//! Everything else talks to it through [`ShowHandle`].

use std::{collections::VecDeque, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep_until, timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::{AppConfig, SchedulerConfig, StopAction},
    device::{DeviceAck, DeviceCommand, LightDevice, FLASH_EFFECT},
    latency::{LatencyEstimator, LatencyStats},
    tempo::{TapTempo, TempoRange},
    BeatClock, BeatLightError, Bpm, EffectSpec, Result, Rgb,
};

const EVENT_QUEUE: usize = 64;

/// Externally visible phase of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Scheduled,
    Dispatching,
    Cooldown,
}

/// Inputs accepted by a running show.
#[derive(Debug, Clone)]
pub enum ShowEvent {
    Tap(Instant),
    SetTempo(f64),
    /// Multiplies the current tempo, e.g. `2.0` to double it.
    ScaleTempo(f64),
    SetEffect(EffectSpec),
    StopEffect,
    SetPalette(Vec<Rgb>),
    /// A one-off command sent outside the beat grid.
    Direct(DeviceCommand),
    Shutdown,
}

/// What the show is doing right now. Replaced as a whole, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ShowContext {
    pub bpm: Bpm,
    pub effect: Option<EffectSpec>,
    pub palette: Vec<Rgb>,
}

/// Counters published after every change and returned when the show ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShowStatus {
    pub phase: SchedulerPhase,
    pub last_beat: Option<u64>,
    pub dispatched: u64,
    pub failures: u64,
    pub skipped_beats: u64,
    pub latency: LatencyStats,
    pub compensation: Duration,
}

impl Default for ShowStatus {
    fn default() -> Self {
        Self {
            phase: SchedulerPhase::Idle,
            last_beat: None,
            dispatched: 0,
            failures: 0,
            skipped_beats: 0,
            latency: LatencyStats::default(),
            compensation: Duration::ZERO,
        }
    }
}

/// Cloneable front door to a running show.
#[derive(Debug, Clone)]
pub struct ShowHandle {
    events: mpsc::Sender<ShowEvent>,
    context: watch::Receiver<Arc<ShowContext>>,
    status: watch::Receiver<ShowStatus>,
}

impl ShowHandle {
    pub async fn send(&self, event: ShowEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| BeatLightError::msg("the show has already ended"))
    }

    pub async fn tap(&self) -> Result<()> {
        self.tap_at(Instant::now()).await
    }

    /// Registers a tap captured earlier, e.g. by an input thread.
    pub async fn tap_at(&self, at: Instant) -> Result<()> {
        self.send(ShowEvent::Tap(at)).await
    }

    pub async fn set_tempo(&self, bpm: f64) -> Result<()> {
        self.send(ShowEvent::SetTempo(bpm)).await
    }

    pub async fn scale_tempo(&self, factor: f64) -> Result<()> {
        self.send(ShowEvent::ScaleTempo(factor)).await
    }

    pub async fn set_effect(&self, effect: EffectSpec) -> Result<()> {
        self.send(ShowEvent::SetEffect(effect)).await
    }

    pub async fn stop_effect(&self) -> Result<()> {
        self.send(ShowEvent::StopEffect).await
    }

    pub async fn set_palette(&self, palette: Vec<Rgb>) -> Result<()> {
        self.send(ShowEvent::SetPalette(palette)).await
    }

    pub async fn command(&self, command: DeviceCommand) -> Result<()> {
        self.send(ShowEvent::Direct(command)).await
    }

    /// Single white flash followed by power off.
    pub async fn flash(&self) -> Result<()> {
        self.command(DeviceCommand::Effect {
            name: FLASH_EFFECT.to_string(),
            speed: 1,
        })
        .await?;
        self.command(DeviceCommand::Power { on: false }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ShowEvent::Shutdown).await
    }

    pub fn context(&self) -> Arc<ShowContext> {
        self.context.borrow().clone()
    }

    pub fn status(&self) -> ShowStatus {
        self.status.borrow().clone()
    }

    /// Waits until the context changes, returning the new snapshot.
    pub async fn context_changed(&mut self) -> Result<Arc<ShowContext>> {
        self.context
            .changed()
            .await
            .map_err(|_| BeatLightError::msg("the show has already ended"))?;
        Ok(self.context.borrow_and_update().clone())
    }
}

/// Starts a show on the current tokio runtime.
pub fn spawn_show<D: LightDevice>(
    device: D,
    config: &AppConfig,
) -> Result<(ShowHandle, JoinHandle<ShowStatus>)> {
    let (scheduler, handle) = EffectScheduler::new(device, config)?;
    let task = tokio::spawn(scheduler.run());
    Ok((handle, task))
}

#[derive(Debug, Clone)]
struct PlannedBeat {
    index: u64,
    dispatch_at: Instant,
    command: DeviceCommand,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Scheduled(PlannedBeat),
    Dispatching,
    Cooldown(Instant),
}

impl Phase {
    fn public(&self) -> SchedulerPhase {
        match self {
            Self::Idle => SchedulerPhase::Idle,
            Self::Scheduled(_) => SchedulerPhase::Scheduled,
            Self::Dispatching => SchedulerPhase::Dispatching,
            Self::Cooldown(_) => SchedulerPhase::Cooldown,
        }
    }
}

struct InFlight {
    seq: u64,
    beat: Option<u64>,
    started: Instant,
    task: JoinHandle<()>,
}

struct DispatchOutcome {
    seq: u64,
    beat: Option<u64>,
    result: Result<DeviceAck>,
}

/// Owns the timing loop. Build one with [`EffectScheduler::new`] and drive
/// it with [`EffectScheduler::run`], or use [`spawn_show`].
pub struct EffectScheduler<D> {
    device: Arc<D>,
    settings: SchedulerConfig,
    range: TempoRange,
    clock: BeatClock,
    taps: TapTempo,
    latency: LatencyEstimator,
    context: Arc<ShowContext>,
    context_tx: watch::Sender<Arc<ShowContext>>,
    status: ShowStatus,
    status_tx: watch::Sender<ShowStatus>,
    events: mpsc::Receiver<ShowEvent>,
    outcomes_tx: mpsc::UnboundedSender<DispatchOutcome>,
    outcomes: mpsc::UnboundedReceiver<DispatchOutcome>,
    in_flight: Option<InFlight>,
    /// One-off commands waiting for the device to be free.
    direct: VecDeque<DeviceCommand>,
    phase: Phase,
    next_beat: u64,
    effect_origin: u64,
    last_dispatch: Option<Instant>,
    seq: u64,
}

impl<D: LightDevice> EffectScheduler<D> {
    pub fn new(device: D, config: &AppConfig) -> Result<(Self, ShowHandle)> {
        let bpm = config.tempo.initial_bpm()?;
        if config.palette.is_empty() {
            return Err(BeatLightError::config("palette must contain at least one color"));
        }

        let context = Arc::new(ShowContext {
            bpm,
            effect: None,
            palette: config.palette.clone(),
        });
        let (context_tx, context_rx) = watch::channel(context.clone());
        let (status_tx, status_rx) = watch::channel(ShowStatus::default());
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();

        let scheduler = Self {
            device: Arc::new(device),
            settings: config.scheduler.clone(),
            range: config.tempo.range(),
            clock: BeatClock::new(bpm, Instant::now()),
            taps: TapTempo::new(&config.tempo),
            latency: LatencyEstimator::new(&config.latency),
            context,
            context_tx,
            status: ShowStatus::default(),
            status_tx,
            events,
            outcomes_tx,
            outcomes,
            in_flight: None,
            direct: VecDeque::new(),
            phase: Phase::Idle,
            next_beat: 0,
            effect_origin: 0,
            last_dispatch: None,
            seq: 0,
        };
        let handle = ShowHandle {
            events: events_tx,
            context: context_rx,
            status: status_rx,
        };
        Ok((scheduler, handle))
    }

    /// Runs until [`ShowEvent::Shutdown`] arrives or every handle is dropped.
    pub async fn run(mut self) -> ShowStatus {
        info!(bpm = %self.context.bpm, "show started");
        loop {
            let keep_running = match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Idle => self.idle().await,
                Phase::Scheduled(plan) => self.scheduled(plan).await,
                Phase::Dispatching => self.dispatching().await,
                Phase::Cooldown(until) => self.cooldown(until).await,
            };
            self.publish_status();
            if !keep_running {
                break;
            }
        }

        self.finish().await;
        info!(
            dispatched = self.status.dispatched,
            failures = self.status.failures,
            skipped = self.status.skipped_beats,
            "show ended"
        );
        self.status
    }

    async fn idle(&mut self) -> bool {
        if !self.direct.is_empty() {
            return self.dispatch_direct().await;
        }

        let Some(effect) = self.context.effect.clone() else {
            return tokio::select! {
                event = self.events.recv() => self.handle_event(event).await,
                Some(outcome) = self.outcomes.recv() => {
                    self.observe(outcome);
                    true
                }
            };
        };

        let plan = self.plan_next(&effect);
        let wake_at = plan
            .dispatch_at
            .checked_sub(self.settings.horizon())
            .unwrap_or(plan.dispatch_at);

        if wake_at <= Instant::now() {
            // The effect is locked in for this beat from here on.
            self.next_beat = plan.index + 1;
            self.phase = Phase::Scheduled(plan);
            return true;
        }

        tokio::select! {
            _ = sleep_until(wake_at) => true,
            event = self.events.recv() => self.handle_event(event).await,
            Some(outcome) = self.outcomes.recv() => {
                self.observe(outcome);
                true
            }
        }
    }

    async fn scheduled(&mut self, plan: PlannedBeat) -> bool {
        let dispatch_at = plan.dispatch_at;
        tokio::select! {
            _ = sleep_until(dispatch_at) => {
                debug!(beat = plan.index, command = ?plan.command, "dispatching beat");
                self.dispatch(plan.command, Some(plan.index)).await;
                self.phase = Phase::Dispatching;
                true
            }
            event = self.events.recv() => {
                self.phase = Phase::Scheduled(plan);
                self.handle_event(event).await
            }
            Some(outcome) = self.outcomes.recv() => {
                self.observe(outcome);
                self.phase = Phase::Scheduled(plan);
                true
            }
        }
    }

    async fn dispatching(&mut self) -> bool {
        let Some(flight) = self.in_flight.as_ref() else {
            self.enter_cooldown();
            return true;
        };
        // Past this point the grid moves on; the next dispatch settles the call.
        let give_up_at = flight.started + self.settings.max_in_flight();

        tokio::select! {
            Some(outcome) = self.outcomes.recv() => {
                self.observe(outcome);
                if self.in_flight.is_none() {
                    self.enter_cooldown();
                } else {
                    self.phase = Phase::Dispatching;
                }
                true
            }
            _ = sleep_until(give_up_at) => {
                self.enter_cooldown();
                true
            }
            event = self.events.recv() => {
                self.phase = Phase::Dispatching;
                self.handle_event(event).await
            }
        }
    }

    async fn cooldown(&mut self, until: Instant) -> bool {
        tokio::select! {
            _ = sleep_until(until) => true,
            event = self.events.recv() => {
                self.phase = Phase::Cooldown(until);
                self.handle_event(event).await
            }
            Some(outcome) = self.outcomes.recv() => {
                self.observe(outcome);
                self.phase = Phase::Cooldown(until);
                true
            }
        }
    }

    fn enter_cooldown(&mut self) {
        self.phase = match self.spacing_deadline() {
            Some(until) => Phase::Cooldown(until),
            None => Phase::Idle,
        };
    }

    /// When the next call may leave, if that is still in the future.
    fn spacing_deadline(&self) -> Option<Instant> {
        self.last_dispatch
            .map(|at| at + self.settings.min_spacing())
            .filter(|until| *until > Instant::now())
    }

    async fn dispatch_direct(&mut self) -> bool {
        if let Some(until) = self.spacing_deadline() {
            self.phase = Phase::Cooldown(until);
            return true;
        }
        if let Some(command) = self.direct.pop_front() {
            debug!(?command, "dispatching direct command");
            self.dispatch(command, None).await;
            self.phase = Phase::Dispatching;
        }
        true
    }

    /// Finds the next beat of `effect` that needs a command, skipping beats
    /// the loop can no longer make in time.
    fn plan_next(&mut self, effect: &EffectSpec) -> PlannedBeat {
        let now = Instant::now();
        let offset = self.latency.compensation(self.clock.period());
        self.resync(now, offset);

        let mut index = self.next_beat;
        loop {
            let beat_at = self.clock.beat_instant(index);
            let effect_beat = index.saturating_sub(self.effect_origin);
            if let Some(command) = effect.command_for(effect_beat, &self.context.palette) {
                return PlannedBeat {
                    index,
                    dispatch_at: beat_at.checked_sub(offset).unwrap_or(beat_at),
                    command,
                };
            }
            index += 1;
        }
    }

    fn resync(&mut self, now: Instant, offset: Duration) {
        let dispatch_at = |clock: &BeatClock, index| {
            let at: Instant = clock.beat_instant(index);
            at.checked_sub(offset).unwrap_or(at)
        };
        let threshold = self.settings.resync_threshold();
        if dispatch_at(&self.clock, self.next_beat) + threshold >= now {
            return;
        }

        let mut first = self.clock.first_beat_at_or_after(now + offset);
        first = first.max(self.next_beat);
        let skipped = first - self.next_beat;
        warn!(
            skipped,
            behind_ms = now.duration_since(dispatch_at(&self.clock, self.next_beat)).as_millis() as u64,
            "fell behind the beat, resyncing"
        );
        self.status.skipped_beats += skipped;
        self.next_beat = first;
    }

    /// Index of the next beat that has not been committed to a command.
    fn upcoming_beat(&self) -> u64 {
        let committed = match &self.phase {
            Phase::Scheduled(plan) => plan.index,
            _ => self.next_beat,
        };
        committed.max(self.clock.first_beat_at_or_after(Instant::now()))
    }

    async fn handle_event(&mut self, event: Option<ShowEvent>) -> bool {
        let Some(event) = event else {
            debug!("all show handles dropped");
            return false;
        };

        match event {
            ShowEvent::Shutdown => return false,
            ShowEvent::Tap(at) => match self.taps.tap(at) {
                Ok(Some(bpm)) => self.apply_tempo(bpm, "tap"),
                Ok(None) => debug!(taps = self.taps.len(), "waiting for more taps"),
                Err(err) => warn!(%err, "ignoring tap, keeping current tempo"),
            },
            ShowEvent::SetTempo(value) => match self.range.validate(value) {
                Ok(bpm) => self.apply_tempo(bpm, "manual"),
                Err(err) => warn!(%err, "keeping current tempo"),
            },
            ShowEvent::ScaleTempo(factor) => {
                match self.range.validate(self.context.bpm.value() * factor) {
                    Ok(bpm) => self.apply_tempo(bpm, "scaled"),
                    Err(err) => warn!(%err, "keeping current tempo"),
                }
            }
            ShowEvent::SetEffect(effect) => self.apply_effect(effect),
            ShowEvent::StopEffect => self.stop_effect(),
            ShowEvent::SetPalette(palette) => {
                if palette.is_empty() {
                    warn!("ignoring empty palette");
                } else {
                    info!(colors = palette.len(), "palette updated");
                    self.replace_context(ShowContext {
                        palette,
                        ..(*self.context).clone()
                    });
                }
            }
            ShowEvent::Direct(command) => {
                debug!(?command, queued = self.direct.len(), "queued direct command");
                self.direct.push_back(command);
            }
        }
        true
    }

    fn apply_tempo(&mut self, bpm: Bpm, source: &'static str) {
        let anchor = self.upcoming_beat();
        self.clock.retime(bpm, anchor);
        if self.next_beat < anchor && !matches!(self.phase, Phase::Scheduled(_)) {
            self.next_beat = anchor;
        }
        info!(%bpm, source, from_beat = anchor, "tempo changed");
        self.replace_context(ShowContext {
            bpm,
            ..(*self.context).clone()
        });
    }

    fn apply_effect(&mut self, effect: EffectSpec) {
        if self.context.effect.is_none() {
            // Nothing is playing: start the grid now so the first beat fires
            // immediately.
            self.clock.restart(Instant::now());
            self.next_beat = 0;
            self.effect_origin = 0;
        } else {
            let origin = match &self.phase {
                Phase::Scheduled(plan) => plan.index + 1,
                _ => self.upcoming_beat(),
            };
            self.next_beat = self.next_beat.max(origin);
            self.effect_origin = origin;
        }

        info!(effect = %effect, from_beat = self.effect_origin, "effect selected");
        self.replace_context(ShowContext {
            effect: Some(effect),
            ..(*self.context).clone()
        });
    }

    fn stop_effect(&mut self) {
        if let Phase::Scheduled(plan) = &self.phase {
            debug!(beat = plan.index, "cancelled scheduled dispatch");
            self.phase = Phase::Idle;
        }
        if self.context.effect.is_some() {
            info!("effect stopped");
            self.replace_context(ShowContext {
                effect: None,
                ..(*self.context).clone()
            });
        }
        if let Some(command) = self.stop_command() {
            self.direct.push_back(command);
        }
    }

    fn stop_command(&self) -> Option<DeviceCommand> {
        match self.settings.on_stop {
            StopAction::PowerOff => Some(DeviceCommand::Power { on: false }),
            StopAction::Hold => None,
        }
    }

    fn replace_context(&mut self, context: ShowContext) {
        self.context = Arc::new(context);
        self.context_tx.send_replace(self.context.clone());
    }

    /// Hands `command` to a background task. At most one call is in flight;
    /// a previous one gets a bounded grace period before it is abandoned.
    async fn dispatch(&mut self, command: DeviceCommand, beat: Option<u64>) {
        self.settle_in_flight().await;

        self.seq += 1;
        let seq = self.seq;
        let device = Arc::clone(&self.device);
        let outcomes = self.outcomes_tx.clone();
        let task = tokio::spawn(async move {
            let result = device.send(&command).await;
            let _ = outcomes.send(DispatchOutcome { seq, beat, result });
        });

        let now = Instant::now();
        self.in_flight = Some(InFlight {
            seq,
            beat,
            started: now,
            task,
        });
        self.last_dispatch = Some(now);
        if beat.is_some() {
            self.status.last_beat = beat;
        }
    }

    async fn settle_in_flight(&mut self) {
        let Some(deadline) = self
            .in_flight
            .as_ref()
            .map(|flight| flight.started + self.settings.max_in_flight())
        else {
            return;
        };

        while self.in_flight.is_some() {
            match timeout_at(deadline, self.outcomes.recv()).await {
                Ok(Some(outcome)) => self.observe(outcome),
                Ok(None) => break,
                Err(_) => {
                    if let Some(stale) = self.in_flight.take() {
                        stale.task.abort();
                        warn!(beat = ?stale.beat, "device call exceeded the in-flight limit, abandoning it");
                        self.latency.record_failure();
                        self.status.failures += 1;
                    }
                }
            }
        }
    }

    fn observe(&mut self, outcome: DispatchOutcome) {
        if self.in_flight.as_ref().map(|flight| flight.seq) != Some(outcome.seq) {
            debug!(seq = outcome.seq, "dropping outcome of an abandoned call");
            return;
        }
        self.in_flight = None;

        match outcome.result {
            Ok(ack) => {
                self.latency.record(ack.elapsed);
                self.status.dispatched += 1;
                debug!(beat = ?outcome.beat, elapsed_ms = ack.elapsed.as_millis() as u64, "device acknowledged");
            }
            Err(err) => {
                self.latency.record_failure();
                self.status.failures += 1;
                warn!(beat = ?outcome.beat, %err, "device command failed, continuing with the next beat");
            }
        }
    }

    fn publish_status(&mut self) {
        self.status.phase = self.phase.public();
        self.status.latency = self.latency.stats();
        self.status.compensation = self.latency.compensation(self.clock.period());
        self.status_tx.send_replace(self.status.clone());
    }

    /// Cancels whatever is pending and leaves the device in its stop state.
    async fn finish(&mut self) {
        self.phase = Phase::Idle;
        self.settle_in_flight().await;
        if !self.direct.is_empty() {
            debug!(dropped = self.direct.len(), "discarding queued direct commands");
            self.direct.clear();
        }

        if let Some(command) = self.stop_command() {
            if let Some(until) = self.spacing_deadline() {
                sleep_until(until).await;
            }
            let limit = self.settings.max_in_flight();
            match timeout(limit, self.device.send(&command)).await {
                Ok(Ok(ack)) => {
                    self.latency.record(ack.elapsed);
                    self.status.dispatched += 1;
                }
                Ok(Err(err)) => {
                    self.status.failures += 1;
                    warn!(%err, "could not apply the stop state");
                }
                Err(_) => {
                    self.status.failures += 1;
                    warn!("device did not confirm the stop state in time");
                }
            }
        }
        self.publish_status();
    }
}

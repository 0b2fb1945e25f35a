use std::{
    sync::{Arc, TryLockError},
    time::Duration,
};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use tokio::{
    sync::{watch, Mutex, Notify},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use thermolink_common::{
    thermostat::{build_telemetry, snapshot},
    evaluate_cycle, CommandError, Configuration, ConnectionState, RemoteCommand, Schedule,
    SendOutcome, SensorReading, TelemetryMessage,
};

use crate::{
    hardware::{Heater, OutputPin, SharedSensor},
    history::{History, Predictor},
    store::{ConfigStore, StoreError},
    uplink::{transport::CommandHandler, UplinkManager},
};

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall-clock time in `timezone`, falling back to UTC for unknown zone names.
pub fn local_time(now: DateTime<Utc>, timezone: &str) -> DateTime<FixedOffset> {
    match timezone.parse::<Tz>() {
        Ok(tz) => {
            let local = now.with_timezone(&tz);
            local.with_timezone(&local.offset().fix())
        }
        Err(_) => now.fixed_offset(),
    }
}

/// Everything both schedulers touch, behind one lock.
struct ControlState {
    config: Configuration,
    last_reading: SensorReading,
    heater_on: bool,
}

/// What a command handler needs to build its reply, captured under the same
/// lock as the mutation.
pub struct CommandOutcome {
    pub telemetry: TelemetryMessage,
    pub program: Schedule,
}

/// The single accessor for the working configuration. The control loop and
/// every command handler go through it; lock spans cover read-modify-persist
/// and never network I/O.
#[derive(Clone)]
pub struct ControlHandle {
    state: Arc<Mutex<ControlState>>,
    store: ConfigStore,
    clock: Arc<dyn Clock>,
    cycle_requested: Arc<Notify>,
}

impl ControlHandle {
    pub fn new(config: Configuration, store: ConfigStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState {
                config,
                last_reading: SensorReading::absent(),
                heater_on: false,
            })),
            store,
            clock,
            cycle_requested: Arc::new(Notify::new()),
        }
    }

    pub fn now(&self, timezone: &str) -> DateTime<FixedOffset> {
        local_time(self.clock.now_utc(), timezone)
    }

    pub fn epoch_now(&self) -> i64 {
        self.clock.now_utc().timestamp()
    }

    pub async fn config(&self) -> Configuration {
        self.state.lock().await.config.clone()
    }

    /// Applies a remote command and captures the post-mutation status without
    /// reading the sensor or touching the heater. Mutations are persisted and
    /// trigger an extra control cycle.
    pub async fn execute(&self, command: &RemoteCommand) -> Result<CommandOutcome, CommandError> {
        let outcome = {
            let mut state = self.state.lock().await;
            let now = self.now(&state.config.timezone);
            command.apply(&mut state.config, now)?;

            if command.is_mutating() {
                if let Err(err) = self.store.save(&state.config).await {
                    error!("failed to persist configuration after {}: {err}", command.name());
                }
            }

            CommandOutcome {
                telemetry: snapshot(&state.config, &state.last_reading, state.heater_on, now),
                program: state.config.schedule.clone(),
            }
        };

        if command.is_mutating() {
            self.request_cycle();
        }
        Ok(outcome)
    }

    pub async fn persist(&self) -> Result<(), StoreError> {
        let state = self.state.lock().await;
        self.store.save(&state.config).await
    }

    pub fn request_cycle(&self) {
        self.cycle_requested.notify_one();
    }
}

/// Bounded retry schedule for sensor reads.
#[derive(Debug, Clone, Copy)]
pub struct SensorRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
    pub reset_pulse: Duration,
}

impl Default for SensorRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff: Duration::from_secs(2),
            backoff_step: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            reset_pulse: Duration::from_millis(250),
        }
    }
}

impl SensorRetryPolicy {
    /// Wait after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let grown = self.initial_backoff + self.backoff_step * attempt.saturating_sub(1);
        grown.min(self.max_backoff)
    }
}

pub struct Devices {
    pub sensor: SharedSensor,
    pub heater: Heater,
    pub sensor_reset: Box<dyn OutputPin>,
}

pub struct Collaborators {
    pub history: Arc<dyn History>,
    pub predictor: Box<dyn Predictor>,
}

pub struct ControlLoop {
    handle: ControlHandle,
    devices: Devices,
    uplink: UplinkManager,
    commands: Arc<dyn CommandHandler>,
    collaborators: Collaborators,
    retry: SensorRetryPolicy,
}

impl ControlLoop {
    pub fn new(
        handle: ControlHandle,
        devices: Devices,
        uplink: UplinkManager,
        commands: Arc<dyn CommandHandler>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            handle,
            devices,
            uplink,
            commands,
            collaborators,
            retry: SensorRetryPolicy::default(),
        }
    }

    /// Runs a cycle on every tick and on every requested extra cycle until
    /// `shutdown` flips. Cycles never overlap.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = {
            let state = self.handle.state.lock().await;
            Duration::from_secs(state.config.poll_interval_seconds)
        };
        info!(poll_secs = poll_interval.as_secs(), "control loop started");

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cycle_requested = self.handle.cycle_requested.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cycle_requested.notified() => debug!("extra cycle requested"),
                _ = shutdown.changed() => break,
            }
            self.tick().await;
        }

        self.force_heater_off().await;
        info!("control loop stopped");
    }

    /// One time-boxed cycle followed by recording and upload of its telemetry.
    /// Returns the message produced, if the cycle finished in time.
    pub async fn tick(&mut self) -> Option<TelemetryMessage> {
        let started = Instant::now();
        let budget = {
            let state = self.handle.state.lock().await;
            Duration::from_secs(state.config.operation_deadline_seconds())
        };

        // Sensor retries stop early enough to leave room for the rest of the cycle.
        let sensor_deadline = started + budget.saturating_sub(budget / 5);
        let message = match tokio::time::timeout(budget, self.cycle(sensor_deadline)).await {
            Ok(message) => message,
            Err(_) => {
                error!(budget_secs = budget.as_secs(), "control cycle overran, forcing heater off");
                self.force_heater_off().await;
                return None;
            }
        };

        if message.temperature.is_some() {
            if let Err(err) = self.collaborators.history.append(&message).await {
                warn!("history append failed: {err}");
            }
        }

        self.publish(message.clone(), budget.saturating_sub(started.elapsed()))
            .await;
        Some(message)
    }

    async fn cycle(&mut self, sensor_deadline: Instant) -> TelemetryMessage {
        let reading = self.read_sensor(sensor_deadline).await;

        let mut state = self.handle.state.lock().await;
        let now = self.handle.now(&state.config.timezone);
        let temperature = reading.valid_temperature();

        let heater_was_on = state.heater_on;
        let evaluation = evaluate_cycle(&mut state.config, temperature, heater_was_on, now);
        if evaluation.override_cleared {
            info!("override expired, returning to schedule");
        }

        if let Err(err) = self.devices.heater.set(evaluation.heater_on) {
            error!("heater relay write failed: {err}");
        }
        state.heater_on = self.devices.heater.is_on();
        if !state.heater_on {
            state.config.heater_on_since = None;
        }
        state.last_reading = reading;

        if let Some(temperature) = temperature {
            self.collaborators.predictor.observe(now, temperature);
        }
        let predicted = self.collaborators.predictor.predict(now);

        let message = build_telemetry(
            &state.config,
            &reading,
            evaluation.setpoint,
            state.heater_on,
            evaluation.heater_on_seconds,
            predicted,
            now,
        );

        if let Err(err) = self.handle.store.save(&state.config).await {
            error!("failed to persist configuration: {err}");
        }

        info!(
            temperature = ?temperature,
            setpoint = %evaluation.setpoint,
            source = ?evaluation.source,
            heater_on = state.heater_on,
            "cycle complete"
        );
        message
    }

    /// Reads with bounded retries. Gives up after `max_attempts` or when the
    /// next wait plus the reset pulse would run past `deadline`.
    async fn read_sensor(&mut self, deadline: Instant) -> SensorReading {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            let reading = read_once(self.devices.sensor.clone()).await;
            if reading.valid {
                return reading;
            }

            warn!(attempt = attempts, max_attempts, "invalid sensor reading");
            if attempts == max_attempts {
                break;
            }
            let delay = self.retry.delay_after(attempts);
            if Instant::now() + delay + self.retry.reset_pulse * 2 > deadline {
                warn!(attempts, "cycle budget exhausted, giving up on sensor retries");
                break;
            }
            tokio::time::sleep(delay).await;
        }

        error!(attempts, "sensor fault, pulsing reset line");
        self.pulse_sensor_reset().await;
        SensorReading::absent()
    }

    async fn pulse_sensor_reset(&mut self) {
        let pulse = self.retry.reset_pulse;
        let pin = &mut self.devices.sensor_reset;
        let result = async {
            pin.turn_off()?;
            tokio::time::sleep(pulse).await;
            pin.turn_on()?;
            tokio::time::sleep(pulse).await;
            pin.turn_off()
        }
        .await;
        if let Err(err) = result {
            warn!("sensor reset pulse failed: {err}");
        }
    }

    /// Fail-safe state: heater off and the sensor reset line released.
    async fn force_heater_off(&mut self) {
        let mut state = self.handle.state.lock().await;
        if let Err(err) = self.devices.heater.set(false) {
            error!("heater relay write failed while forcing off: {err}");
        }
        if let Err(err) = self.devices.sensor_reset.turn_off() {
            warn!("failed to release sensor reset line: {err}");
        }
        state.heater_on = self.devices.heater.is_on();
        state.config.heater_on_since = None;
        if let Err(err) = self.handle.store.save(&state.config).await {
            error!("failed to persist configuration: {err}");
        }
    }

    async fn publish(&mut self, message: TelemetryMessage, deadline: Duration) {
        if self.uplink.state().await == ConnectionState::Disconnected {
            info!("uplink disconnected, re-initializing");
            self.uplink.initialize(self.commands.clone()).await;
        }

        let outcome = self
            .uplink
            .send_telemetry(message, deadline.max(Duration::from_secs(1)))
            .await;
        match outcome {
            SendOutcome::Sent => debug!("telemetry sent"),
            SendOutcome::Queued | SendOutcome::Cancelled => {
                let queued = self.uplink.queued().await;
                info!(?outcome, queued, "telemetry held for later delivery");
            }
        }
    }
}

async fn read_once(sensor: SharedSensor) -> SensorReading {
    let read = tokio::task::spawn_blocking(move || match sensor.try_lock() {
        Ok(mut driver) => driver.read(),
        Err(TryLockError::Poisoned(poisoned)) => {
            warn!("sensor driver panicked during an earlier read, recovering");
            let mut driver = poisoned.into_inner();
            sensor.clear_poison();
            driver.read()
        }
        // A previous read is still stuck in the driver.
        Err(TryLockError::WouldBlock) => SensorReading::absent(),
    });

    match read.await {
        Ok(reading) => reading,
        Err(err) => {
            warn!("sensor read task failed: {err}");
            SensorReading::absent()
        }
    }
}

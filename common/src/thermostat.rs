use chrono::{DateTime, FixedOffset};

use crate::{
    config::Configuration,
    types::{SensorReading, TelemetryMessage, Temperature},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointSource {
    Override,
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub setpoint: Temperature,
    pub source: SetpointSource,
    /// The stored override can never apply again and should be cleared by
    /// the caller.
    pub override_stale: bool,
}

/// Target temperature for `now`. Pure: a stale override is reported, never
/// cleared here.
pub fn resolve_setpoint(config: &Configuration, now: DateTime<FixedOffset>) -> Resolution {
    let now_epoch = now.timestamp();

    let (override_setpoint, override_stale) = match (config.override_until, config.override_setpoint) {
        (Some(until), Some(setpoint)) if until > now_epoch => (Some(setpoint), false),
        // Expiry without a setpoint is tolerated until it passes.
        (Some(until), None) => (None, until <= now_epoch),
        (Some(_), Some(_)) => (None, true),
        (None, Some(_)) => (None, true),
        (None, None) => (None, false),
    };

    let (setpoint, source) = match override_setpoint {
        Some(setpoint) => (setpoint, SetpointSource::Override),
        None => (config.schedule.setpoint_at(now), SetpointSource::Schedule),
    };

    Resolution {
        setpoint: setpoint.max(config.no_frost_setpoint),
        source,
        override_stale,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterDecision {
    TurnOn,
    TurnOff,
    Keep,
}

/// Deadband decision. An unreadable sensor always means off.
pub fn heater_decision(
    temperature: Option<Temperature>,
    setpoint: Temperature,
    threshold: Temperature,
) -> HeaterDecision {
    let Some(temperature) = temperature else {
        return HeaterDecision::TurnOff;
    };

    let diff = temperature - setpoint;
    if diff < -threshold {
        HeaterDecision::TurnOn
    } else if diff > threshold {
        HeaterDecision::TurnOff
    } else {
        HeaterDecision::Keep
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleEvaluation {
    pub setpoint: Temperature,
    pub source: SetpointSource,
    pub heater_on: bool,
    pub heater_on_seconds: i64,
    pub override_cleared: bool,
}

/// Applies one control step to `config`: clears a stale override, decides the
/// heater state and maintains `heater_on_since`.
pub fn evaluate_cycle(
    config: &mut Configuration,
    temperature: Option<Temperature>,
    heater_was_on: bool,
    now: DateTime<FixedOffset>,
) -> CycleEvaluation {
    let resolution = resolve_setpoint(config, now);
    if resolution.override_stale {
        config.clear_override();
    }

    let heater_on = match heater_decision(temperature, resolution.setpoint, config.hysteresis_threshold) {
        HeaterDecision::TurnOn => true,
        HeaterDecision::TurnOff => false,
        HeaterDecision::Keep => heater_was_on,
    };

    let now_epoch = now.timestamp();
    if heater_on && config.heater_on_since.is_none() {
        config.heater_on_since = Some(now_epoch);
    }

    let heater_on_seconds = config
        .heater_on_since
        .map(|since| now_epoch.saturating_sub(since).max(0))
        .unwrap_or(0);

    if !heater_on {
        config.heater_on_since = None;
    }

    CycleEvaluation {
        setpoint: resolution.setpoint,
        source: resolution.source,
        heater_on,
        heater_on_seconds,
        override_cleared: resolution.override_stale,
    }
}

/// Absolute expiry of the override currently in force, if any.
pub fn active_override_end(config: &Configuration, now: DateTime<FixedOffset>) -> Option<i64> {
    match (config.override_setpoint, config.override_until) {
        (Some(_), Some(until)) if until > now.timestamp() => Some(until),
        _ => None,
    }
}

/// Builds the status message for a state that has already been evaluated.
pub fn build_telemetry(
    config: &Configuration,
    reading: &SensorReading,
    setpoint: Temperature,
    heater_on: bool,
    heater_on_seconds: i64,
    predicted_temperature: Option<Temperature>,
    now: DateTime<FixedOffset>,
) -> TelemetryMessage {
    let override_end_epoch = active_override_end(config, now);
    let override_remaining_seconds = override_end_epoch
        .map(|end| end.saturating_sub(now.timestamp()).max(0))
        .unwrap_or(0);

    TelemetryMessage {
        timestamp: now,
        temperature: reading.valid_temperature(),
        humidity: reading.valid_humidity(),
        current_setpoint: setpoint,
        is_heater_on: heater_on,
        heater_on_seconds,
        override_end_epoch,
        override_remaining_seconds,
        predicted_temperature,
        test_device: config.is_test_device,
    }
}

/// Status as it stands right now, without touching the heater, the sensor or
/// the stored document.
pub fn snapshot(
    config: &Configuration,
    last_reading: &SensorReading,
    heater_on: bool,
    now: DateTime<FixedOffset>,
) -> TelemetryMessage {
    let resolution = resolve_setpoint(config, now);
    let heater_on_seconds = match config.heater_on_since {
        Some(since) if heater_on => now.timestamp().saturating_sub(since).max(0),
        _ => 0,
    };
    build_telemetry(
        config,
        last_reading,
        resolution.setpoint,
        heater_on,
        heater_on_seconds,
        None,
        now,
    )
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schedule::Schedule;

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        // Jan 5, 2026 is a Monday.
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 5, hour, minute, 0)
            .unwrap()
    }

    fn deg(centi: i32) -> Temperature {
        Temperature::from_centi(centi)
    }

    fn flat_config(setpoint: Temperature, threshold: Temperature) -> Configuration {
        Configuration {
            schedule: Schedule::uniform(setpoint),
            hysteresis_threshold: threshold,
            ..Configuration::default()
        }
    }

    #[test]
    fn override_applies_until_expiry_then_schedule() {
        let now = at(10, 0);
        let mut config = Configuration::default();
        config.override_setpoint = Some(Temperature::from_degrees(15));
        config.override_until = Some((now + Duration::hours(1)).timestamp());

        let before = resolve_setpoint(&config, now + Duration::minutes(59));
        assert_eq!(before.setpoint, Temperature::from_degrees(15));
        assert_eq!(before.source, SetpointSource::Override);
        assert!(!before.override_stale);

        let after = resolve_setpoint(&config, now + Duration::hours(1));
        assert_eq!(after.setpoint, Temperature::from_degrees(20));
        assert_eq!(after.source, SetpointSource::Schedule);
        assert!(after.override_stale);

        // The resolver never mutates; the cycle does.
        assert!(config.override_until.is_some());
        let evaluation = evaluate_cycle(&mut config, Some(deg(2000)), false, now + Duration::hours(1));
        assert!(evaluation.override_cleared);
        assert_eq!(config.override_setpoint, None);
        assert_eq!(config.override_until, None);
    }

    #[test]
    fn expiry_without_setpoint_is_tolerated() {
        let now = at(6, 0);
        let mut config = Configuration::default();
        config.override_until = Some((now + Duration::hours(1)).timestamp());

        let resolution = resolve_setpoint(&config, now);
        assert_eq!(resolution.setpoint, Temperature::from_degrees(18));
        assert!(!resolution.override_stale);
    }

    #[test]
    fn setpoint_without_expiry_is_stale() {
        let mut config = Configuration::default();
        config.override_setpoint = Some(Temperature::from_degrees(25));

        let resolution = resolve_setpoint(&config, at(12, 0));
        assert_eq!(resolution.setpoint, Temperature::from_degrees(20));
        assert!(resolution.override_stale);
    }

    #[test]
    fn frost_floor_applies_to_every_source() {
        let mut config = flat_config(Temperature::from_degrees(2), deg(20));
        config.no_frost_setpoint = Temperature::from_degrees(5);
        assert_eq!(
            resolve_setpoint(&config, at(3, 0)).setpoint,
            Temperature::from_degrees(5)
        );
    }

    #[test]
    fn deadband_never_changes_state() {
        let setpoint = Temperature::from_degrees(20);
        let threshold = deg(20);
        for initial in [true, false] {
            let mut config = flat_config(setpoint, threshold);
            let mut heater_on = initial;
            for temp in [1980, 2020, 1990, 2000, 2010, 1985, 2015] {
                heater_on = evaluate_cycle(&mut config, Some(deg(temp)), heater_on, at(12, 0)).heater_on;
                assert_eq!(heater_on, initial, "temperature {temp}");
            }
        }
    }

    #[test]
    fn crossing_the_band_switches() {
        assert_eq!(
            heater_decision(Some(deg(1979)), deg(2000), deg(20)),
            HeaterDecision::TurnOn
        );
        assert_eq!(
            heater_decision(Some(deg(2021)), deg(2000), deg(20)),
            HeaterDecision::TurnOff
        );
        assert_eq!(
            heater_decision(Some(deg(1980)), deg(2000), deg(20)),
            HeaterDecision::Keep
        );
    }

    #[test]
    fn missing_temperature_forces_off() {
        let mut config = flat_config(Temperature::from_degrees(20), deg(20));
        config.heater_on_since = Some(at(11, 0).timestamp());

        let evaluation = evaluate_cycle(&mut config, None, true, at(12, 0));
        assert!(!evaluation.heater_on);
        assert_eq!(config.heater_on_since, None);
    }

    #[test]
    fn heating_run_is_timed_across_cycles() {
        let mut config = flat_config(Temperature::from_degrees(20), deg(20));
        let start = at(12, 0);

        let first = evaluate_cycle(&mut config, Some(deg(1950)), false, start);
        assert!(first.heater_on);
        assert_eq!(first.heater_on_seconds, 0);
        assert_eq!(config.heater_on_since, Some(start.timestamp()));

        let second = evaluate_cycle(&mut config, Some(deg(1990)), true, start + Duration::seconds(300));
        assert!(second.heater_on);
        assert_eq!(second.heater_on_seconds, 300);
        assert_eq!(config.heater_on_since, Some(start.timestamp()));

        let third = evaluate_cycle(&mut config, Some(deg(2030)), true, start + Duration::seconds(600));
        assert!(!third.heater_on);
        assert_eq!(third.heater_on_seconds, 600);
        assert_eq!(config.heater_on_since, None);
    }

    #[test]
    fn telemetry_reports_override_remaining() {
        let now = at(9, 0);
        let mut config = Configuration::default();
        config.override_setpoint = Some(Temperature::from_degrees(22));
        config.override_until = Some(now.timestamp() + 5_400);
        config.is_test_device = true;

        let reading = SensorReading::new(Some(deg(2100)), Some(48.5), true);
        let message = snapshot(&config, &reading, true, now);

        assert_eq!(message.current_setpoint, Temperature::from_degrees(22));
        assert_eq!(message.override_end_epoch, Some(now.timestamp() + 5_400));
        assert_eq!(message.override_remaining_seconds, 5_400);
        assert_eq!(message.temperature, Some(deg(2100)));
        assert!(message.test_device);
    }

    #[test]
    fn snapshot_leaves_document_untouched() {
        let now = at(9, 0);
        let mut config = Configuration::default();
        config.override_setpoint = Some(Temperature::from_degrees(22));
        config.override_until = Some(now.timestamp() - 10);
        let before = config.clone();

        let message = snapshot(&config, &SensorReading::absent(), false, now);
        assert_eq!(message.current_setpoint, Temperature::from_degrees(20));
        assert_eq!(message.override_end_epoch, None);
        assert_eq!(config, before);
    }
}

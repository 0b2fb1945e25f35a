use std::{collections::VecDeque, io, path::PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use thermolink_common::{TelemetryMessage, Temperature};

const HISTORY_FILE: &str = "history.jsonl";
const ROTATED_SUFFIX: &str = ".1";
const DEFAULT_MAX_BYTES: u64 = 4 * 1024 * 1024;

/// Long-term record of telemetry, one entry per cycle with a reading.
#[async_trait]
pub trait History: Send + Sync {
    async fn append(&self, message: &TelemetryMessage) -> io::Result<()>;
}

/// Appends each message as one JSON line. Once the file would exceed
/// `max_bytes` it is moved to `history.jsonl.1`, replacing the previous
/// generation, so at most two files are kept.
pub struct JsonlHistory {
    path: PathBuf,
    max_bytes: u64,
}

impl JsonlHistory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join(HISTORY_FILE),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn rotated_path(&self) -> PathBuf {
        let mut rotated = self.path.as_os_str().to_owned();
        rotated.push(ROTATED_SUFFIX);
        PathBuf::from(rotated)
    }

    async fn rotate_if_full(&self, incoming: u64) -> io::Result<()> {
        let current = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if current == 0 || current + incoming <= self.max_bytes {
            return Ok(());
        }
        tokio::fs::rename(&self.path, self.rotated_path()).await?;
        debug!(bytes = current, "rotated history file");
        Ok(())
    }
}

#[async_trait]
impl History for JsonlHistory {
    async fn append(&self, message: &TelemetryMessage) -> io::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.rotate_if_full(line.len() as u64).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

pub trait Predictor: Send {
    fn observe(&mut self, at: DateTime<FixedOffset>, temperature: Temperature);

    /// `None` until enough samples have been seen.
    fn predict(&self, at: DateTime<FixedOffset>) -> Option<Temperature>;
}

/// Least-squares line through the recent samples, extrapolated one hour
/// ahead.
pub struct TrendPredictor {
    samples: VecDeque<(i64, f64)>,
    window: usize,
    min_samples: usize,
    horizon_seconds: i64,
}

impl Default for TrendPredictor {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            window: 48,
            min_samples: 12,
            horizon_seconds: 3_600,
        }
    }
}

impl Predictor for TrendPredictor {
    fn observe(&mut self, at: DateTime<FixedOffset>, temperature: Temperature) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((at.timestamp(), temperature.as_f64()));
    }

    fn predict(&self, at: DateTime<FixedOffset>) -> Option<Temperature> {
        if self.samples.len() < self.min_samples {
            return None;
        }

        let origin = self.samples.front()?.0;
        let n = self.samples.len() as f64;
        let (sum_x, sum_y) = self
            .samples
            .iter()
            .fold((0.0, 0.0), |(sx, sy), (t, y)| (sx + (t - origin) as f64, sy + y));
        let mean_x = sum_x / n;
        let mean_y = sum_y / n;

        let (covariance, variance) = self.samples.iter().fold((0.0, 0.0), |(cov, var), (t, y)| {
            let dx = (t - origin) as f64 - mean_x;
            (cov + dx * (y - mean_y), var + dx * dx)
        });
        if variance == 0.0 {
            return None;
        }

        let slope = covariance / variance;
        let target_x = (at.timestamp() + self.horizon_seconds - origin) as f64;
        Temperature::from_f64(mean_y + slope * (target_x - mean_x))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn start() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-01-10T06:00:00+00:00").unwrap()
    }

    #[test]
    fn needs_enough_samples() {
        let mut predictor = TrendPredictor::default();
        for i in 0..11 {
            predictor.observe(start() + Duration::minutes(5 * i), Temperature::from_degrees(19));
        }
        assert_eq!(predictor.predict(start()), None);
    }

    #[test]
    fn extrapolates_a_steady_rise() {
        let mut predictor = TrendPredictor::default();
        // +0.1° every five minutes is +1.2° per hour.
        for i in 0..12 {
            predictor.observe(
                start() + Duration::minutes(5 * i),
                Temperature::from_centi(1800 + 10 * i as i32),
            );
        }
        let now = start() + Duration::minutes(55);
        assert_eq!(predictor.predict(now), Some(Temperature::from_centi(2030)));
    }

    #[test]
    fn window_discards_old_samples() {
        let mut predictor = TrendPredictor::default();
        for i in 0..100 {
            predictor.observe(start() + Duration::minutes(i), Temperature::from_degrees(20));
        }
        assert_eq!(predictor.samples.len(), 48);
        assert_eq!(
            predictor.predict(start() + Duration::minutes(100)),
            Some(Temperature::from_degrees(20))
        );
    }

    fn message(heater_on_seconds: i64) -> TelemetryMessage {
        TelemetryMessage {
            timestamp: start(),
            temperature: Some(Temperature::from_degrees(19)),
            humidity: Some(50.0),
            current_setpoint: Temperature::from_degrees(20),
            is_heater_on: true,
            heater_on_seconds,
            override_end_epoch: None,
            override_remaining_seconds: 0,
            predicted_temperature: None,
            test_device: false,
        }
    }

    #[tokio::test]
    async fn history_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonlHistory::new(dir.path());
        let message = message(60);

        history.append(&message).await.unwrap();
        history.append(&message).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(HISTORY_FILE)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: TelemetryMessage = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, message);
    }

    #[tokio::test]
    async fn full_history_rotates_to_one_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let line_len = serde_json::to_vec(&message(0)).unwrap().len() as u64 + 1;
        let history = JsonlHistory::new(dir.path()).with_max_bytes(2 * line_len);

        for seconds in 0..5 {
            history.append(&message(seconds)).await.unwrap();
        }

        let read = |name: &str| -> Vec<i64> {
            std::fs::read_to_string(dir.path().join(name))
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str::<TelemetryMessage>(line).unwrap().heater_on_seconds)
                .collect()
        };
        assert_eq!(read("history.jsonl"), vec![4]);
        assert_eq!(read("history.jsonl.1"), vec![2, 3]);
    }
}

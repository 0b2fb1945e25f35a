use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Temperature;

pub const DAYS: usize = 7;
pub const HOURS: usize = 24;
pub const QUARTERS: [u32; 4] = [0, 15, 30, 45];

pub const MIN_SETPOINT: Temperature = Temperature::from_degrees(0);
pub const MAX_SETPOINT: Temperature = Temperature::from_degrees(35);

const DEFAULT_DAY_TEMP: Temperature = Temperature::from_degrees(20);
const DEFAULT_NIGHT_TEMP: Temperature = Temperature::from_degrees(18);
const DEFAULT_DAY_START_HOUR: usize = 8;
const DEFAULT_DAY_END_HOUR: usize = 22;

type Grid = [[[Temperature; QUARTERS.len()]; HOURS]; DAYS];

/// Weekly program: weekday (0 = Sunday) → hour → quarter-hour → setpoint.
///
/// Every one of the 672 cells is always populated; documents missing a cell
/// are rejected on parse, so lookups cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ProgramDocument", into = "ProgramDocument")]
pub struct Schedule {
    grid: Grid,
}

/// JSON shape of the program: `{"0": {"8": {"15": 20.0, ...}, ...}, ...}`.
pub type ProgramDocument = BTreeMap<String, BTreeMap<String, BTreeMap<String, Temperature>>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("program is missing day {day} hour {hour} minute {minute}")]
    MissingCell { day: usize, hour: usize, minute: u32 },
    #[error("program contains unexpected key '{0}'")]
    UnexpectedKey(String),
    #[error("setpoint {value} at day {day} hour {hour} minute {minute} is out of range")]
    OutOfRange {
        day: usize,
        hour: usize,
        minute: u32,
        value: Temperature,
    },
}

impl Default for Schedule {
    fn default() -> Self {
        let mut grid = [[[DEFAULT_NIGHT_TEMP; QUARTERS.len()]; HOURS]; DAYS];
        for day in grid.iter_mut() {
            for (hour, quarters) in day.iter_mut().enumerate() {
                if (DEFAULT_DAY_START_HOUR..=DEFAULT_DAY_END_HOUR).contains(&hour) {
                    *quarters = [DEFAULT_DAY_TEMP; QUARTERS.len()];
                }
            }
        }
        Self { grid }
    }
}

impl Schedule {
    pub fn uniform(setpoint: Temperature) -> Self {
        Self {
            grid: [[[setpoint; QUARTERS.len()]; HOURS]; DAYS],
        }
    }

    /// Start minute of the quarter-hour containing `minute`.
    pub fn quarter_of(minute: u32) -> u32 {
        minute - (minute % 15)
    }

    pub fn weekday_index(now: DateTime<FixedOffset>) -> usize {
        now.weekday().num_days_from_sunday() as usize
    }

    pub fn get(&self, day: usize, hour: usize, minute: u32) -> Option<Temperature> {
        let quarter = quarter_slot(minute)?;
        self.grid.get(day)?.get(hour).map(|quarters| quarters[quarter])
    }

    pub fn set(&mut self, day: usize, hour: usize, minute: u32, setpoint: Temperature) -> bool {
        let Some(quarter) = quarter_slot(minute) else {
            return false;
        };
        match self.grid.get_mut(day).and_then(|hours| hours.get_mut(hour)) {
            Some(quarters) => {
                quarters[quarter] = setpoint;
                true
            }
            None => false,
        }
    }

    pub fn setpoint_at(&self, now: DateTime<FixedOffset>) -> Temperature {
        let day = Self::weekday_index(now);
        let hour = now.hour() as usize;
        let quarter = (now.minute() / 15) as usize;
        self.grid[day][hour][quarter]
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (day, hours) in self.grid.iter().enumerate() {
            for (hour, quarters) in hours.iter().enumerate() {
                for (slot, value) in quarters.iter().enumerate() {
                    if !(MIN_SETPOINT..=MAX_SETPOINT).contains(value) {
                        return Err(ScheduleError::OutOfRange {
                            day,
                            hour,
                            minute: QUARTERS[slot],
                            value: *value,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn quarter_slot(minute: u32) -> Option<usize> {
    QUARTERS.iter().position(|quarter| *quarter == minute)
}

impl TryFrom<ProgramDocument> for Schedule {
    type Error = ScheduleError;

    fn try_from(document: ProgramDocument) -> Result<Self, Self::Error> {
        check_keys(document.keys(), DAYS, |day| day.to_string())?;

        let mut grid = [[[Temperature::default(); QUARTERS.len()]; HOURS]; DAYS];
        for (day, hours) in grid.iter_mut().enumerate() {
            let Some(day_doc) = document.get(&day.to_string()) else {
                return Err(ScheduleError::MissingCell {
                    day,
                    hour: 0,
                    minute: 0,
                });
            };
            check_keys(day_doc.keys(), HOURS, |hour| hour.to_string())?;

            for (hour, quarters) in hours.iter_mut().enumerate() {
                let hour_doc = day_doc.get(&hour.to_string());
                if let Some(hour_doc) = hour_doc {
                    if let Some(key) = hour_doc
                        .keys()
                        .find(|key| !QUARTERS.iter().any(|q| q.to_string() == **key))
                    {
                        return Err(ScheduleError::UnexpectedKey(key.clone()));
                    }
                }

                for (slot, minute) in QUARTERS.iter().enumerate() {
                    let value = hour_doc
                        .and_then(|quarters| quarters.get(&minute.to_string()))
                        .copied()
                        .ok_or(ScheduleError::MissingCell {
                            day,
                            hour,
                            minute: *minute,
                        })?;
                    quarters[slot] = value;
                }
            }
        }

        let schedule = Self { grid };
        schedule.validate()?;
        Ok(schedule)
    }
}

fn check_keys<'a>(
    keys: impl Iterator<Item = &'a String>,
    count: usize,
    name: impl Fn(usize) -> String,
) -> Result<(), ScheduleError> {
    for key in keys {
        if !(0..count).any(|index| name(index) == *key) {
            return Err(ScheduleError::UnexpectedKey(key.clone()));
        }
    }
    Ok(())
}

impl From<Schedule> for ProgramDocument {
    fn from(schedule: Schedule) -> Self {
        schedule
            .grid
            .iter()
            .enumerate()
            .map(|(day, hours)| {
                let hours = hours
                    .iter()
                    .enumerate()
                    .map(|(hour, quarters)| {
                        let quarters = QUARTERS
                            .iter()
                            .zip(quarters.iter())
                            .map(|(minute, value)| (minute.to_string(), *value))
                            .collect();
                        (hour.to_string(), quarters)
                    })
                    .collect();
                (day.to_string(), hours)
            })
            .collect()
    }
}

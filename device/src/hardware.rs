use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{info, warn};

use thermolink_common::{HardwareConfig, SensorReading, Temperature};

const IIO_TEMP_FILE: &str = "in_temp_input";
const IIO_HUMIDITY_FILE: &str = "in_humidityrelative_input";

/// Synchronous temperature/humidity source. Reads may block; callers run them
/// on the blocking pool.
pub trait Sensor: Send {
    fn read(&mut self) -> SensorReading;
}

pub type SharedSensor = Arc<Mutex<Box<dyn Sensor>>>;

pub trait OutputPin: Send {
    fn set(&mut self, on: bool) -> io::Result<()>;
    fn is_on(&self) -> bool;

    fn turn_on(&mut self) -> io::Result<()> {
        self.set(true)
    }

    fn turn_off(&mut self) -> io::Result<()> {
        self.set(false)
    }
}

/// Host stand-in for the real sensor: a slow sawtooth around 20°C.
#[derive(Debug, Default)]
pub struct SimulatedSensor {
    tick: u64,
}

impl Sensor for SimulatedSensor {
    fn read(&mut self) -> SensorReading {
        self.tick = self.tick.wrapping_add(1);
        let temperature = Temperature::from_centi(1900 + (self.tick % 12) as i32 * 20);
        let humidity = 42.0 + (self.tick % 6) as f64 * 0.5;
        SensorReading::new(Some(temperature), Some(humidity), true)
    }
}

/// Linux IIO humidity/temperature device (e.g. an HTU21 or SHT3x), values in
/// milli-units.
#[derive(Debug)]
pub struct IioSensor {
    dir: PathBuf,
}

impl IioSensor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Sensor for IioSensor {
    fn read(&mut self) -> SensorReading {
        let temperature = match read_milli(&self.dir.join(IIO_TEMP_FILE)) {
            Ok(milli) => Temperature::from_f64(milli / 1000.0),
            Err(err) => {
                warn!("failed to read temperature from {}: {err}", self.dir.display());
                return SensorReading::absent();
            }
        };

        let humidity_path = self.dir.join(IIO_HUMIDITY_FILE);
        let humidity = if humidity_path.exists() {
            match read_milli(&humidity_path) {
                Ok(milli) => Some(milli / 1000.0),
                Err(err) => {
                    warn!("failed to read humidity from {}: {err}", self.dir.display());
                    return SensorReading::absent();
                }
            }
        } else {
            None
        };

        SensorReading::new(temperature, humidity, true)
    }
}

fn read_milli(path: &Path) -> io::Result<f64> {
    let raw = std::fs::read_to_string(path)?;
    raw.trim()
        .parse::<f64>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Output that only records and logs its state.
#[derive(Debug)]
pub struct LoggedPin {
    name: &'static str,
    on: bool,
}

impl LoggedPin {
    pub fn new(name: &'static str) -> Self {
        Self { name, on: false }
    }
}

impl OutputPin for LoggedPin {
    fn set(&mut self, on: bool) -> io::Result<()> {
        if self.on != on {
            info!("{} -> {}", self.name, if on { "on" } else { "off" });
        }
        self.on = on;
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on
    }
}

/// Raspberry Pi GPIO line driven through the BCM register block.
#[cfg(feature = "rpi")]
pub struct GpioPin {
    name: &'static str,
    pin: rppal::gpio::OutputPin,
}

#[cfg(feature = "rpi")]
impl GpioPin {
    pub fn open(
        gpio: &rppal::gpio::Gpio,
        name: &'static str,
        number: u8,
    ) -> Result<Self, HardwareError> {
        let pin = gpio
            .get(number)
            .map_err(|err| HardwareError::Gpio {
                name,
                pin: number.into(),
                message: err.to_string(),
            })?
            .into_output_low();
        Ok(Self { name, pin })
    }
}

#[cfg(feature = "rpi")]
impl OutputPin for GpioPin {
    fn set(&mut self, on: bool) -> io::Result<()> {
        if self.pin.is_set_high() != on {
            info!("{} -> {}", self.name, if on { "on" } else { "off" });
        }
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.pin.is_set_high()
    }
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("failed to open the GPIO controller: {0}")]
    Controller(String),
    #[error("{name}: gpio {pin}: {message}")]
    Gpio {
        name: &'static str,
        pin: u32,
        message: String,
    },
    #[error("{name}: gpio {pin} is configured but this build has no GPIO support")]
    Unsupported { name: &'static str, pin: u32 },
}

/// Relay plus its indicator LED; they always switch together.
pub struct Heater {
    relay: Box<dyn OutputPin>,
    led: Box<dyn OutputPin>,
}

impl Heater {
    pub fn new(relay: Box<dyn OutputPin>, led: Box<dyn OutputPin>) -> Self {
        Self { relay, led }
    }

    pub fn set(&mut self, on: bool) -> io::Result<()> {
        let relay = self.relay.set(on);
        if let Err(err) = self.led.set(on) {
            warn!("heater led write failed: {err}");
        }
        relay
    }

    pub fn is_on(&self) -> bool {
        self.relay.is_on()
    }
}

pub struct Hardware {
    pub sensor: SharedSensor,
    pub heater: Heater,
    pub sensor_reset: Box<dyn OutputPin>,
    pub link_led: Box<dyn OutputPin>,
}

impl Hardware {
    pub fn from_config(config: &HardwareConfig) -> Result<Self, HardwareError> {
        let sensor: Box<dyn Sensor> = match &config.sensor_iio_dir {
            Some(dir) => {
                info!("using IIO sensor at {dir}");
                Box::new(IioSensor::new(dir))
            }
            None => {
                info!("no sensor configured, using simulated readings");
                Box::new(SimulatedSensor::default())
            }
        };

        let mut pins = PinFactory::new(config)?;
        Ok(Self {
            sensor: Arc::new(Mutex::new(sensor)),
            heater: Heater::new(
                pins.output("heater relay", config.heater_relay_gpio)?,
                pins.output("heater led", config.heater_led_gpio)?,
            ),
            sensor_reset: pins.output("sensor reset", config.sensor_reset_gpio)?,
            link_led: pins.output("link led", config.link_led_gpio)?,
        })
    }
}

/// Hands out output pins; unconfigured lines become [`LoggedPin`]s.
struct PinFactory {
    #[cfg(feature = "rpi")]
    gpio: Option<rppal::gpio::Gpio>,
}

impl PinFactory {
    #[cfg(feature = "rpi")]
    fn new(config: &HardwareConfig) -> Result<Self, HardwareError> {
        let any_configured = [
            config.heater_relay_gpio,
            config.heater_led_gpio,
            config.link_led_gpio,
            config.sensor_reset_gpio,
        ]
        .iter()
        .any(Option::is_some);
        if !any_configured {
            return Ok(Self { gpio: None });
        }
        let gpio = rppal::gpio::Gpio::new()
            .map_err(|err| HardwareError::Controller(err.to_string()))?;
        Ok(Self { gpio: Some(gpio) })
    }

    #[cfg(not(feature = "rpi"))]
    fn new(_config: &HardwareConfig) -> Result<Self, HardwareError> {
        Ok(Self {})
    }

    fn output(
        &mut self,
        name: &'static str,
        gpio: Option<u32>,
    ) -> Result<Box<dyn OutputPin>, HardwareError> {
        let Some(number) = gpio else {
            return Ok(Box::new(LoggedPin::new(name)));
        };
        self.gpio_pin(name, number)
    }

    #[cfg(feature = "rpi")]
    fn gpio_pin(
        &mut self,
        name: &'static str,
        number: u32,
    ) -> Result<Box<dyn OutputPin>, HardwareError> {
        let pin = u8::try_from(number).map_err(|_| HardwareError::Gpio {
            name,
            pin: number,
            message: "pin number out of range".to_string(),
        })?;
        match &self.gpio {
            Some(gpio) => Ok(Box::new(GpioPin::open(gpio, name, pin)?)),
            None => Err(HardwareError::Unsupported { name, pin: number }),
        }
    }

    #[cfg(not(feature = "rpi"))]
    fn gpio_pin(
        &mut self,
        name: &'static str,
        number: u32,
    ) -> Result<Box<dyn OutputPin>, HardwareError> {
        Err(HardwareError::Unsupported { name, pin: number })
    }
}


#[cfg(test)]
mod tests {
    use super::{fake::FakePin, *};

    #[test]
    fn heater_switches_relay_and_led_together() {
        let relay = FakePin::default();
        let led = FakePin::default();
        let mut heater = Heater::new(Box::new(relay.clone()), Box::new(led.clone()));

        heater.set(true).unwrap();
        heater.set(false).unwrap();

        assert_eq!(relay.writes(), vec![true, false]);
        assert_eq!(led.writes(), vec![true, false]);
        assert!(!heater.is_on());
    }

    #[test]
    fn iio_sensor_reads_milli_units() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IIO_TEMP_FILE), "21375\n").unwrap();
        std::fs::write(dir.path().join(IIO_HUMIDITY_FILE), "48500\n").unwrap();

        let reading = IioSensor::new(dir.path()).read();
        assert!(reading.valid);
        assert_eq!(reading.temperature, Some(Temperature::from_centi(2138)));
        assert_eq!(reading.humidity, Some(48.5));
    }

    #[test]
    fn iio_sensor_without_device_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let reading = IioSensor::new(dir.path().join("missing")).read();
        assert!(!reading.valid);
        assert_eq!(reading.temperature, None);
    }

    #[test]
    fn iio_humidity_out_of_range_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IIO_TEMP_FILE), "20000").unwrap();
        std::fs::write(dir.path().join(IIO_HUMIDITY_FILE), "130000").unwrap();

        assert!(!IioSensor::new(dir.path()).read().valid);
    }

    #[test]
    fn unconfigured_lines_are_logged_pins() {
        let mut hardware = Hardware::from_config(&HardwareConfig::default()).unwrap();
        hardware.heater.set(true).unwrap();
        assert!(hardware.heater.is_on());
        hardware.sensor_reset.turn_on().unwrap();
        assert!(hardware.sensor_reset.is_on());
    }

    #[cfg(not(feature = "rpi"))]
    #[test]
    fn configured_gpio_without_support_is_refused() {
        let config = HardwareConfig {
            heater_relay_gpio: Some(21),
            ..HardwareConfig::default()
        };
        match Hardware::from_config(&config) {
            Err(HardwareError::Unsupported { name, pin }) => {
                assert_eq!(name, "heater relay");
                assert_eq!(pin, 21);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("configured relay must not fall back to a logged pin"),
        }
    }

    #[test]
    fn simulated_sensor_is_always_valid() {
        let mut sensor = SimulatedSensor::default();
        for _ in 0..24 {
            assert!(sensor.read().valid);
        }
    }
}

use std::path::PathBuf;

use libgpiod::{chip::Chip, line, request};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::gpio::{Bias, GpioBackend};

/// Character-device backend. Each claimed line holds its own kernel line
/// request; release drops the requests wholesale.
pub struct LibgpiodBackend {
    chip_path: String,
    lines: RwLock<FxHashMap<u32, request::Request>>, // keyed by line offset
}

impl LibgpiodBackend {
    pub fn new(chip_path: &str) -> Result<Self, AppError> {
        // Probe once so an unsupported backend surfaces at startup, not on
        // the first claim.
        Self::open_chip(chip_path)?;
        Ok(Self {
            chip_path: chip_path.to_string(),
            lines: RwLock::new(FxHashMap::default()),
        })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_line(&self, offset: u32, settings: line::Settings) -> Result<(), AppError> {
        let chip = Self::open_chip(&self.chip_path)?;

        let mut line_cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        line_cfg
            .add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;

        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;

        let request = chip
            .request_lines(Some(&req_cfg), &line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))?;

        self.lines.write().insert(offset, request);
        Ok(())
    }
}

impl GpioBackend for LibgpiodBackend {
    fn claim_output(&self, line: u32) -> Result<(), AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Output)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        ls.set_drive(line::Drive::PushPull)
            .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
        self.request_line(line, ls)
    }

    fn claim_input(&self, line: u32, bias: Bias) -> Result<(), AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;
        ls.set_direction(line::Direction::Input)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        let bias = match bias {
            Bias::Floating => None,
            Bias::PullUp => Some(line::Bias::PullUp),
            Bias::PullDown => Some(line::Bias::PullDown),
        };
        ls.set_bias(bias)
            .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;
        self.request_line(line, ls)
    }

    fn read(&self, line: u32) -> Result<u8, AppError> {
        let lines = self.lines.read();
        let request = lines
            .get(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not claimed")))?;
        let value = request
            .value(line)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }

    fn write(&self, line: u32, level: u8) -> Result<(), AppError> {
        let lines = self.lines.read();
        let request = lines
            .get(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not claimed")))?;
        request
            .set_value(
                line,
                match level {
                    0 => line::Value::InActive,
                    _ => line::Value::Active,
                },
            )
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn release_all(&self) {
        self.lines.write().clear();
    }
}

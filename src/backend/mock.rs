use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::gpio::{Bias, GpioBackend};

/// In-memory backend. Tests drive input levels through [`set_level`] to
/// simulate externally wired signals (e.g. an expander pulling its
/// interrupt line low).
///
/// [`set_level`]: MockGpioBackend::set_level
#[derive(Default)]
pub struct MockGpioBackend {
    lines: RwLock<FxHashMap<u32, Mutex<MockLine>>>, // keyed by line offset
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Input,
    Output,
}

struct MockLine {
    direction: Direction,
    level: u8,
}

impl MockGpioBackend {
    /// Sets the electrical level seen on a line, as external hardware would.
    /// Claims the line as an input if nothing claimed it yet, which keeps
    /// test setup short.
    pub fn set_level(&self, line: u32, level: u8) {
        let lines = self.lines.read();
        if let Some(entry) = lines.get(&line) {
            entry.lock().level = level;
            return;
        }
        drop(lines);
        self.lines.write().insert(
            line,
            Mutex::new(MockLine {
                direction: Direction::Input,
                level,
            }),
        );
    }

    pub fn is_claimed(&self, line: u32) -> bool {
        self.lines.read().contains_key(&line)
    }
}

impl GpioBackend for MockGpioBackend {
    fn claim_output(&self, line: u32) -> Result<(), AppError> {
        self.lines.write().insert(
            line,
            Mutex::new(MockLine {
                direction: Direction::Output,
                level: 0,
            }),
        );
        Ok(())
    }

    fn claim_input(&self, line: u32, bias: Bias) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        if let Some(entry) = lines.get(&line) {
            // A level set before the claim models an externally driven
            // signal; it survives claiming.
            entry.lock().direction = Direction::Input;
            return Ok(());
        }
        // Pull-up inputs idle high.
        let level = match bias {
            Bias::PullUp => 1,
            Bias::PullDown | Bias::Floating => 0,
        };
        lines.insert(
            line,
            Mutex::new(MockLine {
                direction: Direction::Input,
                level,
            }),
        );
        Ok(())
    }

    fn read(&self, line: u32) -> Result<u8, AppError> {
        let lines = self.lines.read();
        let entry = lines
            .get(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not claimed")))?;
        Ok(entry.lock().level)
    }

    fn write(&self, line: u32, level: u8) -> Result<(), AppError> {
        let lines = self.lines.read();
        let entry = lines
            .get(&line)
            .ok_or_else(|| AppError::Gpio(format!("line {line} not claimed")))?;
        let mut pin = entry.lock();
        if pin.direction != Direction::Output {
            return Err(AppError::Gpio(format!(
                "line {line} must be claimed as output to write"
            )));
        }
        pin.level = level;
        Ok(())
    }

    fn release_all(&self) {
        self.lines.write().clear();
    }
}

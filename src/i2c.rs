use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::AppError;
use crate::mcp23017;

/// 16-bit register access bound to one chip address. One instance per chip;
/// the extender controller serializes access with a per-chip lock.
pub trait RegisterBus: Send + 'static {
    fn read_word(&mut self, reg: u8) -> Result<u16, AppError>;
    fn write_word(&mut self, reg: u8, value: u16) -> Result<(), AppError>;
}

/// Opens register-bus handles by address. An open failure means the chip is
/// absent or the board is miswired and is reported as a registration fault.
pub trait BusFactory: Send + Sync {
    fn open(&self, address: u16) -> Result<Box<dyn RegisterBus>, AppError>;
}

#[cfg(feature = "hardware")]
pub use linux::LinuxBusFactory;

#[cfg(feature = "hardware")]
mod linux {
    use i2cdev::core::I2CDevice;
    use i2cdev::linux::LinuxI2CDevice;

    use super::{BusFactory, RegisterBus};
    use crate::error::AppError;

    pub struct LinuxBusFactory {
        device_path: String,
    }

    impl LinuxBusFactory {
        pub fn new(device_path: &str) -> Self {
            Self {
                device_path: device_path.to_string(),
            }
        }
    }

    struct LinuxRegisterBus {
        dev: LinuxI2CDevice,
    }

    impl BusFactory for LinuxBusFactory {
        fn open(&self, address: u16) -> Result<Box<dyn RegisterBus>, AppError> {
            let mut dev = LinuxI2CDevice::new(&self.device_path, address).map_err(|e| {
                AppError::Registration(format!(
                    "open {} address {address:#04x}: {e}",
                    self.device_path
                ))
            })?;
            // Probe with a harmless register read so a missing chip fails
            // registration instead of the first decode.
            dev.smbus_read_word_data(crate::mcp23017::IODIR)
                .map_err(|e| {
                    AppError::Registration(format!("probe address {address:#04x}: {e}"))
                })?;
            Ok(Box::new(LinuxRegisterBus { dev }))
        }
    }

    impl RegisterBus for LinuxRegisterBus {
        fn read_word(&mut self, reg: u8) -> Result<u16, AppError> {
            self.dev
                .smbus_read_word_data(reg)
                .map_err(|e| AppError::Gpio(format!("i2c read reg {reg:#04x}: {e}")))
        }

        fn write_word(&mut self, reg: u8, value: u16) -> Result<(), AppError> {
            self.dev
                .smbus_write_word_data(reg, value)
                .map_err(|e| AppError::Gpio(format!("i2c write reg {reg:#04x}: {e}")))
        }
    }
}

/// Register-level model of an MCP23017, shared between the mock bus handed
/// to the controller and the test that drives it.
#[derive(Default)]
pub struct MockExpanderState {
    pub iodir: u16,
    pub gpinten: u16,
    pub defval: u16,
    pub intcon: u16,
    pub iocon: u16,
    pub gppu: u16,
    pub intf: u16,
    pub gpio: u16,
    pub olat: u16,
}

impl MockExpanderState {
    /// Simulates external hardware driving an input pin. Latches the INTF
    /// flag only if interrupts are enabled for that bit, like the real chip.
    pub fn drive_input(&mut self, index: u8, level: u8) {
        let bit = 1u16 << index;
        let old = self.gpio & bit != 0;
        if level != 0 {
            self.gpio |= bit;
        } else {
            self.gpio &= !bit;
        }
        let new = self.gpio & bit != 0;
        if old != new && self.gpinten & bit != 0 {
            self.intf |= bit;
        }
    }

    pub fn level(&self, index: u8) -> u8 {
        u8::from(self.gpio & (1 << index) != 0)
    }
}

pub struct MockRegisterBus {
    state: Arc<Mutex<MockExpanderState>>,
}

impl RegisterBus for MockRegisterBus {
    fn read_word(&mut self, reg: u8) -> Result<u16, AppError> {
        let mut s = self.state.lock();
        Ok(match reg {
            mcp23017::IODIR => s.iodir,
            mcp23017::GPINTEN => s.gpinten,
            mcp23017::DEFVAL => s.defval,
            mcp23017::INTCON => s.intcon,
            mcp23017::IOCON => s.iocon,
            mcp23017::GPPU => s.gppu,
            mcp23017::INTF => s.intf,
            mcp23017::INTCAP => {
                // Reading INTCAP clears the pending flags.
                s.intf = 0;
                s.gpio
            }
            mcp23017::GPIO => s.gpio,
            mcp23017::OLAT => s.olat,
            _ => return Err(AppError::Gpio(format!("mock: unknown register {reg:#04x}"))),
        })
    }

    fn write_word(&mut self, reg: u8, value: u16) -> Result<(), AppError> {
        let mut s = self.state.lock();
        match reg {
            mcp23017::IODIR => s.iodir = value,
            mcp23017::GPINTEN => s.gpinten = value,
            mcp23017::DEFVAL => s.defval = value,
            mcp23017::INTCON => s.intcon = value,
            mcp23017::IOCON => s.iocon = value,
            mcp23017::GPPU => {
                s.gppu = value;
                // Pulled-up inputs idle high.
                s.gpio |= value & s.iodir;
            }
            mcp23017::INTF => s.intf = value,
            mcp23017::OLAT => s.olat = value,
            _ => return Err(AppError::Gpio(format!("mock: unknown register {reg:#04x}"))),
        }
        Ok(())
    }
}

/// Factory over a board's worth of mock chips. Addresses listed as missing
/// fail to open, which is how registration faults are simulated.
#[derive(Default)]
pub struct MockBusFactory {
    chips: Mutex<FxHashMap<u16, Arc<Mutex<MockExpanderState>>>>,
    missing: Mutex<Vec<u16>>,
}

impl MockBusFactory {
    pub fn mark_missing(&self, address: u16) {
        self.missing.lock().push(address);
    }

    /// State handle for a chip, creating it on first use. Tests keep this
    /// to drive inputs and inspect register writes.
    pub fn state(&self, address: u16) -> Arc<Mutex<MockExpanderState>> {
        self.chips
            .lock()
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(MockExpanderState::default())))
            .clone()
    }
}

impl BusFactory for MockBusFactory {
    fn open(&self, address: u16) -> Result<Box<dyn RegisterBus>, AppError> {
        if self.missing.lock().contains(&address) {
            return Err(AppError::Registration(format!(
                "no expander responds at address {address:#04x}"
            )));
        }
        Ok(Box::new(MockRegisterBus {
            state: self.state(address),
        }))
    }
}

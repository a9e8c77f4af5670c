use crate::error::AppError;
use crate::i2c::RegisterBus;

// MCP23017 register map, BANK=0, addressed as 16-bit words (port A in the
// low byte, port B in the high byte, matching SMBus word order).
pub const IODIR: u8 = 0x00;
pub const GPINTEN: u8 = 0x04;
pub const DEFVAL: u8 = 0x06;
pub const INTCON: u8 = 0x08;
pub const IOCON: u8 = 0x0A;
pub const GPPU: u8 = 0x0C;
pub const INTF: u8 = 0x0E;
pub const INTCAP: u8 = 0x10;
pub const GPIO: u8 = 0x12;
pub const OLAT: u8 = 0x14;

/// IOCON value used for every chip: mirrored interrupt outputs, open-drain
/// INT pin (shared interrupt wiring with external pull-up).
pub const IO_CONTROL: u8 = 0x44;

/// Typed access to one MCP23017 at a fixed bus address.
pub struct Mcp23017 {
    bus: Box<dyn RegisterBus>,
}

impl Mcp23017 {
    pub fn new(bus: Box<dyn RegisterBus>) -> Self {
        Self { bus }
    }

    /// Writes the core configuration: IOCON on both banks, DEFVAL all-high
    /// (pull-up idle) and INTCON zero, i.e. interrupt on any change.
    pub fn configure(&mut self) -> Result<(), AppError> {
        let iocon = u16::from_le_bytes([IO_CONTROL, IO_CONTROL]);
        self.bus.write_word(IOCON, iocon)?;
        self.bus.write_word(DEFVAL, 0xFFFF)?;
        self.bus.write_word(INTCON, 0x0000)?;
        Ok(())
    }

    /// 1 = input. Written together with the matching pull-up mask.
    pub fn set_directions(&mut self, input_mask: u16) -> Result<(), AppError> {
        self.bus.write_word(IODIR, input_mask)?;
        self.bus.write_word(GPPU, input_mask)?;
        Ok(())
    }

    pub fn set_interrupt_enable(&mut self, mask: u16) -> Result<(), AppError> {
        self.bus.write_word(GPINTEN, mask)
    }

    /// Pending interrupt-flag bits (INTF).
    pub fn interrupt_flags(&mut self) -> Result<u16, AppError> {
        self.bus.read_word(INTF)
    }

    /// Live pin levels (GPIO register).
    pub fn levels(&mut self) -> Result<u16, AppError> {
        self.bus.read_word(GPIO)
    }

    /// Reading INTCAP releases the chip's interrupt line.
    pub fn clear_interrupts(&mut self) -> Result<(), AppError> {
        let _ = self.bus.read_word(INTCAP)?;
        Ok(())
    }
}

//! Abstract device-bus interface.
//!
//! The programmer drives the target over a synchronous serial bus and one
//! reset line. Both are traits so the engine runs unchanged against real
//! SPI/GPIO peripherals or the in-memory simulator.

use anyhow::Result;

/// The physical ISP bus: 4-byte transactions plus clock and lifecycle
/// control. Claimed by `begin` and held exclusively until `end`.
pub trait IspBus {
    fn begin(&mut self) -> Result<()>;
    fn end(&mut self) -> Result<()>;

    /// Set the bus clock in Hz. Only meaningful while the bus is open.
    fn set_clock(&mut self, hz: u32) -> Result<()>;

    /// Clock one idle byte to settle the bus before the reset pulse.
    fn idle_clock(&mut self) -> Result<()>;

    /// Full-duplex 4-byte transaction. The reply to an instruction byte
    /// appears one slot later; most instructions answer in the last byte.
    fn transfer(&mut self, out: [u8; 4]) -> Result<[u8; 4]>;

    /// Blocking delay. Device timing (reset settle, page commit, EEPROM
    /// byte writes) is expressed through this.
    fn delay_us(&mut self, us: u32);
}

/// Digital output wired to the target's RESET pin.
pub trait ResetLine {
    fn set_level(&mut self, high: bool) -> Result<()>;
}

/// Reset-line driver that folds in the polarity configuration.
///
/// `active_high` is for boards where an external transistor inverts the
/// line; on a directly-wired AVR, reset is active low.
pub struct ResetControl<R: ResetLine> {
    line: R,
    active_high: bool,
    /// Logical state to park the line in while no session is programming.
    idle_asserted: bool,
}

impl<R: ResetLine> ResetControl<R> {
    pub fn new(line: R, active_high: bool, idle_asserted: bool) -> Self {
        ResetControl {
            line,
            active_high,
            idle_asserted,
        }
    }

    /// Drive the logical reset state onto the pin, honoring polarity.
    pub fn set(&mut self, asserted: bool) -> Result<()> {
        self.line.set_level(asserted == self.active_high)
    }

    pub fn assert(&mut self) -> Result<()> {
        self.set(true)
    }

    pub fn release(&mut self) -> Result<()> {
        self.set(false)
    }

    /// Park the line at its configured idle state.
    pub fn restore_idle(&mut self) -> Result<()> {
        self.set(self.idle_asserted)
    }
}

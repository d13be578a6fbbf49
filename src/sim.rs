//! In-memory AVR target.
//!
//! Implements the device side of the ISP instruction set against plain
//! byte arrays so the whole bridge can be exercised (by the test suite, or
//! by a real avrdude pointed at `serve`) without any hardware attached.
//! Flash writes land in a page latch first and only reach the array on a
//! page-write instruction, same as the silicon.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;

use crate::bus::{IspBus, ResetLine};
use crate::constants::isp;
use crate::device::Part;

struct Core {
    part: Part,
    flash: Vec<u8>,
    eeprom: Vec<u8>,
    latch: Vec<u8>,
    prog_enabled: bool,
    bus_open: bool,
    begin_count: u32,
    end_count: u32,
    clock_hz: Option<u32>,
    idle_clocks: u32,
    slept_us: u64,
    reset_levels: Vec<bool>,
    log: Vec<[u8; 4]>,
    commits: Vec<u16>,
}

impl Core {
    fn words_per_page(&self) -> usize {
        (self.part.page_size as usize / 2).max(1)
    }

    fn exchange(&mut self, out: [u8; 4]) -> [u8; 4] {
        self.log.push(out);
        // the target shifts each received byte back one slot later
        let echo = [0, out[0], out[1], out[2]];

        if out[0] == isp::PROGRAM_ENABLE[0] && out[1] == isp::PROGRAM_ENABLE[1] {
            self.prog_enabled = true;
            return echo;
        }
        if !self.prog_enabled {
            log::warn!("instruction 0x{:02x} before programming enable", out[0]);
            return echo;
        }

        let word = u16::from_be_bytes([out[1], out[2]]) as usize;
        match out[0] {
            isp::LOAD_FLASH_LO | isp::LOAD_FLASH_HI => {
                let offset = (word % self.words_per_page()) * 2;
                let hi = (out[0] == isp::LOAD_FLASH_HI) as usize;
                self.latch[offset + hi] = out[3];
                echo
            }
            isp::WRITE_PAGE => {
                let base = (word * 2) % self.flash.len();
                let page = self.part.page_size as usize;
                for i in 0..page.min(self.flash.len() - base) {
                    self.flash[base + i] = self.latch[i];
                }
                self.latch.fill(0xff);
                self.commits.push(word as u16);
                echo
            }
            isp::READ_FLASH_LO | isp::READ_FLASH_HI => {
                let hi = (out[0] == isp::READ_FLASH_HI) as usize;
                let addr = (word * 2 + hi) % self.flash.len();
                [echo[0], echo[1], echo[2], self.flash[addr]]
            }
            isp::WRITE_EEPROM => {
                let addr = word % self.eeprom.len();
                self.eeprom[addr] = out[3];
                echo
            }
            isp::READ_EEPROM => {
                let addr = word % self.eeprom.len();
                [echo[0], echo[1], echo[2], self.eeprom[addr]]
            }
            isp::READ_SIGNATURE => {
                let sig = self.part.signature[out[2] as usize % 3];
                [echo[0], echo[1], echo[2], sig]
            }
            other => {
                log::debug!("unmodelled instruction 0x{:02x}", other);
                echo
            }
        }
    }
}

/// Bus-side handle to the simulated target. Clones share the same chip.
#[derive(Clone)]
pub struct SimAvr {
    core: Rc<RefCell<Core>>,
}

/// Reset-pin handle, split off so the bus and the reset line can be owned
/// by different parts of the programmer.
pub struct SimResetLine {
    core: Rc<RefCell<Core>>,
}

impl SimAvr {
    pub fn new(part: Part) -> Self {
        let flash = vec![0xff; part.flash_size as usize];
        let eeprom = vec![0xff; part.eeprom_size as usize];
        let latch = vec![0xff; part.page_size as usize];
        SimAvr {
            core: Rc::new(RefCell::new(Core {
                part,
                flash,
                eeprom,
                latch,
                prog_enabled: false,
                bus_open: false,
                begin_count: 0,
                end_count: 0,
                clock_hz: None,
                idle_clocks: 0,
                slept_us: 0,
                reset_levels: Vec::new(),
                log: Vec::new(),
                commits: Vec::new(),
            })),
        }
    }

    pub fn reset_line(&self) -> SimResetLine {
        SimResetLine {
            core: self.core.clone(),
        }
    }

    pub fn flash_at(&self, addr: usize) -> u8 {
        self.core.borrow().flash[addr]
    }

    pub fn eeprom_at(&self, addr: usize) -> u8 {
        self.core.borrow().eeprom[addr]
    }

    /// Preload flash content, bypassing the latch.
    pub fn load_flash(&self, addr: usize, bytes: &[u8]) {
        let mut core = self.core.borrow_mut();
        core.flash[addr..addr + bytes.len()].copy_from_slice(bytes);
    }

    pub fn load_eeprom(&self, addr: usize, bytes: &[u8]) {
        let mut core = self.core.borrow_mut();
        core.eeprom[addr..addr + bytes.len()].copy_from_slice(bytes);
    }

    /// Word addresses of every page-write instruction seen, in order.
    pub fn commits(&self) -> Vec<u16> {
        self.core.borrow().commits.clone()
    }

    /// Every 4-byte instruction seen, in order.
    pub fn transactions(&self) -> Vec<[u8; 4]> {
        self.core.borrow().log.clone()
    }

    pub fn bus_open(&self) -> bool {
        self.core.borrow().bus_open
    }

    pub fn begin_count(&self) -> u32 {
        self.core.borrow().begin_count
    }

    pub fn end_count(&self) -> u32 {
        self.core.borrow().end_count
    }

    pub fn clock_hz(&self) -> Option<u32> {
        self.core.borrow().clock_hz
    }

    pub fn prog_enabled(&self) -> bool {
        self.core.borrow().prog_enabled
    }

    /// Microseconds of device-timing delay requested so far.
    pub fn slept_us(&self) -> u64 {
        self.core.borrow().slept_us
    }

    /// Electrical levels driven onto the reset pin, in order.
    pub fn reset_levels(&self) -> Vec<bool> {
        self.core.borrow().reset_levels.clone()
    }
}

impl IspBus for SimAvr {
    fn begin(&mut self) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.bus_open = true;
        core.begin_count += 1;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let mut core = self.core.borrow_mut();
        core.bus_open = false;
        core.end_count += 1;
        core.prog_enabled = false;
        Ok(())
    }

    fn set_clock(&mut self, hz: u32) -> Result<()> {
        self.core.borrow_mut().clock_hz = Some(hz);
        Ok(())
    }

    fn idle_clock(&mut self) -> Result<()> {
        self.core.borrow_mut().idle_clocks += 1;
        Ok(())
    }

    fn transfer(&mut self, out: [u8; 4]) -> Result<[u8; 4]> {
        Ok(self.core.borrow_mut().exchange(out))
    }

    fn delay_us(&mut self, us: u32) {
        // accounted, not slept: tests would otherwise wait out real
        // EEPROM timing
        self.core.borrow_mut().slept_us += us as u64;
    }
}

impl ResetLine for SimResetLine {
    fn set_level(&mut self, high: bool) -> Result<()> {
        self.core.borrow_mut().reset_levels.push(high);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PartDb;

    fn enabled_sim() -> SimAvr {
        let mut sim = SimAvr::new(PartDb::find("atmega328p").unwrap());
        sim.begin().unwrap();
        sim.transfer(isp::PROGRAM_ENABLE).unwrap();
        sim
    }

    #[test]
    fn signature_reads() {
        let mut sim = enabled_sim();
        let got: Vec<u8> = (0..3)
            .map(|i| sim.transfer([isp::READ_SIGNATURE, 0, i, 0]).unwrap()[3])
            .collect();
        assert_eq!(got, vec![0x1e, 0x95, 0x0f]);
    }

    #[test]
    fn flash_needs_a_commit() {
        let mut sim = enabled_sim();
        sim.transfer([isp::LOAD_FLASH_LO, 0x00, 0x10, 0xaa]).unwrap();
        sim.transfer([isp::LOAD_FLASH_HI, 0x00, 0x10, 0xbb]).unwrap();
        // nothing in the array until the page write
        assert_eq!(sim.flash_at(0x20), 0xff);
        sim.transfer([isp::WRITE_PAGE, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(sim.flash_at(0x20), 0xaa);
        assert_eq!(sim.flash_at(0x21), 0xbb);
        assert_eq!(sim.commits(), vec![0x0000]);
    }

    #[test]
    fn commit_clears_the_latch() {
        let mut sim = enabled_sim();
        sim.transfer([isp::LOAD_FLASH_LO, 0x00, 0x00, 0x11]).unwrap();
        sim.transfer([isp::WRITE_PAGE, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(sim.flash_at(0), 0x11);
        // a second commit of the same page writes erased bytes
        sim.transfer([isp::WRITE_PAGE, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(sim.flash_at(0), 0xff);
    }

    #[test]
    fn eeprom_round_trip() {
        let mut sim = enabled_sim();
        sim.transfer([isp::WRITE_EEPROM, 0x01, 0x02, 0x5a]).unwrap();
        assert_eq!(sim.eeprom_at(0x0102), 0x5a);
        let got = sim.transfer([isp::READ_EEPROM, 0x01, 0x02, 0xff]).unwrap()[3];
        assert_eq!(got, 0x5a);
    }

    #[test]
    fn instructions_ignored_until_enabled() {
        let mut sim = SimAvr::new(PartDb::find("atmega8").unwrap());
        sim.begin().unwrap();
        sim.transfer([isp::WRITE_EEPROM, 0x00, 0x00, 0x42]).unwrap();
        assert_eq!(sim.eeprom_at(0), 0xff);
    }
}

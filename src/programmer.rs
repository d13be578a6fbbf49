//! The programmer session: connection lifecycle, command dispatch, and the
//! page programming engine.
//!
//! One `Programmer` owns the device bus, the reset line, and the command
//! transport. `update()` runs the Idle/Pending/Active state machine;
//! `serve()` additionally executes every command frame the transport has
//! buffered. Both are non-blocking and meant to be polled from a scheduler
//! loop.

use anyhow::Result;

use crate::bus::{IspBus, ResetControl, ResetLine};
use crate::constants::{ident, isp, params, responses, timing, EEPROM_CHUNK, SIGN_ON_ID};
use crate::device::{DeviceParameters, PartDb};
use crate::protocol::{Command, FrameError, MemType, Reply};
use crate::transport::CommandTransport;

/// Session lifecycle. The bus is claimed only while `Active` and released
/// on every transition back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammerState {
    Idle,
    Pending,
    Active,
}

pub struct Programmer<B, R, T>
where
    B: IspBus,
    R: ResetLine,
    T: CommandTransport,
{
    bus: B,
    reset: ResetControl<R>,
    transport: T,
    state: ProgrammerState,
    spi_freq: u32,
    /// Programming-enable has been issued and the bus is held open.
    prog_mode: bool,
    /// Desync and format events on this connection. Diagnostic only.
    errors: u32,
    /// Word address for page operations, set by Load Address.
    here: u16,
    params: Option<DeviceParameters>,
    /// A frame failed to decode; the session is dropped on the next pass.
    drop_session: bool,
}

impl<B, R, T> Programmer<B, R, T>
where
    B: IspBus,
    R: ResetLine,
    T: CommandTransport,
{
    pub fn new(bus: B, reset: ResetControl<R>, transport: T, spi_freq: u32) -> Self {
        Programmer {
            bus,
            reset,
            transport,
            state: ProgrammerState::Idle,
            spi_freq,
            prog_mode: false,
            errors: 0,
            here: 0,
            params: None,
            drop_session: false,
        }
    }

    pub fn state(&self) -> ProgrammerState {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn address(&self) -> u16 {
        self.here
    }

    pub fn parameters(&self) -> Option<&DeviceParameters> {
        self.params.as_ref()
    }

    /// Change the bus clock. Takes effect immediately when a programming
    /// session currently holds the bus.
    pub fn set_spi_frequency(&mut self, hz: u32) -> Result<()> {
        self.spi_freq = hz;
        if self.prog_mode {
            self.bus.set_clock(hz)?;
        }
        Ok(())
    }

    /// Run the connection state machine one step.
    pub fn update(&mut self) -> Result<ProgrammerState> {
        match self.state {
            ProgrammerState::Idle => {
                if self.transport.session_waiting() {
                    self.transport.open_session()?;
                    self.errors = 0;
                    self.state = ProgrammerState::Pending;
                    self.transport.reject_incoming();
                }
            }
            ProgrammerState::Pending | ProgrammerState::Active => {
                if self.drop_session || !self.transport.session_alive() {
                    self.transport.close_session();
                    if self.prog_mode {
                        if let Err(e) = self.bus.end() {
                            log::warn!("bus release failed: {}", e);
                        }
                        self.prog_mode = false;
                    }
                    self.reset.restore_idle()?;
                    self.drop_session = false;
                    self.state = ProgrammerState::Idle;
                } else {
                    self.transport.reject_incoming();
                }
            }
        }
        Ok(self.state)
    }

    /// Step the state machine and execute every buffered command frame.
    pub fn serve(&mut self) -> Result<ProgrammerState> {
        if self.update()? == ProgrammerState::Idle {
            return Ok(ProgrammerState::Idle);
        }
        self.state = ProgrammerState::Active;
        while !self.drop_session {
            match self.transport.receive_body() {
                Ok(Some(body)) => self.execute(&body)?,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("receive failed: {}", e);
                    self.drop_session = true;
                }
            }
        }
        self.update()
    }

    /// Decode and run one command frame, sending its response.
    fn execute(&mut self, body: &[u8]) -> Result<()> {
        let cmd = match Command::parse(body) {
            Ok(cmd) => cmd,
            Err(FrameError::BadMemType { raw }) => {
                log::warn!("page command for unknown memory space 0x{:02x}", raw);
                self.errors += 1;
                return self.respond(Reply::OutOfSync);
            }
            Err(e) => {
                log::warn!("malformed frame [{}]: {}", hex::encode(body), e);
                self.errors += 1;
                self.drop_session = true;
                return self.respond(Reply::Malformed);
            }
        };

        log::debug!("CMD {}", cmd.name());
        let reply = self.dispatch(cmd)?;
        if !reply.in_sync() {
            self.errors += 1;
        }
        self.respond(reply)
    }

    fn respond(&mut self, reply: Reply) -> Result<()> {
        self.transport.send(&reply.into_raw())
    }

    fn dispatch(&mut self, cmd: Command) -> Result<Reply> {
        match cmd {
            Command::GetSync { sync } => {
                self.errors = 0;
                Ok(Reply::empty(sync))
            }
            Command::GetSignOn { sync } => Ok(Reply::Framed {
                in_sync: sync,
                payload: SIGN_ON_ID.to_vec(),
            }),
            Command::GetParameter { id, sync } => {
                Ok(Reply::byte(sync, self.parameter_value(id)))
            }
            Command::SetDevice { block, sync } => {
                let p = DeviceParameters::from_block(&block)?;
                match PartDb::find_by_code(p.device_code) {
                    Some(part) => log::info!("device set: {}", part),
                    None => log::info!("device set: code 0x{:02x}", p.device_code),
                }
                self.params = Some(p);
                Ok(Reply::empty(sync))
            }
            Command::SetDeviceExt { sync }
            | Command::ProgFlash { sync }
            | Command::ProgData { sync } => Ok(Reply::empty(sync)),
            Command::EnterProgMode { sync } => {
                self.enter_prog_mode()?;
                Ok(Reply::empty(sync))
            }
            Command::LeaveProgMode { sync } => {
                self.leave_prog_mode()?;
                self.errors = 0;
                Ok(Reply::empty(sync))
            }
            Command::LoadAddress { addr, sync } => {
                self.here = addr;
                Ok(Reply::empty(sync))
            }
            Command::ProgramPage { mem, data, sync } => self.program_page(mem, &data, sync),
            Command::ReadPage { mem, length, sync } => self.read_page(mem, length, sync),
            Command::Universal { instruction, sync } => {
                let out = self.transaction(instruction)?;
                Ok(Reply::byte(sync, out))
            }
            Command::ReadSignature { sync } => self.read_signature(sync),
            Command::Desync => Ok(Reply::OutOfSync),
            Command::Unknown { opcode } => {
                log::warn!("unsupported opcode 0x{:02x}", opcode);
                Ok(Reply::OutOfSync)
            }
        }
    }

    fn parameter_value(&self, id: u8) -> u8 {
        match id {
            params::HW_VER => ident::HW_VER,
            params::SW_MAJOR => ident::SW_MAJOR,
            params::SW_MINOR => ident::SW_MINOR,
            params::PROGRAMMER_TYPE => ident::PROGRAMMER_TYPE,
            _ => 0,
        }
    }

    /// Clock a 4-byte instruction into the target; the answer to an
    /// instruction rides in the last byte of the exchange.
    fn transaction(&mut self, out: [u8; 4]) -> Result<u8> {
        Ok(self.bus.transfer(out)?[3])
    }

    fn enter_prog_mode(&mut self) -> Result<()> {
        self.bus.begin()?;
        self.bus.set_clock(self.spi_freq)?;
        self.bus.idle_clock()?;

        // pulse reset, then give the target time to land in its ISP mode
        self.reset.release()?;
        self.bus.delay_us(timing::RESET_RELEASE_US);
        self.reset.assert()?;
        self.bus.delay_us(timing::RESET_SETTLE_MS * 1000);

        self.transaction(isp::PROGRAM_ENABLE)?;
        self.prog_mode = true;
        log::info!("programming mode entered");
        Ok(())
    }

    fn leave_prog_mode(&mut self) -> Result<()> {
        self.bus.end()?;
        self.reset.restore_idle()?;
        self.prog_mode = false;
        log::info!("programming mode left");
        Ok(())
    }

    fn program_page(&mut self, mem: MemType, data: &[u8], sync: bool) -> Result<Reply> {
        if !sync {
            // the frame never reaches the device out of sync
            return Ok(Reply::OutOfSync);
        }
        let params = match self.params {
            Some(p) => p,
            None => {
                log::warn!("page write before Set Device");
                self.errors += 1;
                return Ok(Reply::Status {
                    in_sync: true,
                    result: responses::FAILED,
                });
            }
        };
        let result = match mem {
            MemType::Flash => {
                self.write_flash_pages(&params, data)?;
                responses::OK
            }
            MemType::Eeprom => self.write_eeprom(&params, data)?,
        };
        Ok(Reply::Status {
            in_sync: true,
            result,
        })
    }

    /// Latch byte pairs into the target, committing each page as the
    /// cursor crosses out of it, and the final page at the end. Flash only
    /// accepts whole pages, so every latched page needs exactly one write
    /// pulse.
    fn write_flash_pages(&mut self, params: &DeviceParameters, data: &[u8]) -> Result<()> {
        let mut page = params.page_base(self.here);
        for pair in data.chunks(2) {
            if page != params.page_base(self.here) {
                self.commit_page(page)?;
                page = params.page_base(self.here);
            }
            let [hi, lo] = self.here.to_be_bytes();
            self.transaction([isp::LOAD_FLASH_LO, hi, lo, pair[0]])?;
            // odd tail byte: the high half of the word stays erased
            let high = pair.get(1).copied().unwrap_or(0xff);
            self.transaction([isp::LOAD_FLASH_HI, hi, lo, high])?;
            self.here = self.here.wrapping_add(1);
        }
        self.commit_page(page)
    }

    fn commit_page(&mut self, page: u16) -> Result<()> {
        let [hi, lo] = page.to_be_bytes();
        self.transaction([isp::WRITE_PAGE, hi, lo, 0])?;
        self.bus.delay_us(timing::PAGE_COMMIT_MS * 1000);
        Ok(())
    }

    /// EEPROM writes are byte-addressed and self-timed; data goes out in
    /// fixed-size chunks with a settle delay per byte.
    fn write_eeprom(&mut self, params: &DeviceParameters, data: &[u8]) -> Result<u8> {
        if data.len() > params.eeprom_size as usize {
            log::warn!(
                "EEPROM write of {} bytes exceeds the {}-byte device",
                data.len(),
                params.eeprom_size
            );
            self.errors += 1;
            return Ok(responses::FAILED);
        }
        let mut addr = self.here as u32 * 2;
        for chunk in data.chunks(EEPROM_CHUNK) {
            self.write_eeprom_chunk(addr, chunk)?;
            addr += chunk.len() as u32;
        }
        Ok(responses::OK)
    }

    fn write_eeprom_chunk(&mut self, start: u32, chunk: &[u8]) -> Result<()> {
        for (i, &b) in chunk.iter().enumerate() {
            let addr = start + i as u32;
            self.transaction([isp::WRITE_EEPROM, (addr >> 8) as u8, addr as u8, b])?;
            self.bus.delay_us(timing::EEPROM_BYTE_MS * 1000);
        }
        Ok(())
    }

    fn read_page(&mut self, mem: MemType, length: usize, sync: bool) -> Result<Reply> {
        if !sync {
            return Ok(Reply::OutOfSync);
        }
        let mut payload = Vec::with_capacity(length);
        match mem {
            MemType::Flash => {
                while payload.len() < length {
                    let [hi, lo] = self.here.to_be_bytes();
                    payload.push(self.transaction([isp::READ_FLASH_LO, hi, lo, 0])?);
                    if payload.len() < length {
                        payload.push(self.transaction([isp::READ_FLASH_HI, hi, lo, 0])?);
                    }
                    self.here = self.here.wrapping_add(1);
                }
            }
            MemType::Eeprom => {
                let start = self.here as u32 * 2;
                for i in 0..length {
                    let addr = start + i as u32;
                    payload.push(self.transaction([
                        isp::READ_EEPROM,
                        (addr >> 8) as u8,
                        addr as u8,
                        0xff,
                    ])?);
                }
            }
        }
        Ok(Reply::Framed {
            in_sync: true,
            payload,
        })
    }

    fn read_signature(&mut self, sync: bool) -> Result<Reply> {
        if !sync {
            return Ok(Reply::OutOfSync);
        }
        let mut payload = Vec::with_capacity(3);
        for i in 0..3u8 {
            payload.push(self.transaction([isp::READ_SIGNATURE, 0x00, i, 0x00])?);
        }
        Ok(Reply::Framed {
            in_sync: true,
            payload,
        })
    }
}

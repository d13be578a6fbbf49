
/// Capacity of the page buffer, and the largest payload a single command may carry.
pub const PAGE_BUFFER_SIZE: usize = 256;

/// Every command frame is terminated by this marker ("CRC EOP" in AVR061).
pub const SYNC_CRC_EOP: u8 = 0x20;

/// Default SPI clock for the target bus.
pub const DEFAULT_SPI_FREQ: u32 = 300_000;

/// EEPROM bytes written per chunk.
pub const EEPROM_CHUNK: usize = 32;

/// Identification string returned by Get Sign-On.
pub const SIGN_ON_ID: &[u8; 7] = b"AVR ISP";

pub mod commands {
    pub const GET_SYNC: u8 = 0x30;
    pub const GET_SIGN_ON: u8 = 0x31;
    pub const GET_PARAMETER: u8 = 0x41;
    pub const SET_DEVICE: u8 = 0x42;
    pub const SET_DEVICE_EXT: u8 = 0x45;
    pub const ENTER_PROGMODE: u8 = 0x50;
    pub const LEAVE_PROGMODE: u8 = 0x51;
    pub const LOAD_ADDRESS: u8 = 0x55;
    pub const UNIVERSAL: u8 = 0x56;
    pub const PROG_FLASH: u8 = 0x60;
    pub const PROG_DATA: u8 = 0x61;
    pub const PROG_PAGE: u8 = 0x64;
    pub const READ_PAGE: u8 = 0x74;
    pub const READ_SIGN: u8 = 0x75;
}

pub mod responses {
    pub const OK: u8 = 0x10;
    pub const FAILED: u8 = 0x11;
    pub const INSYNC: u8 = 0x14;
    pub const NOSYNC: u8 = 0x15;
}

/// Parameter ids understood by Get Parameter.
pub mod params {
    pub const HW_VER: u8 = 0x80;
    pub const SW_MAJOR: u8 = 0x81;
    pub const SW_MINOR: u8 = 0x82;
    pub const PROGRAMMER_TYPE: u8 = 0x93;
}

/// Values reported for the parameter ids above.
pub mod ident {
    pub const HW_VER: u8 = 2;
    pub const SW_MAJOR: u8 = 1;
    pub const SW_MINOR: u8 = 18;
    /// 'S' for a serial programmer.
    pub const PROGRAMMER_TYPE: u8 = b'S';
}

/// First bytes of the 4-byte ISP instructions clocked into the target.
pub mod isp {
    pub const PROGRAM_ENABLE: [u8; 4] = [0xAC, 0x53, 0x00, 0x00];
    pub const LOAD_FLASH_LO: u8 = 0x40;
    pub const LOAD_FLASH_HI: u8 = 0x48;
    pub const WRITE_PAGE: u8 = 0x4C;
    pub const READ_FLASH_LO: u8 = 0x20;
    pub const READ_FLASH_HI: u8 = 0x28;
    pub const WRITE_EEPROM: u8 = 0xC0;
    pub const READ_EEPROM: u8 = 0xA0;
    pub const READ_SIGNATURE: u8 = 0x30;
}

/// Device timing, all blocking sleeps.
pub mod timing {
    /// Settle time after a flash page commit, in milliseconds.
    pub const PAGE_COMMIT_MS: u32 = 10;
    /// Self-timed EEPROM byte write, in milliseconds.
    pub const EEPROM_BYTE_MS: u32 = 45;
    /// Reset released before pulsing it low again, in microseconds.
    pub const RESET_RELEASE_US: u32 = 50;
    /// Reset held before the program-enable instruction, in milliseconds.
    pub const RESET_SETTLE_MS: u32 = 30;
}

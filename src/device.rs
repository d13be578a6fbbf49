//! Target device description: the STK500 parameter block sent by the
//! client, and a small catalog of known AVR parts for the simulator.

use anyhow::Result;
use scroll::{Pread, Pwrite, BE};
use serde::{Deserialize, Serialize};

/// Programming parameters for the attached device, decoded from the 20-byte
/// Set Device block. Set once per session by the client; everything the
/// page engine needs to know about the target comes from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParameters {
    pub device_code: u8,
    pub revision: u8,
    pub prog_type: u8,
    pub par_mode: u8,
    pub polling: u8,
    pub self_timed: u8,
    pub lock_bytes: u8,
    pub fuse_bytes: u8,
    pub flash_poll: u8,
    pub eeprom_poll: u16,
    /// Flash page size in bytes, one of 32/64/128/256 for paged parts.
    pub page_size: u16,
    pub eeprom_size: u16,
    pub flash_size: u32,
}

impl DeviceParameters {
    /// All multi-byte fields are big endian on the wire.
    pub fn from_block(block: &[u8; 20]) -> Result<Self> {
        Ok(DeviceParameters {
            device_code: block[0],
            revision: block[1],
            prog_type: block[2],
            par_mode: block[3],
            polling: block[4],
            self_timed: block[5],
            lock_bytes: block[6],
            fuse_bytes: block[7],
            flash_poll: block[8],
            // block[9] repeats flash_poll
            eeprom_poll: block.pread_with(10, BE)?,
            page_size: block.pread_with(12, BE)?,
            eeprom_size: block.pread_with(14, BE)?,
            flash_size: block.pread_with(16, BE)?,
        })
    }

    pub fn to_block(&self) -> Result<[u8; 20]> {
        let mut block = [0u8; 20];
        block[0] = self.device_code;
        block[1] = self.revision;
        block[2] = self.prog_type;
        block[3] = self.par_mode;
        block[4] = self.polling;
        block[5] = self.self_timed;
        block[6] = self.lock_bytes;
        block[7] = self.fuse_bytes;
        block[8] = self.flash_poll;
        block[9] = self.flash_poll;
        block.pwrite_with(self.eeprom_poll, 10, BE)?;
        block.pwrite_with(self.page_size, 12, BE)?;
        block.pwrite_with(self.eeprom_size, 14, BE)?;
        block.pwrite_with(self.flash_size, 16, BE)?;
        Ok(block)
    }

    /// Word address of the start of the page containing `addr`.
    ///
    /// Page sizes outside the paged set leave the address untouched, which
    /// makes every word its own page.
    pub fn page_base(&self, addr: u16) -> u16 {
        match self.page_size {
            32 => addr & 0xfff0,
            64 => addr & 0xffe0,
            128 => addr & 0xffc0,
            256 => addr & 0xff80,
            _ => {
                log::debug!("unpaged or unknown page size: {}", self.page_size);
                addr
            }
        }
    }
}

/// One entry of the simulator part catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    #[serde(deserialize_with = "parse_byte")]
    pub device_code: u8,
    #[serde(deserialize_with = "parse_signature")]
    pub signature: [u8; 3],
    #[serde(deserialize_with = "parse_size")]
    pub flash_size: u32,
    /// Flash page size in bytes.
    pub page_size: u16,
    #[serde(deserialize_with = "parse_size")]
    pub eeprom_size: u32,
}

impl ::std::fmt::Display for Part {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{} (devcode 0x{:02x}, sig {})",
            self.name,
            self.device_code,
            hex::encode(self.signature)
        )
    }
}

pub struct PartDb {
    parts: Vec<Part>,
}

impl PartDb {
    pub fn load() -> Result<Self> {
        Ok(PartDb {
            parts: serde_yaml::from_str(include_str!("../devices/avr.yaml"))?,
        })
    }

    pub fn all() -> Result<Vec<Part>> {
        Ok(Self::load()?.parts)
    }

    pub fn find(name: &str) -> Result<Part> {
        let db = Self::load()?;
        db.parts
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| anyhow::format_err!("no part named {:?} in the catalog", name))
    }

    /// Look a part up by its STK500 device code, for log messages.
    pub fn find_by_code(device_code: u8) -> Option<Part> {
        let db = Self::load().ok()?;
        db.parts
            .iter()
            .find(|p| p.device_code == device_code)
            .cloned()
    }
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    if let Some(kib) = s.strip_suffix('K') {
        kib.parse::<u32>()
            .map(|n| n * 1024)
            .map_err(serde::de::Error::custom)
    } else if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
    } else {
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn byte_from_str<E: serde::de::Error>(s: &str) -> std::result::Result<u8, E> {
    if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
    } else {
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_byte<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    byte_from_str(&s)
}

fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<String> = serde::Deserialize::deserialize(deserializer)?;
    if raw.len() != 3 {
        return Err(serde::de::Error::custom(format!(
            "signature needs 3 bytes, got {}",
            raw.len()
        )));
    }
    let mut sig = [0u8; 3];
    for (out, s) in sig.iter_mut().zip(&raw) {
        *out = byte_from_str(s)?;
    }
    Ok(sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    // the block avrdude sends for an ATmega328P
    const M328P_BLOCK: [u8; 20] = [
        0x86, 0x00, 0x00, 0x01, 0x01, 0x01, 0x01, 0x03, 0xff, 0xff, 0xff, 0xff, 0x00, 0x80, 0x04,
        0x00, 0x00, 0x00, 0x80, 0x00,
    ];

    #[test]
    fn decode_follows_big_endian_formulas() {
        let p = DeviceParameters::from_block(&M328P_BLOCK).unwrap();
        assert_eq!(p.device_code, 0x86);
        assert_eq!(p.eeprom_poll, 0xff * 256 + 0xff);
        assert_eq!(p.page_size, 0x00 * 256 + 0x80);
        assert_eq!(p.eeprom_size, 0x04 * 256 + 0x00);
        assert_eq!(
            p.flash_size,
            0x00 * 0x0100_0000 + 0x00 * 0x0001_0000 + 0x80 * 0x0000_0100 + 0x00
        );
    }

    #[test]
    fn block_round_trips() {
        let p = DeviceParameters::from_block(&M328P_BLOCK).unwrap();
        let block = p.to_block().unwrap();
        assert_eq!(block, M328P_BLOCK);
        assert_eq!(DeviceParameters::from_block(&block).unwrap(), p);
    }

    #[test]
    fn page_base_masks_word_addresses() {
        let mut p = DeviceParameters::from_block(&M328P_BLOCK).unwrap();
        for (size, base) in [(32u16, 0x0130), (64, 0x0120), (128, 0x0100), (256, 0x0100)] {
            p.page_size = size;
            assert_eq!(p.page_base(0x013f), base, "page size {}", size);
        }
        // page of 128 bytes = 64 words: 0x40 boundary
        p.page_size = 128;
        assert_eq!(p.page_base(0x0040), 0x0040);
        assert_eq!(p.page_base(0x007f), 0x0040);
        // unknown page size leaves the address alone
        p.page_size = 48;
        assert_eq!(p.page_base(0x013f), 0x013f);
    }

    #[test]
    fn catalog_loads_and_finds_parts() {
        let parts = PartDb::all().unwrap();
        assert!(!parts.is_empty());

        let part = PartDb::find("atmega328p").unwrap();
        assert_eq!(part.signature, [0x1e, 0x95, 0x0f]);
        assert_eq!(part.flash_size, 32 * 1024);
        assert_eq!(part.page_size, 128);
        assert_eq!(part.eeprom_size, 1024);

        assert!(PartDb::find("pdp11").is_err());
        assert_eq!(PartDb::find_by_code(0x86).unwrap().name, "ATmega328P");
    }
}

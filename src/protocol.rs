//! The STK500 command subset spoken by the bridge.
//!
//! One HTTP request body carries exactly one command frame: an opcode byte,
//! opcode-specific parameters, and (for every supported opcode) a trailing
//! synchronization marker. Frames are decoded in full before anything
//! touches the device bus, so a malformed frame can never cause a partial
//! bus operation.

use std::fmt;

use crate::constants::{commands, responses, PAGE_BUFFER_SIZE, SYNC_CRC_EOP};

/// Memory space addressed by the page commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Flash,
    Eeprom,
}

impl MemType {
    fn from_raw(raw: u8) -> Result<Self, FrameError> {
        match raw {
            b'F' => Ok(MemType::Flash),
            b'E' => Ok(MemType::Eeprom),
            _ => Err(FrameError::BadMemType { raw }),
        }
    }
}

/// Decoding error for a single command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The frame ended before the bytes a parameter needs.
    Truncated { needed: usize, remaining: usize },
    /// A payload or read length larger than the page buffer.
    Oversize { len: usize },
    /// Page command naming a memory space other than 'F' or 'E'.
    BadMemType { raw: u8 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated { needed, remaining } => {
                write!(f, "frame truncated: needed {} bytes, {} left", needed, remaining)
            }
            FrameError::Oversize { len } => {
                write!(f, "length {} exceeds the {}-byte page buffer", len, PAGE_BUFFER_SIZE)
            }
            FrameError::BadMemType { raw } => {
                write!(f, "unknown memory type 0x{:02x}", raw)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Cursor over one command request body.
struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FrameReader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn getch(&mut self) -> Result<u8, FrameError> {
        let b = *self.buf.get(self.pos).ok_or(FrameError::Truncated {
            needed: 1,
            remaining: 0,
        })?;
        self.pos += 1;
        Ok(b)
    }

    /// Take the next `n` bytes. `n` may not exceed the remaining frame nor
    /// the page buffer capacity.
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if n > PAGE_BUFFER_SIZE {
            return Err(FrameError::Oversize { len: n });
        }
        if n > self.remaining() {
            return Err(FrameError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consume the trailing sync marker. Anything else (including an
    /// exhausted frame) counts as a desync.
    fn consume_sync(&mut self) -> bool {
        match self.buf.get(self.pos) {
            Some(&SYNC_CRC_EOP) => {
                self.pos += 1;
                true
            }
            Some(_) => {
                self.pos += 1;
                false
            }
            None => false,
        }
    }
}

/// One decoded STK500 command.
///
/// `sync` records whether the trailing marker was present; handlers answer
/// in-sync or out-of-sync accordingly, which is the protocol's
/// resynchronization mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetSync { sync: bool },
    GetSignOn { sync: bool },
    GetParameter { id: u8, sync: bool },
    SetDevice { block: [u8; 20], sync: bool },
    SetDeviceExt { sync: bool },
    EnterProgMode { sync: bool },
    LeaveProgMode { sync: bool },
    LoadAddress { addr: u16, sync: bool },
    /// Word-at-a-time flash programming. Legacy, accepted and ignored.
    ProgFlash { sync: bool },
    /// Byte-at-a-time EEPROM programming. Legacy, accepted and ignored.
    ProgData { sync: bool },
    ProgramPage { mem: MemType, data: Vec<u8>, sync: bool },
    ReadPage { mem: MemType, length: usize, sync: bool },
    /// Raw 4-byte instruction forwarded to the target verbatim.
    Universal { instruction: [u8; 4], sync: bool },
    ReadSignature { sync: bool },
    /// The sync marker arrived where an opcode was expected.
    Desync,
    /// Opcode outside the supported subset. The byte after it has been
    /// consumed as a resynchronization attempt.
    Unknown { opcode: u8 },
}

impl Command {
    pub fn parse(body: &[u8]) -> Result<Command, FrameError> {
        let mut r = FrameReader::new(body);
        let opcode = r.getch()?;
        let cmd = match opcode {
            SYNC_CRC_EOP => Command::Desync,
            commands::GET_SYNC => Command::GetSync {
                sync: r.consume_sync(),
            },
            commands::GET_SIGN_ON => Command::GetSignOn {
                sync: r.consume_sync(),
            },
            commands::GET_PARAMETER => {
                let id = r.getch()?;
                Command::GetParameter {
                    id,
                    sync: r.consume_sync(),
                }
            }
            commands::SET_DEVICE => {
                let mut block = [0u8; 20];
                block.copy_from_slice(r.take(20)?);
                Command::SetDevice {
                    block,
                    sync: r.consume_sync(),
                }
            }
            commands::SET_DEVICE_EXT => {
                // extended parameters, not used by this programmer
                let _ = r.take(5)?;
                Command::SetDeviceExt {
                    sync: r.consume_sync(),
                }
            }
            commands::ENTER_PROGMODE => Command::EnterProgMode {
                sync: r.consume_sync(),
            },
            commands::LEAVE_PROGMODE => Command::LeaveProgMode {
                sync: r.consume_sync(),
            },
            commands::LOAD_ADDRESS => {
                // little endian, unlike every other multi-byte field
                let lo = r.getch()? as u16;
                let hi = r.getch()? as u16;
                Command::LoadAddress {
                    addr: hi << 8 | lo,
                    sync: r.consume_sync(),
                }
            }
            commands::PROG_FLASH => {
                let _ = r.take(2)?;
                Command::ProgFlash {
                    sync: r.consume_sync(),
                }
            }
            commands::PROG_DATA => {
                let _ = r.getch()?;
                Command::ProgData {
                    sync: r.consume_sync(),
                }
            }
            commands::PROG_PAGE => {
                let length = r.getch()? as usize * 256 + r.getch()? as usize;
                let mem = MemType::from_raw(r.getch()?)?;
                let data = r.take(length)?.to_vec();
                Command::ProgramPage {
                    mem,
                    data,
                    sync: r.consume_sync(),
                }
            }
            commands::READ_PAGE => {
                let length = r.getch()? as usize * 256 + r.getch()? as usize;
                let mem = MemType::from_raw(r.getch()?)?;
                if length > PAGE_BUFFER_SIZE {
                    return Err(FrameError::Oversize { len: length });
                }
                Command::ReadPage {
                    mem,
                    length,
                    sync: r.consume_sync(),
                }
            }
            commands::UNIVERSAL => {
                let mut instruction = [0u8; 4];
                instruction.copy_from_slice(r.take(4)?);
                Command::Universal {
                    instruction,
                    sync: r.consume_sync(),
                }
            }
            commands::READ_SIGN => Command::ReadSignature {
                sync: r.consume_sync(),
            },
            opcode => {
                // still eat one byte so a well-formed-but-unsupported frame
                // leaves the stream aligned
                let _ = r.consume_sync();
                Command::Unknown { opcode }
            }
        };
        Ok(cmd)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetSync { .. } => "GET_SYNC",
            Command::GetSignOn { .. } => "GET_SIGN_ON",
            Command::GetParameter { .. } => "GET_PARAMETER",
            Command::SetDevice { .. } => "SET_DEVICE",
            Command::SetDeviceExt { .. } => "SET_DEVICE_EXT",
            Command::EnterProgMode { .. } => "ENTER_PROGMODE",
            Command::LeaveProgMode { .. } => "LEAVE_PROGMODE",
            Command::LoadAddress { .. } => "LOAD_ADDRESS",
            Command::ProgFlash { .. } => "PROG_FLASH",
            Command::ProgData { .. } => "PROG_DATA",
            Command::ProgramPage { .. } => "PROG_PAGE",
            Command::ReadPage { .. } => "READ_PAGE",
            Command::Universal { .. } => "UNIVERSAL",
            Command::ReadSignature { .. } => "READ_SIGN",
            Command::Desync => "SYNC_CRC_EOP",
            Command::Unknown { .. } => "UNKNOWN",
        }
    }
}

/// One response frame.
#[derive(Clone, PartialEq, Eq)]
pub enum Reply {
    /// `[INSYNC|NOSYNC, payload…, OK]` — the shape of nearly every reply.
    Framed { in_sync: bool, payload: Vec<u8> },
    /// `[INSYNC|NOSYNC, result]` — the legacy page-write reply, where
    /// `result` is OK or FAILED.
    Status { in_sync: bool, result: u8 },
    /// Bare NOSYNC byte: resync probe or unsupported opcode.
    OutOfSync,
    /// Bare FAILED byte: the frame itself could not be decoded.
    Malformed,
}

impl Reply {
    pub fn empty(in_sync: bool) -> Self {
        Reply::Framed {
            in_sync,
            payload: Vec::new(),
        }
    }

    pub fn byte(in_sync: bool, b: u8) -> Self {
        Reply::Framed {
            in_sync,
            payload: vec![b],
        }
    }

    pub fn in_sync(&self) -> bool {
        match self {
            Reply::Framed { in_sync, .. } | Reply::Status { in_sync, .. } => *in_sync,
            Reply::OutOfSync | Reply::Malformed => false,
        }
    }

    pub fn into_raw(self) -> Vec<u8> {
        match self {
            Reply::Framed { in_sync, payload } => {
                let mut buf = Vec::with_capacity(payload.len() + 2);
                buf.push(if in_sync {
                    responses::INSYNC
                } else {
                    responses::NOSYNC
                });
                buf.extend_from_slice(&payload);
                buf.push(responses::OK);
                buf
            }
            Reply::Status { in_sync, result } => {
                let status = if in_sync {
                    responses::INSYNC
                } else {
                    responses::NOSYNC
                };
                vec![status, result]
            }
            Reply::OutOfSync => vec![responses::NOSYNC],
            Reply::Malformed => vec![responses::FAILED],
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Framed { in_sync, payload } => {
                write!(f, "Framed(in_sync={}, [{}])", in_sync, hex::encode(payload))
            }
            Reply::Status { in_sync, result } => {
                write!(f, "Status(in_sync={}, 0x{:02x})", in_sync, result)
            }
            Reply::OutOfSync => write!(f, "OutOfSync"),
            Reply::Malformed => write!(f, "Malformed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_sync_with_marker() {
        let cmd = Command::parse(&[0x30, 0x20]).unwrap();
        assert_eq!(cmd, Command::GetSync { sync: true });
    }

    #[test]
    fn get_sync_missing_marker() {
        assert_eq!(
            Command::parse(&[0x30]).unwrap(),
            Command::GetSync { sync: false }
        );
        // a stray parameter byte is just as much a desync
        assert_eq!(
            Command::parse(&[0x30, 0x31]).unwrap(),
            Command::GetSync { sync: false }
        );
    }

    #[test]
    fn load_address_is_little_endian() {
        let cmd = Command::parse(&[0x55, 0x10, 0x02, 0x20]).unwrap();
        assert_eq!(
            cmd,
            Command::LoadAddress {
                addr: 0x0210,
                sync: true
            }
        );
    }

    #[test]
    fn marker_as_opcode_is_desync() {
        assert_eq!(Command::parse(&[0x20]).unwrap(), Command::Desync);
    }

    #[test]
    fn unknown_opcode_consumes_resync_byte() {
        assert_eq!(
            Command::parse(&[0x52, 0x20]).unwrap(),
            Command::Unknown { opcode: 0x52 }
        );
        // no byte after the opcode at all
        assert_eq!(
            Command::parse(&[0x52]).unwrap(),
            Command::Unknown { opcode: 0x52 }
        );
    }

    #[test]
    fn program_page_carries_payload() {
        let mut frame = vec![0x64, 0x00, 0x04, b'F'];
        frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        frame.push(0x20);
        match Command::parse(&frame).unwrap() {
            Command::ProgramPage { mem, data, sync } => {
                assert_eq!(mem, MemType::Flash);
                assert_eq!(data, vec![0xde, 0xad, 0xbe, 0xef]);
                assert!(sync);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn program_page_truncated_payload() {
        let frame = [0x64, 0x00, 0x04, b'E', 0xaa, 0xbb];
        assert_eq!(
            Command::parse(&frame),
            Err(FrameError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn page_length_bounded_by_buffer() {
        // 0x0101 = 257 bytes, one past the buffer
        let frame = [0x74, 0x01, 0x01, b'F', 0x20];
        assert_eq!(Command::parse(&frame), Err(FrameError::Oversize { len: 257 }));
    }

    #[test]
    fn page_rejects_unknown_memory_space() {
        let frame = [0x74, 0x00, 0x10, b'X', 0x20];
        assert_eq!(
            Command::parse(&frame),
            Err(FrameError::BadMemType { raw: b'X' })
        );
    }

    #[test]
    fn universal_takes_whole_instruction() {
        let cmd = Command::parse(&[0x56, 0xac, 0x53, 0x00, 0x00, 0x20]).unwrap();
        assert_eq!(
            cmd,
            Command::Universal {
                instruction: [0xac, 0x53, 0x00, 0x00],
                sync: true
            }
        );
    }

    #[test]
    fn empty_body_is_truncated() {
        assert!(matches!(
            Command::parse(&[]),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn reply_framing() {
        assert_eq!(Reply::empty(true).into_raw(), vec![0x14, 0x10]);
        assert_eq!(Reply::empty(false).into_raw(), vec![0x15, 0x10]);
        assert_eq!(Reply::byte(true, 0x42).into_raw(), vec![0x14, 0x42, 0x10]);
        assert_eq!(
            Reply::Status {
                in_sync: true,
                result: 0x10
            }
            .into_raw(),
            vec![0x14, 0x10]
        );
        assert_eq!(Reply::OutOfSync.into_raw(), vec![0x15]);
        assert_eq!(Reply::Malformed.into_raw(), vec![0x11]);
    }
}

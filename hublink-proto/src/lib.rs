//! Pybricks hub wire protocol - command encoding, event decoding and the
//! capability record read from the hub after connecting.
//!
//! Everything on the wire is little-endian. Commands are write-only (host to
//! hub), events arrive as notifications on the control characteristic with a
//! one-byte discriminator prefix.

/// Pybricks GATT Service UUID
pub const PYBRICKS_SERVICE_UUID: &str = "c5f50001-8280-46da-89f4-6d8051e4aeef";

/// Control/event characteristic UUID (write commands, receive notifications)
pub const PYBRICKS_CONTROL_EVENT_UUID: &str = "c5f50002-8280-46da-89f4-6d8051e4aeef";

/// Hub capabilities characteristic UUID (read once after connect)
pub const PYBRICKS_HUB_CAPABILITIES_UUID: &str = "c5f50003-8280-46da-89f4-6d8051e4aeef";

/// Command opcodes
pub mod commands {
    /// Stop the user program, if any is running
    pub const STOP_USER_PROGRAM: u8 = 0x00;

    /// Start the downloaded user program (legacy, no program id payload)
    pub const START_USER_PROGRAM: u8 = 0x01;

    /// Declare the total size of the user program about to be transferred.
    /// Size 0 clears any previously accepted program.
    pub const WRITE_USER_PROGRAM_META: u8 = 0x03;

    /// Write a chunk of the user program at a byte offset
    pub const WRITE_USER_RAM: u8 = 0x04;
}

/// Event discriminators (first byte of a notification frame)
pub mod events {
    pub const STATUS_REPORT: u8 = 0x00;
    pub const WRITE_STDOUT: u8 = 0x01;
}

/// Status report flag bit: a user program is currently running
pub const FLAG_USER_PROGRAM_RUNNING: u32 = 1 << 6;

/// Fixed header size of a WRITE_USER_RAM command: opcode + u32 offset.
/// Chunks must fit in `max_write_size - WRITE_USER_RAM_HEADER` bytes.
pub const WRITE_USER_RAM_HEADER: usize = 5;

/// A command sent to the hub over the control characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StopUserProgram,
    LegacyStartUserProgram,
    WriteUserProgramMeta { size: u32 },
    WriteUserRam { offset: u32, payload: Vec<u8> },
}

impl Command {
    /// Encode to the wire form. Every variant has exactly one encoding.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::StopUserProgram => vec![commands::STOP_USER_PROGRAM],
            Command::LegacyStartUserProgram => vec![commands::START_USER_PROGRAM],
            Command::WriteUserProgramMeta { size } => {
                let mut buf = Vec::with_capacity(5);
                buf.push(commands::WRITE_USER_PROGRAM_META);
                buf.extend_from_slice(&size.to_le_bytes());
                buf
            }
            Command::WriteUserRam { offset, payload } => {
                let mut buf = Vec::with_capacity(WRITE_USER_RAM_HEADER + payload.len());
                buf.push(commands::WRITE_USER_RAM);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(payload);
                buf
            }
        }
    }
}

/// Decode failure for a notification frame. These are soft errors: the
/// dispatcher logs and drops the frame, the connection stays up.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty notification frame")]
    Empty,
    #[error("unknown event type 0x{0:02x}")]
    UnknownEvent(u8),
    #[error("event 0x{event:02x} payload too short: {len} bytes")]
    Truncated { event: u8, len: usize },
    #[error("capability record too short: {0} bytes")]
    ShortCapabilities(usize),
}

/// A notification pushed by the hub on the control characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StatusReport { flags: u32 },
    WriteStdout(Vec<u8>),
}

impl Event {
    /// Decode a raw notification frame. The first byte discriminates the
    /// event type, the rest is the payload.
    pub fn decode(data: &[u8]) -> Result<Event, FrameError> {
        let (&event, payload) = data.split_first().ok_or(FrameError::Empty)?;
        match event {
            events::STATUS_REPORT => {
                if payload.len() < 4 {
                    return Err(FrameError::Truncated { event, len: payload.len() });
                }
                let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Event::StatusReport { flags })
            }
            events::WRITE_STDOUT => Ok(Event::WriteStdout(payload.to_vec())),
            other => Err(FrameError::UnknownEvent(other)),
        }
    }
}

/// Transfer limits the hub advertises on the capabilities characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Largest single characteristic write the hub accepts
    pub max_write_size: u16,
    /// Largest user program the hub will store
    pub max_user_program_size: u32,
}

impl Capabilities {
    /// Parse the fixed-layout capability record: u16 max write size at
    /// offset 0, u32 max program size at offset 6.
    pub fn from_bytes(data: &[u8]) -> Result<Capabilities, FrameError> {
        if data.len() < 10 {
            return Err(FrameError::ShortCapabilities(data.len()));
        }
        Ok(Capabilities {
            max_write_size: u16::from_le_bytes([data[0], data[1]]),
            max_user_program_size: u32::from_le_bytes([data[6], data[7], data[8], data[9]]),
        })
    }
}

/// Append one module record to a multi-module program blob:
/// `[u32 LE compiled length][module name][NUL][compiled bytes]`.
pub fn append_module(blob: &mut Vec<u8>, name: &str, mpy: &[u8]) {
    blob.extend_from_slice(&(mpy.len() as u32).to_le_bytes());
    blob.extend_from_slice(name.as_bytes());
    blob.push(0);
    blob.extend_from_slice(mpy);
}

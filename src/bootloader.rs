//! Bootloader command framing.
//!
//! A command frame is `[cmd][len][payload; len][checksum]`. The bootloader
//! answers in the same window with `[status][len][payload; len][checksum]`;
//! while it is still busy the status byte keeps echoing the pending command.

use crate::ProtocolError;

/// Largest payload carried by one frame, and the patch upload chunk size.
pub const CHUNK_SIZE: usize = 128;

/// Largest encoded frame: header, full chunk and checksum.
pub const MAX_FRAME_LEN: usize = CHUNK_SIZE + 3;

/// `0xFF XOR (sum(bytes) mod 256)`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0xFF ^ sum
}

/// An encoded bootloader command frame.
#[derive(Clone)]
pub struct CommandFrame {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl CommandFrame {
    /// Encodes `cmd` with `payload`.
    ///
    /// The checksum byte covers the command, length and payload bytes.
    ///
    /// # Errors
    ///
    /// * `Err(ProtocolError::PayloadTooLong)` - if `payload` exceeds [`CHUNK_SIZE`]
    pub fn new(cmd: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > CHUNK_SIZE {
            return Err(ProtocolError::PayloadTooLong(payload.len()));
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        buf[0] = cmd;
        #[allow(clippy::cast_possible_truncation)]
        {
            buf[1] = payload.len() as u8;
        }
        buf[2..2 + payload.len()].copy_from_slice(payload);
        let body = 2 + payload.len();
        buf[body] = checksum(&buf[..body]);
        Ok(Self {
            buf,
            len: body + 1,
        })
    }

    /// Command byte.
    #[must_use]
    pub fn command(&self) -> u8 {
        self.buf[0]
    }

    /// The wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Outcome of one read of the response window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    /// The status byte still echoes the pending command.
    Pending,
    /// Validated response payload.
    Done(&'a [u8]),
}

/// Number of bytes to read from the window for a response carrying `payload_len` bytes.
#[must_use]
pub const fn response_len(payload_len: usize) -> usize {
    payload_len + 3
}

/// Validates a raw response window for the command `cmd`.
///
/// A successful response has status `0`, the expected payload length, and a
/// checksum over the length byte and payload.
///
/// # Errors
///
/// * `Err(ProtocolError::BootloaderStatus)` - the bootloader reported a non-zero status
/// * `Err(ProtocolError::BootloaderLength)` - the payload length differs from `payload_len`
/// * `Err(ProtocolError::BootloaderChecksum)` - the checksum does not match
pub fn parse_response(cmd: u8, payload_len: usize, rx: &[u8]) -> Result<Response<'_>, ProtocolError> {
    if rx.len() < response_len(payload_len) {
        return Err(ProtocolError::BootloaderLength {
            expected: payload_len,
            actual: rx.len().saturating_sub(3),
        });
    }
    let status = rx[0];
    if status == cmd {
        return Ok(Response::Pending);
    }
    if status != 0 {
        return Err(ProtocolError::BootloaderStatus(status));
    }
    let actual = usize::from(rx[1]);
    if actual != payload_len {
        return Err(ProtocolError::BootloaderLength {
            expected: payload_len,
            actual,
        });
    }
    let expected = checksum(&rx[1..2 + payload_len]);
    let received = rx[2 + payload_len];
    if received != expected {
        return Err(ProtocolError::BootloaderChecksum { expected, received });
    }
    Ok(Response::Done(&rx[2..2 + payload_len]))
}

/// Firmware patch uploaded when the device boots into its bootloader.
///
/// The image is the vendor RAM patch; this crate does not ship it.
#[derive(Debug, Clone, Copy)]
pub struct PatchImage<'a> {
    /// RAM address the image is loaded at (low 16 bits).
    pub load_address: u16,
    /// Image bytes.
    pub data: &'a [u8],
}

impl<'a> PatchImage<'a> {
    /// Creates a patch description.
    #[must_use]
    pub const fn new(load_address: u16, data: &'a [u8]) -> Self {
        Self { load_address, data }
    }

    /// Upload chunks of at most [`CHUNK_SIZE`] bytes, in order.
    pub fn chunks(&self) -> core::slice::Chunks<'a, u8> {
        self.data.chunks(CHUNK_SIZE)
    }

    /// Number of chunks the upload takes.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(CHUNK_SIZE)
    }
}

//! RFC 6455 frame codec.
//!
//! Wire format (RFC 6455 §5.2):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! All multi-byte integers are big-endian.
//!
//! # Length discovery (for beginners)
//!
//! A frame does not announce its total size up front.  The reader has to look
//! at the 7-bit length field in byte 1 first:
//!
//! - `0..=125` – that *is* the payload length.
//! - `126`     – the real length follows in the next 2 bytes.
//! - `127`     – the real length follows in the next 8 bytes.
//!
//! Only after those extra bytes (and the optional 4-byte mask key) have
//! arrived is the full frame size known.  [`peek_header`] performs exactly
//! this two-phase discovery so that a stream reader can buffer partial frames
//! without guessing.

use thiserror::Error;

/// Largest payload length that fits directly in the 7-bit length field.
pub const MAX_INLINE_LEN: usize = 125;

/// Smallest possible frame header: flags/opcode byte + mask/length byte.
pub const MIN_HEADER_LEN: usize = 2;

/// Size of the client masking key.
pub const MASK_KEY_LEN: usize = 4;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;
const LEN_16_MARKER: u8 = 126;
const LEN_64_MARKER: u8 = 127;

/// Errors that can occur while decoding a frame.
///
/// Every variant is a *protocol error*: the peer sent bytes that this server
/// cannot interpret, and the connection should be closed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The byte slice is shorter than the frame header.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The header declares more payload than the buffer holds.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: u64, available: usize },

    /// The low 4 bits of byte 0 are a reserved opcode.
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// RSV1–RSV3 are set although no extension was negotiated.
    #[error("reserved bits set: 0x{0:02X}")]
    ReservedBitsSet(u8),

    /// The 64-bit length field has its most significant bit set.
    #[error("invalid 64-bit payload length: {0}")]
    InvalidLength(u64),

    /// The declared payload is larger than the receiver is willing to buffer.
    #[error("payload of {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge { declared: u64, limit: usize },
}

/// Frame opcode (low 4 bits of byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text message.
    Text = 0x1,
    /// Binary message.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping (must be answered with a Pong).
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl Opcode {
    /// Returns `true` for Close, Ping and Pong.
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// One decoded WebSocket frame.
///
/// The payload of a decoded frame is always *unmasked*; `mask_key` records
/// the key that was on the wire so callers can tell client frames apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; MASK_KEY_LEN]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Creates a final, unmasked text frame.
    pub fn text(text: &str) -> Self {
        Self::new(Opcode::Text, text.as_bytes())
    }

    /// Returns the same frame masked with `key`, as a client would send it.
    pub fn masked(mut self, key: [u8; MASK_KEY_LEN]) -> Self {
        self.mask_key = Some(key);
        self
    }

    /// Serializes the frame, honouring `fin` and `mask_key`.
    ///
    /// Server-originated frames should use [`encode_frame`], which is the
    /// unmasked, always-final fast path.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(encoded_len(self.payload.len()) + MASK_KEY_LEN);
        let fin = if self.fin { FIN_BIT } else { 0 };
        buf.push(fin | self.opcode as u8);
        let mask = if self.mask_key.is_some() { MASK_BIT } else { 0 };
        write_length(&mut buf, self.payload.len(), mask);

        match self.mask_key {
            Some(key) => {
                buf.extend_from_slice(&key);
                let start = buf.len();
                buf.extend_from_slice(&self.payload);
                apply_mask(&mut buf[start..], key);
            }
            None => buf.extend_from_slice(&self.payload),
        }
        buf
    }
}

/// The fixed part of a frame, available before the payload has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; MASK_KEY_LEN]>,
    /// Bytes occupied by the header, including extended length and mask key.
    pub header_len: usize,
    /// Declared payload length.
    pub payload_len: u64,
}

impl FrameHeader {
    /// Total on-wire size of the frame, or `None` if it does not fit in `usize`.
    pub fn frame_len(&self) -> Option<usize> {
        usize::try_from(self.payload_len)
            .ok()?
            .checked_add(self.header_len)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `payload` as a single final, unmasked frame.
///
/// Byte 0 is `0x80 | opcode`; the length uses the inline, 16-bit or 64-bit
/// form depending on the payload size.
///
/// # Examples
///
/// ```rust
/// use wshub_core::protocol::frame::{encode_frame, Opcode};
///
/// let bytes = encode_frame(b"hi", Opcode::Text);
/// assert_eq!(bytes, vec![0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode_frame(payload: &[u8], opcode: Opcode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(payload.len()));
    buf.push(FIN_BIT | opcode as u8);
    write_length(&mut buf, payload.len(), 0);
    buf.extend_from_slice(payload);
    buf
}

/// Inspects the start of `bytes` and returns the frame header once every
/// header byte is present.
///
/// Returns `Ok(None)` when more bytes are needed to know the frame size.
///
/// # Errors
///
/// Returns [`FrameError`] if the header is malformed (reserved bits, unknown
/// opcode, invalid 64-bit length).
pub fn peek_header(bytes: &[u8]) -> Result<Option<FrameHeader>, FrameError> {
    match parse_header(bytes)? {
        HeaderParse::Complete(header) => Ok(Some(header)),
        HeaderParse::Incomplete { .. } => Ok(None),
    }
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame (with its payload unmasked) and the number of bytes
/// consumed, so the caller can advance a read cursor past it.
///
/// # Errors
///
/// Returns [`FrameError::InsufficientData`] if the header itself is cut off,
/// and [`FrameError::PayloadLengthMismatch`] if the declared payload length
/// exceeds the bytes actually available.
///
/// # Examples
///
/// ```rust
/// use wshub_core::protocol::frame::{decode_frame, encode_frame, Opcode};
///
/// let bytes = encode_frame(b"hello", Opcode::Text);
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame.payload, b"hello");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    let header = match parse_header(bytes)? {
        HeaderParse::Complete(header) => header,
        HeaderParse::Incomplete { needed } => {
            return Err(FrameError::InsufficientData {
                needed,
                available: bytes.len(),
            })
        }
    };

    let available = bytes.len() - header.header_len;
    let payload_len = match usize::try_from(header.payload_len) {
        Ok(len) if len <= available => len,
        _ => {
            return Err(FrameError::PayloadLengthMismatch {
                declared: header.payload_len,
                available,
            })
        }
    };

    let end = header.header_len + payload_len;
    let mut payload = bytes[header.header_len..end].to_vec();
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, key);
    }

    Ok((
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            mask_key: header.mask_key,
            payload,
        },
        end,
    ))
}

/// XORs `payload` in place with `key`, cycling through the 4 key bytes.
///
/// Masking is its own inverse: applying the same key twice restores the
/// original bytes.
pub fn apply_mask(payload: &mut [u8], key: [u8; MASK_KEY_LEN]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % MASK_KEY_LEN];
    }
}

/// Size of an unmasked frame carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    MIN_HEADER_LEN + extended_len_size(payload_len) + payload_len
}

// ── Header helpers ────────────────────────────────────────────────────────────

enum HeaderParse {
    Complete(FrameHeader),
    Incomplete { needed: usize },
}

fn parse_header(bytes: &[u8]) -> Result<HeaderParse, FrameError> {
    if bytes.len() < MIN_HEADER_LEN {
        return Ok(HeaderParse::Incomplete {
            needed: MIN_HEADER_LEN,
        });
    }

    let b0 = bytes[0];
    let b1 = bytes[1];

    let rsv = b0 & RSV_BITS;
    if rsv != 0 {
        return Err(FrameError::ReservedBitsSet(rsv));
    }
    let opcode = Opcode::try_from(b0 & OPCODE_BITS)?;
    let fin = b0 & FIN_BIT != 0;
    let masked = b1 & MASK_BIT != 0;
    let len7 = b1 & LEN_BITS;

    let ext_len = match len7 {
        LEN_16_MARKER => 2,
        LEN_64_MARKER => 8,
        _ => 0,
    };
    let mask_len = if masked { MASK_KEY_LEN } else { 0 };
    let header_len = MIN_HEADER_LEN + ext_len + mask_len;
    if bytes.len() < header_len {
        return Ok(HeaderParse::Incomplete { needed: header_len });
    }

    let payload_len = match len7 {
        LEN_16_MARKER => u64::from(u16::from_be_bytes([bytes[2], bytes[3]])),
        LEN_64_MARKER => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(FrameError::InvalidLength(len));
            }
            len
        }
        inline => u64::from(inline),
    };

    let mask_key = masked.then(|| {
        let start = header_len - MASK_KEY_LEN;
        [bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]]
    });

    Ok(HeaderParse::Complete(FrameHeader {
        fin,
        opcode,
        mask_key,
        header_len,
        payload_len,
    }))
}

fn extended_len_size(payload_len: usize) -> usize {
    if payload_len <= MAX_INLINE_LEN {
        0
    } else if payload_len <= usize::from(u16::MAX) {
        2
    } else {
        8
    }
}

/// Writes byte 1 (with `mask_bit` OR-ed in) and any extended length bytes.
fn write_length(buf: &mut Vec<u8>, len: usize, mask_bit: u8) {
    if len <= MAX_INLINE_LEN {
        buf.push(mask_bit | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        buf.push(mask_bit | LEN_16_MARKER);
        buf.extend_from_slice(&short.to_be_bytes());
    } else {
        buf.push(mask_bit | LEN_64_MARKER);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

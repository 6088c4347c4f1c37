//! Resumable WebSocket frame reader
//!
//! The reader is a state machine fed with whatever bytes the socket
//! delivered so far. Each call consumes as much input as it can, writes
//! unmasked payload bytes into the caller's buffer and reports why it
//! stopped:
//!
//! ```text
//! Opcode ─► PayloadLength ─► [ExtendedLength] ─► [MaskingKey] ─► Payload ─┐
//!   ▲                                                                      │
//!   └──────────────────────────── FrameComplete ◄──────────────────────────┘
//! ```
//!
//! A zero length frame completes right after its header. Control frame
//! payloads never reach the caller's buffer; they are collected in a small
//! side buffer so a Close frame arriving between two fragments of a data
//! message does not disturb the data already delivered.

use super::frame::{
    FrameError, Opcode, FIN_BIT, LEN_16, LEN_64, LEN_BITS, MASK_BIT, MAX_CONTROL_PAYLOAD,
    OPCODE_BITS, RSV_BITS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Opcode,
    PayloadLength,
    ExtendedLength,
    MaskingKey,
    Payload,
}

/// Why a [`FrameReader::read`] call returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// All input was consumed and the current frame is not complete yet
    NeedMoreInput,
    /// The output buffer is full while payload bytes remain
    BufferFull,
    /// A frame ended. Inspect the reader for its opcode and flags.
    FrameComplete,
}

/// Bytes consumed from the input and written to the output by one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadProgress {
    pub consumed: usize,
    pub written: usize,
    pub status: ReadStatus,
}

/// Incremental RFC 6455 frame decoder
#[derive(Debug)]
pub struct FrameReader {
    state: ReadState,
    max_payload: u64,

    fin: bool,
    opcode: Opcode,
    /// Text or Binary of the data message currently being received
    message_opcode: Option<Opcode>,
    /// Data opcode the last completed data frame belonged to
    last_message_opcode: Opcode,
    end_of_message: bool,

    len_buf: [u8; 8],
    len_needed: usize,
    len_read: usize,

    masked: bool,
    mask: [u8; 4],
    mask_read: usize,

    payload_len: u64,
    payload_pos: u64,

    control: [u8; MAX_CONTROL_PAYLOAD],
    control_len: usize,
    close_status: Option<u16>,
    close_description: Option<String>,
}

impl FrameReader {
    /// Create a reader rejecting frames with payloads above `max_payload`
    pub fn new(max_payload: u64) -> Self {
        Self {
            state: ReadState::Opcode,
            max_payload,
            fin: false,
            opcode: Opcode::Continuation,
            message_opcode: None,
            last_message_opcode: Opcode::Text,
            end_of_message: false,
            len_buf: [0; 8],
            len_needed: 0,
            len_read: 0,
            masked: false,
            mask: [0; 4],
            mask_read: 0,
            payload_len: 0,
            payload_pos: 0,
            control: [0; MAX_CONTROL_PAYLOAD],
            control_len: 0,
            close_status: None,
            close_description: None,
        }
    }

    /// Opcode of the most recent frame
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Text or Binary for the data message the last data frame belonged to
    pub fn message_opcode(&self) -> Opcode {
        self.last_message_opcode
    }

    /// Whether the last completed frame ended its message
    pub fn end_of_message(&self) -> bool {
        self.end_of_message
    }

    /// Payload length declared by the current frame header
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Status code of the last Close frame
    pub fn close_status(&self) -> Option<u16> {
        self.close_status
    }

    /// Reason text of the last Close frame
    pub fn close_status_description(&self) -> Option<&str> {
        self.close_description.as_deref()
    }

    /// Payload of the last completed control frame
    pub fn control_payload(&self) -> &[u8] {
        &self.control[..self.control_len]
    }

    /// True between frames when no fragmented message is open
    pub fn is_idle(&self) -> bool {
        self.state == ReadState::Opcode && self.message_opcode.is_none()
    }

    /// Feed `input` and write payload bytes into `output`.
    ///
    /// Returns after the first completed frame, when `output` is full, or
    /// when `input` is exhausted. Resuming with the unconsumed input (and
    /// any output space) continues exactly where the previous call stopped.
    pub fn read(&mut self, input: &[u8], output: &mut [u8]) -> Result<ReadProgress, FrameError> {
        let mut consumed = 0;
        let mut written = 0;

        loop {
            match self.state {
                ReadState::Opcode => {
                    let Some(&byte) = input.get(consumed) else {
                        return Ok(progress(consumed, written, ReadStatus::NeedMoreInput));
                    };
                    consumed += 1;
                    self.begin_frame(byte)?;
                }
                ReadState::PayloadLength => {
                    let Some(&byte) = input.get(consumed) else {
                        return Ok(progress(consumed, written, ReadStatus::NeedMoreInput));
                    };
                    consumed += 1;
                    self.masked = byte & MASK_BIT != 0;
                    match byte & LEN_BITS {
                        LEN_16 => self.expect_extended_length(2),
                        LEN_64 => self.expect_extended_length(8),
                        len => {
                            if self.set_payload_len(u64::from(len))? {
                                return Ok(progress(consumed, written, ReadStatus::FrameComplete));
                            }
                        }
                    }
                }
                ReadState::ExtendedLength => {
                    let take = (self.len_needed - self.len_read).min(input.len() - consumed);
                    if take == 0 {
                        return Ok(progress(consumed, written, ReadStatus::NeedMoreInput));
                    }
                    self.len_buf[self.len_read..self.len_read + take]
                        .copy_from_slice(&input[consumed..consumed + take]);
                    consumed += take;
                    self.len_read += take;

                    if self.len_read == self.len_needed {
                        let len = if self.len_needed == 2 {
                            u64::from(u16::from_be_bytes([self.len_buf[0], self.len_buf[1]]))
                        } else {
                            let len = u64::from_be_bytes(self.len_buf);
                            if len >> 63 != 0 {
                                return Err(FrameError::LengthOverflow);
                            }
                            len
                        };
                        if self.set_payload_len(len)? {
                            return Ok(progress(consumed, written, ReadStatus::FrameComplete));
                        }
                    }
                }
                ReadState::MaskingKey => {
                    let take = (4 - self.mask_read).min(input.len() - consumed);
                    if take == 0 {
                        return Ok(progress(consumed, written, ReadStatus::NeedMoreInput));
                    }
                    self.mask[self.mask_read..self.mask_read + take]
                        .copy_from_slice(&input[consumed..consumed + take]);
                    consumed += take;
                    self.mask_read += take;

                    if self.mask_read == 4 && self.enter_payload()? {
                        return Ok(progress(consumed, written, ReadStatus::FrameComplete));
                    }
                }
                ReadState::Payload => {
                    if consumed == input.len() {
                        return Ok(progress(consumed, written, ReadStatus::NeedMoreInput));
                    }
                    let remaining = self.payload_len - self.payload_pos;
                    let available = input.len() - consumed;

                    let take = if self.opcode.is_control() {
                        let take = clamp(remaining, available);
                        let start = self.control_len;
                        unmask(
                            &input[consumed..consumed + take],
                            &mut self.control[start..start + take],
                            self.mask,
                            self.payload_pos,
                        );
                        self.control_len += take;
                        take
                    } else {
                        if written == output.len() {
                            return Ok(progress(consumed, written, ReadStatus::BufferFull));
                        }
                        let take = clamp(remaining, available).min(output.len() - written);
                        unmask(
                            &input[consumed..consumed + take],
                            &mut output[written..written + take],
                            self.mask,
                            self.payload_pos,
                        );
                        written += take;
                        take
                    };

                    consumed += take;
                    self.payload_pos += take as u64;

                    if self.payload_pos == self.payload_len {
                        self.finish_frame()?;
                        return Ok(progress(consumed, written, ReadStatus::FrameComplete));
                    }
                }
            }
        }
    }

    fn begin_frame(&mut self, byte: u8) -> Result<(), FrameError> {
        if byte & RSV_BITS != 0 {
            return Err(FrameError::ReservedBits);
        }
        let raw = byte & OPCODE_BITS;
        let opcode = Opcode::from_u8(raw).ok_or(FrameError::UnknownOpcode(raw))?;
        let fin = byte & FIN_BIT != 0;

        match opcode {
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                if !fin {
                    return Err(FrameError::FragmentedControlFrame);
                }
                self.control_len = 0;
            }
            Opcode::Continuation => {
                if self.message_opcode.is_none() {
                    return Err(FrameError::UnexpectedContinuation);
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.message_opcode.is_some() {
                    return Err(FrameError::ExpectedContinuation);
                }
                self.message_opcode = Some(opcode);
            }
        }

        self.fin = fin;
        self.opcode = opcode;
        self.end_of_message = false;
        self.masked = false;
        self.mask = [0; 4];
        self.mask_read = 0;
        self.len_read = 0;
        self.payload_len = 0;
        self.payload_pos = 0;
        self.state = ReadState::PayloadLength;
        Ok(())
    }

    fn expect_extended_length(&mut self, bytes: usize) {
        self.len_needed = bytes;
        self.len_read = 0;
        self.state = ReadState::ExtendedLength;
    }

    /// Returns true when the frame completed (zero length payload)
    fn set_payload_len(&mut self, len: u64) -> Result<bool, FrameError> {
        if self.opcode.is_control() && len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLong(len));
        }
        if len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                len,
                limit: self.max_payload,
            });
        }
        self.payload_len = len;
        if self.masked {
            self.state = ReadState::MaskingKey;
            Ok(false)
        } else {
            self.enter_payload()
        }
    }

    fn enter_payload(&mut self) -> Result<bool, FrameError> {
        if self.payload_len == 0 {
            self.finish_frame()?;
            return Ok(true);
        }
        self.state = ReadState::Payload;
        Ok(false)
    }

    fn finish_frame(&mut self) -> Result<(), FrameError> {
        self.state = ReadState::Opcode;

        if self.opcode.is_control() {
            self.end_of_message = true;
            if self.opcode == Opcode::Close {
                self.finish_close()?;
            }
            return Ok(());
        }

        if let Some(message_opcode) = self.message_opcode {
            self.last_message_opcode = message_opcode;
        }
        self.end_of_message = self.fin;
        if self.fin {
            self.message_opcode = None;
        }
        Ok(())
    }

    fn finish_close(&mut self) -> Result<(), FrameError> {
        let payload = &self.control[..self.control_len];
        match payload.len() {
            0 => {
                self.close_status = None;
                self.close_description = None;
            }
            1 => return Err(FrameError::InvalidClosePayload),
            _ => {
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| FrameError::InvalidClosePayload)?;
                self.close_status = Some(u16::from_be_bytes([payload[0], payload[1]]));
                self.close_description = Some(reason.to_string());
            }
        }
        Ok(())
    }
}

/// XOR `src` into `dst` with the key byte chosen by the absolute payload
/// position, so a frame split across calls unmasks the same as a whole one.
/// An unmasked frame has an all-zero key.
fn unmask(src: &[u8], dst: &mut [u8], mask: [u8; 4], payload_pos: u64) {
    let phase = (payload_pos % 4) as usize;
    for (i, (out, byte)) in dst.iter_mut().zip(src).enumerate() {
        *out = byte ^ mask[(phase + i) % 4];
    }
}

fn progress(consumed: usize, written: usize, status: ReadStatus) -> ReadProgress {
    ReadProgress {
        consumed,
        written,
        status,
    }
}

fn clamp(remaining: u64, available: usize) -> usize {
    remaining.min(available as u64) as usize
}

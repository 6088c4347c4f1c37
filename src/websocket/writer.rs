//! WebSocket frame writer

use bytes::{BufMut, BytesMut};

use super::frame::{Opcode, Role, FIN_BIT, LEN_16, LEN_64, MASK_BIT, MAX_CONTROL_PAYLOAD};

/// Encodes frames for one endpoint role
#[derive(Debug, Clone, Copy)]
pub struct FrameWriter {
    role: Role,
}

impl FrameWriter {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Append one frame to `dst`. Client frames get a fresh masking key.
    pub fn write_frame(&self, opcode: Opcode, fin: bool, payload: &[u8], dst: &mut BytesMut) {
        let mask = match self.role {
            Role::Server => None,
            Role::Client => Some(rand::random::<[u8; 4]>()),
        };
        encode_frame(opcode, fin, payload, mask, dst);
    }

    /// Append a complete single-frame message
    pub fn write_message(&self, opcode: Opcode, payload: &[u8], dst: &mut BytesMut) {
        self.write_frame(opcode, true, payload, dst);
    }

    /// Append a Close frame. The reason is cut to fit a control frame.
    pub fn write_close(&self, status: u16, reason: &str, dst: &mut BytesMut) {
        let reason = truncate_utf8(reason, MAX_CONTROL_PAYLOAD - 2);
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&status.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.write_frame(Opcode::Close, true, &payload, dst);
    }
}

/// Encode a frame with an explicit masking key
pub fn encode_frame(
    opcode: Opcode,
    fin: bool,
    payload: &[u8],
    mask: Option<[u8; 4]>,
    dst: &mut BytesMut,
) {
    let len = payload.len();
    dst.reserve(14 + len);

    let first = (if fin { FIN_BIT } else { 0 }) | opcode.as_u8();
    dst.put_u8(first);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len < LEN_16 as usize {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(mask_bit | LEN_16);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | LEN_64);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            dst.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => dst.put_slice(payload),
    }
}

fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_frames_are_unmasked() {
        let mut buf = BytesMut::new();
        FrameWriter::new(Role::Server).write_message(Opcode::Text, b"hi", &mut buf);
        assert_eq!(&buf[..], &[0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_client_frames_are_masked() {
        let mut buf = BytesMut::new();
        FrameWriter::new(Role::Client).write_message(Opcode::Binary, b"abcd", &mut buf);
        assert_eq!(buf[0], 0x82);
        assert_eq!(buf[1], MASK_BIT | 4);
        let key = [buf[2], buf[3], buf[4], buf[5]];
        let unmasked: Vec<u8> = buf[6..].iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect();
        assert_eq!(unmasked, b"abcd");
    }

    #[test]
    fn test_extended_length_headers() {
        let mut buf = BytesMut::new();
        encode_frame(Opcode::Binary, true, &[0u8; 126], None, &mut buf);
        assert_eq!(&buf[..4], &[0x82, 126, 0x00, 0x7E]);

        buf.clear();
        encode_frame(Opcode::Binary, true, &vec![0u8; 65536], None, &mut buf);
        assert_eq!(&buf[..10], &[0x82, 127, 0, 0, 0, 0, 0, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let mut buf = BytesMut::new();
        FrameWriter::new(Role::Server).write_close(1000, &reason, &mut buf);
        let len = buf[1] as usize;
        assert!(len <= MAX_CONTROL_PAYLOAD);
        assert!(std::str::from_utf8(&buf[4..]).is_ok());
    }
}

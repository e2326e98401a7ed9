//! Minimal framing for mesh datagrams.
//!
//! Nodes send non-confirmable POST messages with a 2-byte token, one Uri-Path
//! option per path segment and the envelope after the 0xFF payload marker.
//! Only the framing lives here: there is no retransmission, no acknowledgment
//! and no observe support.

use crate::error::FrameError;

pub const VERSION: u8 = 1;
pub const TYPE_NON_CONFIRMABLE: u8 = 1;
pub const CODE_POST: u8 = 0x02;
pub const OPTION_URI_PATH: u16 = 11;
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// token every node stamps on its sensor posts
pub const SENSOR_TOKEN: [u8; 2] = *b"tk";

/// one decoded mesh frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub uri_path: Vec<String>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// non-confirmable POST to `resource` (segments split on '/')
    pub fn post(resource: &str, token: &[u8], message_id: u16, payload: &[u8]) -> Self {
        Self {
            kind: TYPE_NON_CONFIRMABLE,
            code: CODE_POST,
            message_id,
            token: token.to_vec(),
            uri_path: resource
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            payload: payload.to_vec(),
        }
    }

    /// uri path joined back with '/'
    pub fn path(&self) -> String {
        self.uri_path.join("/")
    }

    pub fn encode(&self) -> Vec<u8> {
        let tkl = self.token.len().min(8) as u8;
        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        out.push((VERSION << 6) | ((self.kind & 0x03) << 4) | tkl);
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token[..tkl as usize]);

        let mut last = 0u16;
        for segment in &self.uri_path {
            write_option(&mut out, OPTION_URI_PATH - last, segment.as_bytes());
            last = OPTION_URI_PATH;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 4 {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(FrameError::Version(version));
        }
        let kind = (bytes[0] >> 4) & 0x03;
        let tkl = bytes[0] & 0x0F;
        if tkl > 8 {
            return Err(FrameError::TokenLength(tkl));
        }
        let code = bytes[1];
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut pos = 4usize;
        let token_end = pos + tkl as usize;
        if bytes.len() < token_end {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let token = bytes[pos..token_end].to_vec();
        pos = token_end;

        let mut uri_path = Vec::new();
        let mut number = 0u16;
        let mut payload = Vec::new();

        while pos < bytes.len() {
            let head = bytes[pos];
            pos += 1;
            if head == PAYLOAD_MARKER {
                payload = bytes[pos..].to_vec();
                break;
            }

            let delta = read_extended(bytes, &mut pos, head >> 4)?;
            let length = read_extended(bytes, &mut pos, head & 0x0F)? as usize;
            if pos + length > bytes.len() {
                return Err(FrameError::TruncatedOption);
            }
            number = number.saturating_add(delta);
            let value = &bytes[pos..pos + length];
            pos += length;

            if number == OPTION_URI_PATH {
                uri_path.push(String::from_utf8_lossy(value).into_owned());
            }
        }

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            uri_path,
            payload,
        })
    }
}

fn nibble(v: u16) -> (u8, Option<Vec<u8>>) {
    match v {
        0..=12 => (v as u8, None),
        13..=268 => (13, Some(vec![(v - 13) as u8])),
        _ => (14, Some((v - 269).to_be_bytes().to_vec())),
    }
}

fn write_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) {
    let (d, d_ext) = nibble(delta);
    let (l, l_ext) = nibble(value.len().min(u16::MAX as usize) as u16);
    out.push((d << 4) | l);
    if let Some(ext) = d_ext {
        out.extend_from_slice(&ext);
    }
    if let Some(ext) = l_ext {
        out.extend_from_slice(&ext);
    }
    out.extend_from_slice(value);
}

fn read_extended(bytes: &[u8], pos: &mut usize, nib: u8) -> Result<u16, FrameError> {
    match nib {
        0..=12 => Ok(nib as u16),
        13 => {
            let b = *bytes.get(*pos).ok_or(FrameError::TruncatedOption)?;
            *pos += 1;
            Ok(b as u16 + 13)
        }
        14 => {
            let hi = *bytes.get(*pos).ok_or(FrameError::TruncatedOption)?;
            let lo = *bytes.get(*pos + 1).ok_or(FrameError::TruncatedOption)?;
            *pos += 2;
            Ok(u16::from_be_bytes([hi, lo]).saturating_add(269))
        }
        _ => Err(FrameError::ReservedNibble),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_post_layout() {
        let frame = Frame::post("sensor", &SENSOR_TOKEN, 0x1234, b"{}");
        let bytes = frame.encode();
        // ver 1, NON, tkl 2
        assert_eq!(bytes[0], 0b0101_0010);
        assert_eq!(bytes[1], CODE_POST);
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
        assert_eq!(&bytes[4..6], b"tk");
        // uri-path: delta 11, length 6
        assert_eq!(bytes[6], 0xB6);
        assert_eq!(&bytes[7..13], b"sensor");
        assert_eq!(bytes[13], PAYLOAD_MARKER);
        assert_eq!(&bytes[14..], b"{}");

        let back = Frame::decode(&bytes).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.path(), "sensor");
    }

    #[test]
    fn test_multi_segment_and_long_segment() {
        let long = "x".repeat(20);
        let frame = Frame::post(&format!("a/{}", long), &[], 7, b"");
        let back = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(back.uri_path, vec!["a".to_string(), long]);
        assert!(back.payload.is_empty());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Frame::decode(&[0x50]), Err(FrameError::TooShort(1)));
        assert_eq!(Frame::decode(&[0x10, 0, 0, 0]), Err(FrameError::Version(0)));
        assert_eq!(Frame::decode(&[0x59, 0, 0, 0]), Err(FrameError::TokenLength(9)));
        // option claims 6 bytes, only 2 present
        assert_eq!(
            Frame::decode(&[0x50, 0x02, 0, 0, 0xB6, b's', b'e']),
            Err(FrameError::TruncatedOption)
        );
    }
}

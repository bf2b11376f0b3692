//! Wire Codec
//!
//! ```text
//! 000055AA | seqno | command | length | [retcode] body | crc32 / hmac | 0000AA55
//! ```
//!
//! `length` counts every byte after the 16-byte header. Revision 3.3 keeps the
//! version header in front of the ciphertext, revision 3.4 encrypts it along
//! with the payload.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::cipher::{self, EcbCipher, HMAC_LEN};
use super::error::FrameError;
use super::{CommandType, ProtocolSession, ProtocolVersion};

pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;
pub const HEADER_LEN: usize = 16;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const PREFIX_BYTES: [u8; 4] = PREFIX.to_be_bytes();
const SUFFIX_LEN: usize = 4;
const CRC_LEN: usize = 4;
const VERSION_HEADER_LEN: usize = 15;

/// Whether device frames may start their body with a return code.
///
/// Device-originated frames usually do; the client never sends one, so the
/// simulator decodes client frames with [`RetcodeMode::Absent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetcodeMode {
    Auto,
    Absent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub seqno: u32,
    pub command: CommandType,
    pub retcode: Option<u32>,
    /// Decrypted payload without the version header.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(seqno: u32, command: CommandType, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            command,
            retcode: None,
            payload,
        }
    }
}

fn integrity_len(version: ProtocolVersion) -> usize {
    match version {
        ProtocolVersion::V33 => CRC_LEN,
        ProtocolVersion::V34 => HMAC_LEN,
    }
}

pub fn encode_frame(session: &ProtocolSession, frame: &Frame) -> Vec<u8> {
    let version = session.version();
    let cipher = EcbCipher::new(session.key());
    let with_header = frame.command.carries_version_header();

    let encrypted = if frame.payload.is_empty() {
        Vec::new()
    } else {
        match version {
            ProtocolVersion::V33 => {
                let ciphertext = cipher.encrypt(&frame.payload);
                if with_header {
                    let mut out = version.version_header().to_vec();
                    out.extend_from_slice(&ciphertext);
                    out
                } else {
                    ciphertext
                }
            }
            ProtocolVersion::V34 => {
                let mut plaintext = Vec::with_capacity(VERSION_HEADER_LEN + frame.payload.len());
                if with_header {
                    plaintext.extend_from_slice(&version.version_header());
                }
                plaintext.extend_from_slice(&frame.payload);
                cipher.encrypt(&plaintext)
            }
        }
    };

    let retcode_len = if frame.retcode.is_some() { 4 } else { 0 };
    let length = retcode_len + encrypted.len() + integrity_len(version) + SUFFIX_LEN;

    let mut buf = Vec::with_capacity(HEADER_LEN + length);
    buf.put_u32(PREFIX);
    buf.put_u32(frame.seqno);
    buf.put_u32(frame.command.code());
    buf.put_u32(length as u32);
    if let Some(retcode) = frame.retcode {
        buf.put_u32(retcode);
    }
    buf.extend_from_slice(&encrypted);

    match version {
        ProtocolVersion::V33 => {
            let crc = cipher::crc32(&buf);
            buf.put_u32(crc);
        }
        ProtocolVersion::V34 => {
            let tag = cipher::hmac_sha256(session.key(), &buf);
            buf.extend_from_slice(&tag);
        }
    }
    buf.put_u32(SUFFIX);
    buf
}

pub fn decode_frame(
    session: &ProtocolSession,
    raw: &[u8],
    mode: RetcodeMode,
) -> Result<Frame, FrameError> {
    let version = session.version();
    let trailer = integrity_len(version) + SUFFIX_LEN;
    if raw.len() < HEADER_LEN + trailer {
        return Err(FrameError::TooShort(raw.len()));
    }

    let mut header = &raw[..HEADER_LEN];
    if header.get_u32() != PREFIX {
        return Err(FrameError::BadPrefix);
    }
    let seqno = header.get_u32();
    let command_code = header.get_u32();
    let declared = header.get_u32() as usize;
    let available = raw.len() - HEADER_LEN;
    if declared != available || declared < trailer {
        return Err(FrameError::MalformedLength {
            declared,
            available,
        });
    }

    if raw[raw.len() - SUFFIX_LEN..] != SUFFIX.to_be_bytes() {
        return Err(FrameError::BadSuffix);
    }

    let signed_end = raw.len() - trailer;
    let signed = &raw[..signed_end];
    let integrity = &raw[signed_end..raw.len() - SUFFIX_LEN];
    let intact = match version {
        ProtocolVersion::V33 => cipher::crc32(signed).to_be_bytes() == integrity,
        ProtocolVersion::V34 => cipher::hmac_sha256_verify(session.key(), signed, integrity),
    };
    if !intact {
        return Err(FrameError::ChecksumMismatch);
    }

    let command = CommandType::try_from(command_code)?;

    let mut body = &raw[HEADER_LEN..signed_end];
    let retcode = match mode {
        RetcodeMode::Auto if body.len() >= 4 && body[..3] == [0, 0, 0] => Some(body.get_u32()),
        _ => None,
    };

    let payload = decode_body(session, body)?;
    Ok(Frame {
        seqno,
        command,
        retcode,
        payload,
    })
}

fn decode_body(session: &ProtocolSession, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let version = session.version();
    let cipher = EcbCipher::new(session.key());
    let version_tag = version.as_str().as_bytes();

    match version {
        ProtocolVersion::V33 => {
            if body.starts_with(b"{") {
                return Ok(body.to_vec());
            }
            let ciphertext = if body.starts_with(version_tag) {
                body.get(VERSION_HEADER_LEN..).unwrap_or_default()
            } else {
                body
            };
            cipher.decrypt(ciphertext)
        }
        ProtocolVersion::V34 => {
            let mut plaintext = cipher.decrypt(body)?;
            if plaintext.starts_with(version_tag) && plaintext.len() >= VERSION_HEADER_LEN {
                plaintext.drain(..VERSION_HEADER_LEN);
            }
            Ok(plaintext)
        }
    }
}

/// Splits the device byte stream into whole frames.
///
/// Garbage before a prefix and impossible lengths are reported as one
/// [`FrameError`] each and skipped, so a corrupt burst never kills the stream.
#[derive(Debug, Default)]
pub struct FrameSplitter;

impl Decoder for FrameSplitter {
    type Item = Result<BytesMut, FrameError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.windows(PREFIX_BYTES.len()).position(|w| w == PREFIX_BYTES) {
            Some(0) => {}
            Some(offset) => {
                debug!(skipped = offset, "Discarding bytes before frame prefix");
                src.advance(offset);
                return Ok(Some(Err(FrameError::BadPrefix)));
            }
            None => {
                // Keep a possible partial prefix at the tail.
                let keep = src.len().min(PREFIX_BYTES.len() - 1);
                let skipped = src.len() - keep;
                if skipped == 0 {
                    return Ok(None);
                }
                src.advance(skipped);
                return Ok(Some(Err(FrameError::BadPrefix)));
            }
        }

        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let declared = (&src[12..HEADER_LEN]).get_u32() as usize;
        if declared < CRC_LEN + SUFFIX_LEN || declared > MAX_FRAME_LEN {
            src.advance(PREFIX_BYTES.len());
            return Ok(Some(Err(FrameError::MalformedLength {
                declared,
                available: src.len(),
            })));
        }

        let total = HEADER_LEN + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(Ok(src.split_to(total))))
    }
}

impl Encoder<Vec<u8>> for FrameSplitter {
    type Error = std::io::Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn session(version: ProtocolVersion) -> ProtocolSession {
        ProtocolSession::new(version, KEY)
    }

    #[test]
    fn v33_control_keeps_version_header_outside_ciphertext() {
        let s = session(ProtocolVersion::V33);
        let frame = Frame::request(7, CommandType::Control, br#"{"dps":{"115":"PauseWork"}}"#.to_vec());
        let raw = encode_frame(&s, &frame);

        assert_eq!(&raw[HEADER_LEN..HEADER_LEN + 3], b"3.3");
        assert_eq!(decode_frame(&s, &raw, RetcodeMode::Absent).unwrap(), frame);
    }

    #[test]
    fn v34_control_encrypts_version_header() {
        let s = session(ProtocolVersion::V34);
        let frame = Frame::request(3, CommandType::ControlNew, br#"{"protocol":5}"#.to_vec());
        let raw = encode_frame(&s, &frame);

        assert_ne!(&raw[HEADER_LEN..HEADER_LEN + 3], b"3.4");
        let cipher = EcbCipher::new(&KEY);
        let plaintext = cipher
            .decrypt(&raw[HEADER_LEN..raw.len() - HMAC_LEN - SUFFIX_LEN])
            .unwrap();
        assert!(plaintext.starts_with(b"3.4"));
        assert_eq!(decode_frame(&s, &raw, RetcodeMode::Absent).unwrap(), frame);
    }

    #[test]
    fn v33_control_matches_known_bytes() {
        let frame = Frame::request(1, CommandType::Control, br#"{"dps":{"115":"PauseWork"}}"#.to_vec());
        let raw = encode_frame(&session(ProtocolVersion::V33), &frame);
        assert_eq!(
            hex::encode(&raw),
            "000055aa000000010000000700000037332e3300000000000000000000000069\
             99526126d45b9fcd4119b2b3a31ee36060c4778d09eed721e5a847d0f337fbb6\
             73c6450000aa55"
        );
    }

    #[test]
    fn v34_control_matches_known_bytes() {
        let frame = Frame::request(2, CommandType::ControlNew, br#"{"protocol":5}"#.to_vec());
        let raw = encode_frame(&session(ProtocolVersion::V34), &frame);
        assert_eq!(
            hex::encode(&raw),
            "000055aa000000020000000d000000444490b05d74be9368c24a038cbaeded8e\
             b5a2a06af4a6d50a3d990ed63d20d5be9f6585255c4109eab6582d2c59acab3f\
             4a6f69a08081a5b865cd721a3b1ceefa0000aa55"
        );
    }

    #[test]
    fn query_frames_carry_no_version_header() {
        let s = session(ProtocolVersion::V33);
        let raw = encode_frame(&s, &Frame::request(1, CommandType::DpQuery, b"{}".to_vec()));
        // one padded block, crc and suffix
        assert_eq!(raw.len(), HEADER_LEN + 16 + CRC_LEN + SUFFIX_LEN);
    }

    #[test]
    fn device_retcode_is_detected() {
        let s = session(ProtocolVersion::V34);
        let frame = Frame {
            seqno: 9,
            command: CommandType::Status,
            retcode: Some(0),
            payload: br#"{"dps":{"6":87}}"#.to_vec(),
        };
        let raw = encode_frame(&s, &frame);
        assert_eq!(decode_frame(&s, &raw, RetcodeMode::Auto).unwrap(), frame);
    }

    #[test]
    fn v33_accepts_plaintext_json() {
        let s = session(ProtocolVersion::V33);
        let body = br#"{"dps":{"6":12}}"#;
        let mut raw = Vec::new();
        raw.put_u32(PREFIX);
        raw.put_u32(1);
        raw.put_u32(CommandType::Status.code());
        raw.put_u32((body.len() + CRC_LEN + SUFFIX_LEN) as u32);
        raw.extend_from_slice(body);
        let crc = cipher::crc32(&raw);
        raw.put_u32(crc);
        raw.put_u32(SUFFIX);

        let frame = decode_frame(&s, &raw, RetcodeMode::Auto).unwrap();
        assert_eq!(frame.payload, body.to_vec());
        assert_eq!(frame.retcode, None);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let s = session(ProtocolVersion::V33);
        let mut raw = encode_frame(&s, &Frame::request(1, CommandType::DpQuery, b"{}".to_vec()));
        raw[HEADER_LEN] ^= 0xff;
        assert_eq!(
            decode_frame(&s, &raw, RetcodeMode::Absent),
            Err(FrameError::ChecksumMismatch)
        );
    }

    #[test]
    fn hmac_with_wrong_key_is_rejected() {
        let raw = encode_frame(
            &session(ProtocolVersion::V34),
            &Frame::request(1, CommandType::HeartBeat, b"{}".to_vec()),
        );
        let other = ProtocolSession::new(ProtocolVersion::V34, *b"fedcba9876543210");
        assert_eq!(
            decode_frame(&other, &raw, RetcodeMode::Auto),
            Err(FrameError::ChecksumMismatch)
        );
    }

    #[test]
    fn unknown_command_is_rejected_after_integrity_check() {
        let s = session(ProtocolVersion::V33);
        let mut raw = encode_frame(&s, &Frame::request(1, CommandType::DpQuery, b"{}".to_vec()));
        raw[8..12].copy_from_slice(&0x42u32.to_be_bytes());
        let end = raw.len() - CRC_LEN - SUFFIX_LEN;
        let crc = cipher::crc32(&raw[..end]);
        raw[end..end + CRC_LEN].copy_from_slice(&crc.to_be_bytes());

        assert_eq!(
            decode_frame(&s, &raw, RetcodeMode::Absent),
            Err(FrameError::UnknownCommand(0x42))
        );
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let s = session(ProtocolVersion::V33);
        let mut raw = encode_frame(&s, &Frame::request(1, CommandType::DpQuery, b"{}".to_vec()));
        raw.truncate(raw.len() - 1);
        assert!(matches!(
            decode_frame(&s, &raw, RetcodeMode::Absent),
            Err(FrameError::MalformedLength { .. })
        ));
    }

    #[test]
    fn splitter_resyncs_after_garbage() {
        let s = session(ProtocolVersion::V33);
        let first = encode_frame(&s, &Frame::request(1, CommandType::HeartBeat, b"{}".to_vec()));
        let second = encode_frame(&s, &Frame::request(2, CommandType::HeartBeat, b"{}".to_vec()));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"noise");
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..10]);

        let mut splitter = FrameSplitter;
        assert_eq!(splitter.decode(&mut buf).unwrap(), Some(Err(FrameError::BadPrefix)));
        assert_eq!(
            splitter.decode(&mut buf).unwrap().unwrap().unwrap().to_vec(),
            first
        );
        assert_eq!(splitter.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&second[10..]);
        assert_eq!(
            splitter.decode(&mut buf).unwrap().unwrap().unwrap().to_vec(),
            second
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn splitter_skips_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(PREFIX);
        buf.put_u32(1);
        buf.put_u32(8);
        buf.put_u32(u32::MAX);

        let mut splitter = FrameSplitter;
        assert!(matches!(
            splitter.decode(&mut buf).unwrap(),
            Some(Err(FrameError::MalformedLength { .. }))
        ));
        // The remaining header words hold no prefix and get flushed.
        assert_eq!(splitter.decode(&mut buf).unwrap(), Some(Err(FrameError::BadPrefix)));
    }
}

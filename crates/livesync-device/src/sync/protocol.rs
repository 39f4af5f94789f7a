//! Wire format of the Android live-sync protocol
//!
//! Outbound frames start with an ASCII-digit opcode and are always followed
//! by the MD5 digest of their own bytes. Lengths are written as decimal digit
//! strings preceded by a single byte holding the number of digits.
//!
//! ```text
//! CREATE_FILE  '8' | n | path-len digits | path | m | content-len digits   MD5
//!              content bytes (chunked)                                    MD5
//! DELETE_FILE  '7' | n | path-len digits | path                           MD5
//! DO_SYNC      '9' | 32 hex operation id | refresh (1/0)                  MD5
//! ```
//!
//! Inbound reports start with a raw type byte: `1` error message (rest of the
//! chunk), `2`/`3` followed by the 32-character operation id.

use std::path::{Component, Path};

use md5::{Digest, Md5};

use livesync_core::TransportError;

pub const CREATE_FILE_OPERATION: u8 = b'8';
pub const DELETE_FILE_OPERATION: u8 = b'7';
pub const DO_SYNC_OPERATION: u8 = b'9';

pub const ERROR_REPORT: u8 = 1;
pub const OPERATION_END_REPORT: u8 = 2;
pub const OPERATION_END_NO_REFRESH_REPORT: u8 = 3;

pub const OPERATION_ID_LENGTH: usize = 32;
pub const DIGEST_LENGTH: usize = 16;

const MAX_LENGTH_DIGITS: usize = u8::MAX as usize;

/// MD5 of a byte slice
pub fn md5_digest(bytes: &[u8]) -> [u8; DIGEST_LENGTH] {
    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(&Md5::digest(bytes));
    digest
}

/// 16 random bytes, hex encoded
pub fn generate_operation_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

pub fn is_valid_operation_id(id: &str) -> bool {
    id.len() == OPERATION_ID_LENGTH && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `[digit count][decimal digits]` for a length field
fn encode_length(length: u64, field: &str) -> Result<Vec<u8>, TransportError> {
    let digits = length.to_string();
    if digits.len() > MAX_LENGTH_DIGITS {
        return Err(TransportError::invalid_frame(format!(
            "{field} size is longer than {MAX_LENGTH_DIGITS} digits."
        )));
    }

    let mut bytes = Vec::with_capacity(digits.len() + 1);
    bytes.push(digits.len() as u8);
    bytes.extend_from_slice(digits.as_bytes());
    Ok(bytes)
}

fn encode_file_name(relative_path: &str) -> Result<Vec<u8>, TransportError> {
    let name = relative_path.as_bytes();
    let mut bytes = encode_length(name.len() as u64, "File name")?;
    bytes.extend_from_slice(name);
    Ok(bytes)
}

/// Header of a CREATE_FILE frame (the digest is written separately)
pub fn create_file_header(relative_path: &str, content_length: u64) -> Result<Vec<u8>, TransportError> {
    let mut frame = vec![CREATE_FILE_OPERATION];
    frame.extend(encode_file_name(relative_path)?);
    frame.extend(encode_length(content_length, "File content")?);
    Ok(frame)
}

/// DELETE_FILE frame (the digest is written separately)
pub fn delete_file_frame(relative_path: &str) -> Result<Vec<u8>, TransportError> {
    let mut frame = vec![DELETE_FILE_OPERATION];
    frame.extend(encode_file_name(relative_path)?);
    Ok(frame)
}

/// DO_SYNC frame (the digest is written separately)
pub fn do_sync_frame(operation_id: &str, do_refresh: bool) -> Result<Vec<u8>, TransportError> {
    if !is_valid_operation_id(operation_id) {
        return Err(TransportError::invalid_frame(format!(
            "Operation id must be {OPERATION_ID_LENGTH} hex characters, got '{operation_id}'"
        )));
    }

    let mut frame = Vec::with_capacity(2 + OPERATION_ID_LENGTH);
    frame.push(DO_SYNC_OPERATION);
    frame.extend_from_slice(operation_id.as_bytes());
    frame.push(u8::from(do_refresh));
    Ok(frame)
}

/// Path of `file` relative to `root`, joined with `/`
pub fn device_relative_path(root: &Path, file: &Path) -> Result<String, TransportError> {
    let relative = file.strip_prefix(root).map_err(|_| {
        TransportError::invalid_frame(format!(
            "{} is not inside {}",
            file.display(),
            root.display()
        ))
    })?;

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        return Err(TransportError::invalid_frame(format!(
            "{} does not name a file",
            file.display()
        )));
    }

    Ok(parts.join("/"))
}

// ─────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────

/// First message the agent sends after accepting a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: String,
    pub app_identifier: String,
}

impl Handshake {
    /// Number of bytes needed before [`Handshake::parse`] can succeed
    pub fn required_len(bytes: &[u8]) -> Option<usize> {
        bytes.first().map(|len| 1 + *len as usize)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, TransportError> {
        let required = Self::required_len(bytes)
            .ok_or_else(|| TransportError::invalid_frame("Empty handshake"))?;
        if bytes.len() < required {
            return Err(TransportError::invalid_frame(format!(
                "Handshake truncated: expected at least {required} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self {
            protocol_version: String::from_utf8_lossy(&bytes[1..required]).into_owned(),
            app_identifier: String::from_utf8_lossy(&bytes[required..]).into_owned(),
        })
    }
}

/// Report sent by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Error(String),
    OperationEnd {
        operation_id: String,
        did_refresh: bool,
    },
}

/// Buffers inbound bytes and yields complete reports
#[derive(Debug, Default)]
pub struct ReportDecoder {
    buffer: Vec<u8>,
}

impl ReportDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete report, or `None` when more bytes are needed.
    ///
    /// An unknown report type discards the buffered bytes.
    pub fn next_report(&mut self) -> Option<Result<Report, TransportError>> {
        let report_type = *self.buffer.first()?;

        match report_type {
            ERROR_REPORT => {
                let message = String::from_utf8_lossy(&self.buffer[1..]).into_owned();
                self.buffer.clear();
                Some(Ok(Report::Error(message)))
            }
            OPERATION_END_REPORT | OPERATION_END_NO_REFRESH_REPORT => {
                if self.buffer.len() < 1 + OPERATION_ID_LENGTH {
                    return None;
                }
                let id_bytes: Vec<u8> = self.buffer.drain(..1 + OPERATION_ID_LENGTH).skip(1).collect();
                Some(Ok(Report::OperationEnd {
                    operation_id: String::from_utf8_lossy(&id_bytes).into_owned(),
                    did_refresh: report_type == OPERATION_END_REPORT,
                }))
            }
            other => {
                let dropped = self.buffer.len();
                self.buffer.clear();
                Some(Err(TransportError::invalid_frame(format!(
                    "Unknown report type {other} ({dropped} bytes dropped)"
                ))))
            }
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_create_file_header_layout() {
        let header = create_file_header("app/main.js", 42).unwrap();

        let mut expected = vec![b'8', 2, b'1', b'1'];
        expected.extend_from_slice(b"app/main.js");
        expected.extend_from_slice(&[2, b'4', b'2']);
        assert_eq!(header, expected);
    }

    #[test]
    fn test_delete_file_frame_layout() {
        let frame = delete_file_frame("a.css").unwrap();
        assert_eq!(frame, vec![b'7', 1, b'5', b'a', b'.', b'c', b's', b's']);
    }

    #[test]
    fn test_do_sync_frame_layout() {
        let id = "0123456789abcdef0123456789abcdef";
        let frame = do_sync_frame(id, true).unwrap();
        assert_eq!(frame.len(), 34);
        assert_eq!(frame[0], b'9');
        assert_eq!(&frame[1..33], id.as_bytes());
        assert_eq!(frame[33], 1);

        let frame = do_sync_frame(id, false).unwrap();
        assert_eq!(frame[33], 0);
    }

    #[test]
    fn test_do_sync_rejects_malformed_id() {
        assert!(do_sync_frame("short", true).is_err());
        assert!(do_sync_frame(&"z".repeat(32), true).is_err());
    }

    #[test]
    fn test_generated_operation_id_is_32_hex_chars() {
        let a = generate_operation_id();
        let b = generate_operation_id();
        assert!(is_valid_operation_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_md5_digest_known_value() {
        assert_eq!(
            hex::encode(md5_digest(b"")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_device_relative_path_uses_forward_slashes() {
        let root = PathBuf::from("/work/platforms/android/assets");
        let file = root.join("app").join("views").join("main.xml");
        assert_eq!(
            device_relative_path(&root, &file).unwrap(),
            "app/views/main.xml"
        );
    }

    #[test]
    fn test_device_relative_path_outside_root() {
        let root = PathBuf::from("/work/platforms");
        assert!(device_relative_path(&root, Path::new("/etc/passwd")).is_err());
        assert!(device_relative_path(&root, &root).is_err());
    }

    #[test]
    fn test_handshake_parse() {
        let mut bytes = vec![5];
        bytes.extend_from_slice(b"0.2.0org.example.app");

        let handshake = Handshake::parse(&bytes).unwrap();
        assert_eq!(handshake.protocol_version, "0.2.0");
        assert_eq!(handshake.app_identifier, "org.example.app");
    }

    #[test]
    fn test_handshake_truncated() {
        assert!(Handshake::parse(&[]).is_err());
        assert!(Handshake::parse(&[5, b'0', b'.']).is_err());
        assert_eq!(Handshake::required_len(&[5, b'0']), Some(6));
    }

    #[test]
    fn test_report_decoder_handles_split_and_batched_reports() {
        let id_a = "a".repeat(32);
        let id_b = "b".repeat(32);
        let mut decoder = ReportDecoder::default();

        decoder.push(&[OPERATION_END_REPORT]);
        decoder.push(&id_a.as_bytes()[..10]);
        assert!(decoder.next_report().is_none());

        let mut rest = id_a.as_bytes()[10..].to_vec();
        rest.push(OPERATION_END_NO_REFRESH_REPORT);
        rest.extend_from_slice(id_b.as_bytes());
        decoder.push(&rest);

        assert_eq!(
            decoder.next_report().unwrap().unwrap(),
            Report::OperationEnd {
                operation_id: id_a,
                did_refresh: true
            }
        );
        assert_eq!(
            decoder.next_report().unwrap().unwrap(),
            Report::OperationEnd {
                operation_id: id_b,
                did_refresh: false
            }
        );
        assert!(decoder.next_report().is_none());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_report_decoder_error_report() {
        let mut decoder = ReportDecoder::default();
        let mut bytes = vec![ERROR_REPORT];
        bytes.extend_from_slice("Failed to write file".as_bytes());
        decoder.push(&bytes);

        assert_eq!(
            decoder.next_report().unwrap().unwrap(),
            Report::Error("Failed to write file".to_string())
        );
    }

    #[test]
    fn test_report_decoder_unknown_type() {
        let mut decoder = ReportDecoder::default();
        decoder.push(&[42, 1, 2, 3]);
        assert!(decoder.next_report().unwrap().is_err());
        assert_eq!(decoder.buffered_len(), 0);
    }
}

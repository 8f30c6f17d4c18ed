//! Wire protocol shared by sender and receiver
//!
//! Message-oriented request/response framing (all integers big-endian):
//!
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | 1 byte | 4 bytes| variable         |
//! +--------+--------+------------------+
//! ```
//!
//! Paths are u16-length-prefixed UTF-8 with '/' separators regardless of
//! host OS. Checksums travel as their 32-character lowercase-hex rendering.
//! Offsets and sizes are 8-byte big-endian values.
//!
//! The codec is pure ([`Request::encode`]/[`Request::decode`] and the
//! [`Response`] equivalents work on byte buffers); [`ProtocolReader`] and
//! [`ProtocolWriter`] adapt it to async byte streams.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::checksum::Checksum;
use crate::error::SyncError;
use crate::meta::{Block, FileMeta};

/// Maximum frame payload size (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Checksums travel as 32 hex characters.
const CHECKSUM_WIRE_SIZE: usize = 32;

/// Bytes a block occupies inside a file-meta response.
const BLOCK_WIRE_SIZE: usize = 8 + 8 + 8 + CHECKSUM_WIRE_SIZE;

/// Message type identifiers.
pub mod msg {
    // Requests.
    pub const FILE_CHECKSUM_REQ: u8 = 0x01;
    pub const FILE_META_REQ: u8 = 0x02;
    pub const WRITE_BLOCK_REQ: u8 = 0x03;
    pub const TRUNCATE_REQ: u8 = 0x04;
    pub const TOUCH_REQ: u8 = 0x05;
    pub const CHMOD_REQ: u8 = 0x06;
    pub const RENAME_REQ: u8 = 0x07;
    pub const DELETE_REQ: u8 = 0x08;
    pub const MKDIR_REQ: u8 = 0x09;

    // Responses.
    pub const EMPTY_RESP: u8 = 0x10;
    pub const FILE_CHECKSUM_RESP: u8 = 0x11;
    pub const FILE_META_RESP: u8 = 0x12;
    pub const ERROR_RESP: u8 = 0x13;
}

/// A request from the sender to the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    FileChecksum { path: String },
    FileMeta { path: String, block_size: u64 },
    WriteFileBlock { path: String, offset: u64, data: Bytes },
    TruncateFile { path: String, size: u64 },
    Touch { path: String },
    Chmod { path: String, mode: u32 },
    Rename { old_path: String, new_path: String },
    Delete { path: String },
    CreateDirectory { path: String, mode: u32 },
}

/// A response from the receiver.
#[derive(Debug, Clone)]
pub enum Response {
    Empty,
    FileChecksum { checksum: Checksum },
    FileMeta(FileMeta),
    Error { kind: u8, transient: bool, message: String },
}

impl Request {
    /// Encode into a complete frame (header + payload).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, payload) = match self {
            Self::FileChecksum { path } => (msg::FILE_CHECKSUM_REQ, encode_path_only(path)),
            Self::FileMeta { path, block_size } => {
                let mut buf = encode_path_only(path);
                buf.extend_from_slice(&block_size.to_be_bytes());
                (msg::FILE_META_REQ, buf)
            }
            Self::WriteFileBlock { path, offset, data } => {
                let mut buf = encode_path_only(path);
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u64).to_be_bytes());
                buf.extend_from_slice(data);
                (msg::WRITE_BLOCK_REQ, buf)
            }
            Self::TruncateFile { path, size } => {
                let mut buf = encode_path_only(path);
                buf.extend_from_slice(&size.to_be_bytes());
                (msg::TRUNCATE_REQ, buf)
            }
            Self::Touch { path } => (msg::TOUCH_REQ, encode_path_only(path)),
            Self::Chmod { path, mode } => {
                let mut buf = encode_path_only(path);
                buf.extend_from_slice(&mode.to_be_bytes());
                (msg::CHMOD_REQ, buf)
            }
            Self::Rename { old_path, new_path } => {
                let mut buf = encode_path_only(old_path);
                put_path(&mut buf, new_path);
                (msg::RENAME_REQ, buf)
            }
            Self::Delete { path } => (msg::DELETE_REQ, encode_path_only(path)),
            Self::CreateDirectory { path, mode } => {
                let mut buf = encode_path_only(path);
                buf.extend_from_slice(&mode.to_be_bytes());
                (msg::MKDIR_REQ, buf)
            }
        };
        frame(msg_type, payload)
    }

    /// Decode a request payload.
    ///
    /// # Errors
    /// `Protocol` on an unknown type, truncated payload, or a block write
    /// whose declared size disagrees with its data length.
    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self, SyncError> {
        let mut reader = PayloadReader::new(payload);
        let request = match msg_type {
            msg::FILE_CHECKSUM_REQ => Self::FileChecksum { path: reader.path()? },
            msg::FILE_META_REQ => Self::FileMeta {
                path: reader.path()?,
                block_size: reader.u64()?,
            },
            msg::WRITE_BLOCK_REQ => {
                let path = reader.path()?;
                let offset = reader.u64()?;
                let size = reader.u64()?;
                let data = reader.rest();
                if size != data.len() as u64 {
                    return Err(SyncError::Protocol(format!(
                        "block write declares {size} bytes but carries {}",
                        data.len()
                    )));
                }
                Self::WriteFileBlock {
                    path,
                    offset,
                    data: Bytes::copy_from_slice(data),
                }
            }
            msg::TRUNCATE_REQ => Self::TruncateFile {
                path: reader.path()?,
                size: reader.u64()?,
            },
            msg::TOUCH_REQ => Self::Touch { path: reader.path()? },
            msg::CHMOD_REQ => Self::Chmod {
                path: reader.path()?,
                mode: reader.u32()?,
            },
            msg::RENAME_REQ => Self::Rename {
                old_path: reader.path()?,
                new_path: reader.path()?,
            },
            msg::DELETE_REQ => Self::Delete { path: reader.path()? },
            msg::MKDIR_REQ => Self::CreateDirectory {
                path: reader.path()?,
                mode: reader.u32()?,
            },
            other => {
                return Err(SyncError::Protocol(format!(
                    "unknown request type: {other:#04x}"
                )));
            }
        };
        Ok(request)
    }
}

impl Response {
    /// Encode into a complete frame (header + payload).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, payload) = match self {
            Self::Empty => (msg::EMPTY_RESP, Vec::new()),
            Self::FileChecksum { checksum } => {
                (msg::FILE_CHECKSUM_RESP, checksum.to_hex().into_bytes())
            }
            Self::FileMeta(meta) => {
                let mut buf = encode_path_only(&meta.path);
                buf.extend_from_slice(&meta.block_size.to_be_bytes());
                buf.extend_from_slice(&meta.num_blocks.to_be_bytes());
                for block in &meta.blocks {
                    buf.extend_from_slice(&block.index.to_be_bytes());
                    buf.extend_from_slice(&block.offset.to_be_bytes());
                    buf.extend_from_slice(&block.size.to_be_bytes());
                    buf.extend_from_slice(block.checksum.to_hex().as_bytes());
                }
                buf.extend_from_slice(meta.checksum.to_hex().as_bytes());
                (msg::FILE_META_RESP, buf)
            }
            Self::Error { kind, transient, message } => {
                let mut buf = vec![*kind, u8::from(*transient)];
                buf.extend_from_slice(message.as_bytes());
                (msg::ERROR_RESP, buf)
            }
        };
        frame(msg_type, payload)
    }

    /// Decode a response payload.
    ///
    /// # Errors
    /// `Protocol` on an unknown type or malformed payload.
    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self, SyncError> {
        let mut reader = PayloadReader::new(payload);
        let response = match msg_type {
            msg::EMPTY_RESP => Self::Empty,
            msg::FILE_CHECKSUM_RESP => Self::FileChecksum {
                checksum: reader.checksum()?,
            },
            msg::FILE_META_RESP => {
                let path = reader.path()?;
                let block_size = reader.u64()?;
                let num_blocks = reader.u64()?;
                if num_blocks as usize > payload.len() / BLOCK_WIRE_SIZE {
                    return Err(SyncError::Protocol(format!(
                        "file meta declares {num_blocks} blocks in a {}-byte payload",
                        payload.len()
                    )));
                }

                let mut blocks = Vec::with_capacity(num_blocks as usize);
                for _ in 0..num_blocks {
                    blocks.push(Block {
                        index: reader.u64()?,
                        offset: reader.u64()?,
                        size: reader.u64()?,
                        checksum: reader.checksum()?,
                    });
                }
                let checksum = reader.checksum()?;

                // The response carries no size field; the file size is the
                // sum of the block sizes. Mode does not travel either way.
                let size = blocks.iter().map(|b| b.size).sum();
                Self::FileMeta(FileMeta {
                    path,
                    mode: 0,
                    size,
                    block_size,
                    num_blocks,
                    blocks,
                    checksum,
                })
            }
            msg::ERROR_RESP => {
                let kind = reader.u8()?;
                let transient = reader.u8()? != 0;
                let message = String::from_utf8_lossy(reader.rest()).into_owned();
                Self::Error { kind, transient, message }
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "unknown response type: {other:#04x}"
                )));
            }
        };
        Ok(response)
    }

    /// Build the wire form of an error.
    ///
    /// The payload carries the bare message; the kind prefix is re-applied
    /// by the variant on the far side.
    #[must_use]
    pub fn from_error(err: &SyncError) -> Self {
        let (kind, transient) = err.wire_kind();
        let message = match err {
            SyncError::NotFound(inner)
            | SyncError::Transport(inner)
            | SyncError::Validation(inner)
            | SyncError::Protocol(inner) => inner.clone(),
            SyncError::Io(inner) => inner.to_string(),
        };
        Self::Error { kind, transient, message }
    }
}

fn frame(msg_type: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(msg_type);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    buf
}

fn encode_path_only(path: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + path.len());
    put_path(&mut buf, path);
    buf
}

fn put_path(buf: &mut Vec<u8>, path: &str) {
    buf.extend_from_slice(&(path.len() as u16).to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
}

/// Cursor over a payload with truncation-checked reads.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SyncError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(SyncError::Protocol("truncated payload".into()));
        };
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SyncError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SyncError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, SyncError> {
        let raw: [u8; 4] = self.take(4)?.try_into().map_err(bad_slice)?;
        Ok(u32::from_be_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, SyncError> {
        let raw: [u8; 8] = self.take(8)?.try_into().map_err(bad_slice)?;
        Ok(u64::from_be_bytes(raw))
    }

    fn path(&mut self) -> Result<String, SyncError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| SyncError::Protocol("path is not valid UTF-8".into()))
    }

    fn checksum(&mut self) -> Result<Checksum, SyncError> {
        let raw = self.take(CHECKSUM_WIRE_SIZE)?;
        let hex = std::str::from_utf8(raw)
            .map_err(|_| SyncError::Protocol("checksum is not valid hex".into()))?;
        Checksum::from_hex(hex).map_err(|_| SyncError::Protocol("checksum is not valid hex".into()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

fn bad_slice<E>(_: E) -> SyncError {
    SyncError::Protocol("truncated payload".into())
}

/// Reads length-prefixed frames from an async byte stream.
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next request frame.
    ///
    /// # Errors
    /// `Transport` if the stream fails, `Protocol` on a malformed frame.
    pub async fn read_request(&mut self) -> Result<Request, SyncError> {
        let (msg_type, payload) = self.read_frame().await?;
        Request::decode(msg_type, &payload)
    }

    /// Read the next response frame.
    ///
    /// # Errors
    /// `Transport` if the stream fails, `Protocol` on a malformed frame.
    pub async fn read_response(&mut self) -> Result<Response, SyncError> {
        let (msg_type, payload) = self.read_frame().await?;
        Response::decode(msg_type, &payload)
    }

    async fn read_frame(&mut self) -> Result<(u8, Vec<u8>), SyncError> {
        let mut header = [0u8; 5];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(transport_error)?;

        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(SyncError::Protocol(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_SIZE}-byte limit"
            )));
        }

        let mut payload = vec![0u8; len];
        if len > 0 {
            self.inner
                .read_exact(&mut payload)
                .await
                .map_err(transport_error)?;
        }

        Ok((header[0], payload))
    }
}

/// Writes length-prefixed frames to an async byte stream.
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a request frame.
    ///
    /// # Errors
    /// `Protocol` if the frame is oversized, `Transport` if the stream fails.
    pub async fn write_request(&mut self, request: &Request) -> Result<(), SyncError> {
        self.write_frame(request.encode()).await
    }

    /// Send a response frame.
    ///
    /// # Errors
    /// `Protocol` if the frame is oversized, `Transport` if the stream fails.
    pub async fn write_response(&mut self, response: &Response) -> Result<(), SyncError> {
        self.write_frame(response.encode()).await
    }

    async fn write_frame(&mut self, buf: Vec<u8>) -> Result<(), SyncError> {
        if buf.len() - 5 > MAX_FRAME_SIZE {
            return Err(SyncError::Protocol(format!(
                "frame of {} bytes exceeds the {MAX_FRAME_SIZE}-byte limit",
                buf.len() - 5
            )));
        }
        self.inner.write_all(&buf).await.map_err(transport_error)?;
        self.inner.flush().await.map_err(transport_error)?;
        Ok(())
    }
}

fn transport_error(err: std::io::Error) -> SyncError {
    SyncError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_round_trip(request: Request) -> Request {
        let frame = request.encode();
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(len, frame.len() - 5);
        Request::decode(frame[0], &frame[5..]).unwrap()
    }

    fn response_round_trip(response: &Response) -> Response {
        let frame = response.encode();
        Response::decode(frame[0], &frame[5..]).unwrap()
    }

    #[test]
    fn request_round_trips() {
        let requests = vec![
            Request::FileChecksum { path: "a/b.txt".into() },
            Request::FileMeta { path: "a.bin".into(), block_size: 4096 },
            Request::WriteFileBlock {
                path: "a.bin".into(),
                offset: 8192,
                data: Bytes::from_static(b"some block data"),
            },
            Request::TruncateFile { path: "a.bin".into(), size: 12 },
            Request::Touch { path: "new.txt".into() },
            Request::Chmod { path: "x".into(), mode: 0o755 },
            Request::Rename { old_path: "old".into(), new_path: "new".into() },
            Request::Delete { path: "gone".into() },
            Request::CreateDirectory { path: "sub/dir".into(), mode: 0o700 },
        ];

        for request in requests {
            assert_eq!(request_round_trip(request.clone()), request);
        }
    }

    #[test]
    fn file_meta_round_trip_derives_size() {
        let meta = FileMeta {
            path: "data.bin".into(),
            mode: 0o644,
            size: 19,
            block_size: 4,
            num_blocks: 5,
            blocks: (0..5)
                .map(|i| Block {
                    index: i,
                    offset: i * 4,
                    size: if i == 4 { 3 } else { 4 },
                    checksum: Checksum::from_bytes(&[i as u8]),
                })
                .collect(),
            checksum: Checksum::from_bytes(b"whole"),
        };

        let decoded = match response_round_trip(&Response::FileMeta(meta.clone())) {
            Response::FileMeta(decoded) => decoded,
            other => panic!("wrong response: {other:?}"),
        };

        assert_eq!(decoded.path, meta.path);
        assert_eq!(decoded.block_size, meta.block_size);
        assert_eq!(decoded.num_blocks, meta.num_blocks);
        assert_eq!(decoded.size, 19);
        assert_eq!(decoded.checksum, meta.checksum);
        for (a, b) in decoded.blocks.iter().zip(&meta.blocks) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn checksum_response_round_trips() {
        let checksum = Checksum::from_bytes(b"AAAABBBBCCCCDDDDEEE");
        match response_round_trip(&Response::FileChecksum { checksum }) {
            Response::FileChecksum { checksum: decoded } => assert_eq!(decoded, checksum),
            other => panic!("wrong response: {other:?}"),
        }
    }

    #[test]
    fn error_response_round_trips() {
        let response = Response::Error {
            kind: crate::error::kind::NOT_FOUND,
            transient: false,
            message: "not found: a.txt".into(),
        };
        match response_round_trip(&response) {
            Response::Error { kind, transient, message } => {
                assert_eq!(kind, crate::error::kind::NOT_FOUND);
                assert!(!transient);
                assert_eq!(message, "not found: a.txt");
            }
            other => panic!("wrong response: {other:?}"),
        }
    }

    #[test]
    fn block_write_size_mismatch_is_rejected() {
        let mut payload = Vec::new();
        put_path(&mut payload, "a.bin");
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&100u64.to_be_bytes()); // declares 100 bytes
        payload.extend_from_slice(b"only a few");

        let err = Request::decode(msg::WRITE_BLOCK_REQ, &payload).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(matches!(
            Request::decode(0xff, &[]),
            Err(SyncError::Protocol(_))
        ));
        assert!(matches!(
            Response::decode(0xff, &[]),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        // Path length claims more bytes than the payload holds.
        let payload = [0x00, 0x10, b'a'];
        assert!(matches!(
            Request::decode(msg::TOUCH_REQ, &payload),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn meta_with_absurd_block_count_is_rejected() {
        let mut payload = Vec::new();
        put_path(&mut payload, "f");
        payload.extend_from_slice(&4u64.to_be_bytes());
        payload.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            Response::decode(msg::FILE_META_RESP, &payload),
            Err(SyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn framed_round_trip_over_a_stream() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = ProtocolWriter::new(client_write);
        let mut reader = ProtocolReader::new(server_read);

        let request = Request::WriteFileBlock {
            path: "dir/file.bin".into(),
            offset: 4,
            data: Bytes::from_static(b"BBBB"),
        };
        writer.write_request(&request).await.unwrap();

        let received = reader.read_request().await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn oversized_frame_header_is_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _keep) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let mut header = vec![msg::TOUCH_REQ];
        header.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        AsyncWriteExt::write_all(&mut client_write, &header)
            .await
            .unwrap();

        let mut reader = ProtocolReader::new(server_read);
        let err = reader.read_request().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote sharing wire protocol.
//!
//! Every message, discovery and session alike, is one fixed-size record.
//! All multi-byte integers travel big-endian; text fields are NUL-padded.
//!
//! Wire format:
//! ```text
//! header (20 bytes)
//! +-------------+-----------+-----------+-------------+---------------+---------+
//! | version u32 | flags u32 | token u32 | command u32 | data_port u16 | pad u16 |
//! +-------------+-----------+-----------+-------------+---------------+---------+
//!
//! body (7204 bytes, layout selected by command)
//!   Connect:    family_set[32] | error u32 | port u16 | pad u16
//!   Response:   error u32 | flags u32 | kind u32
//!   UpdateVsn:  count u32 | 100 x element
//!   element:    vsn[32] | media[4] | eq u16 | partition u16 | slot u32
//!               | status u32 | block_size u32 | capacity u64 | space u64
//!               | update_flags u32
//! ```

use crate::catalog::{
    CatalogChange, CatalogEntry, MediaType, UpdateFlags, VolumeStatus, Vsn, MEDIA_LEN, VSN_LEN,
};
use byteorder::{BigEndian, ByteOrder, NativeEndian};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version. Every byte differs so a byte-swapped peer is detectable.
pub const PROTOCOL_VERSION: u32 = 0x0201_0001;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Maximum catalog changes carried by one `UpdateVsn` record.
pub const MAX_VSN_BATCH: usize = 100;

/// Size of the family-set name field (31 characters plus NUL).
pub const FAMILY_SET_LEN: usize = 32;

/// Size of one `UpdateVsn` element.
pub const VSN_ELEMENT_SIZE: usize = 72;

/// Size of the body union (the largest variant, `UpdateVsn`).
pub const BODY_SIZE: usize = 4 + MAX_VSN_BATCH * VSN_ELEMENT_SIZE;

/// Size of every record on the wire.
pub const RECORD_SIZE: usize = HEADER_SIZE + BODY_SIZE;

/// Success.
pub const ERR_OK: u32 = 0;
/// The requested family set is not served here.
pub const ERR_UNKNOWN_FAMILY_SET: u32 = 2;
/// The catalog could not be read.
pub const ERR_IO: u32 = 5;
/// An installation is already running for this client.
pub const ERR_BUSY: u32 = 16;

// Header offsets.
const OFF_VERSION: usize = 0;
const OFF_FLAGS: usize = 4;
const OFF_TOKEN: usize = 8;
const OFF_COMMAND: usize = 12;
const OFF_DATA_PORT: usize = 16;

// Connect body.
const OFF_FAMILY_SET: usize = HEADER_SIZE;
const OFF_CONNECT_ERROR: usize = OFF_FAMILY_SET + FAMILY_SET_LEN;
const OFF_CONNECT_PORT: usize = OFF_CONNECT_ERROR + 4;

// Response body.
const OFF_RESPONSE_ERROR: usize = HEADER_SIZE;
const OFF_RESPONSE_FLAGS: usize = HEADER_SIZE + 4;
const OFF_RESPONSE_KIND: usize = HEADER_SIZE + 8;

// UpdateVsn body.
const OFF_COUNT: usize = HEADER_SIZE;
const OFF_ELEMENTS: usize = HEADER_SIZE + 4;

// Offsets inside one element.
const EL_VSN: usize = 0;
const EL_MEDIA: usize = EL_VSN + VSN_LEN;
const EL_EQ: usize = EL_MEDIA + MEDIA_LEN;
const EL_PARTITION: usize = EL_EQ + 2;
const EL_SLOT: usize = EL_PARTITION + 2;
const EL_STATUS: usize = EL_SLOT + 4;
const EL_BLOCK_SIZE: usize = EL_STATUS + 4;
const EL_CAPACITY: usize = EL_BLOCK_SIZE + 4;
const EL_SPACE: usize = EL_CAPACITY + 8;
const EL_UPDATE_FLAGS: usize = EL_SPACE + 8;

/// Multi-byte fields as (offset, width).
const HEADER_FIELDS: &[(usize, usize)] = &[(0, 4), (4, 4), (8, 4), (12, 4), (16, 2), (18, 2)];
const CONNECT_FIELDS: &[(usize, usize)] =
    &[(OFF_CONNECT_ERROR, 4), (OFF_CONNECT_PORT, 2), (OFF_CONNECT_PORT + 2, 2)];
const RESPONSE_FIELDS: &[(usize, usize)] = &[
    (OFF_RESPONSE_ERROR, 4),
    (OFF_RESPONSE_FLAGS, 4),
    (OFF_RESPONSE_KIND, 4),
];
const ELEMENT_FIELDS: &[(usize, usize)] = &[
    (EL_EQ, 2),
    (EL_PARTITION, 2),
    (EL_SLOT, 4),
    (EL_STATUS, 4),
    (EL_BLOCK_SIZE, 4),
    (EL_CAPACITY, 8),
    (EL_SPACE, 8),
    (EL_UPDATE_FLAGS, 4),
];

/// Protocol command tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Discovery request (client) and its echo (server).
    Connect = 1,
    /// Client is leaving.
    Disconnect = 2,
    /// Keep-alive check.
    Heartbeat = 3,
    /// Ask the server to stream every matching volume.
    SendVsnFilters = 4,
    /// Batch of catalog changes.
    UpdateVsn = 5,
    /// Reply to a correlated request.
    Response = 6,
}

impl TryFrom<u32> for Command {
    type Error = ProtocolViolation;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::Disconnect),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::SendVsnFilters),
            5 => Ok(Self::UpdateVsn),
            6 => Ok(Self::Response),
            other => Err(ProtocolViolation::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Heartbeat => "heartbeat",
            Self::SendVsnFilters => "send_vsn_filters",
            Self::UpdateVsn => "update_vsn",
            Self::Response => "response",
        };
        f.write_str(name)
    }
}

/// What a `Response` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    #[default]
    Unknown,
    CommandAck,
    HeartbeatAck,
}

impl ResponseKind {
    fn to_wire(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::CommandAck => 1,
            Self::HeartbeatAck => 2,
        }
    }

    fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::CommandAck,
            2 => Self::HeartbeatAck,
            _ => Self::Unknown,
        }
    }
}

/// Record validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("Unknown command {0}")]
    UnknownCommand(u32),

    #[error("Batch count {0} exceeds {MAX_VSN_BATCH}")]
    BatchTooLarge(u32),

    #[error("Undecodable text in {0} field")]
    InvalidText(&'static str),

    #[error("Unsupported protocol version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("Byte-order mismatch (version {0:#010x})")]
    ByteOrderMismatch(u32),
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),
}

/// Name of a family set (one library and its drives).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FamilySetName(String);

impl FamilySetName {
    /// Create a family-set name. Non-empty, at most 31 bytes, without NUL.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty() || name.len() >= FAMILY_SET_LEN || name.contains('\0') {
            return None;
        }
        Some(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilySetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of a discovery request or its echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBody {
    pub family_set: FamilySetName,
    pub error: u32,
    /// Session port (server echo only; 0 on failure).
    pub port: u16,
}

/// Body of a `Response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseBody {
    pub error: u32,
    pub flags: u32,
    pub kind: ResponseKind,
}

/// At most [`MAX_VSN_BATCH`] catalog changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VsnBatch {
    changes: Vec<CatalogChange>,
}

impl VsnBatch {
    pub fn new() -> Self {
        Self {
            changes: Vec::with_capacity(MAX_VSN_BATCH),
        }
    }

    /// Append a change. Hands it back if the batch is full.
    pub fn push(&mut self, change: CatalogChange) -> Result<(), CatalogChange> {
        if self.is_full() {
            return Err(change);
        }
        self.changes.push(change);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.changes.len() >= MAX_VSN_BATCH
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogChange> {
        self.changes.iter()
    }

    pub fn into_changes(self) -> Vec<CatalogChange> {
        self.changes
    }
}

/// Command-specific payload. The variant is the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(ConnectBody),
    Disconnect,
    Heartbeat,
    SendVsnFilters,
    UpdateVsn(VsnBatch),
    Response(ResponseBody),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Self::Connect(_) => Command::Connect,
            Self::Disconnect => Command::Disconnect,
            Self::Heartbeat => Command::Heartbeat,
            Self::SendVsnFilters => Command::SendVsnFilters,
            Self::UpdateVsn(_) => Command::UpdateVsn,
            Self::Response(_) => Command::Response,
        }
    }
}

/// One protocol record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub version: u32,
    pub flags: u32,
    /// Correlation token, echoed in the matching `Response`.
    pub token: u32,
    pub data_port: u16,
    pub message: Message,
}

impl Record {
    pub fn new(token: u32, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            token,
            data_port: 0,
            message,
        }
    }

    /// Discovery request for a family set.
    pub fn connect(family_set: FamilySetName) -> Self {
        Self::connect_reply(family_set, ERR_OK, 0)
    }

    /// Discovery answer.
    pub fn connect_reply(family_set: FamilySetName, error: u32, port: u16) -> Self {
        Self::new(
            0,
            Message::Connect(ConnectBody {
                family_set,
                error,
                port,
            }),
        )
    }

    pub fn disconnect() -> Self {
        Self::new(0, Message::Disconnect)
    }

    pub fn heartbeat(token: u32) -> Self {
        Self::new(token, Message::Heartbeat)
    }

    pub fn heartbeat_ack(token: u32) -> Self {
        Self::response(token, ERR_OK, ResponseKind::HeartbeatAck)
    }

    pub fn command_ack(token: u32, error: u32) -> Self {
        Self::response(token, error, ResponseKind::CommandAck)
    }

    pub fn response(token: u32, error: u32, kind: ResponseKind) -> Self {
        Self::new(
            token,
            Message::Response(ResponseBody {
                error,
                flags: 0,
                kind,
            }),
        )
    }

    pub fn send_vsn_filters(token: u32) -> Self {
        Self::new(token, Message::SendVsnFilters)
    }

    pub fn update_vsn(batch: VsnBatch) -> Self {
        Self::new(0, Message::UpdateVsn(batch))
    }

    pub fn command(&self) -> Command {
        self.message.command()
    }

    /// Encode to exactly [`RECORD_SIZE`] bytes in wire order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        let command = self.command();

        NativeEndian::write_u32(&mut buf[OFF_VERSION..], self.version);
        NativeEndian::write_u32(&mut buf[OFF_FLAGS..], self.flags);
        NativeEndian::write_u32(&mut buf[OFF_TOKEN..], self.token);
        NativeEndian::write_u32(&mut buf[OFF_COMMAND..], command as u32);
        NativeEndian::write_u16(&mut buf[OFF_DATA_PORT..], self.data_port);

        match &self.message {
            Message::Connect(body) => {
                write_text(
                    &mut buf[OFF_FAMILY_SET..OFF_FAMILY_SET + FAMILY_SET_LEN],
                    body.family_set.as_str(),
                );
                NativeEndian::write_u32(&mut buf[OFF_CONNECT_ERROR..], body.error);
                NativeEndian::write_u16(&mut buf[OFF_CONNECT_PORT..], body.port);
            }
            Message::Response(body) => {
                NativeEndian::write_u32(&mut buf[OFF_RESPONSE_ERROR..], body.error);
                NativeEndian::write_u32(&mut buf[OFF_RESPONSE_FLAGS..], body.flags);
                NativeEndian::write_u32(&mut buf[OFF_RESPONSE_KIND..], body.kind.to_wire());
            }
            Message::UpdateVsn(batch) => {
                NativeEndian::write_u32(&mut buf[OFF_COUNT..], batch.len() as u32);
                for (i, change) in batch.iter().enumerate() {
                    let start = OFF_ELEMENTS + i * VSN_ELEMENT_SIZE;
                    encode_element(&mut buf[start..start + VSN_ELEMENT_SIZE], change);
                }
            }
            Message::Disconnect | Message::Heartbeat | Message::SendVsnFilters => {}
        }

        normalize(&mut buf, command);
        buf
    }

    /// Decode one record from wire bytes. Bytes past [`RECORD_SIZE`] are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < RECORD_SIZE {
            return Err(CodecError::ShortRead {
                expected: RECORD_SIZE,
                actual: bytes.len(),
            });
        }

        let version = BigEndian::read_u32(&bytes[OFF_VERSION..]);
        if version != PROTOCOL_VERSION {
            if version.swap_bytes() == PROTOCOL_VERSION {
                return Err(ProtocolViolation::ByteOrderMismatch(version).into());
            }
            return Err(ProtocolViolation::UnsupportedVersion(version).into());
        }
        let command = Command::try_from(BigEndian::read_u32(&bytes[OFF_COMMAND..]))?;

        let mut buf = bytes[..RECORD_SIZE].to_vec();
        normalize(&mut buf, command);

        let flags = NativeEndian::read_u32(&buf[OFF_FLAGS..]);
        let token = NativeEndian::read_u32(&buf[OFF_TOKEN..]);
        let data_port = NativeEndian::read_u16(&buf[OFF_DATA_PORT..]);

        let message = match command {
            Command::Connect => {
                let name = read_text(
                    &buf[OFF_FAMILY_SET..OFF_FAMILY_SET + FAMILY_SET_LEN],
                    "family_set",
                )?;
                let family_set = FamilySetName::new(name)
                    .ok_or(ProtocolViolation::InvalidText("family_set"))?;
                Message::Connect(ConnectBody {
                    family_set,
                    error: NativeEndian::read_u32(&buf[OFF_CONNECT_ERROR..]),
                    port: NativeEndian::read_u16(&buf[OFF_CONNECT_PORT..]),
                })
            }
            Command::Response => Message::Response(ResponseBody {
                error: NativeEndian::read_u32(&buf[OFF_RESPONSE_ERROR..]),
                flags: NativeEndian::read_u32(&buf[OFF_RESPONSE_FLAGS..]),
                kind: ResponseKind::from_wire(NativeEndian::read_u32(&buf[OFF_RESPONSE_KIND..])),
            }),
            Command::UpdateVsn => {
                let count = NativeEndian::read_u32(&buf[OFF_COUNT..]);
                if count as usize > MAX_VSN_BATCH {
                    return Err(ProtocolViolation::BatchTooLarge(count).into());
                }
                let mut batch = VsnBatch::new();
                for i in 0..count as usize {
                    let start = OFF_ELEMENTS + i * VSN_ELEMENT_SIZE;
                    let change = decode_element(&buf[start..start + VSN_ELEMENT_SIZE])?;
                    // count <= MAX_VSN_BATCH, so the batch cannot overflow
                    let _ = batch.push(change);
                }
                Message::UpdateVsn(batch)
            }
            Command::Disconnect => Message::Disconnect,
            Command::Heartbeat => Message::Heartbeat,
            Command::SendVsnFilters => Message::SendVsnFilters,
        };

        Ok(Self {
            version,
            flags,
            token,
            data_port,
            message,
        })
    }
}

/// Convert every multi-byte field of `buf` between host and wire order.
///
/// Identity on big-endian hosts; applying it twice restores the input.
/// `buf` must hold at least [`RECORD_SIZE`] bytes.
pub fn normalize(buf: &mut [u8], command: Command) {
    if cfg!(target_endian = "big") {
        return;
    }
    swap_fields(buf, 0, HEADER_FIELDS);
    match command {
        Command::Connect => swap_fields(buf, 0, CONNECT_FIELDS),
        Command::Response => swap_fields(buf, 0, RESPONSE_FIELDS),
        Command::UpdateVsn => {
            swap_fields(buf, 0, &[(OFF_COUNT, 4)]);
            for i in 0..MAX_VSN_BATCH {
                swap_fields(buf, OFF_ELEMENTS + i * VSN_ELEMENT_SIZE, ELEMENT_FIELDS);
            }
        }
        Command::Disconnect | Command::Heartbeat | Command::SendVsnFilters => {}
    }
}

fn swap_fields(buf: &mut [u8], base: usize, fields: &[(usize, usize)]) {
    for &(offset, width) in fields {
        buf[base + offset..base + offset + width].reverse();
    }
}

fn encode_element(el: &mut [u8], change: &CatalogChange) {
    let entry = &change.entry;
    write_text(&mut el[EL_VSN..EL_VSN + VSN_LEN], entry.vsn.as_str());
    write_text(&mut el[EL_MEDIA..EL_MEDIA + MEDIA_LEN], entry.media.as_str());
    NativeEndian::write_u16(&mut el[EL_EQ..], entry.eq);
    NativeEndian::write_u16(&mut el[EL_PARTITION..], entry.partition);
    NativeEndian::write_u32(&mut el[EL_SLOT..], entry.slot);
    NativeEndian::write_u32(&mut el[EL_STATUS..], entry.status.to_bits());
    NativeEndian::write_u32(&mut el[EL_BLOCK_SIZE..], entry.block_size);
    NativeEndian::write_u64(&mut el[EL_CAPACITY..], entry.capacity);
    NativeEndian::write_u64(&mut el[EL_SPACE..], entry.space);
    NativeEndian::write_u32(&mut el[EL_UPDATE_FLAGS..], change.flags.to_bits());
}

fn decode_element(el: &[u8]) -> Result<CatalogChange, ProtocolViolation> {
    let vsn = Vsn::new(read_text(&el[EL_VSN..EL_VSN + VSN_LEN], "vsn")?)
        .map_err(|_| ProtocolViolation::InvalidText("vsn"))?;
    let media = MediaType::new(read_text(&el[EL_MEDIA..EL_MEDIA + MEDIA_LEN], "media")?)
        .map_err(|_| ProtocolViolation::InvalidText("media"))?;

    let entry = CatalogEntry {
        eq: NativeEndian::read_u16(&el[EL_EQ..]),
        slot: NativeEndian::read_u32(&el[EL_SLOT..]),
        partition: NativeEndian::read_u16(&el[EL_PARTITION..]),
        media,
        vsn,
        status: VolumeStatus::from_bits(NativeEndian::read_u32(&el[EL_STATUS..])),
        block_size: NativeEndian::read_u32(&el[EL_BLOCK_SIZE..]),
        capacity: NativeEndian::read_u64(&el[EL_CAPACITY..]),
        space: NativeEndian::read_u64(&el[EL_SPACE..]),
    };
    // Status already carries the export bit; keep the entry as sent.
    Ok(CatalogChange {
        entry,
        flags: UpdateFlags::from_bits(NativeEndian::read_u32(&el[EL_UPDATE_FLAGS..])),
    })
}

/// Copy `text` into a zeroed fixed-size field. Callers guarantee it fits.
fn write_text(field: &mut [u8], text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

fn read_text<'a>(field: &'a [u8], name: &'static str) -> Result<&'a str, ProtocolViolation> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).map_err(|_| ProtocolViolation::InvalidText(name))
}

/// Outcome of reading one record from a stream.
#[derive(Debug)]
pub enum Inbound {
    Record(Record),
    /// A full-size record that failed validation, or a record cut short by EOF.
    Invalid(CodecError),
    /// Clean end of stream on a record boundary.
    Closed,
}

/// Reads fixed-size records from a byte stream.
///
/// Partial reads are kept across calls, so [`RecordReader::next`] may be
/// raced in `select!` or wrapped in a timeout without losing data.
pub struct RecordReader<R> {
    inner: R,
    buf: Box<[u8]>,
    filled: usize,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; RECORD_SIZE].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Read the next record.
    pub async fn next(&mut self) -> io::Result<Inbound> {
        while self.filled < RECORD_SIZE {
            let n = self.inner.read(&mut self.buf[self.filled..]).await?;
            if n == 0 {
                let actual = std::mem::take(&mut self.filled);
                if actual == 0 {
                    return Ok(Inbound::Closed);
                }
                return Ok(Inbound::Invalid(CodecError::ShortRead {
                    expected: RECORD_SIZE,
                    actual,
                }));
            }
            self.filled += n;
        }
        self.filled = 0;

        Ok(match Record::decode(&self.buf) {
            Ok(record) => Inbound::Record(record),
            Err(e) => Inbound::Invalid(e),
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write one record and flush.
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &Record) -> io::Result<()> {
    writer.write_all(&record.encode()).await?;
    writer.flush().await
}

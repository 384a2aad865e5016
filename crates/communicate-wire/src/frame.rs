//! Data framing: how one transfer looks on the byte stream.
//!
//! ```text
//! +-----------+---------------+------------------+---------------------+
//! | u32 BE    | header (JSON) | payload          | footer (JSON)       |
//! | hdr len   | hdr len bytes | `Length` bytes   | `FooterLength` bytes|
//! +-----------+---------------+------------------+---------------------+
//! ```
//!
//! The header is a flat JSON object of string keys to string values. It
//! always carries `Name`, `Length` and `Kind`; the footer is present only
//! when the header carries a non-zero `FooterLength`. Reading tolerates
//! arbitrarily fragmented input and reports progress per component.

use crate::codec::CodecError;
use communicate_types::{
    ActionState, DataComponent, DataKind, ErrorCode, TransferProgress,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Content name of the frame.
pub const NAME_KEY: &str = "Name";
/// Payload length in bytes.
pub const LENGTH_KEY: &str = "Length";
/// Registered identifier of the payload's [`DataKind`].
pub const KIND_KEY: &str = "Kind";
/// MIME type of image payloads.
pub const MIME_TYPE_KEY: &str = "MimeType";
/// Footer length in bytes, omitted when there is no footer.
pub const FOOTER_LENGTH_KEY: &str = "FooterLength";

/// Size of the header length prefix.
pub const HEADER_PREFIX_LEN: usize = 4;

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("{component:?} too large: {size} bytes (max {max})")]
    FrameTooLarge {
        component: DataComponent,
        size: u64,
        max: u32,
    },
    #[error("Missing header key '{0}'")]
    MissingHeader(String),
    #[error("Header '{key}' = '{value}' is not a valid {expected}")]
    HeaderType {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Kind '{0}' is reserved for connection control")]
    ReservedKind(DataKind),
}

impl WireError {
    /// The connection-phase code an application observes for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            WireError::ConnectionClosed => ErrorCode::ConnectionClosed,
            WireError::Io(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => ErrorCode::ConnectionClosed,
                std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRejected,
                _ => ErrorCode::ConnectionUnknownError,
            },
            _ => ErrorCode::ConnectionUnknownError,
        }
    }
}

/// String-to-string mapping used for frame headers and footers.
///
/// Typed accessors parse on read and fail with [`WireError::HeaderType`]
/// when the stored string does not parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameHeader {
    entries: BTreeMap<String, String>,
}

impl FrameHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FrameHeader::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every entry of `other` into `self`, overwriting on conflict.
    pub fn merge(&mut self, other: &FrameHeader) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn set_int(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, value.to_string());
    }

    pub fn set_float(&mut self, key: impl Into<String>, value: f64) {
        self.set(key, value.to_string());
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, value.to_string());
    }

    pub fn get_int(&self, key: &str) -> Result<i64, WireError> {
        self.parse(key, "integer")
    }

    pub fn get_float(&self, key: &str) -> Result<f64, WireError> {
        self.parse(key, "float")
    }

    /// Accepts `true`/`false` in any letter case.
    pub fn get_bool(&self, key: &str) -> Result<bool, WireError> {
        let value = self.require(key)?;
        if value.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if value.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(type_error(key, value, "bool"))
        }
    }

    fn require(&self, key: &str) -> Result<&str, WireError> {
        self.get(key)
            .ok_or_else(|| WireError::MissingHeader(key.to_string()))
    }

    fn parse<T: FromStr>(&self, key: &str, expected: &'static str) -> Result<T, WireError> {
        let value = self.require(key)?;
        value
            .trim()
            .parse()
            .map_err(|_| type_error(key, value, expected))
    }

    /// Content name, if set.
    pub fn name(&self) -> Option<&str> {
        self.get(NAME_KEY)
    }

    /// Declared payload length.
    pub fn length(&self) -> Result<u64, WireError> {
        let value = self.get_int(LENGTH_KEY)?;
        u64::try_from(value).map_err(|_| type_error(LENGTH_KEY, &value.to_string(), "length"))
    }

    /// Declared footer length, zero when absent.
    pub fn footer_length(&self) -> Result<u64, WireError> {
        if !self.contains_key(FOOTER_LENGTH_KEY) {
            return Ok(0);
        }
        let value = self.get_int(FOOTER_LENGTH_KEY)?;
        u64::try_from(value)
            .map_err(|_| type_error(FOOTER_LENGTH_KEY, &value.to_string(), "length"))
    }

    /// Payload kind, resolved through the kind registry.
    pub fn kind(&self) -> Result<DataKind, WireError> {
        let id = self.get_int(KIND_KEY)?;
        let id = i32::try_from(id).map_err(|_| type_error(KIND_KEY, &id.to_string(), "kind"))?;
        Ok(DataKind::from_identifier(id))
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.get(MIME_TYPE_KEY)
    }

    /// JSON bytes; an empty mapping encodes as `{}`.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse JSON bytes. Zero bytes decode to an empty mapping.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn type_error(key: &str, value: impl Display, expected: &'static str) -> WireError {
    WireError::HeaderType {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

/// One complete unit of transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub header: FrameHeader,
    pub kind: DataKind,
    pub payload: Vec<u8>,
    pub footer: FrameHeader,
}

impl DataFrame {
    /// Build a frame, filling in `Kind`, `Length` and, when absent, `Name`.
    ///
    /// A frame without a caller-supplied name gets a fresh UUID so progress
    /// reports for it can be told apart.
    pub fn new(kind: DataKind, mut header: FrameHeader, payload: Vec<u8>) -> Self {
        if header.name().map_or(true, str::is_empty) {
            header.set(NAME_KEY, uuid::Uuid::new_v4().to_string());
        }
        let mut frame = Self {
            header,
            kind,
            payload,
            footer: FrameHeader::default(),
        };
        frame.stamp();
        frame
    }

    /// Attach a footer.
    pub fn with_footer(mut self, footer: FrameHeader) -> Self {
        self.footer = footer;
        self
    }

    /// Content name.
    pub fn name(&self) -> &str {
        self.header.name().unwrap_or_default()
    }

    fn stamp(&mut self) {
        self.header.set_int(KIND_KEY, i64::from(self.kind.identifier()));
        self.header.set_int(LENGTH_KEY, self.payload.len() as i64);
    }

    /// Encode the prefix and header, plus the footer bytes.
    fn encode_parts(&self) -> Result<(Vec<u8>, Vec<u8>), WireError> {
        let mut header = self.header.clone();
        header.set_int(KIND_KEY, i64::from(self.kind.identifier()));
        header.set_int(LENGTH_KEY, self.payload.len() as i64);
        let footer = if self.footer.is_empty() {
            header.remove(FOOTER_LENGTH_KEY);
            Vec::new()
        } else {
            let footer = self.footer.encode()?;
            header.set_int(FOOTER_LENGTH_KEY, footer.len() as i64);
            footer
        };

        let json = header.encode()?;
        let len = u32::try_from(json.len()).map_err(|_| WireError::FrameTooLarge {
            component: DataComponent::Header,
            size: json.len() as u64,
            max: u32::MAX,
        })?;
        let mut head = Vec::with_capacity(HEADER_PREFIX_LEN + json.len());
        head.extend_from_slice(&len.to_be_bytes());
        head.extend_from_slice(&json);
        Ok((head, footer))
    }

    /// The complete frame as one byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let (mut bytes, footer) = self.encode_parts()?;
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&footer);
        Ok(bytes)
    }
}

/// Bounds applied while reading and writing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest header, payload or footer accepted.
    pub max_component_bytes: u32,
    /// Progress granularity in percent; also sets the I/O chunk size.
    pub progress_percentage: u8,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_component_bytes: 64 * 1024 * 1024,
            progress_percentage: 5,
        }
    }
}

/// Bytes moved per I/O step so that each step is `percentage` of `len`.
pub fn chunk_size(len: usize, percentage: u8) -> usize {
    let steps = 100 / usize::from(percentage.clamp(1, 100));
    match len / steps {
        0 => len.max(1),
        n => n,
    }
}

/// Write one frame, reporting header, body and footer progress.
pub async fn write_frame<W, F>(
    writer: &mut W,
    frame: &DataFrame,
    percentage: u8,
    mut on_progress: F,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    F: FnMut(TransferProgress),
{
    let name = frame.name().to_string();
    let mut report = |component, state| on_progress(TransferProgress::new(&name, component, state));
    let (head, footer) = frame.encode_parts()?;

    report(DataComponent::Header, ActionState::Started);
    writer.write_all(&head).await?;
    report(DataComponent::Header, ActionState::Completed);

    report(DataComponent::Body, ActionState::Started);
    let total = frame.payload.len();
    let step = chunk_size(total, percentage);
    let mut sent = 0;
    for chunk in frame.payload.chunks(step) {
        writer.write_all(chunk).await?;
        sent += chunk.len();
        if sent < total {
            report(
                DataComponent::Body,
                ActionState::Updating(sent as f32 / total as f32),
            );
        }
    }
    report(DataComponent::Body, ActionState::Completed);

    if !footer.is_empty() {
        report(DataComponent::Footer, ActionState::Started);
        writer.write_all(&footer).await?;
        report(DataComponent::Footer, ActionState::Completed);
    }

    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary and
/// [`WireError::ConnectionClosed`] when it ends part-way through a frame.
/// Header progress is reported with an empty name since the name is only
/// known once the header has been parsed.
pub async fn read_frame<R, F>(
    reader: &mut R,
    limits: &FrameLimits,
    mut on_progress: F,
) -> Result<Option<DataFrame>, WireError>
where
    R: AsyncRead + Unpin,
    F: FnMut(TransferProgress),
{
    let mut prefix = [0u8; HEADER_PREFIX_LEN];
    let first = reader.read(&mut prefix).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < HEADER_PREFIX_LEN {
        match reader.read_exact(&mut prefix[first..]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::ConnectionClosed);
            }
            Err(e) => return Err(WireError::Io(e)),
        }
    }

    let header_len = u32::from_be_bytes(prefix);
    check_size(DataComponent::Header, u64::from(header_len), limits)?;

    let pct = limits.progress_percentage;
    on_progress(TransferProgress::new("", DataComponent::Header, ActionState::Started));
    let header_bytes = read_component(reader, header_len as usize, pct, |f| {
        on_progress(TransferProgress::new("", DataComponent::Header, ActionState::Updating(f)))
    })
    .await?;
    let header = FrameHeader::decode(&header_bytes)?;
    let name = header.name().unwrap_or_default().to_string();
    on_progress(TransferProgress::new(&name, DataComponent::Header, ActionState::Completed));

    let kind = header.kind()?;
    let length = header.length()?;
    let footer_length = header.footer_length()?;
    check_size(DataComponent::Body, length, limits)?;
    check_size(DataComponent::Footer, footer_length, limits)?;

    on_progress(TransferProgress::new(&name, DataComponent::Body, ActionState::Started));
    let payload = read_component(reader, length as usize, pct, |f| {
        on_progress(TransferProgress::new(&name, DataComponent::Body, ActionState::Updating(f)))
    })
    .await?;
    on_progress(TransferProgress::new(&name, DataComponent::Body, ActionState::Completed));

    let footer = if footer_length > 0 {
        on_progress(TransferProgress::new(&name, DataComponent::Footer, ActionState::Started));
        let bytes = read_component(reader, footer_length as usize, pct, |f| {
            on_progress(TransferProgress::new(
                &name,
                DataComponent::Footer,
                ActionState::Updating(f),
            ))
        })
        .await?;
        on_progress(TransferProgress::new(&name, DataComponent::Footer, ActionState::Completed));
        FrameHeader::decode(&bytes)?
    } else {
        FrameHeader::default()
    };

    Ok(Some(DataFrame {
        header,
        kind,
        payload,
        footer,
    }))
}

fn check_size(component: DataComponent, size: u64, limits: &FrameLimits) -> Result<(), WireError> {
    if size > u64::from(limits.max_component_bytes) {
        return Err(WireError::FrameTooLarge {
            component,
            size,
            max: limits.max_component_bytes,
        });
    }
    Ok(())
}

/// Read exactly `len` bytes, accumulating partial reads.
///
/// The buffer grows as data arrives so a peer cannot force a large
/// allocation with a length it never sends.
async fn read_component<R, F>(
    reader: &mut R,
    len: usize,
    percentage: u8,
    mut on_update: F,
) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
    F: FnMut(f32),
{
    let step = chunk_size(len, percentage);
    let mut buf = Vec::with_capacity(len.min(step.max(8 * 1024)));
    while buf.len() < len {
        let filled = buf.len();
        let end = (filled + step).min(len);
        buf.resize(end, 0);
        let n = reader.read(&mut buf[filled..end]).await?;
        buf.truncate(filled + n);
        if n == 0 {
            return Err(WireError::ConnectionClosed);
        }
        if buf.len() < len {
            on_update(buf.len() as f32 / len as f32);
        }
    }
    Ok(buf)
}

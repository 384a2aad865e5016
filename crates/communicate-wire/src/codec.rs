//! Payload codecs, keyed by [`DataKind`].
//!
//! A [`Codec`] turns an application [`Payload`] into frame bytes and back.
//! The [`CodecRegistry`] maps each data kind to its codec so new kinds can be
//! added without touching the connection code.

use crate::frame::{FrameHeader, MIME_TYPE_KEY, NAME_KEY};
use communicate_types::registered;
use communicate_types::DataKind;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{found} payload cannot be encoded as {kind}")]
    KindMismatch { kind: String, found: &'static str },
    #[error("No codec registered for data kind {0}")]
    UnsupportedKind(String),
    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    fn malformed(kind: &DataKind, reason: impl ToString) -> Self {
        Self::Malformed {
            kind: kind.name().to_string(),
            reason: reason.to_string(),
        }
    }

    fn mismatch(kind: &DataKind, found: &Payload) -> Self {
        Self::KindMismatch {
            kind: kind.name().to_string(),
            found: found.type_name(),
        }
    }
}

/// Encoded image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// A named file's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub name: String,
    pub data: Vec<u8>,
}

/// An application value before encoding or after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    /// A structured object. Serialized as JSON or MessagePack depending on
    /// the kind it is sent as.
    Object(serde_json::Value),
    Image(ImagePayload),
    File(FilePayload),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text(text.into())
    }

    /// Capture any serializable value as an object payload.
    pub fn object<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        serde_json::to_value(value)
            .map(Payload::Object)
            .map_err(|e| CodecError::malformed(&DataKind::JSON_OBJECT, e))
    }

    /// Wrap image bytes, detecting the MIME type from the content.
    pub fn image(data: Vec<u8>) -> Result<Self, CodecError> {
        let mime_type = sniff_image_mime(&data)
            .ok_or_else(|| CodecError::malformed(&DataKind::IMAGE, "unrecognized image format"))?;
        Ok(Payload::Image(ImagePayload {
            mime_type: mime_type.to_string(),
            data,
        }))
    }

    /// Read a file from disk. Recognized images become [`Payload::Image`],
    /// everything else a [`Payload::File`].
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        if let Some(mime_type) = sniff_image_mime(&data) {
            return Ok(Payload::Image(ImagePayload {
                mime_type: mime_type.to_string(),
                data,
            }));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Payload::File(FilePayload { name, data }))
    }

    /// Deserialize an object payload into `T`.
    pub fn to_object<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        match self {
            Payload::Object(value) => T::deserialize(value)
                .map_err(|e| CodecError::malformed(&DataKind::JSON_OBJECT, e)),
            other => Err(CodecError::mismatch(&DataKind::JSON_OBJECT, other)),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes of byte, image and file payloads.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Image(image) => Some(&image.data),
            Payload::File(file) => Some(&file.data),
            _ => None,
        }
    }

    /// The kind this payload is sent as unless the caller picks another.
    pub fn default_kind(&self) -> DataKind {
        match self {
            Payload::Bytes(_) => DataKind::BYTES,
            Payload::Text(_) => DataKind::TEXT,
            Payload::Object(_) => DataKind::JSON_OBJECT,
            Payload::Image(_) => DataKind::IMAGE,
            Payload::File(_) => DataKind::FILE,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Bytes(_) => "Bytes",
            Payload::Text(_) => "Text",
            Payload::Object(_) => "Object",
            Payload::Image(_) => "Image",
            Payload::File(_) => "File",
        }
    }
}

/// Detect common image formats by their magic bytes.
pub fn sniff_image_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else if data.starts_with(b"BM") && data.len() > 14 {
        Some("image/bmp")
    } else {
        None
    }
}

/// Converts between [`Payload`] values and frame bytes for one or more kinds.
///
/// `encode` may add header entries (a MIME type, a file name); `decode`
/// receives the full header of the frame it decodes.
pub trait Codec: Send + Sync + 'static {
    fn encode(
        &self,
        kind: &DataKind,
        value: &Payload,
        header: &mut FrameHeader,
    ) -> Result<Vec<u8>, CodecError>;

    fn decode(
        &self,
        kind: &DataKind,
        bytes: &[u8],
        header: &FrameHeader,
    ) -> Result<Payload, CodecError>;
}

/// Opaque bytes, passed through untouched.
#[derive(Debug, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn encode(&self, kind: &DataKind, value: &Payload, _: &mut FrameHeader) -> Result<Vec<u8>, CodecError> {
        match value {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(CodecError::mismatch(kind, other)),
        }
    }

    fn decode(&self, _: &DataKind, bytes: &[u8], _: &FrameHeader) -> Result<Payload, CodecError> {
        Ok(Payload::Bytes(bytes.to_vec()))
    }
}

/// UTF-8 text.
#[derive(Debug, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn encode(&self, kind: &DataKind, value: &Payload, _: &mut FrameHeader) -> Result<Vec<u8>, CodecError> {
        match value {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            other => Err(CodecError::mismatch(kind, other)),
        }
    }

    fn decode(&self, kind: &DataKind, bytes: &[u8], _: &FrameHeader) -> Result<Payload, CodecError> {
        String::from_utf8(bytes.to_vec())
            .map(Payload::Text)
            .map_err(|e| CodecError::malformed(kind, e))
    }
}

/// Structured objects as JSON.
#[derive(Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, kind: &DataKind, value: &Payload, _: &mut FrameHeader) -> Result<Vec<u8>, CodecError> {
        match value {
            Payload::Object(object) => {
                serde_json::to_vec(object).map_err(|e| CodecError::malformed(kind, e))
            }
            other => Err(CodecError::mismatch(kind, other)),
        }
    }

    fn decode(&self, kind: &DataKind, bytes: &[u8], _: &FrameHeader) -> Result<Payload, CodecError> {
        serde_json::from_slice(bytes)
            .map(Payload::Object)
            .map_err(|e| CodecError::malformed(kind, e))
    }
}

/// Structured objects as MessagePack.
#[derive(Debug, Default)]
pub struct MessagePackCodec;

impl Codec for MessagePackCodec {
    fn encode(&self, kind: &DataKind, value: &Payload, _: &mut FrameHeader) -> Result<Vec<u8>, CodecError> {
        match value {
            Payload::Object(object) => {
                rmp_serde::to_vec_named(object).map_err(|e| CodecError::malformed(kind, e))
            }
            other => Err(CodecError::mismatch(kind, other)),
        }
    }

    fn decode(&self, kind: &DataKind, bytes: &[u8], _: &FrameHeader) -> Result<Payload, CodecError> {
        rmp_serde::from_slice(bytes)
            .map(Payload::Object)
            .map_err(|e| CodecError::malformed(kind, e))
    }
}

/// Image bytes; the MIME type travels in the `MimeType` header.
#[derive(Debug, Default)]
pub struct ImageCodec;

impl Codec for ImageCodec {
    fn encode(&self, kind: &DataKind, value: &Payload, header: &mut FrameHeader) -> Result<Vec<u8>, CodecError> {
        match value {
            Payload::Image(image) => {
                header.set(MIME_TYPE_KEY, image.mime_type.clone());
                Ok(image.data.clone())
            }
            other => Err(CodecError::mismatch(kind, other)),
        }
    }

    fn decode(&self, kind: &DataKind, bytes: &[u8], header: &FrameHeader) -> Result<Payload, CodecError> {
        let mime_type = match header.mime_type() {
            Some(mime) => mime.to_string(),
            None => sniff_image_mime(bytes)
                .ok_or_else(|| CodecError::malformed(kind, "no MIME type and unrecognized format"))?
                .to_string(),
        };
        Ok(Payload::Image(ImagePayload {
            mime_type,
            data: bytes.to_vec(),
        }))
    }
}

/// File contents; the file name travels as the frame's content name.
#[derive(Debug, Default)]
pub struct FileCodec;

impl Codec for FileCodec {
    fn encode(&self, kind: &DataKind, value: &Payload, header: &mut FrameHeader) -> Result<Vec<u8>, CodecError> {
        match value {
            Payload::File(file) => {
                header.set(NAME_KEY, file.name.clone());
                Ok(file.data.clone())
            }
            other => Err(CodecError::mismatch(kind, other)),
        }
    }

    fn decode(&self, _: &DataKind, bytes: &[u8], header: &FrameHeader) -> Result<Payload, CodecError> {
        Ok(Payload::File(FilePayload {
            name: header.name().unwrap_or("file").to_string(),
            data: bytes.to_vec(),
        }))
    }
}

/// Map from data kind to codec.
///
/// Lookups are lock-free for readers; registration may happen while other
/// tasks are encoding.
pub struct CodecRegistry {
    codecs: DashMap<DataKind, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry with no codecs.
    pub fn empty() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    /// A registry with codecs for every built-in application kind.
    pub fn with_builtin() -> Self {
        registered::init();
        let registry = Self::empty();
        registry.register(DataKind::TEXT, Arc::new(TextCodec));
        registry.register(DataKind::IMAGE, Arc::new(ImageCodec));
        registry.register(DataKind::FILE, Arc::new(FileCodec));
        registry.register(DataKind::JSON_OBJECT, Arc::new(JsonCodec));
        registry.register(DataKind::BINARY_OBJECT, Arc::new(MessagePackCodec));
        registry.register(DataKind::BYTES, Arc::new(BytesCodec));
        registry
    }

    /// The process-wide registry, initialized with the built-ins on first use.
    pub fn global() -> Arc<CodecRegistry> {
        static GLOBAL: OnceLock<Arc<CodecRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(CodecRegistry::with_builtin()))
            .clone()
    }

    /// Install `codec` for `kind`, returning the codec it replaced.
    ///
    /// The kind is also added to the kind registry so peers' headers naming
    /// it resolve to the same name.
    pub fn register(&self, kind: DataKind, codec: Arc<dyn Codec>) -> Option<Arc<dyn Codec>> {
        let kind = kind.register();
        self.codecs.insert(kind, codec)
    }

    pub fn get(&self, kind: &DataKind) -> Option<Arc<dyn Codec>> {
        self.codecs.get(kind).map(|entry| Arc::clone(entry.value()))
    }

    pub fn supports(&self, kind: &DataKind) -> bool {
        self.codecs.contains_key(kind)
    }

    /// Registered kinds ordered by identifier.
    pub fn kinds(&self) -> Vec<DataKind> {
        let mut kinds: Vec<DataKind> = self.codecs.iter().map(|e| e.key().clone()).collect();
        kinds.sort_by_key(DataKind::identifier);
        kinds
    }

    pub fn encode(
        &self,
        kind: &DataKind,
        value: &Payload,
        header: &mut FrameHeader,
    ) -> Result<Vec<u8>, CodecError> {
        self.lookup(kind)?.encode(kind, value, header)
    }

    pub fn decode(
        &self,
        kind: &DataKind,
        bytes: &[u8],
        header: &FrameHeader,
    ) -> Result<Payload, CodecError> {
        self.lookup(kind)?.decode(kind, bytes, header)
    }

    fn lookup(&self, kind: &DataKind) -> Result<Arc<dyn Codec>, CodecError> {
        self.get(kind)
            .ok_or_else(|| CodecError::UnsupportedKind(kind.to_string()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
        label: String,
    }

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn test_text_roundtrip_and_invalid_utf8() {
        let registry = CodecRegistry::with_builtin();
        let mut header = FrameHeader::new();
        let bytes = registry
            .encode(&DataKind::TEXT, &Payload::text("Hello Test"), &mut header)
            .unwrap();
        assert_eq!(bytes.len(), 10);
        let back = registry.decode(&DataKind::TEXT, &bytes, &header).unwrap();
        assert_eq!(back.as_text(), Some("Hello Test"));

        let err = registry
            .decode(&DataKind::TEXT, &[0xff, 0xfe], &header)
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_objects_json_and_messagepack() {
        let registry = CodecRegistry::with_builtin();
        let value = Position {
            x: 3,
            y: -4,
            label: "corner".into(),
        };
        let payload = Payload::object(&value).unwrap();

        for kind in [DataKind::JSON_OBJECT, DataKind::BINARY_OBJECT] {
            let mut header = FrameHeader::new();
            let bytes = registry.encode(&kind, &payload, &mut header).unwrap();
            let back = registry.decode(&kind, &bytes, &header).unwrap();
            assert_eq!(back.to_object::<Position>().unwrap(), value);
        }
    }

    #[test]
    fn test_kind_mismatch_and_unsupported() {
        let registry = CodecRegistry::with_builtin();
        let mut header = FrameHeader::new();
        let err = registry
            .encode(&DataKind::TEXT, &Payload::Bytes(vec![1]), &mut header)
            .unwrap_err();
        assert!(matches!(err, CodecError::KindMismatch { found: "Bytes", .. }));

        let custom = DataKind::new(5000, "Telemetry");
        let err = registry
            .encode(&custom, &Payload::Bytes(vec![1]), &mut header)
            .unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedKind(_)));
    }

    #[test]
    fn test_register_custom_kind() {
        let registry = CodecRegistry::empty();
        let custom = DataKind::new(5001, "Sensor Bytes");
        assert!(registry.register(custom.clone(), Arc::new(BytesCodec)).is_none());
        assert!(registry.supports(&custom));
        assert!(DataKind::lookup(5001).is_some());
        assert!(!registry.supports(&DataKind::TEXT));
    }

    #[test]
    fn test_image_mime_header() {
        let registry = CodecRegistry::with_builtin();
        let payload = Payload::image(PNG_HEADER.to_vec()).unwrap();
        let mut header = FrameHeader::new();
        let bytes = registry.encode(&DataKind::IMAGE, &payload, &mut header).unwrap();
        assert_eq!(header.mime_type(), Some("image/png"));
        let back = registry.decode(&DataKind::IMAGE, &bytes, &header).unwrap();
        assert_eq!(back, payload);

        assert!(Payload::image(b"plain text".to_vec()).is_err());
    }

    #[test]
    fn test_sniff_formats() {
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_image_mime(b"GIF89a...."), Some("image/gif"));
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_image_mime(b"hello"), None);
    }

    #[tokio::test]
    async fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let text_path = dir.path().join("notes.txt");
        tokio::fs::write(&text_path, b"some notes").await.unwrap();
        let image_path = dir.path().join("pixel.png");
        tokio::fs::write(&image_path, PNG_HEADER).await.unwrap();

        match Payload::from_path(&text_path).await.unwrap() {
            Payload::File(file) => {
                assert_eq!(file.name, "notes.txt");
                assert_eq!(file.data, b"some notes");
            }
            other => panic!("expected file payload, got {other:?}"),
        }
        let image = Payload::from_path(&image_path).await.unwrap();
        assert_eq!(image.default_kind(), DataKind::IMAGE);

        let missing = Payload::from_path(dir.path().join("absent")).await;
        assert!(matches!(missing, Err(CodecError::Io(_))));
    }

    #[test]
    fn test_file_name_in_header() {
        let registry = CodecRegistry::with_builtin();
        let payload = Payload::File(FilePayload {
            name: "report.csv".into(),
            data: b"a,b".to_vec(),
        });
        let mut header = FrameHeader::new();
        let bytes = registry.encode(&DataKind::FILE, &payload, &mut header).unwrap();
        assert_eq!(header.name(), Some("report.csv"));
        assert_eq!(registry.decode(&DataKind::FILE, &bytes, &header).unwrap(), payload);
    }
}

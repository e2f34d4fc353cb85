use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const MAX_ATTACHMENTS: usize = 4;

/// An image ready to be sent to the model: base64 payload without a `data:` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub data: String,
    pub mime_type: String,
    pub file_name: String,
}

impl EncodedImage {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("could not read {name}: {reason}")]
    Read { name: String, reason: String },
}

impl AttachmentError {
    fn read(name: &str, reason: impl ToString) -> Self {
        AttachmentError::Read { name: name.to_string(), reason: reason.to_string() }
    }
}

#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Inline(Vec<u8>),
    Base64(String),
}

#[derive(Debug, Clone)]
pub struct RawFile {
    pub name: String,
    pub mime_type: String,
    pub source: FileSource,
}

impl RawFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self { name, mime_type: guess_mime(&path), source: FileSource::Path(path) }
    }

    pub fn inline(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), mime_type: mime_type.into(), source: FileSource::Inline(bytes) }
    }

    pub fn from_data_url(name: impl Into<String>, url: &str) -> Option<Self> {
        let (mime_type, data) = parse_data_url(url)?;
        Some(Self { name: name.into(), mime_type, source: FileSource::Base64(data) })
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// MIME type from the file extension, `application/octet-stream` when unknown.
pub fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

/// Splits `data:<mime>;base64,<payload>` into mime type and payload.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mut meta_parts = meta.split(';');
    let mime = meta_parts.next()?.trim().to_string();
    if !meta_parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return None;
    }
    Some((mime, data.trim().to_string()))
}

/// Turns a rendered result image back into an attachable image.
pub fn decode_data_url(url: &str, file_name: &str) -> Result<EncodedImage, AttachmentError> {
    let (mime_type, data) =
        parse_data_url(url).ok_or_else(|| AttachmentError::read(file_name, "not a base64 data URL"))?;
    let bytes = BASE64_STANDARD.decode(data.as_bytes()).map_err(|e| AttachmentError::read(file_name, e))?;
    if bytes.is_empty() {
        return Err(AttachmentError::read(file_name, "empty image"));
    }
    Ok(EncodedImage { data: BASE64_STANDARD.encode(bytes), mime_type, file_name: file_name.to_string() })
}

pub async fn encode(file: &RawFile) -> Result<EncodedImage, AttachmentError> {
    let bytes = match &file.source {
        FileSource::Path(path) => tokio::fs::read(path).await.map_err(|e| AttachmentError::read(&file.name, e))?,
        FileSource::Inline(bytes) => bytes.clone(),
        FileSource::Base64(data) => BASE64_STANDARD
            .decode(data.trim().as_bytes())
            .map_err(|e| AttachmentError::read(&file.name, e))?,
    };
    if bytes.is_empty() {
        return Err(AttachmentError::read(&file.name, "file is empty"));
    }
    Ok(EncodedImage {
        data: BASE64_STANDARD.encode(bytes),
        mime_type: file.mime_type.clone(),
        file_name: file.name.clone(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddReport {
    pub accepted: usize,
    pub rejected_non_image: usize,
    pub dropped_over_quota: usize,
    pub failed: Vec<String>,
}

/// Filters non-images, cuts the batch to `remaining` slots and encodes what is left.
/// Files that fail to encode are logged and skipped; the rest of the batch proceeds.
pub async fn encode_batch(files: Vec<RawFile>, remaining: usize) -> (Vec<EncodedImage>, AddReport) {
    let mut report = AddReport::default();
    let images: Vec<RawFile> = files
        .into_iter()
        .filter(|f| {
            let keep = f.is_image();
            if !keep {
                report.rejected_non_image += 1;
            }
            keep
        })
        .collect();
    report.dropped_over_quota = images.len().saturating_sub(remaining);

    let mut encoded = Vec::new();
    for file in images.into_iter().take(remaining) {
        match encode(&file).await {
            Ok(img) => encoded.push(img),
            Err(e) => {
                warn!(file = %file.name, error = %e, "skipping attachment");
                report.failed.push(file.name);
            }
        }
    }
    report.accepted = encoded.len();
    (encoded, report)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentTray {
    images: Vec<EncodedImage>,
}

impl AttachmentTray {
    pub fn images(&self) -> &[EncodedImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn remaining(&self) -> usize {
        MAX_ATTACHMENTS.saturating_sub(self.images.len())
    }

    /// Appends already-encoded images, dropping anything past the cap.
    /// Returns how many were dropped.
    pub fn push_all(&mut self, images: Vec<EncodedImage>) -> usize {
        let room = self.remaining();
        let dropped = images.len().saturating_sub(room);
        self.images.extend(images.into_iter().take(room));
        dropped
    }

    pub async fn add_files(&mut self, files: Vec<RawFile>) -> AddReport {
        let (encoded, mut report) = encode_batch(files, self.remaining()).await;
        let dropped = self.push_all(encoded);
        report.accepted -= dropped;
        report.dropped_over_quota += dropped;
        report
    }

    pub fn remove(&mut self, index: usize) -> Option<EncodedImage> {
        (index < self.images.len()).then(|| self.images.remove(index))
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }

    pub fn take(&mut self) -> Vec<EncodedImage> {
        std::mem::take(&mut self.images)
    }
}

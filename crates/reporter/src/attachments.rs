//! Attachment factory
//!
//! Builds attachment descriptors and forwards the bodies to the result sink
//! under a generated file name.

use std::path::Path;

use stepwise_common::{digest, Attachment, Result};
use tracing::{debug, warn};

use crate::sink::SharedSink;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
pub const APPLICATION_JSON: &str = "application/json";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";

const PNG_MAGIC: &[u8] = b"\x89PNG";
const JPEG_MAGIC: &[u8] = b"\xff\xd8\xff";

/// Generated attachment file name: `{uuid}-attachment.{ext}`
pub fn attachment_file_name(ext: &str) -> String {
    format!("{}-attachment.{}", digest::new_uuid(), ext)
}

/// File extension for a MIME type, `unknown` when none is registered
pub fn extension_for_mime(mime_type: &str) -> String {
    let preferred = match mime_type {
        TEXT_PLAIN => Some("txt"),
        TEXT_HTML => Some("html"),
        APPLICATION_JSON => Some("json"),
        IMAGE_PNG => Some("png"),
        IMAGE_JPEG => Some("jpg"),
        _ => None,
    };
    preferred
        .or_else(|| {
            mime_guess::get_mime_extensions_str(mime_type)
                .and_then(|exts| exts.first().copied())
        })
        .unwrap_or("unknown")
        .to_string()
}

/// MIME type of a screenshot, sniffed from its magic bytes
pub fn screenshot_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(PNG_MAGIC) {
        IMAGE_PNG
    } else if bytes.starts_with(JPEG_MAGIC) {
        IMAGE_JPEG
    } else {
        IMAGE_PNG
    }
}

/// Creates attachments and hands their bodies to the sink
#[derive(Clone)]
pub struct AttachmentFactory {
    sink: SharedSink,
}

impl AttachmentFactory {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    fn descriptor(name: &str, mime_type: &str, ext: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            source: attachment_file_name(ext),
            mime_type: mime_type.to_string(),
        }
    }

    /// Attachment from in-memory bytes
    pub fn memory(&self, data: &[u8], name: &str, mime_type: &str) -> Result<Attachment> {
        let attachment = Self::descriptor(name, mime_type, &extension_for_mime(mime_type));
        self.sink.attach_data(data, &attachment.source)?;
        debug!("Attached '{}' as {} ({} bytes)", name, attachment.source, data.len());
        Ok(attachment)
    }

    /// Attachment from text, stored as UTF-8
    pub fn text(&self, text: &str, name: &str, mime_type: &str) -> Result<Attachment> {
        self.memory(text.as_bytes(), name, mime_type)
    }

    /// Attachment from a serializable value, rendered as indented JSON.
    ///
    /// If the value cannot be serialized, falls back to `fallback` rendered
    /// as plain text under the name `"{name} (fallback)"`.
    pub fn json<T>(&self, data: &T, name: &str) -> Result<Attachment>
    where
        T: serde::Serialize + std::fmt::Debug + ?Sized,
    {
        match serde_json::to_string_pretty(data) {
            Ok(json) => self.text(&json, name, APPLICATION_JSON),
            Err(e) => {
                warn!("Could not serialize '{}' as JSON, attaching as text: {}", name, e);
                self.text(&format!("{:?}", data), &format!("{} (fallback)", name), TEXT_PLAIN)
            }
        }
    }

    /// Attachment from a file on disk.
    ///
    /// Returns `Ok(None)` when the path does not exist. The MIME type is
    /// guessed from the extension when not given.
    pub fn file(
        &self,
        path: &Path,
        name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Result<Option<Attachment>> {
        if !path.exists() {
            warn!("Attachment source not found: {}", path.display());
            return Ok(None);
        }

        let mime_type = match mime_type {
            Some(m) => m.to_string(),
            None => mime_guess::from_path(path)
                .first_raw()
                .unwrap_or(OCTET_STREAM)
                .to_string(),
        };
        let name = match name {
            Some(n) => n.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        };
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let attachment = Self::descriptor(&name, &mime_type, &ext);
        self.sink.attach_file(path, &attachment.source)?;
        debug!("Attached file {} as {}", path.display(), attachment.source);
        Ok(Some(attachment))
    }

    /// Attachment from screenshot bytes; PNG unless the bytes look like JPEG
    pub fn screenshot(&self, bytes: &[u8], name: &str) -> Result<Attachment> {
        self.memory(bytes, name, screenshot_mime(bytes))
    }

    /// HTML link attachment named `Link: {name}`
    pub fn link(&self, url: &str, name: Option<&str>) -> Result<Attachment> {
        let display = name.unwrap_or(url);
        let html = format!(r#"<a href="{}" target="_blank">{}</a>"#, url, display);
        self.text(&html, &format!("Link: {}", display), TEXT_HTML)
    }
}

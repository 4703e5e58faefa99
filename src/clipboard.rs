use std::borrow::Cow;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use arboard::{Clipboard, ImageData};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, RgbaImage};
use thiserror::Error;
use tracing::debug;

use crate::protocol::Kind;

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Backend(#[from] arboard::Error),
    #[error("clipboard holds neither text nor an image")]
    Empty,
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image conversion failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("image buffer does not match {width}x{height}")]
    ImageSize { width: usize, height: usize },
}

/// Current clipboard contents in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: String,
    pub kind: Kind,
}

impl Snapshot {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: Kind::Text,
        }
    }
}

/// Access to a clipboard, independent of the platform behind it.
pub trait ClipboardAccess: Send + 'static {
    fn read(&mut self) -> Result<Snapshot, ClipboardError>;

    fn write(&mut self, content: &str, kind: Kind) -> Result<(), ClipboardError>;
}

/// The desktop clipboard.
pub struct SystemClipboard {
    clipboard: Clipboard,
}

impl SystemClipboard {
    pub fn new() -> Result<Self, ClipboardError> {
        Ok(Self {
            clipboard: Clipboard::new()?,
        })
    }

    fn write_text(&mut self, text: &str) -> Result<(), ClipboardError> {
        // Clipboard managers that let entries be "deleted" still report them as
        // current; writing a newline first pushes the entry back to the top.
        if matches!(self.clipboard.get_text(), Ok(current) if current == text) {
            self.clipboard.set_text("\n")?;
        }
        self.clipboard.set_text(text)?;
        Ok(())
    }
}

impl ClipboardAccess for SystemClipboard {
    fn read(&mut self) -> Result<Snapshot, ClipboardError> {
        match self.clipboard.get_text() {
            Ok(text) => return Ok(Snapshot::text(text)),
            Err(arboard::Error::ContentNotAvailable) => {}
            Err(e) => return Err(e.into()),
        }

        match self.clipboard.get_image() {
            Ok(image) => Ok(Snapshot {
                content: encode_image(&image)?,
                kind: Kind::Image,
            }),
            Err(arboard::Error::ContentNotAvailable) => Err(ClipboardError::Empty),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, content: &str, kind: Kind) -> Result<(), ClipboardError> {
        debug!(len = content.len(), %kind, "writing clipboard");
        match kind {
            Kind::Text => self.write_text(content),
            Kind::Image => {
                let image = decode_image(content)?;
                self.clipboard.set_image(image)?;
                Ok(())
            }
        }
    }
}

/// Encode raw RGBA clipboard pixels as base64 PNG.
pub fn encode_image(image: &ImageData<'_>) -> Result<String, ClipboardError> {
    let size_error = || ClipboardError::ImageSize {
        width: image.width,
        height: image.height,
    };
    let width = u32::try_from(image.width).map_err(|_| size_error())?;
    let height = u32::try_from(image.height).map_err(|_| size_error())?;
    let rgba = RgbaImage::from_raw(width, height, image.bytes.to_vec()).ok_or_else(size_error)?;

    let mut png = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(STANDARD.encode(png))
}

pub fn decode_image(encoded: &str) -> Result<ImageData<'static>, ClipboardError> {
    let png = STANDARD.decode(encoded)?;
    let rgba = image::load_from_memory_with_format(&png, ImageFormat::Png)?.to_rgba8();
    Ok(ImageData {
        width: rgba.width() as usize,
        height: rgba.height() as usize,
        bytes: Cow::Owned(rgba.into_raw()),
    })
}

/// Clipboard kept in memory. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    inner: Arc<Mutex<Option<Snapshot>>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(snapshot: Snapshot) -> Self {
        let clipboard = Self::new();
        clipboard.set(snapshot);
        clipboard
    }

    pub fn set(&self, snapshot: Snapshot) {
        *self.lock() = Some(snapshot);
    }

    pub fn get(&self) -> Option<Snapshot> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Snapshot>> {
        // A panic while holding the lock cannot leave a half-written Option.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ClipboardAccess for MemoryClipboard {
    fn read(&mut self) -> Result<Snapshot, ClipboardError> {
        self.get().ok_or(ClipboardError::Empty)
    }

    fn write(&mut self, content: &str, kind: Kind) -> Result<(), ClipboardError> {
        self.set(Snapshot {
            content: content.to_string(),
            kind,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_clipboard_shares_state() {
        let mut writer = MemoryClipboard::new();
        let mut reader = writer.clone();
        assert!(matches!(reader.read(), Err(ClipboardError::Empty)));

        writer.write("hello", Kind::Text).unwrap();
        assert_eq!(reader.read().unwrap(), Snapshot::text("hello"));
    }

    #[test]
    fn test_image_roundtrip() {
        let pixels: Vec<u8> = (0..2 * 3 * 4).map(|i| i as u8).collect();
        let image = ImageData {
            width: 2,
            height: 3,
            bytes: Cow::Owned(pixels.clone()),
        };

        let encoded = encode_image(&image).unwrap();
        assert!(encoded.is_ascii());

        let decoded = decode_image(&encoded).unwrap();
        assert_eq!(decoded.width, 2);
        assert_eq!(decoded.height, 3);
        assert_eq!(decoded.bytes.as_ref(), pixels.as_slice());
    }

    #[test]
    fn test_image_size_mismatch() {
        let image = ImageData {
            width: 4,
            height: 4,
            bytes: Cow::Owned(vec![0; 3]),
        };
        assert!(matches!(
            encode_image(&image),
            Err(ClipboardError::ImageSize { width: 4, height: 4 })
        ));
    }

    #[test]
    fn test_decode_image_rejects_bad_base64() {
        assert!(matches!(
            decode_image("not base64!"),
            Err(ClipboardError::Base64(_))
        ));
    }

    #[test]
    fn test_system_clipboard_roundtrip() {
        // Headless environments have no clipboard.
        let Ok(mut clipboard) = SystemClipboard::new() else {
            return;
        };
        if clipboard.write("lanclip test", Kind::Text).is_ok() {
            if let Ok(snapshot) = clipboard.read() {
                assert_eq!(snapshot.content, "lanclip test");
            }
        }
    }
}

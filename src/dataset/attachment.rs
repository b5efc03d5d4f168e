//! Image attachments sent alongside prompts.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::AttachmentError;

/// A base64-encoded image ready to embed in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64 payload.
    pub data: String,
}

impl Attachment {
    /// Reads and encodes the image at `path`.
    pub fn from_path(path: &Path) -> Result<Self, AttachmentError> {
        if !path.exists() {
            return Err(AttachmentError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| AttachmentError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            media_type: guess_media_type(path).to_string(),
            data: STANDARD.encode(bytes),
        })
    }
}

/// Guesses an image MIME type from the file extension.
pub fn guess_media_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_guess_media_type() {
        assert_eq!(guess_media_type(Path::new("a.PNG")), "image/png");
        assert_eq!(guess_media_type(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(guess_media_type(Path::new("a.webp")), "image/webp");
        assert_eq!(guess_media_type(Path::new("a.bmp")), "image/jpeg");
        assert_eq!(guess_media_type(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn test_from_path_encodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("img.png");
        std::fs::write(&path, b"abc").expect("write");

        let attachment = Attachment::from_path(&path).expect("attachment");
        assert_eq!(attachment.media_type, "image/png");
        assert_eq!(attachment.data, "YWJj");
    }

    #[test]
    fn test_from_path_missing() {
        let err = Attachment::from_path(&PathBuf::from("/definitely/not/here.png"))
            .expect_err("missing file");
        assert!(matches!(err, AttachmentError::NotFound(_)));
    }
}

//! Stored files and content addressing
//!
//! Files are immutable blobs addressed by `sha256:<hex>` of their bytes. The
//! ref is derived once at construction and never changes.

use crate::error::{StoreError, StoreResult};
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Media types accepted for stored files.
const EXPECTED_MEDIA_TYPES: [&str; 2] = ["application/wasm", "application/zip"];

/// A binary object in the file store, referenced by its content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// content-type of the blob
    pub media: String,
    /// raw blob
    pub bytes: Bytes,
    r#ref: String,
}

impl StoredFile {
    /// Take a blob and its content-type and derive the content address.
    pub fn new(media: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let r#ref = sha256_ref(&bytes);
        Self {
            media: media.into(),
            bytes,
            r#ref,
        }
    }

    /// The `sha256:<hex>` reference of this file.
    pub fn file_ref(&self) -> &str {
        &self.r#ref
    }
}

/// Calculate the `sha256:<hex>` content address of a blob.
pub fn sha256_ref(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{digest:x}")
}

/// Check whether a string is a well-formed SHA256 content address.
pub fn is_ref(s: &str) -> bool {
    match s.strip_prefix("sha256:") {
        Some(hex) => hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
        None => false,
    }
}

/// Parse a media type, strip optional parameters and check it against the
/// allow-list. Invalid parameters are tolerated; a malformed essence is not.
pub fn check_media_type(media: &str) -> StoreResult<String> {
    let essence = media
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.split_once('/') {
        Some((ty, sub)) if !ty.is_empty() && !sub.is_empty() => {}
        _ => return Err(StoreError::MediaParse(media.to_string())),
    }

    if !EXPECTED_MEDIA_TYPES.contains(&essence.as_str()) {
        return Err(StoreError::MediaUnexpected(essence));
    }
    Ok(essence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_is_deterministic() {
        let a = StoredFile::new("application/wasm", Bytes::from_static(b"\0asm"));
        let b = StoredFile::new("application/zip", Bytes::from_static(b"\0asm"));
        // media and alias never influence the content address
        assert_eq!(a.file_ref(), b.file_ref());
        assert!(is_ref(a.file_ref()));
    }

    #[test]
    fn test_known_digest() {
        // sha256 of the empty string
        assert_eq!(
            sha256_ref(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_is_ref() {
        assert!(is_ref(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
        assert!(!is_ref("sha256:tooshort"));
        assert!(!is_ref("md5:e3b0c44298fc1c149afbf4c8996fb92427ae41e4"));
        assert!(!is_ref("just-a-name.wasm"));
        // uppercase hex is not canonical
        assert!(!is_ref(
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
        ));
    }

    #[test]
    fn test_media_type_allow_list() {
        assert_eq!(check_media_type("application/wasm").unwrap(), "application/wasm");
        assert_eq!(check_media_type("application/zip").unwrap(), "application/zip");
        // parameters are stripped, even slightly broken ones
        assert_eq!(
            check_media_type("application/wasm; charset=binary").unwrap(),
            "application/wasm"
        );
        assert_eq!(check_media_type("application/wasm; bogus").unwrap(), "application/wasm");
        // unexpected or malformed types fail
        assert!(matches!(
            check_media_type("text/plain"),
            Err(StoreError::MediaUnexpected(_))
        ));
        assert!(matches!(
            check_media_type("notamediatype"),
            Err(StoreError::MediaParse(_))
        ));
    }
}

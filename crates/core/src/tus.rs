//! tus 1.0 protocol helpers.

use base64::Engine;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

/// Protocol version spoken by the server.
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions the server implements.
pub const TUS_EXTENSIONS: &str = "creation,termination,expiration";

pub const HEADER_TUS_RESUMABLE: &str = "tus-resumable";
pub const HEADER_TUS_VERSION: &str = "tus-version";
pub const HEADER_TUS_EXTENSION: &str = "tus-extension";
pub const HEADER_TUS_MAX_SIZE: &str = "tus-max-size";
pub const HEADER_UPLOAD_LENGTH: &str = "upload-length";
pub const HEADER_UPLOAD_OFFSET: &str = "upload-offset";
pub const HEADER_UPLOAD_METADATA: &str = "upload-metadata";
pub const HEADER_UPLOAD_EXPIRES: &str = "upload-expires";
pub const HEADER_UPLOAD_STATE: &str = "upload-state";

/// Content type required on PATCH bodies.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Parse an `Upload-Metadata` header.
///
/// The header is a comma-separated list of `key base64value` pairs; the value
/// may be omitted for flag-style keys.
pub fn parse_metadata(header: &str) -> crate::Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default();
        if key.is_empty() || key.chars().any(|c| c.is_whitespace()) {
            return Err(crate::Error::InvalidMetadata(format!("invalid key in '{pair}'")));
        }
        let value = match parts.next().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| crate::Error::InvalidMetadata(format!("{key}: {e}")))?;
                String::from_utf8(bytes)
                    .map_err(|e| crate::Error::InvalidMetadata(format!("{key}: {e}")))?
            }
            _ => String::new(),
        };
        if out.insert(key.to_string(), value).is_some() {
            return Err(crate::Error::InvalidMetadata(format!("duplicate key '{key}'")));
        }
    }
    Ok(out)
}

/// Encode metadata pairs as an `Upload-Metadata` header value.
pub fn encode_metadata(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!(
                    "{k} {}",
                    base64::engine::general_purpose::STANDARD.encode(v.as_bytes())
                )
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Format a timestamp as an RFC 7231 HTTP-date.
pub fn http_date(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_parse_metadata_pairs() {
        // "video.mp4" and "video/mp4"
        let parsed =
            parse_metadata("filename dmlkZW8ubXA0, filetype dmlkZW8vbXA0,is_confidential").unwrap();
        assert_eq!(parsed["filename"], "video.mp4");
        assert_eq!(parsed["filetype"], "video/mp4");
        assert_eq!(parsed["is_confidential"], "");
    }

    #[test]
    fn test_parse_metadata_rejects_bad_base64() {
        assert!(parse_metadata("filename !!!").is_err());
    }

    #[test]
    fn test_parse_metadata_rejects_duplicate_keys() {
        assert!(parse_metadata("a YQ==,a Yg==").is_err());
    }

    #[test]
    fn test_encode_then_parse_metadata() {
        let mut pairs = BTreeMap::new();
        pairs.insert("filename".to_string(), "holiday 2024.mov".to_string());
        pairs.insert("flag".to_string(), String::new());
        let header = encode_metadata(&pairs);
        assert_eq!(parse_metadata(&header).unwrap(), pairs);
    }

    #[test]
    fn test_http_date_format() {
        let at = datetime!(2024-03-05 07:08:09 UTC);
        assert_eq!(http_date(at), "Tue, 05 Mar 2024 07:08:09 GMT");
    }
}

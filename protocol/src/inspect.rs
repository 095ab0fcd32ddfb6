//! The captured request/response record shipped from server to client.

use serde::{Deserialize, Serialize};

pub const BODY_CAP_BYTES: usize = 4096;
pub const BINARY_SNIFF_BYTES: usize = 512;

pub const REQUEST_BODY_TOO_LARGE: &str = "[Request Body Too Large]";
pub const RESPONSE_BODY_TOO_LARGE: &str = "[Response Body Too Large]";
pub const BINARY_REQUEST_BODY: &str = "[Binary Request Body]";
pub const BINARY_RESPONSE_BODY: &str = "[Binary Response Body]";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectRecord {
    pub id: String,
    pub ts_millis: i64,
    pub method: String,
    pub url: String,
    pub req_headers: String,
    pub req_body: String,
    pub status: u16,
    pub res_headers: String,
    pub res_body: String,
    pub duration_ms: u64,
    pub client_ip: String,
    pub public_port: u16,
}

/// Applies the §3 sentinel rules to a captured body: bodies at or above
/// [`BODY_CAP_BYTES`], or containing a NUL byte in the first
/// [`BINARY_SNIFF_BYTES`] bytes, are replaced by the sentinel string.
pub fn sanitize_body(raw: &[u8], too_large: &str, binary: &str) -> String {
    let sniff_len = raw.len().min(BINARY_SNIFF_BYTES);
    if raw[..sniff_len].contains(&0u8) {
        return binary.to_string();
    }
    if raw.len() >= BODY_CAP_BYTES {
        return too_large.to_string();
    }
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_body_passes_through() {
        assert_eq!(
            sanitize_body(b"hello", REQUEST_BODY_TOO_LARGE, BINARY_REQUEST_BODY),
            "hello"
        );
    }

    #[test]
    fn oversize_body_is_sentineled() {
        let big = vec![b'x'; BODY_CAP_BYTES];
        assert_eq!(
            sanitize_body(&big, REQUEST_BODY_TOO_LARGE, BINARY_REQUEST_BODY),
            REQUEST_BODY_TOO_LARGE
        );
    }

    #[test]
    fn nul_in_first_512_bytes_is_binary() {
        let mut buf = vec![b'a'; 10];
        buf[5] = 0;
        assert_eq!(
            sanitize_body(&buf, REQUEST_BODY_TOO_LARGE, BINARY_REQUEST_BODY),
            BINARY_REQUEST_BODY
        );
    }

    #[test]
    fn nul_after_sniff_window_is_not_binary() {
        let mut buf = vec![b'a'; BINARY_SNIFF_BYTES + 10];
        buf[BINARY_SNIFF_BYTES + 1] = 0;
        let out = sanitize_body(&buf, REQUEST_BODY_TOO_LARGE, BINARY_REQUEST_BODY);
        assert_ne!(out, BINARY_REQUEST_BODY);
    }
}

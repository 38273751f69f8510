//! Data URL helpers (`data:<mime>;base64,<payload>`).

use anyhow::{Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose};

/// Encode raw bytes as a base64 data URL.
pub fn encode_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime_type};base64,{}",
        general_purpose::STANDARD.encode(bytes)
    )
}

/// Decode a base64 payload that may or may not carry a `data:...;base64,` prefix.
///
/// Generated maps arrive as data URLs, but the service has been seen to return bare
/// base64 as well, so both forms are accepted.
pub fn decode_base64_payload(value: &str) -> Result<Vec<u8>> {
    let s = value.trim();
    let data = if s.starts_with("data:") {
        let (meta, data) = s
            .split_once(',')
            .ok_or_else(|| anyhow!("invalid data URL: missing comma"))?;
        let is_base64 = meta
            .split(';')
            .any(|t| t.trim().eq_ignore_ascii_case("base64"));
        if !is_base64 {
            bail!("unsupported data URL encoding (expected base64)");
        }
        data
    } else {
        s
    };

    let data = data.trim();
    if data.is_empty() {
        bail!("empty base64 payload");
    }
    general_purpose::STANDARD
        .decode(data)
        .or_else(|_| general_purpose::URL_SAFE.decode(data))
        .map_err(|e| anyhow!("invalid base64 payload: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_wire_shape() {
        assert_eq!(encode_data_url("image/png", b"\0\0\0"), "data:image/png;base64,AAAA");
    }

    #[test]
    fn decode_accepts_prefixed_and_bare_payloads() {
        assert_eq!(decode_base64_payload("data:image/png;base64,AAAA").unwrap(), vec![0, 0, 0]);
        assert_eq!(decode_base64_payload("AAAA").unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_base64_payload("data:image/png;base64,@@@").is_err());
        assert!(decode_base64_payload("data:image/png,plain").is_err());
        assert!(decode_base64_payload("").is_err());
    }
}

//! `data:` URLs (RFC 2397), decoded locally without touching the network.

use base64::Engine;
use percent_encoding::percent_decode_str;
use url::Url;

use super::{NetworkError, Resource, Result};

const DEFAULT_MIME: &str = "text/plain;charset=US-ASCII";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime: String,
    pub body: Vec<u8>,
}

/// Splits `data:[<mediatype>][;base64],<data>` into its media type and bytes.
pub fn parse(url: &Url) -> Result<DataUrl> {
    if url.scheme() != "data" {
        return Err(NetworkError::DataUrl(format!("not a data URL: {url}")));
    }
    // `Url` keeps the fragment separately; everything before it is the payload.
    let rest = &url.as_str()["data:".len()..];
    let rest = rest.split('#').next().unwrap_or_default();
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| NetworkError::DataUrl("missing comma".into()))?;

    let mut mime = String::new();
    let mut is_base64 = false;
    for (index, part) in meta.split(';').enumerate() {
        let part = part.trim();
        if part.eq_ignore_ascii_case("base64") {
            is_base64 = true;
        } else if index == 0 {
            mime.push_str(part);
        } else if !part.is_empty() {
            mime.push(';');
            mime.push_str(part);
        }
    }
    if mime.is_empty() || mime.starts_with(';') {
        mime = format!("{DEFAULT_MIME}{mime}");
    }

    let decoded: Vec<u8> = percent_decode_str(payload).collect();
    let body = if is_base64 {
        let compact: Vec<u8> = decoded
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|_| NetworkError::DataUrl("invalid base64 payload".into()))?
    } else {
        decoded
    };
    Ok(DataUrl { mime, body })
}

/// Decodes `url` into a `200` resource, refusing bodies over `max_bytes`.
pub fn load(url: &Url, max_bytes: usize) -> Result<Resource> {
    let data = parse(url)?;
    if data.body.len() > max_bytes {
        return Err(NetworkError::DataUrl(format!(
            "payload of {} bytes exceeds the {max_bytes} byte limit",
            data.body.len()
        )));
    }
    Ok(Resource::new(url.clone(), 200, Some(&data.mime), data.body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(s: &str) -> Result<DataUrl> {
        parse(&Url::parse(s).unwrap())
    }

    #[test]
    fn decodes_plain_and_base64_payloads() {
        let plain = parse_str("data:text/html,%3Cp%3Ehi%3C/p%3E").unwrap();
        assert_eq!(plain.mime, "text/html");
        assert_eq!(plain.body, b"<p>hi</p>");

        let encoded = parse_str("data:text/plain;base64,aGVs bG8=").unwrap();
        assert_eq!(encoded.body, b"hello");

        let defaulted = parse_str("data:,x").unwrap();
        assert_eq!(defaulted.mime, DEFAULT_MIME);
    }

    #[test]
    fn rejects_malformed_and_oversized_urls() {
        assert!(parse_str("data:text/plain").is_err());
        assert!(parse_str("data:;base64,***").is_err());
        let url = Url::parse("data:,0123456789").unwrap();
        assert!(load(&url, 4).is_err());
        assert_eq!(load(&url, 64).unwrap().text(), "0123456789");
    }
}

use crate::error::Error;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Payload compression scheme, negotiated with the server through the decide
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// Gzip the JSON payload and post it as a raw blob body, signalled with a
    /// `compression=gzip-js` query parameter.
    #[serde(rename = "gzip-js")]
    GzipJs,
    /// Base64-encode the JSON payload inside the form body.
    #[serde(rename = "base64")]
    Base64,
    /// A scheme this client does not implement; never selected.
    #[serde(other)]
    Unsupported,
}

impl Compression {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Compression::GzipJs => "gzip-js",
            Compression::Base64 => "base64",
            Compression::Unsupported => "unsupported",
        }
    }
}

/// Pick the compression scheme for the next request.
///
/// Prefers gzip over base64 when the server supports both. Returns `None`
/// (plain form body) when compression is disabled or nothing usable was
/// negotiated.
pub(crate) fn decide_compression(
    supported: &[Compression],
    disable_compression: bool,
) -> Option<Compression> {
    if disable_compression {
        None
    } else if supported.contains(&Compression::GzipJs) {
        Some(Compression::GzipJs)
    } else if supported.contains(&Compression::Base64) {
        Some(Compression::Base64)
    } else {
        None
    }
}

/// An encoded request body, ready for a transport.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PostData {
    /// `data=<payload>[&compression=<scheme>]` form body.
    Form {
        data: String,
        compression: Option<Compression>,
    },
    /// Opaque compressed body, posted as-is.
    Blob(Vec<u8>),
}

impl PostData {
    /// Query parameters implied by the body encoding.
    pub(crate) fn url_query_args(&self) -> Vec<(String, String)> {
        match self {
            PostData::Blob(_) => vec![("compression".into(), Compression::GzipJs.as_str().into())],
            PostData::Form { .. } => Vec::new(),
        }
    }
}

/// Apply the chosen compression scheme to a serialized JSON payload.
pub(crate) fn compress_data(
    compression: Option<Compression>,
    json: String,
) -> Result<PostData, Error> {
    match compression {
        Some(Compression::GzipJs) => {
            let mut gzip_encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            gzip_encoder
                .write_all(json.as_bytes())
                .map_err(Error::CompressRequest)?;
            let compressed = gzip_encoder.finish().map_err(Error::CompressRequest)?;
            Ok(PostData::Blob(compressed))
        }
        Some(Compression::Base64) => Ok(PostData::Form {
            data: BASE64.encode(json),
            compression: Some(Compression::Base64),
        }),
        Some(Compression::Unsupported) | None => Ok(PostData::Form {
            data: json,
            compression: None,
        }),
    }
}

/// Encode a prepared body into raw bytes plus its content type.
///
/// Blob payloads are passed through untouched so compressed bytes are never
/// form-encoded a second time.
pub(crate) fn encode_post_data(data: &PostData) -> (Vec<u8>, &'static str) {
    match data {
        PostData::Form { data, compression } => {
            let mut body = format!("data={}", urlencoding::encode(data));
            if let Some(compression) = compression {
                body.push_str("&compression=");
                body.push_str(compression.as_str());
            }
            (body.into_bytes(), "application/x-www-form-urlencoded")
        }
        PostData::Blob(bytes) => (bytes.clone(), "text/plain"),
    }
}

/// Decorate a request URL with the standard query parameters: optional
/// `ip=1`, a millisecond cache buster, the library version and any
/// encoding-implied parameters.
pub(crate) fn add_params_to_url(url: &str, query_args: &[(String, String)], ip: bool) -> String {
    let mut decorated = String::from(url);
    let mut push = |name: &str, value: &str| {
        decorated.push(if decorated.contains('?') { '&' } else { '?' });
        decorated.push_str(name);
        decorated.push('=');
        decorated.push_str(&urlencoding::encode(value));
    };
    if ip {
        push("ip", "1");
    }
    push("_", &chrono::Utc::now().timestamp_millis().to_string());
    push("ver", env!("CARGO_PKG_VERSION"));
    for (name, value) in query_args {
        push(name, value);
    }
    decorated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use test_case::test_case;

    #[test_case(&[], false, None ; "nothing negotiated")]
    #[test_case(&[Compression::GzipJs, Compression::Base64], false, Some(Compression::GzipJs) ; "gzip preferred")]
    #[test_case(&[Compression::Base64], false, Some(Compression::Base64) ; "base64 fallback")]
    #[test_case(&[Compression::GzipJs], true, None ; "disabled wins")]
    #[test_case(&[Compression::Unsupported], false, None ; "unknown scheme ignored")]
    fn decide_compression_prefers_gzip(
        supported: &[Compression],
        disabled: bool,
        expected: Option<Compression>,
    ) {
        assert_eq!(expected, decide_compression(supported, disabled));
    }

    #[test]
    fn gzip_round_trips() {
        let json = r#"[{"event":"$pageview"}]"#.to_string();
        let data = compress_data(Some(Compression::GzipJs), json.clone()).unwrap();
        let PostData::Blob(compressed) = &data else {
            unreachable!("gzip produces a blob body");
        };
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(json, decoded);
        assert_eq!(
            vec![("compression".to_string(), "gzip-js".to_string())],
            data.url_query_args()
        );
    }

    #[test]
    fn base64_payload_is_form_encoded() {
        let data = compress_data(Some(Compression::Base64), "{}".into()).unwrap();
        let (body, content_type) = encode_post_data(&data);
        assert_eq!("application/x-www-form-urlencoded", content_type);
        assert_eq!(b"data=e30%3D&compression=base64".to_vec(), body);
    }

    #[test]
    fn plain_payload_is_percent_encoded() {
        let data = compress_data(None, r#"{"a":"b c"}"#.into()).unwrap();
        let (body, _) = encode_post_data(&data);
        assert_eq!(
            "data=%7B%22a%22%3A%22b%20c%22%7D",
            String::from_utf8(body).unwrap()
        );
    }

    #[test]
    fn url_decoration_appends_params() {
        let url = add_params_to_url("https://app.posthog.com/e/", &[], true);
        assert!(url.starts_with("https://app.posthog.com/e/?ip=1&_="));
        assert!(url.contains(&format!("&ver={}", env!("CARGO_PKG_VERSION"))));

        let args = vec![("compression".to_string(), "gzip-js".to_string())];
        let url = add_params_to_url("https://app.posthog.com/s/", &args, false);
        assert!(!url.contains("ip=1"));
        assert!(url.ends_with("&compression=gzip-js"));
    }
}

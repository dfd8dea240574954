//! AWS Signature Version 4 for S3 GET/HEAD requests.
//!
//! Payloads are never signed (`UNSIGNED-PAYLOAD`); only the host, date and
//! content-hash headers (plus the session token, when present) are covered.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use time::OffsetDateTime;

use crate::config::AwsCredentials;

type HmacSha256 = Hmac<Sha256>;

pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Headers to attach to a signed request, in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub headers: Vec<(&'static str, String)>,
}

/// Everything that goes into one request signature.
#[derive(Debug, Clone, Copy)]
pub struct RequestToSign<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Already URI-encoded path, starting with `/`
    pub canonical_uri: &'a str,
    pub region: &'a str,
    pub now: OffsetDateTime,
}

/// Sign `request` and return the headers to send.
pub fn sign(credentials: &AwsCredentials, request: &RequestToSign<'_>) -> SignedHeaders {
    let amz_date = amz_date(request.now);
    let date = &amz_date[..8];

    let mut headers: Vec<(&'static str, String)> = vec![
        ("host", request.host.to_string()),
        ("x-amz-content-sha256", UNSIGNED_PAYLOAD.to_string()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }

    let signed_header_names = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let mut canonical = format!("{}\n{}\n\n", request.method, request.canonical_uri);
    for (name, value) in &headers {
        let _ = writeln!(canonical, "{}:{}", name, value.trim());
    }
    let _ = write!(canonical, "\n{}\n{}", signed_header_names, UNSIGNED_PAYLOAD);

    let scope = format!("{}/{}/{}/aws4_request", date, request.region, SERVICE);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex(&Sha256::digest(canonical.as_bytes()))
    );

    let key = signing_key(&credentials.secret_access_key, date, request.region, SERVICE);
    let signature = hex(&hmac_sha256(&key, string_to_sign.as_bytes()));

    headers.push((
        "authorization",
        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, credentials.access_key_id, scope, signed_header_names, signature
        ),
    ));
    // Host is set by the HTTP client from the URL
    headers.retain(|(name, _)| *name != "host");

    SignedHeaders { headers }
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// `YYYYMMDDTHHMMSSZ` in UTC
pub fn amz_date(now: OffsetDateTime) -> String {
    let t = now.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

/// Percent-encode an object key for the request path. `/` is kept.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

//! `draft-cavage` HTTP signature used by JumpServer access keys.
//!
//! Signed headers are fixed to `(request-target) accept date`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const ACCEPT: &str = "application/json";
const SIGNED_HEADERS: &str = "(request-target) accept date";

/// RFC 7231 `Date` header value.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn signing_string(method: &str, path_and_query: &str, date: &str) -> String {
    format!(
        "(request-target): {} {}\naccept: {}\ndate: {}",
        method.to_lowercase(),
        path_and_query,
        ACCEPT,
        date
    )
}

/// Build the `Authorization` header value for one request.
pub fn authorization(
    key_id: &str,
    secret: &str,
    method: &str,
    path_and_query: &str,
    date: &str,
) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(signing_string(method, path_and_query, date).as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        "Signature keyId=\"{key_id}\",algorithm=\"hmac-sha256\",headers=\"{SIGNED_HEADERS}\",signature=\"{signature}\""
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_header_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(http_date(now), "Mon, 01 Jan 2024 00:00:00 GMT");
    }

    #[test]
    fn signature_matches_known_vector() {
        let header = authorization(
            "ak-1",
            "secret-key",
            "GET",
            "/api/v1/assets/nodes/children/?key=1",
            "Mon, 01 Jan 2024 00:00:00 GMT",
        )
        .unwrap();
        assert_eq!(
            header,
            "Signature keyId=\"ak-1\",algorithm=\"hmac-sha256\",\
             headers=\"(request-target) accept date\",\
             signature=\"mjn5PU1k8QJ8BYGUmYyB3SaPV+LyytqjxlgDKG7zotc=\""
        );
    }
}

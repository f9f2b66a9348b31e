//! AWS signature version 4 request signing.
//!
//! Covers the subset needed for KMS: a POST to the service root with a
//! JSON payload and a fixed header set. Derivation chain per the SigV4
//! specification: `HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region),
//! service), "aws4_request")`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

pub(crate) struct SigningParams<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub session_token: Option<&'a str>,
    pub region: &'a str,
    pub service: &'a str,
}

pub(crate) struct SignedRequest {
    /// Value for the `X-Amz-Date` header.
    pub amz_date: String,
    /// Value for the `Authorization` header.
    pub authorization: String,
}

/// Signs a `POST /` request against `host` carrying `payload` with the
/// given `X-Amz-Target` operation header.
pub(crate) fn sign_request(
    params: &SigningParams<'_>,
    host: &str,
    target: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> SignedRequest {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let payload_hash = hex::encode(Sha256::digest(payload));

    // Canonical headers must be lowercase and sorted by name.
    let mut canonical_headers =
        format!("content-type:{CONTENT_TYPE}\nhost:{host}\nx-amz-date:{amz_date}\n");
    let mut signed_headers = String::from("content-type;host;x-amz-date");
    if let Some(token) = params.session_token {
        canonical_headers.push_str("x-amz-security-token:");
        canonical_headers.push_str(token);
        canonical_headers.push('\n');
        signed_headers.push_str(";x-amz-security-token");
    }
    canonical_headers.push_str("x-amz-target:");
    canonical_headers.push_str(target);
    canonical_headers.push('\n');
    signed_headers.push_str(";x-amz-target");

    let canonical_request =
        format!("POST\n/\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");

    let scope = format!("{date}/{}/{}/aws4_request", params.region, params.service);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("AWS4{}", params.secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, params.region.as_bytes());
    let k_service = hmac(&k_region, params.service.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        params.access_key
    );

    SignedRequest { amz_date, authorization }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn params<'a>(session_token: Option<&'a str>) -> SigningParams<'a> {
        SigningParams {
            access_key: "AKIDEXAMPLE",
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            session_token,
            region: "us-east-1",
            service: "kms",
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    #[test]
    fn signing_is_deterministic() {
        let a = sign_request(
            &params(None),
            "kms.us-east-1.amazonaws.com",
            "TrentService.Encrypt",
            b"{}",
            fixed_now(),
        );
        let b = sign_request(
            &params(None),
            "kms.us-east-1.amazonaws.com",
            "TrentService.Encrypt",
            b"{}",
            fixed_now(),
        );
        assert_eq!(a.authorization, b.authorization);
        assert_eq!(a.amz_date, "20150830T123600Z");
    }

    #[test]
    fn signature_is_64_hex_chars() {
        let signed = sign_request(
            &params(None),
            "kms.us-east-1.amazonaws.com",
            "TrentService.Decrypt",
            b"{\"CiphertextBlob\":\"AQID\"}",
            fixed_now(),
        );
        let signature = signed
            .authorization
            .rsplit("Signature=")
            .next()
            .expect("authorization carries a signature");
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn payload_changes_the_signature() {
        let a = sign_request(&params(None), "h", "T.Op", b"one", fixed_now());
        let b = sign_request(&params(None), "h", "T.Op", b"two", fixed_now());
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn session_token_extends_signed_headers() {
        let signed = sign_request(&params(Some("FwoGZXIvYXdzEBc")), "h", "T.Op", b"{}", fixed_now());
        assert!(signed.authorization.contains("x-amz-security-token"));
    }
}

//! CloudStack API request signing.
//!
//! The management server authenticates every call with an HMAC-SHA1
//! signature over the request parameters:
//!
//! 1. URL-encode every value (`*` kept, space as `%20`)
//! 2. Sort the `key=value` pairs by lower-cased key and join with `&`
//! 3. Lower-case the whole string
//! 4. HMAC-SHA1 it with the secret key and base64-encode the digest
//!
//! The signature travels as the `signature` parameter next to the ones it
//! covers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use std::collections::BTreeMap;

type HmacSha1 = Hmac<Sha1>;

/// Everything except RFC 3986 unreserved characters and `*`.
const CS_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'*');

/// Percent-encode a parameter value the way the management server expects.
pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, CS_ENCODE_SET).to_string()
}

/// Build the `k=v&k=v` string, sorted by lower-cased key, values encoded.
///
/// This is both the transmitted query/form body and (lower-cased) the
/// signed message.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = params.iter().collect();
    pairs.sort_by_key(|(k, _)| k.to_ascii_lowercase());
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the base64 HMAC-SHA1 signature for `params`.
pub fn sign(params: &BTreeMap<String, String>, secret_key: &str) -> String {
    let message = canonical_query(params).to_lowercase();
    let mut mac = HmacSha1::new_from_slice(secret_key.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Return the full signed query string: canonical parameters + `signature`.
pub fn signed_query(params: &BTreeMap<String, String>, secret_key: &str) -> String {
    let signature = sign(params, secret_key);
    format!("{}&signature={}", canonical_query(params), encode(&signature))
}

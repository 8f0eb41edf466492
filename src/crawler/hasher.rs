use serde::Serialize;
use sha2::{Digest, Sha256};

use super::request::{Request, RequestContent};

/// Computes request fingerprints
pub trait RequestHasher: Send + Sync {
    /// Set `request.hash` from its owner, URL, method, retry count and body
    fn compute_hash(&self, request: &mut Request);
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    owner: &'a str,
    url: &'a str,
    method: &'a str,
    requested_times: u32,
    content: Option<&'a RequestContent>,
}

/// SHA-256 over the JSON form of the fingerprint fields, hex encoded
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256RequestHasher;

impl RequestHasher for Sha256RequestHasher {
    fn compute_hash(&self, request: &mut Request) {
        let fingerprint = Fingerprint {
            owner: request.owner(),
            url: request.url.as_str(),
            method: &request.method,
            requested_times: request.requested_times(),
            content: request.content.as_ref(),
        };

        // Serializing plain strings and integers cannot fail
        let json = serde_json::to_vec(&fingerprint).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(&json);
        request.set_hash(hex::encode(hasher.finalize()));
    }
}

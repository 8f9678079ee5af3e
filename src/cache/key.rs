//! Cache key derivation.
//!
//! A key is the SHA-256 of five framed components: generation, normalized
//! path, canonical query, active locale and user identifier. Each component is
//! preceded by its length as an 8-byte big-endian integer, so no two distinct
//! tuples share an input.

use std::fmt;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, percent_encode};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::{Context, LocaleNegotiator};

/// Bytes escaped when mapping a decoded path back to a URI. Reserved
/// characters and `%` pass through; non-ASCII bytes are always escaped.
const IRI_TO_URI: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Generation component of a key. Renders as `None` when the counter is
/// absent, which no integer generation can collide with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(pub Option<u64>);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value}"),
            None => f.write_str("None"),
        }
    }
}

/// The normalized identity of a request, as hashed into its cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub generation: Generation,
    pub path: String,
    pub query: String,
    pub locale: String,
    pub user: String,
}

impl RequestIdentity {
    /// Normalizes the request behind `ctx` under `generation`.
    pub fn from_context(ctx: &Context, generation: Option<u64>, locales: &LocaleNegotiator) -> Self {
        let request = ctx.request();
        Self {
            generation: Generation(generation),
            path: normalize_path(request.path()),
            query: request.query_params().to_canonical_string(),
            locale: locales.resolve(ctx),
            user: ctx
                .identity()
                .map(|identity| identity.cache_id().to_owned())
                .unwrap_or_default(),
        }
    }

    /// Lowercase hex SHA-256 over the framed components.
    pub fn fingerprint(&self) -> String {
        let generation = self.generation.to_string();
        let mut hasher = Sha256::new();
        for part in [
            generation.as_str(),
            self.path.as_str(),
            self.query.as_str(),
            self.locale.as_str(),
            self.user.as_str(),
        ] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let key = hex::encode(hasher.finalize());
        debug!(
            generation = %self.generation,
            path = %self.path,
            query = %self.query,
            locale = %self.locale,
            user = %self.user,
            key = %key,
            "derived cache key"
        );
        key
    }
}

/// Percent-decodes `path` and re-encodes it in canonical URI form.
pub fn normalize_path(path: &str) -> String {
    let decoded: Vec<u8> = percent_decode_str(path).collect();
    percent_encode(&decoded, IRI_TO_URI).to_string()
}

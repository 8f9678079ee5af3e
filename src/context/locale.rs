//! Language negotiation for the locale component of the cache key.

use super::Context;

/// A language explicitly activated for the request (for example from a
/// session preference or a URL prefix). Takes precedence over `Accept-Language`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale(String);

impl Locale {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolves the active language tag of a request.
///
/// Resolution order: an activated [`Locale`] extension, then the best
/// supported `Accept-Language` entry, then the default. Tags are lowercased.
/// With an empty `supported` list any well-formed tag is accepted.
#[derive(Debug, Clone)]
pub struct LocaleNegotiator {
    default: String,
    supported: Vec<String>,
}

impl LocaleNegotiator {
    pub fn new(default: impl Into<String>, supported: Vec<String>) -> Self {
        Self {
            default: default.into().to_ascii_lowercase(),
            supported: supported
                .into_iter()
                .map(|tag| tag.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn default_locale(&self) -> &str {
        &self.default
    }

    pub fn resolve(&self, ctx: &Context) -> String {
        if let Some(locale) = ctx.extensions().get::<Locale>() {
            if let Some(tag) = self.supported_variant(locale.as_str()) {
                return tag;
            }
        }

        ctx.request()
            .headers()
            .get("accept-language")
            .and_then(|header| self.negotiate(header))
            .unwrap_or_else(|| self.default.clone())
    }

    /// Picks the best supported tag from an `Accept-Language` value.
    pub fn negotiate(&self, header: &str) -> Option<String> {
        let mut ranges: Vec<(String, f32)> = header.split(',').filter_map(parse_range).collect();
        // Stable sort keeps header order among equal weights.
        ranges.sort_by(|a, b| b.1.total_cmp(&a.1));

        ranges
            .into_iter()
            .find_map(|(tag, _)| self.supported_variant(&tag))
    }

    fn supported_variant(&self, tag: &str) -> Option<String> {
        if !is_well_formed(tag) {
            return None;
        }
        let tag = tag.to_ascii_lowercase();
        if self.supported.is_empty() || self.supported.contains(&tag) {
            return Some(tag);
        }

        let primary = tag.split('-').next().unwrap_or_default();
        self.supported
            .iter()
            .find(|candidate| {
                candidate.as_str() == primary
                    || candidate.split('-').next() == Some(primary)
            })
            .cloned()
    }
}

impl Default for LocaleNegotiator {
    fn default() -> Self {
        Self::new("en-us", Vec::new())
    }
}

// Parses one `tag;q=weight` entry. Wildcards and zero weights are dropped.
fn parse_range(entry: &str) -> Option<(String, f32)> {
    let mut parts = entry.split(';');
    let tag = parts.next()?.trim();
    if tag.is_empty() || tag == "*" {
        return None;
    }

    let mut weight = 1.0_f32;
    for param in parts {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("q") {
            weight = value.trim().parse().ok()?;
        }
    }

    if !(weight > 0.0 && weight <= 1.0) {
        return None;
    }
    Some((tag.to_owned(), weight))
}

// BCP 47 shape only: 1-8 letters, then `-`-separated 1-8 alphanumerics.
fn is_well_formed(tag: &str) -> bool {
    let mut subtags = tag.split('-');
    let primary_ok = subtags
        .next()
        .is_some_and(|p| (1..=8).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_alphabetic()));
    primary_ok
        && subtags.all(|s| (1..=8).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_alphanumeric()))
}

//! Cacheability predicates.

use crate::{
    Method, Response, StatusCode,
    context::{Context, CsrfCookie},
};

/// Decides which requests may be answered from cache and which responses may
/// be stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    disabled: bool,
}

impl CachePolicy {
    pub fn new(disabled: bool) -> Self {
        Self { disabled }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// `GET` requests with no flash messages waiting, while caching is on.
    pub fn request_is_cacheable(&self, ctx: &Context) -> bool {
        !self.disabled && *ctx.request().method() == Method::Get && ctx.pending_messages() == 0
    }

    /// Plain `200 OK` responses that neither opt out with `Pragma: no-cache`,
    /// vary on cookies, nor embed an anti-forgery token.
    pub fn response_is_cacheable(&self, csrf: &CsrfCookie, response: &Response) -> bool {
        let headers = response.headers();
        !self.disabled
            && response.status() == StatusCode::Ok
            && !headers.has_token("pragma", "no-cache")
            && !headers.has_token("vary", "cookie")
            && !headers.has_token("vary", "*")
            && !csrf.is_used()
    }
}

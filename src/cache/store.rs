//! Prefixed access to the backing store and the page entry encoding.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::backend::{BackendError, CacheBackend, CasToken, Ttl};

/// A rendered page as kept in the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub body: Bytes,
    pub content_type: String,
}

impl CachedPage {
    pub fn new(body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
        }
    }

    /// Frames the page as `u32` big-endian content-type length, content-type
    /// bytes, then the body.
    pub fn encode(&self) -> Bytes {
        let content_type = self.content_type.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + content_type.len() + self.body.len());
        buf.put_u32(content_type.len() as u32);
        buf.put_slice(content_type);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, BackendError> {
        if raw.len() < 4 {
            return Err(BackendError::Corrupt("truncated header"));
        }
        let header = raw.split_to(4);
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if raw.len() < len {
            return Err(BackendError::Corrupt("truncated content type"));
        }
        let content_type = raw.split_to(len);
        let content_type = std::str::from_utf8(&content_type)
            .map_err(|_| BackendError::Corrupt("content type is not UTF-8"))?
            .to_owned();
        Ok(Self {
            body: raw,
            content_type,
        })
    }
}

/// A [`CacheBackend`] seen through the configured key prefix.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The key as handed to the backend: `{prefix}:{key}`, or `key` alone when
    /// no prefix is configured.
    pub fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        self.backend.get(&self.full_key(key)).await
    }

    pub async fn set(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<(), BackendError> {
        self.backend.set(&self.full_key(key), value, ttl).await
    }

    pub async fn add(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<bool, BackendError> {
        self.backend.add(&self.full_key(key), value, ttl).await
    }

    pub async fn incr(&self, key: &str) -> Result<u64, BackendError> {
        self.backend.incr(&self.full_key(key)).await
    }

    pub async fn gets(&self, key: &str) -> Result<Option<(Bytes, CasToken)>, BackendError> {
        self.backend.gets(&self.full_key(key)).await
    }

    pub async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        token: CasToken,
    ) -> Result<bool, BackendError> {
        self.backend
            .compare_and_swap(&self.full_key(key), value, ttl, token)
            .await
    }

    /// Loads a page. A stored value that does not decode is reported as
    /// [`BackendError::Corrupt`].
    pub async fn get_page(&self, key: &str) -> Result<Option<CachedPage>, BackendError> {
        self.get(key).await?.map(CachedPage::decode).transpose()
    }

    pub async fn set_page(&self, key: &str, page: &CachedPage, ttl: Ttl) -> Result<(), BackendError> {
        self.set(key, page.encode(), ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn page_frame_keeps_content_type_parameters() {
        let page = CachedPage::new("<p>hi</p>", "text/html; charset=iso-8859-1");
        let decoded = CachedPage::decode(page.encode()).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn empty_body_and_truncated_frames() {
        let page = CachedPage::new(Bytes::new(), "text/plain");
        assert_eq!(CachedPage::decode(page.encode()).unwrap().body.len(), 0);

        assert!(matches!(
            CachedPage::decode(Bytes::from_static(b"\x00\x00")),
            Err(BackendError::Corrupt(_))
        ));
        assert!(matches!(
            CachedPage::decode(Bytes::from_static(b"\x00\x00\x00\x09text")),
            Err(BackendError::Corrupt(_))
        ));
    }

    #[test]
    fn prefix_is_joined_with_a_colon() {
        let backend = Arc::new(MemoryBackend::default());
        assert_eq!(CacheStore::new(backend.clone(), "").full_key("k"), "k");
        assert_eq!(CacheStore::new(backend, "site").full_key("k"), "site:k");
    }

    #[tokio::test]
    async fn pages_land_under_the_prefixed_key() {
        let backend = Arc::new(MemoryBackend::default());
        let store = CacheStore::new(backend.clone(), "site");
        let page = CachedPage::new("body", "text/plain");
        store.set_page("abc", &page, Ttl::Default).await.unwrap();

        assert!(backend.get("site:abc").await.unwrap().is_some());
        assert!(backend.get("abc").await.unwrap().is_none());
        assert_eq!(store.get_page("abc").await.unwrap(), Some(page));
    }

    #[tokio::test]
    async fn storing_the_same_page_twice_changes_nothing() {
        let backend = Arc::new(MemoryBackend::default());
        let store = CacheStore::new(backend.clone(), "site");
        let page = CachedPage::new("<p>same</p>", "text/html; charset=utf-8");

        store.set_page("abc", &page, Ttl::Default).await.unwrap();
        let once = backend.get("site:abc").await.unwrap();
        store.set_page("abc", &page, Ttl::Default).await.unwrap();

        assert_eq!(backend.get("site:abc").await.unwrap(), once);
        assert_eq!(store.get_page("abc").await.unwrap(), Some(page));
        assert_eq!(backend.len(), 1);
    }
}

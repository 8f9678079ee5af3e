use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
    net::TcpStream,
    sync::{Semaphore, SemaphorePermit},
    time::timeout,
};
use tracing::{debug, warn};

use super::{BackendError, CacheBackend, CasToken, Ttl};

/// memcached reads expiry times above this many seconds as Unix timestamps.
const RELATIVE_EXPIRY_LIMIT: u64 = 60 * 60 * 24 * 30;

const MAX_KEY_LEN: usize = 250;

/// Connections opened by [`MemcachedBackend::new`].
pub const DEFAULT_POOL_SIZE: usize = 4;

/// memcached's default item size limit.
pub const DEFAULT_MAX_ITEM_BYTES: usize = 1024 * 1024;

/// [`CacheBackend`] speaking the memcached text protocol.
///
/// Keeps a small pool of connections, opened lazily. A connection is dropped
/// after any I/O, timeout or protocol failure and a fresh one is opened on
/// demand. Each call, including the wait for a free connection, is bounded by
/// `io_timeout`. A literal zero TTL is sent as exptime `0`, which memcached
/// treats as "never expire".
pub struct MemcachedBackend {
    address: String,
    default_ttl: Option<Duration>,
    io_timeout: Duration,
    max_item_bytes: usize,
    permits: Semaphore,
    idle: Mutex<Vec<Connection>>,
}

impl MemcachedBackend {
    pub fn new(address: impl Into<String>, default_ttl: Duration, io_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            default_ttl: Some(default_ttl),
            io_timeout,
            max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
            permits: Semaphore::new(DEFAULT_POOL_SIZE),
            idle: Mutex::new(Vec::with_capacity(DEFAULT_POOL_SIZE)),
        }
    }

    /// Caps the number of connections open at once. Zero is clamped to one.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        self.permits = Semaphore::new(pool_size);
        self.idle = Mutex::new(Vec::with_capacity(pool_size));
        self
    }

    /// Largest value accepted in a reply. Longer values fail with
    /// [`BackendError::Protocol`] before anything is allocated for them.
    #[must_use]
    pub fn with_max_item_bytes(mut self, max_item_bytes: usize) -> Self {
        self.max_item_bytes = max_item_bytes;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn checkout(&self) -> Result<Lease<'_>, BackendError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::Protocol("connection pool closed".to_owned()))?;

        let pooled = self.idle().pop();
        let connection = match pooled {
            Some(connection) => connection,
            None => {
                debug!(address = %self.address, "opening memcached connection");
                let stream = TcpStream::connect(&self.address).await?;
                stream.set_nodelay(true)?;
                Connection::new(stream)
            }
        };

        Ok(Lease {
            backend: self,
            connection,
            _permit: permit,
        })
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    address = %self.address,
                    result = "poisoned_recovered",
                    "Recovered from poisoned memcached pool lock"
                );
                poisoned.into_inner()
            }
        }
    }

    // Covers the wait for a connection as well as the command itself. On
    // timeout the in-flight lease is dropped along with its connection.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        timeout(self.io_timeout, op)
            .await
            .map_err(|_| BackendError::Timeout(self.io_timeout))?
    }

    fn exptime(&self, ttl: Ttl) -> u64 {
        match ttl.resolve(self.default_ttl) {
            None => 0,
            Some(after) => {
                let secs = after.as_secs().max(1);
                if secs <= RELATIVE_EXPIRY_LIMIT {
                    secs
                } else {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map_or(0, |d| d.as_secs());
                    now + secs
                }
            }
        }
    }

    async fn store(
        &self,
        command: &'static str,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        cas: Option<CasToken>,
    ) -> Result<StoreReply, BackendError> {
        validate_key(key)?;
        let exptime = self.exptime(ttl);
        self.bounded(async {
            let mut lease = self.checkout().await?;
            let result = lease
                .connection
                .store(command, key, &value, exptime, cas)
                .await;
            lease.release(result)
        })
        .await
    }

    async fn retrieve(
        &self,
        command: &'static str,
        key: &str,
    ) -> Result<Option<(Bytes, Option<u64>)>, BackendError> {
        validate_key(key)?;
        self.bounded(async {
            let mut lease = self.checkout().await?;
            let result = lease
                .connection
                .retrieve(command, key, self.max_item_bytes)
                .await;
            lease.release(result)
        })
        .await
    }
}

/// A connection borrowed from the pool together with its slot.
struct Lease<'a> {
    backend: &'a MemcachedBackend,
    connection: Connection,
    _permit: SemaphorePermit<'a>,
}

impl Lease<'_> {
    /// Returns the connection to the pool unless `result` leaves it in an
    /// unknown state.
    fn release<T>(self, result: Result<T, BackendError>) -> Result<T, BackendError> {
        match &result {
            Err(err) if err.is_connection_failure() => {
                warn!(
                    address = %self.backend.address,
                    error = %err,
                    "dropping memcached connection"
                );
            }
            _ => self.backend.idle().push(self.connection),
        }
        result
    }
}

#[async_trait]
impl CacheBackend for MemcachedBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        Ok(self.retrieve("get", key).await?.map(|(value, _)| value))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<(), BackendError> {
        match self.store("set", key, value, ttl, None).await? {
            StoreReply::Stored => Ok(()),
            other => Err(BackendError::Protocol(format!("set answered {other:?}"))),
        }
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<bool, BackendError> {
        match self.store("add", key, value, ttl, None).await? {
            StoreReply::Stored => Ok(true),
            StoreReply::NotStored => Ok(false),
            other => Err(BackendError::Protocol(format!("add answered {other:?}"))),
        }
    }

    async fn incr(&self, key: &str) -> Result<u64, BackendError> {
        validate_key(key)?;
        self.bounded(async {
            let mut lease = self.checkout().await?;
            let result = lease.connection.incr(key).await;
            lease.release(result)
        })
        .await
    }

    async fn gets(&self, key: &str) -> Result<Option<(Bytes, CasToken)>, BackendError> {
        match self.retrieve("gets", key).await? {
            None => Ok(None),
            Some((value, Some(cas))) => Ok(Some((value, CasToken(cas)))),
            Some((_, None)) => Err(BackendError::Protocol(
                "gets reply without a cas unique".to_owned(),
            )),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        token: CasToken,
    ) -> Result<bool, BackendError> {
        match self.store("cas", key, value, ttl, Some(token)).await? {
            StoreReply::Stored => Ok(true),
            StoreReply::Exists => Ok(false),
            StoreReply::NotFound => Err(BackendError::NotFound),
            StoreReply::NotStored => Ok(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreReply {
    Stored,
    NotStored,
    Exists,
    NotFound,
}

struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    async fn send(&mut self, parts: &[&[u8]]) -> Result<(), BackendError> {
        for part in parts {
            self.stream.write_all(part).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, BackendError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(BackendError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_owned();
        if line == "ERROR" || line.starts_with("SERVER_ERROR") {
            return Err(BackendError::Protocol(line));
        }
        Ok(line)
    }

    async fn retrieve(
        &mut self,
        command: &str,
        key: &str,
        max_item_bytes: usize,
    ) -> Result<Option<(Bytes, Option<u64>)>, BackendError> {
        self.send(&[command.as_bytes(), &b" "[..], key.as_bytes(), &b"\r\n"[..]])
            .await?;

        let header = self.read_line().await?;
        if header == "END" {
            return Ok(None);
        }

        // VALUE <key> <flags> <bytes> [<cas unique>]
        let fields: Vec<&str> = header.split_ascii_whitespace().collect();
        let (len, cas) = match fields.as_slice() {
            ["VALUE", _, _, len, rest @ ..] if rest.len() <= 1 => {
                let len: usize = len
                    .parse()
                    .map_err(|_| BackendError::Protocol(header.clone()))?;
                let cas = match rest.first() {
                    Some(cas) => Some(
                        cas.parse::<u64>()
                            .map_err(|_| BackendError::Protocol(header.clone()))?,
                    ),
                    None => None,
                };
                (len, cas)
            }
            _ => return Err(BackendError::Protocol(header.clone())),
        };
        if len > max_item_bytes {
            return Err(BackendError::Protocol(format!(
                "value of {len} bytes exceeds the {max_item_bytes} byte item limit"
            )));
        }

        let mut data = vec![0; len + 2];
        self.stream.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
            return Err(BackendError::Protocol("data block not terminated".to_owned()));
        }
        data.truncate(len);

        let trailer = self.read_line().await?;
        if trailer != "END" {
            return Err(BackendError::Protocol(trailer));
        }
        Ok(Some((Bytes::from(data), cas)))
    }

    async fn store(
        &mut self,
        command: &str,
        key: &str,
        value: &Bytes,
        exptime: u64,
        cas: Option<CasToken>,
    ) -> Result<StoreReply, BackendError> {
        let header = match cas {
            Some(token) => format!("{command} {key} 0 {exptime} {} {}\r\n", value.len(), token.0),
            None => format!("{command} {key} 0 {exptime} {}\r\n", value.len()),
        };
        self.send(&[header.as_bytes(), &value[..], &b"\r\n"[..]]).await?;

        let reply = self.read_line().await?;
        match reply.as_str() {
            "STORED" => Ok(StoreReply::Stored),
            "NOT_STORED" => Ok(StoreReply::NotStored),
            "EXISTS" => Ok(StoreReply::Exists),
            "NOT_FOUND" => Ok(StoreReply::NotFound),
            _ => Err(BackendError::Protocol(reply)),
        }
    }

    async fn incr(&mut self, key: &str) -> Result<u64, BackendError> {
        self.send(&[&b"incr "[..], key.as_bytes(), &b" 1\r\n"[..]]).await?;

        let reply = self.read_line().await?;
        if reply == "NOT_FOUND" {
            return Err(BackendError::NotFound);
        }
        if reply.starts_with("CLIENT_ERROR") {
            return Err(BackendError::NotNumeric);
        }
        reply
            .trim()
            .parse()
            .map_err(|_| BackendError::Protocol(reply))
    }
}

fn validate_key(key: &str) -> Result<(), BackendError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(BackendError::InvalidKey(key.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tokio::{
        io::BufReader,
        net::TcpListener,
        sync::mpsc,
        task::JoinHandle,
    };

    /// Scripted memcached: answers each command line with the next canned
    /// reply and reports the command lines it received.
    async fn fake_server(
        replies: Vec<&'static str>,
    ) -> (String, mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            for reply in replies {
                let mut line = String::new();
                if stream.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                let line = line.trim_end().to_owned();
                let fields: Vec<&str> = line.split(' ').collect();
                if matches!(fields[0], "set" | "add" | "cas") {
                    let len: usize = fields[4].parse().unwrap();
                    let mut data = vec![0; len + 2];
                    stream.read_exact(&mut data).await.unwrap();
                }
                tx.send(line.clone()).unwrap();
                stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        (address, rx, task)
    }

    fn backend(address: String) -> MemcachedBackend {
        MemcachedBackend::new(address, Duration::from_secs(300), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn get_set_and_miss() {
        let (address, mut seen, task) = fake_server(vec![
            "END\r\n",
            "STORED\r\n",
            "VALUE page 0 5\r\nhello\r\nEND\r\n",
        ])
        .await;
        let store = backend(address);

        assert!(store.get("page").await.unwrap().is_none());
        store
            .set("page", Bytes::from_static(b"hello"), Ttl::Default)
            .await
            .unwrap();
        assert_eq!(
            store.get("page").await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );

        assert_eq!(seen.recv().await.unwrap(), "get page");
        assert_eq!(seen.recv().await.unwrap(), "set page 0 300 5");
        assert_eq!(seen.recv().await.unwrap(), "get page");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn zero_ttl_is_sent_as_never_expire() {
        let (address, mut seen, _task) = fake_server(vec!["STORED\r\n"]).await;
        let store = backend(address);
        store
            .set("k", Bytes::from_static(b"v"), Ttl::from_secs(0))
            .await
            .unwrap();
        assert_eq!(seen.recv().await.unwrap(), "set k 0 0 1");
    }

    #[tokio::test]
    async fn long_ttls_become_absolute_timestamps() {
        let (address, mut seen, _task) = fake_server(vec!["STORED\r\n"]).await;
        let store = backend(address);
        let month_and_a_day = RELATIVE_EXPIRY_LIMIT + 86_400;
        store
            .set("k", Bytes::from_static(b"v"), Ttl::from_secs(month_and_a_day))
            .await
            .unwrap();

        let line = seen.recv().await.unwrap();
        let exptime: u64 = line.split(' ').nth(3).unwrap().parse().unwrap();
        assert!(exptime > 1_600_000_000 + month_and_a_day, "{line}");
    }

    #[tokio::test]
    async fn incr_maps_replies_to_errors() {
        let (address, _seen, _task) = fake_server(vec![
            "NOT_FOUND\r\n",
            "CLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
            "8\r\n",
        ])
        .await;
        let store = backend(address);
        assert!(matches!(store.incr("generation").await, Err(BackendError::NotFound)));
        assert!(matches!(store.incr("generation").await, Err(BackendError::NotNumeric)));
        assert_eq!(store.incr("generation").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn add_and_cas_report_conflicts() {
        let (address, mut seen, _task) = fake_server(vec![
            "NOT_STORED\r\n",
            "VALUE generation 0 1 77\r\n3\r\nEND\r\n",
            "EXISTS\r\n",
        ])
        .await;
        let store = backend(address);

        assert!(!store.add("generation", Bytes::from_static(b"1"), Ttl::Never).await.unwrap());
        let (value, token) = store.gets("generation").await.unwrap().unwrap();
        assert_eq!(value, Bytes::from_static(b"3"));
        assert_eq!(token, CasToken(77));
        assert!(!store
            .compare_and_swap("generation", Bytes::from_static(b"4"), Ttl::Never, token)
            .await
            .unwrap());

        assert_eq!(seen.recv().await.unwrap(), "add generation 0 0 1");
        assert_eq!(seen.recv().await.unwrap(), "gets generation");
        assert_eq!(seen.recv().await.unwrap(), "cas generation 0 0 1 77");
    }

    #[tokio::test]
    async fn keys_with_whitespace_are_rejected_locally() {
        let store = backend("127.0.0.1:1".to_owned());
        assert!(matches!(
            store.get("has space").await,
            Err(BackendError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let store = backend(address);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_connection_failure(), "{err}");
    }

    #[tokio::test]
    async fn oversized_values_are_refused_before_reading() {
        let (address, _seen, _task) = fake_server(vec!["VALUE page 0 4294967296\r\n"]).await;
        let store = backend(address);
        match store.get("page").await {
            Err(BackendError::Protocol(reason)) => assert!(reason.contains("item limit"), "{reason}"),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_server_fails_each_caller_within_the_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            // Accepts and holds connections without ever answering.
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                held.push(stream);
            }
        });

        let io_timeout = Duration::from_millis(200);
        let store = Arc::new(
            MemcachedBackend::new(address, Duration::from_secs(300), io_timeout).with_pool_size(2),
        );
        let callers: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let started = std::time::Instant::now();
                    let result = store.get(&format!("page:{i}")).await;
                    (result, started.elapsed())
                })
            })
            .collect();

        for caller in callers {
            let (result, elapsed) = caller.await.unwrap();
            assert!(matches!(result, Err(BackendError::Timeout(_))), "{result:?}");
            assert!(elapsed < io_timeout * 3, "waited {elapsed:?}");
        }
    }
}

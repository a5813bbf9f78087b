//! I/O requests issued from the event loop.
//!
//! The loop itself never blocks on I/O. A request is handed to an
//! [`IoProvider`] on a worker thread from a thread pool; when the provider
//! returns, the completion is sent back over a channel, the loop thread is
//! unparked, and the request's task is settled on the loop between two jobs.
//!
//! Two providers are included: [`SystemProvider`] reads the local file system
//! and performs HTTP GET requests, and [`MemoryProvider`] serves fixed
//! contents from memory.

use std::{
    cell::{Cell, OnceCell, RefCell},
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    thread::Thread,
    time::Duration,
};

use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    executor::{ThreadPool, ThreadPoolBuilder},
};

use crate::{
    Task,
    config::RunnerConfig,
    error::{Failure, IoError, RunnerError},
    event_loop::{Handle, Shared},
    task::Settler,
};

/// The external capabilities the loop can call into.
///
/// Implementations run on worker threads and may block.
pub trait IoProvider: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError>;

    fn http_get(&self, url: &str) -> Result<Vec<u8>, IoError>;
}

/// A single request for an [`IoProvider`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoOperation {
    Read(PathBuf),
    HttpGet(String),
}

impl IoOperation {
    fn perform(&self, provider: &dyn IoProvider) -> Result<Vec<u8>, IoError> {
        match self {
            IoOperation::Read(path) => provider.read(path),
            IoOperation::HttpGet(url) => provider.http_get(url),
        }
    }
}

impl fmt::Display for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOperation::Read(path) => write!(f, "read {}", path.display()),
            IoOperation::HttpGet(url) => write!(f, "GET {url}"),
        }
    }
}

/// Reads files with `std::fs` and fetches URLs with a blocking `reqwest`
/// client.
///
/// The HTTP client is built on the first request.
pub struct SystemProvider {
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl SystemProvider {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    /// Like [`SystemProvider::new`] but builds the HTTP client right away.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Http`] if the client cannot be built.
    pub fn connect(timeout: Duration) -> Result<Self, RunnerError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            timeout,
            client: OnceLock::from(client),
        })
    }

    /// Connects with the HTTP timeout of `config`, see [`SystemProvider::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Http`] if the client cannot be built.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, RunnerError> {
        Self::connect(config.http_timeout)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, IoError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| IoError::NetworkFailure {
                message: format!("cannot build http client: {e}"),
            })?;
        // Another worker may have won the race; either client is fine.
        Ok(self.client.get_or_init(|| client))
    }
}

impl IoProvider for SystemProvider {
    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        std::fs::read(path).map_err(|e| IoError::from_fs(path, &e))
    }

    fn http_get(&self, url: &str) -> Result<Vec<u8>, IoError> {
        let response = self
            .client()?
            .get(url)
            .send()
            .map_err(|e| IoError::NetworkFailure {
                message: e.to_string(),
            })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(IoError::NotFound {
                resource: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(IoError::NetworkFailure {
                message: format!("GET {url} returned {status}"),
            });
        }
        let body = response.bytes().map_err(|e| IoError::NetworkFailure {
            message: e.to_string(),
        })?;
        Ok(body.to_vec())
    }
}

/// Serves files and URLs from memory.
///
/// Each resource may carry a latency that the worker sleeps before answering,
/// which makes completion order controllable in tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider {
    files: HashMap<PathBuf, (Vec<u8>, Duration)>,
    urls: HashMap<String, (Vec<u8>, Duration)>,
}

impl MemoryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.with_slow_file(path, contents, Duration::ZERO)
    }

    pub fn with_slow_file(
        mut self,
        path: impl Into<PathBuf>,
        contents: impl Into<Vec<u8>>,
        latency: Duration,
    ) -> Self {
        self.files.insert(path.into(), (contents.into(), latency));
        self
    }

    pub fn with_url(self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.with_slow_url(url, body, Duration::ZERO)
    }

    pub fn with_slow_url(
        mut self,
        url: impl Into<String>,
        body: impl Into<Vec<u8>>,
        latency: Duration,
    ) -> Self {
        self.urls.insert(url.into(), (body.into(), latency));
        self
    }

    fn serve(entry: Option<&(Vec<u8>, Duration)>, resource: &str) -> Result<Vec<u8>, IoError> {
        let (contents, latency) = entry.ok_or_else(|| IoError::NotFound {
            resource: resource.to_string(),
        })?;
        if !latency.is_zero() {
            std::thread::sleep(*latency);
        }
        Ok(contents.clone())
    }
}

impl IoProvider for MemoryProvider {
    fn read(&self, path: &Path) -> Result<Vec<u8>, IoError> {
        Self::serve(self.files.get(path), &path.display().to_string())
    }

    fn http_get(&self, url: &str) -> Result<Vec<u8>, IoError> {
        Self::serve(self.urls.get(url), url)
    }
}

struct Completion {
    request: u64,
    outcome: Result<Vec<u8>, IoError>,
}

/// Connects the loop to the worker pool that runs provider calls.
pub(crate) struct IoBridge {
    provider: Arc<dyn IoProvider>,
    pool_size: usize,
    pool: OnceCell<ThreadPool>,
    sender: UnboundedSender<Completion>,
    receiver: RefCell<UnboundedReceiver<Completion>>,
    // Pending requests by request number. A completion settles and removes
    // its entry.
    pending: RefCell<HashMap<u64, Settler<Vec<u8>>>>,
    next_request: Cell<u64>,
    loop_thread: Thread,
}

impl IoBridge {
    pub(crate) fn new(provider: Arc<dyn IoProvider>, pool_size: usize, loop_thread: Thread) -> Self {
        let (sender, receiver) = mpsc::unbounded();
        Self {
            provider,
            pool_size,
            pool: OnceCell::new(),
            sender,
            receiver: RefCell::new(receiver),
            pending: RefCell::new(HashMap::with_capacity(8)),
            next_request: Cell::new(0),
            loop_thread,
        }
    }

    fn pool(&self) -> Result<&ThreadPool, IoError> {
        if let Some(pool) = self.pool.get() {
            return Ok(pool);
        }
        let pool = ThreadPoolBuilder::new()
            .pool_size(self.pool_size)
            .name_prefix("deferron-io-")
            .create()
            .map_err(|e| IoError::Other {
                message: format!("cannot start I/O worker pool: {e}"),
            })?;
        Ok(self.pool.get_or_init(|| pool))
    }

    fn request(&self, shared: &Shared, operation: IoOperation) -> Task<Vec<u8>> {
        let (task, settler) = Task::pending(shared.weak());
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(e) => {
                settler.reject(e.into());
                return task;
            }
        };

        let request = self.next_request.get();
        self.next_request.set(request + 1);
        tracing::debug!(task = %task.id(), request, %operation, "i/o issued");
        self.pending.borrow_mut().insert(request, settler);

        let provider = Arc::clone(&self.provider);
        let sender = self.sender.clone();
        let loop_thread = self.loop_thread.clone();
        pool.spawn_ok(async move {
            let outcome = operation.perform(provider.as_ref());
            // The receiver only goes away with the loop.
            let _ = sender.unbounded_send(Completion { request, outcome });
            loop_thread.unpark();
        });
        task
    }

    /// Settles the tasks of every finished request. Returns how many there were.
    pub(crate) fn drain_completions(&self) -> usize {
        let mut drained = 0;
        loop {
            let next = self.receiver.borrow_mut().try_next();
            let Ok(Some(completion)) = next else {
                break;
            };
            drained += 1;
            let settler = self.pending.borrow_mut().remove(&completion.request);
            let Some(settler) = settler else {
                continue;
            };
            tracing::debug!(
                task = %settler.id(),
                request = completion.request,
                ok = completion.outcome.is_ok(),
                "i/o completed"
            );
            settler.settle(completion.outcome.map_err(Failure::from));
        }
        drained
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.borrow().len()
    }

    pub(crate) fn clear(&self) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        drop(pending);
    }
}

impl Handle {
    /// Issues `operation` to the I/O provider.
    ///
    /// The task fulfills with the bytes the provider returned, or rejects with
    /// [`Failure::Io`]. Nothing is reported synchronously.
    pub fn request_io(&self, operation: IoOperation) -> Task<Vec<u8>> {
        self.shared.io.request(&self.shared, operation)
    }

    pub fn read(&self, path: impl Into<PathBuf>) -> Task<Vec<u8>> {
        self.request_io(IoOperation::Read(path.into()))
    }

    /// Reads a file and decodes it as UTF-8.
    pub fn read_to_string(&self, path: impl Into<PathBuf>) -> Task<String> {
        self.read(path).and_then(|bytes| {
            String::from_utf8(bytes).map_err(|e| {
                Failure::from(IoError::DecodeFailure {
                    message: e.to_string(),
                })
            })
        })
    }

    pub fn http_get(&self, url: impl Into<String>) -> Task<Vec<u8>> {
        self.request_io(IoOperation::HttpGet(url.into()))
    }

    /// Fetches `url` and decodes the body as JSON.
    pub fn get_json(&self, url: impl Into<String>) -> Task<serde_json::Value> {
        self.http_get(url).and_then(|body| {
            serde_json::from_slice::<serde_json::Value>(&body).map_err(|e| {
                Failure::from(IoError::DecodeFailure {
                    message: e.to_string(),
                })
            })
        })
    }
}

use thiserror::Error;

/// Unified error type for the deconvolution engine and its job-dispatch pool.
///
/// Mirrors the error classes in the design: configuration errors are
/// surfaced before any iteration begins, cache misses on the hot path are
/// logic bugs (fatal), and worker/handler failures are reported without
/// crashing the pool.
#[derive(Debug, Error)]
pub enum WscmsError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cache miss for key {key:?}: expected entry was never populated")]
    CacheMiss { key: String },

    #[error("cache io error for key {key:?}: {source}")]
    CacheIo {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker process died before its jobs completed")]
    WorkerDied,

    #[error("handler {handler_id:?} failed: {message}")]
    HandlerFailed { handler_id: String, message: String },

    #[error("pool is shut down")]
    PoolShutDown,

    #[error("unknown handler id {0:?}")]
    UnknownHandler(String),

    #[error("model file io error at {path:?}: {source}")]
    ModelIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("model file {path:?} is not a valid WSCMS model: {source}")]
    ModelFormat {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, WscmsError>;

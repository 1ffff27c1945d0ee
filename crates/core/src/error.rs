use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no part size fits {size} bytes within {max_parts} parts")]
    PartSize { size: u64, max_parts: u32 },

    #[error("source read failed ({path:?}): {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rpc error: {message}")]
    Rpc { message: String },

    #[error("http upload error: {message}")]
    Http { message: String },

    #[error("media cache error: {message}")]
    Cache { message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("random source failed: {message}")]
    Random { message: String },

    #[error("upload cancelled")]
    Cancelled,

    #[error("uploader task stopped")]
    Stopped,
}

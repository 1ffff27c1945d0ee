use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::file::{FileKind, FileSource, MB};
use crate::{Error, Result};

/// Content larger than this is never written to the local cache.
pub const MAX_CACHED_CONTENT: usize = 5 * MB;

/// Identity of the signed-in user, handed to the uploader instead of being
/// looked up globally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: i64,
    pub auth_token: String,
}

impl SessionContext {
    pub fn new(user_id: i64, auth_token: impl Into<String>) -> Self {
        Self {
            user_id,
            auth_token: auth_token.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailData {
    pub id: Option<u64>,
    pub bytes: Vec<u8>,
}

/// A media item ready to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub kind: FileKind,
    /// Upload handle id; generated when absent.
    pub file_id: Option<u64>,
    /// Photo/document record in the registry.
    pub media_id: u64,
    pub filename: String,
    pub mime_type: String,
    pub source: FileSource,
    /// Declared size of a path source. Buffers use their own length.
    pub size: u64,
    pub thumbnail: Option<ThumbnailData>,
}

impl MediaDescriptor {
    pub fn from_bytes(
        kind: FileKind,
        media_id: u64,
        filename: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        let size = bytes.len() as u64;
        Self {
            kind,
            file_id: None,
            media_id,
            filename: filename.into(),
            mime_type: String::new(),
            source: FileSource::Bytes(bytes),
            size,
            thumbnail: None,
        }
    }

    pub fn from_path(kind: FileKind, media_id: u64, path: PathBuf, size: u64) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            kind,
            file_id: None,
            media_id,
            filename,
            mime_type: String::new(),
            source: FileSource::Path(path),
            size,
            thumbnail: None,
        }
    }

    pub fn with_file_id(mut self, id: u64) -> Self {
        self.file_id = Some(id);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_thumbnail(mut self, bytes: Vec<u8>) -> Self {
        self.thumbnail = Some(ThumbnailData { id: None, bytes });
        self
    }

    pub fn total_size(&self) -> u64 {
        match &self.source {
            FileSource::Bytes(bytes) => bytes.len() as u64,
            FileSource::Path(_) => self.size,
        }
    }
}

/// Output of a background prepare task: the media plus content worth caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLoadResult {
    pub media: MediaDescriptor,
    pub content: Option<Vec<u8>>,
}

impl FileLoadResult {
    pub fn new(media: MediaDescriptor) -> Self {
        Self {
            media,
            content: None,
        }
    }

    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = Some(content);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadingState {
    InProgress { offset: u64, size: u64 },
    Failed,
    Done,
}

/// Photo/document records owned by the data layer.
pub trait MediaRegistry: Send + Sync {
    /// Registers the record and returns the key its content may be cached under.
    fn register(&self, media: &MediaDescriptor) -> Option<CacheKey>;

    fn upload_state_changed(&self, media_id: u64, state: UploadingState);
}

pub trait MediaCache: Send + Sync {
    fn write(&self, key: &CacheKey, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Default)]
struct RegistryState {
    registered: Vec<u64>,
    states: HashMap<u64, UploadingState>,
    cache: HashMap<CacheKey, Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    inner: Mutex<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<u64> {
        self.inner
            .lock()
            .map(|s| s.registered.clone())
            .unwrap_or_default()
    }

    pub fn state(&self, media_id: u64) -> Option<UploadingState> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.states.get(&media_id).copied())
    }

    pub fn cached(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.cache.get(key).cloned())
    }
}

impl MediaRegistry for InMemoryRegistry {
    fn register(&self, media: &MediaDescriptor) -> Option<CacheKey> {
        let mut state = self.inner.lock().ok()?;
        state.registered.push(media.media_id);
        Some(CacheKey(format!("{}:{}", media.kind.as_str(), media.media_id)))
    }

    fn upload_state_changed(&self, media_id: u64, state: UploadingState) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.states.insert(media_id, state);
        }
    }
}

impl MediaCache for InMemoryRegistry {
    fn write(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let mut state = self.inner.lock().map_err(|_| Error::Cache {
            message: "media cache lock poisoned".to_string(),
        })?;
        state.cache.insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

use serde::Serialize;
use tokio::sync::mpsc;

use crate::file::{FileKind, FullMsgId};

/// Handle referencing an uploaded file when composing the outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputFile {
    Small {
        id: u64,
        parts: u32,
        name: String,
        md5_checksum: String,
    },
    Big {
        id: u64,
        parts: u32,
        name: String,
    },
    /// Uploaded out of band and referenced by URL.
    Url { url: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UploadEvent {
    PhotoReady {
        msg_id: FullMsgId,
        file: InputFile,
    },
    DocumentReady {
        msg_id: FullMsgId,
        file: InputFile,
    },
    ThumbDocumentReady {
        msg_id: FullMsgId,
        file: InputFile,
        thumb: InputFile,
    },
    SecureReady {
        msg_id: FullMsgId,
        file_id: u64,
        parts: u32,
        file: InputFile,
    },
    PhotoProgress {
        msg_id: FullMsgId,
        sent: u64,
        total: u64,
    },
    DocumentProgress {
        msg_id: FullMsgId,
        sent: u64,
        total: u64,
    },
    SecureProgress {
        msg_id: FullMsgId,
        offset: u64,
        size: u64,
    },
    PhotoFailed {
        msg_id: FullMsgId,
        error: String,
    },
    DocumentFailed {
        msg_id: FullMsgId,
        error: String,
    },
    SecureFailed {
        msg_id: FullMsgId,
        error: String,
    },
}

impl UploadEvent {
    pub fn msg_id(&self) -> FullMsgId {
        match self {
            Self::PhotoReady { msg_id, .. }
            | Self::DocumentReady { msg_id, .. }
            | Self::ThumbDocumentReady { msg_id, .. }
            | Self::SecureReady { msg_id, .. }
            | Self::PhotoProgress { msg_id, .. }
            | Self::DocumentProgress { msg_id, .. }
            | Self::SecureProgress { msg_id, .. }
            | Self::PhotoFailed { msg_id, .. }
            | Self::DocumentFailed { msg_id, .. }
            | Self::SecureFailed { msg_id, .. } => *msg_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::PhotoProgress { .. } | Self::DocumentProgress { .. } | Self::SecureProgress { .. }
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::PhotoFailed { .. } | Self::DocumentFailed { .. } | Self::SecureFailed { .. }
        )
    }

    pub(crate) fn progress(kind: FileKind, msg_id: FullMsgId, sent: u64, total: u64) -> Self {
        match kind {
            FileKind::Photo => Self::PhotoProgress { msg_id, sent, total },
            FileKind::Secure => Self::SecureProgress {
                msg_id,
                offset: sent,
                size: total,
            },
            FileKind::File | FileKind::WallPaper | FileKind::Audio => Self::DocumentProgress {
                msg_id,
                sent,
                total,
            },
        }
    }

    pub(crate) fn failed(kind: FileKind, msg_id: FullMsgId, error: String) -> Self {
        match kind {
            FileKind::Photo => Self::PhotoFailed { msg_id, error },
            FileKind::Secure => Self::SecureFailed { msg_id, error },
            FileKind::File | FileKind::WallPaper | FileKind::Audio => {
                Self::DocumentFailed { msg_id, error }
            }
        }
    }
}

/// Fan-out of upload events to every live subscriber.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Vec<mpsc::UnboundedSender<UploadEvent>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: UploadEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::events::{EventHub, InputFile, UploadEvent};
use crate::file::{FileKind, FullMsgId, PartTarget, UploadFile};
use crate::media::{
    FileLoadResult, MAX_CACHED_CONTENT, MediaCache, MediaDescriptor, MediaRegistry,
    UploadingState,
};
use crate::strategy::{Completion, RequestId, UploadStrategy};
use crate::{Error, Result};

pub const DEFAULT_IDLE_TEARDOWN: Duration = Duration::from_secs(15);

/// Upload queue shared by both protocols. Exactly one file is current at a
/// time; the rest wait in message-id order.
pub struct Uploader<S: UploadStrategy> {
    strategy: S,
    queue: BTreeMap<FullMsgId, UploadFile>,
    uploading: Option<FullMsgId>,
    finalizing: bool,
    paused: Option<FullMsgId>,
    idle_timeout: Duration,
    idle_deadline: Option<Instant>,
    registry: Arc<dyn MediaRegistry>,
    cache: Arc<dyn MediaCache>,
    events: EventHub,
}

impl<S: UploadStrategy> Uploader<S> {
    pub fn new(strategy: S, registry: Arc<dyn MediaRegistry>, cache: Arc<dyn MediaCache>) -> Self {
        Self {
            strategy,
            queue: BTreeMap::new(),
            uploading: None,
            finalizing: false,
            paused: None,
            idle_timeout: DEFAULT_IDLE_TEARDOWN,
            idle_deadline: None,
            registry,
            cache,
            events: EventHub::new(),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<UploadEvent> {
        self.events.subscribe()
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.strategy
    }

    pub fn current(&self) -> Option<FullMsgId> {
        self.uploading
    }

    pub fn file(&self, msg_id: FullMsgId) -> Option<&UploadFile> {
        self.queue.get(&msg_id)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn paused(&self) -> Option<FullMsgId> {
        self.paused
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    pub fn upload_media(&mut self, msg_id: FullMsgId, media: MediaDescriptor) {
        self.registry.register(&media);
        self.enqueue(msg_id, media);
    }

    pub fn upload(&mut self, msg_id: FullMsgId, result: FileLoadResult) {
        let key = self.registry.register(&result.media);
        if let (Some(key), Some(content)) = (key, result.content.as_deref())
            && content.len() < MAX_CACHED_CONTENT
            && let Err(e) = self.cache.write(&key, content)
        {
            warn!(
                event = "upload.cache_write_failed",
                msg_id = %msg_id,
                key = %key.0,
                error = %e,
                "upload.cache_write_failed"
            );
        }
        self.enqueue(msg_id, result.media);
    }

    /// The current file fails right away; a queued one is dropped silently.
    pub fn cancel(&mut self, msg_id: FullMsgId) {
        if self.uploading == Some(msg_id) {
            self.fail_current(Error::Cancelled);
            self.send_next();
        } else if let Some(mut file) = self.queue.remove(&msg_id) {
            file.close();
            debug!(event = "upload.dequeued", msg_id = %msg_id, "upload.dequeued");
        }
    }

    pub fn pause(&mut self, msg_id: FullMsgId) {
        self.paused = Some(msg_id);
    }

    pub fn unpause(&mut self) {
        self.paused = None;
        self.send_next();
    }

    pub fn confirm(&mut self, msg_id: FullMsgId) {
        self.strategy.confirm(msg_id);
    }

    /// Pushes as many parts as the strategy accepts. Files that end while
    /// being started or pumped are followed by the next queued one in the
    /// same call.
    pub fn send_next(&mut self) {
        while self.paused.is_none() {
            let current = match self.uploading {
                Some(id) => id,
                None => match self.begin_next() {
                    Some(Ok(id)) => id,
                    Some(Err(e)) => {
                        self.fail_current(e);
                        continue;
                    }
                    None => return,
                },
            };

            if !self.pump(current) {
                return;
            }
        }
    }

    pub fn on_response(&mut self, request: RequestId, response: Result<S::Response>) {
        match self.strategy.complete(request, response) {
            Ok(Completion::Stale) => {
                debug!(event = "upload.stale_response", request, "upload.stale_response");
                return;
            }
            Ok(Completion::Part { target, bytes }) => self.part_done(target, bytes),
            Ok(Completion::Finalized(input)) => self.finish_current(input),
            Err(e) => self.fail_current(e),
        }
        self.send_next();
    }

    /// Idle deadline expired. Sessions are only released when nothing got
    /// queued in the meantime.
    pub fn on_idle_timeout(&mut self) {
        if self.idle_deadline.take().is_none() {
            return;
        }
        if !self.queue.is_empty() || self.uploading.is_some() {
            return;
        }
        info!(
            event = "upload.sessions_released",
            strategy = self.strategy.name(),
            "upload.sessions_released"
        );
        self.strategy.release_idle();
    }

    fn enqueue(&mut self, msg_id: FullMsgId, media: MediaDescriptor) {
        let kind = media.kind;
        let media_id = media.media_id;
        let table = self.strategy.part_table();

        match UploadFile::new(msg_id, media, &table) {
            Ok(file) => {
                if self.queue.contains_key(&msg_id) {
                    warn!(event = "upload.replaced", msg_id = %msg_id, "upload.replaced");
                    self.cancel(msg_id);
                }
                debug!(
                    event = "upload.enqueued",
                    msg_id = %msg_id,
                    file_id = file.id(),
                    size = file.total_size(),
                    parts = file.parts_count(),
                    "upload.enqueued"
                );
                self.queue.insert(msg_id, file);
            }
            Err(e) => {
                error!(
                    event = "upload.plan_failed",
                    strategy = self.strategy.name(),
                    msg_id = %msg_id,
                    error = %e,
                    "upload.plan_failed"
                );
                self.registry
                    .upload_state_changed(media_id, UploadingState::Failed);
                self.events
                    .emit(UploadEvent::failed(kind, msg_id, e.to_string()));
            }
        }

        self.send_next();
    }

    /// Makes the first queued file current. `None` when the queue is empty.
    fn begin_next(&mut self) -> Option<Result<FullMsgId>> {
        let Some((&id, file)) = self.queue.iter_mut().next() else {
            self.arm_idle();
            return None;
        };
        self.idle_deadline = None;
        self.uploading = Some(id);
        self.finalizing = false;

        if let Err(e) = self.strategy.begin(file) {
            return Some(Err(e));
        }
        info!(
            event = "upload.start",
            strategy = self.strategy.name(),
            msg_id = %id,
            file_id = file.id(),
            kind = file.kind().as_str(),
            size = file.total_size(),
            part_size = file.plan().part_size,
            parts = file.parts_count(),
            big = file.is_big(),
            "upload.start"
        );
        Some(Ok(id))
    }

    /// Returns `true` once the current file has ended and the next one may start.
    fn pump(&mut self, current: FullMsgId) -> bool {
        loop {
            if self.finalizing {
                return false;
            }
            let Some(file) = self.queue.get_mut(&current) else {
                self.uploading = None;
                return true;
            };

            match self.strategy.prepare(file) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    self.fail_current(e);
                    return true;
                }
            }

            if file.has_pending_thumb_parts() || file.has_unrequested_parts() {
                if !self.strategy.can_send() {
                    return false;
                }
                let part = match file.take_thumb_part() {
                    Some(part) => Ok(part),
                    None => file.read_next_part(),
                };
                let sent = part.and_then(|part| self.strategy.send_part(file, part));
                if let Err(e) = sent {
                    self.fail_current(e);
                    return true;
                }
                continue;
            }

            if !file.is_resolved(self.strategy.has_outstanding()) {
                return false;
            }

            return match self.strategy.finalize(file) {
                Ok(Some(input)) => {
                    self.finish_current(input);
                    true
                }
                Ok(None) => {
                    debug!(event = "upload.finalizing", msg_id = %current, "upload.finalizing");
                    self.finalizing = true;
                    false
                }
                Err(e) => {
                    self.fail_current(e);
                    true
                }
            };
        }
    }

    fn part_done(&mut self, target: PartTarget, bytes: usize) {
        if target != PartTarget::Body {
            return;
        }
        let Some(msg_id) = self.uploading else {
            return;
        };
        let Some(file) = self.queue.get_mut(&msg_id) else {
            return;
        };

        file.mark_part_sent(bytes);
        let (sent, total) = (file.sent_bytes(), file.total_size());
        self.registry.upload_state_changed(
            file.media_id(),
            UploadingState::InProgress {
                offset: sent,
                size: total,
            },
        );
        self.events
            .emit(UploadEvent::progress(file.kind(), msg_id, sent, total));
    }

    fn finish_current(&mut self, input: InputFile) {
        let Some(msg_id) = self.uploading.take() else {
            return;
        };
        self.finalizing = false;
        let Some(mut file) = self.queue.remove(&msg_id) else {
            return;
        };
        file.close();

        let event = match file.kind() {
            FileKind::Photo => UploadEvent::PhotoReady {
                msg_id,
                file: input,
            },
            FileKind::Secure => UploadEvent::SecureReady {
                msg_id,
                file_id: file.id(),
                parts: file.parts_count(),
                file: input,
            },
            FileKind::File | FileKind::WallPaper | FileKind::Audio => match file.thumbnail() {
                Some(thumb) => UploadEvent::ThumbDocumentReady {
                    msg_id,
                    file: input,
                    thumb: thumb.input_file(),
                },
                None => UploadEvent::DocumentReady {
                    msg_id,
                    file: input,
                },
            },
        };

        info!(
            event = "upload.ready",
            strategy = self.strategy.name(),
            msg_id = %msg_id,
            file_id = file.id(),
            parts = file.parts_count(),
            bytes = file.sent_bytes(),
            "upload.ready"
        );
        self.registry
            .upload_state_changed(file.media_id(), UploadingState::Done);
        self.events.emit(event);
    }

    fn fail_current(&mut self, err: Error) {
        let Some(msg_id) = self.uploading.take() else {
            return;
        };
        self.finalizing = false;
        self.strategy.abort();

        if let Some(mut file) = self.queue.remove(&msg_id) {
            file.close();
            warn!(
                event = "upload.failed",
                strategy = self.strategy.name(),
                msg_id = %msg_id,
                file_id = file.id(),
                sent_parts = file.sent_parts(),
                parts = file.parts_count(),
                error = %err,
                "upload.failed"
            );
            self.registry
                .upload_state_changed(file.media_id(), UploadingState::Failed);
            self.events
                .emit(UploadEvent::failed(file.kind(), msg_id, err.to_string()));
        }
    }

    fn arm_idle(&mut self) {
        if self.idle_deadline.is_none() {
            self.idle_deadline = Some(Instant::now() + self.idle_timeout);
        }
    }
}

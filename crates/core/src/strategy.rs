use crate::Result;
use crate::events::InputFile;
use crate::file::{FilePart, FullMsgId, PartTable, PartTarget, UploadFile};

/// Transport-assigned identifier of one outstanding request.
pub type RequestId = u64;

/// What a transport response meant for the current file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The request is no longer tracked (cancelled or already failed).
    Stale,
    Part { target: PartTarget, bytes: usize },
    Finalized(InputFile),
}

/// Protocol-specific half of the uploader. The controller owns the queue and
/// drives the chunk loop; a strategy decides how parts go over the wire, how
/// much may be in flight and how a file is finalized.
pub trait UploadStrategy {
    type Response;

    fn name(&self) -> &'static str;

    fn part_table(&self) -> PartTable;

    /// Called once when `file` becomes the current upload.
    fn begin(&mut self, file: &mut UploadFile) -> Result<()>;

    /// Advances per-file setup by one bounded step. Parts are only sent once
    /// this returns `true`; until then the controller retries on its next pass.
    fn prepare(&mut self, _file: &mut UploadFile) -> Result<bool> {
        Ok(true)
    }

    fn can_send(&self) -> bool;

    fn send_part(&mut self, file: &UploadFile, part: FilePart) -> Result<()>;

    fn has_outstanding(&self) -> bool;

    /// Returns the ready handle, or `None` while a finalize request is in flight.
    fn finalize(&mut self, file: &mut UploadFile) -> Result<Option<InputFile>>;

    fn complete(
        &mut self,
        request: RequestId,
        response: Result<Self::Response>,
    ) -> Result<Completion>;

    /// Drops every outstanding request of the current file.
    fn abort(&mut self);

    /// Releases transport resources after the queue stayed empty.
    fn release_idle(&mut self) {}

    fn confirm(&mut self, _msg_id: FullMsgId) {}
}

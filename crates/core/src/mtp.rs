use std::collections::HashMap;

use tracing::debug;

use crate::events::InputFile;
use crate::file::{FilePart, KB, MB, PartTable, PartTarget, PartTier, UploadFile};
use crate::strategy::{Completion, RequestId, UploadStrategy};
use crate::{Error, Result};

pub const UPLOAD_SESSIONS_COUNT: usize = 2;
pub const MAX_PARALLEL_BYTES_PER_SESSION: usize = 512 * KB;
pub const MAX_UPLOAD_FILE_PARALLEL_SIZE: usize =
    UPLOAD_SESSIONS_COUNT * MAX_PARALLEL_BYTES_PER_SESSION;
/// Files strictly larger than this go through the big-file call.
pub const USE_BIG_FILES_FROM: u64 = 10 * MB as u64;
pub const MAX_PARTS: u32 = 3000;

pub static MTP_PART_TABLE: PartTable = PartTable {
    tiers: &[
        PartTier {
            part_size: 32 * KB,
            max_total: Some(MB as u64 - 1),
        },
        PartTier {
            part_size: 64 * KB,
            max_total: Some(32 * MB as u64),
        },
        PartTier {
            part_size: 128 * KB,
            max_total: None,
        },
        PartTier {
            part_size: 256 * KB,
            max_total: None,
        },
        PartTier {
            part_size: 512 * KB,
            max_total: None,
        },
    ],
    max_parts: MAX_PARTS,
};

/// One save-part call. `Big` carries the total part count and no digest is
/// ever sent for such a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveFilePart {
    Small {
        file_id: u64,
        part: u32,
        bytes: Vec<u8>,
    },
    Big {
        file_id: u64,
        part: u32,
        total_parts: u32,
        bytes: Vec<u8>,
    },
}

impl SaveFilePart {
    pub fn file_id(&self) -> u64 {
        match self {
            Self::Small { file_id, .. } | Self::Big { file_id, .. } => *file_id,
        }
    }

    pub fn part(&self) -> u32 {
        match self {
            Self::Small { part, .. } | Self::Big { part, .. } => *part,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Small { bytes, .. } | Self::Big { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_big(&self) -> bool {
        matches!(self, Self::Big { .. })
    }
}

/// RPC layer as seen by the uploader. Responses are delivered back through
/// [`crate::Uploader::on_response`] with the returned request id.
pub trait MtpTransport {
    fn send(&mut self, lane: usize, request: SaveFilePart) -> RequestId;

    fn cancel(&mut self, request: RequestId);

    fn stop_session(&mut self, lane: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtpLimits {
    pub sessions: usize,
    pub max_in_flight_per_session: usize,
    pub big_file_threshold: u64,
}

impl MtpLimits {
    pub fn max_in_flight(&self) -> usize {
        self.sessions * self.max_in_flight_per_session
    }

    /// Files above the threshold go out as big parts without a checksum.
    pub fn is_big(&self, total_size: u64) -> bool {
        total_size > self.big_file_threshold
    }
}

impl Default for MtpLimits {
    fn default() -> Self {
        Self {
            sessions: UPLOAD_SESSIONS_COUNT,
            max_in_flight_per_session: MAX_PARALLEL_BYTES_PER_SESSION,
            big_file_threshold: USE_BIG_FILES_FROM,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingPart {
    bytes: usize,
    lane: usize,
    target: PartTarget,
}

pub struct MtpStrategy<T: MtpTransport> {
    transport: T,
    limits: MtpLimits,
    lane_bytes: Vec<usize>,
    in_flight: usize,
    requests: HashMap<RequestId, PendingPart>,
}

impl<T: MtpTransport> MtpStrategy<T> {
    pub fn new(transport: T, limits: MtpLimits) -> Self {
        let sessions = limits.sessions.max(1);
        Self {
            transport,
            limits: MtpLimits { sessions, ..limits },
            lane_bytes: vec![0; sessions],
            in_flight: 0,
            requests: HashMap::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn limits(&self) -> MtpLimits {
        self.limits
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight
    }

    pub fn lane_bytes(&self) -> &[usize] {
        &self.lane_bytes
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    /// Least loaded lane, lowest index on ties.
    fn pick_lane(&self) -> usize {
        self.lane_bytes
            .iter()
            .enumerate()
            .min_by_key(|(_, bytes)| **bytes)
            .map(|(lane, _)| lane)
            .unwrap_or(0)
    }

    fn release(&mut self, pending: PendingPart) {
        if let Some(lane) = self.lane_bytes.get_mut(pending.lane) {
            *lane = lane.saturating_sub(pending.bytes);
        }
        self.in_flight = self.in_flight.saturating_sub(pending.bytes);
    }
}

impl<T: MtpTransport> UploadStrategy for MtpStrategy<T> {
    type Response = bool;

    fn name(&self) -> &'static str {
        "mtp"
    }

    fn part_table(&self) -> PartTable {
        MTP_PART_TABLE
    }

    fn begin(&mut self, file: &mut UploadFile) -> Result<()> {
        let big = self.limits.is_big(file.total_size());
        file.set_big(big);
        if big {
            // The big-file finalize record carries no checksum.
            file.disable_hash();
        }
        Ok(())
    }

    fn can_send(&self) -> bool {
        self.in_flight < self.limits.max_in_flight()
    }

    fn send_part(&mut self, file: &UploadFile, part: FilePart) -> Result<()> {
        let bytes = part.bytes.len();
        let target = part.target;
        let request = match target {
            PartTarget::Body if file.is_big() => SaveFilePart::Big {
                file_id: part.file_id,
                part: part.index,
                total_parts: file.parts_count(),
                bytes: part.bytes,
            },
            PartTarget::Body | PartTarget::Thumbnail => SaveFilePart::Small {
                file_id: part.file_id,
                part: part.index,
                bytes: part.bytes,
            },
        };

        let lane = self.pick_lane();
        let id = self.transport.send(lane, request);
        self.lane_bytes[lane] += bytes;
        self.in_flight += bytes;
        self.requests.insert(
            id,
            PendingPart {
                bytes,
                lane,
                target,
            },
        );
        Ok(())
    }

    fn has_outstanding(&self) -> bool {
        !self.requests.is_empty()
    }

    fn finalize(&mut self, file: &mut UploadFile) -> Result<Option<InputFile>> {
        let name = file.wire_name();
        let input = if file.is_big() {
            InputFile::Big {
                id: file.id(),
                parts: file.parts_count(),
                name,
            }
        } else {
            InputFile::Small {
                id: file.id(),
                parts: file.parts_count(),
                name,
                md5_checksum: file.finish_hash().map(hex::encode).unwrap_or_default(),
            }
        };
        Ok(Some(input))
    }

    fn complete(&mut self, request: RequestId, response: Result<bool>) -> Result<Completion> {
        let Some(pending) = self.requests.remove(&request) else {
            return Ok(Completion::Stale);
        };
        self.release(pending);

        match response {
            Ok(true) => Ok(Completion::Part {
                target: pending.target,
                bytes: pending.bytes,
            }),
            Ok(false) => Err(Error::Rpc {
                message: format!("save file part rejected (request {request})"),
            }),
            Err(e) => Err(e),
        }
    }

    fn abort(&mut self) {
        for (id, _) in self.requests.drain() {
            self.transport.cancel(id);
        }
        self.lane_bytes.iter_mut().for_each(|b| *b = 0);
        self.in_flight = 0;
    }

    fn release_idle(&mut self) {
        for lane in 0..self.limits.sessions {
            debug!(event = "mtp.session_stop", lane, "mtp.session_stop");
            self.transport.stop_session(lane);
        }
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Take};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::events::InputFile;
use crate::media::MediaDescriptor;
use crate::{Error, Result};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

pub const THUMB_PART_SIZE: usize = 32 * KB;
pub const PHOTO_WIRE_NAME: &str = "file.jpg";
pub const THUMB_WIRE_NAME: &str = "thumb.jpg";

const DIGEST_READ_BUFFER: usize = 64 * KB;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FullMsgId {
    pub peer: i64,
    pub msg: i32,
}

impl FullMsgId {
    pub const fn new(peer: i64, msg: i32) -> Self {
        Self { peer, msg }
    }
}

impl fmt::Display for FullMsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Photo,
    File,
    WallPaper,
    Audio,
    Secure,
}

impl FileKind {
    /// Kinds that finish through the document events and may carry a thumbnail.
    pub fn is_document(self) -> bool {
        matches!(self, Self::File | Self::WallPaper | Self::Audio)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::File => "file",
            Self::WallPaper => "wallpaper",
            Self::Audio => "audio",
            Self::Secure => "secure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl FileSource {
    fn display_path(&self) -> PathBuf {
        match self {
            Self::Bytes(_) => PathBuf::from("<memory>"),
            Self::Path(path) => path.clone(),
        }
    }
}

/// One row of a part-size table. The tier is only considered for totals up to
/// `max_total` (inclusive) when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartTier {
    pub part_size: usize,
    pub max_total: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartTable {
    pub tiers: &'static [PartTier],
    pub max_parts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartPlan {
    pub part_size: usize,
    pub parts_count: u32,
}

impl PartTable {
    /// Picks the first tier whose part count stays within `max_parts`.
    pub fn plan(&self, total: u64) -> Result<PartPlan> {
        for tier in self.tiers {
            if tier.part_size == 0 || tier.max_total.is_some_and(|max| total > max) {
                continue;
            }
            let parts = total.div_ceil(tier.part_size as u64);
            if parts <= u64::from(self.max_parts) {
                return Ok(PartPlan {
                    part_size: tier.part_size,
                    parts_count: parts as u32,
                });
            }
        }
        Err(Error::PartSize {
            size: total,
            max_parts: self.max_parts,
        })
    }

    pub fn largest_part_size(&self) -> usize {
        self.tiers.iter().map(|t| t.part_size).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartTarget {
    Body,
    Thumbnail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub target: PartTarget,
    pub file_id: u64,
    /// Zero-based part index.
    pub index: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub id: u64,
    pub parts_count: u32,
    pub md5: [u8; 16],
    parts: VecDeque<Vec<u8>>,
    next_index: u32,
}

impl Thumbnail {
    pub fn split(id: u64, bytes: &[u8]) -> Self {
        let parts: VecDeque<Vec<u8>> = bytes
            .chunks(THUMB_PART_SIZE)
            .map(<[u8]>::to_vec)
            .collect();
        Self {
            id,
            parts_count: parts.len() as u32,
            md5: md5::compute(bytes).0,
            parts,
            next_index: 0,
        }
    }

    pub fn pending_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn input_file(&self) -> InputFile {
        InputFile::Small {
            id: self.id,
            parts: self.parts_count,
            name: THUMB_WIRE_NAME.to_string(),
            md5_checksum: hex::encode(self.md5),
        }
    }
}

pub fn random_file_id() -> Result<u64> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).map_err(|e| Error::Random {
        message: e.to_string(),
    })?;
    Ok(u64::from_le_bytes(buf))
}

/// Bookkeeping for one media item while it sits in the upload queue.
pub struct UploadFile {
    msg_id: FullMsgId,
    id: u64,
    kind: FileKind,
    filename: String,
    media_id: u64,
    total_size: u64,
    plan: PartPlan,
    next_part: u32,
    sent_parts: u32,
    sent_bytes: u64,
    big: bool,
    hasher: Option<md5::Context>,
    digest: Option<[u8; 16]>,
    source: FileSource,
    reader: Option<File>,
    digest_job: Option<DigestJob>,
    thumbnail: Option<Thumbnail>,
}

/// Whole-source MD5 in progress, bounded to the declared size.
struct DigestJob {
    reader: Take<File>,
    ctx: md5::Context,
    hashed: u64,
}

impl UploadFile {
    pub fn new(msg_id: FullMsgId, media: MediaDescriptor, table: &PartTable) -> Result<Self> {
        let total_size = media.total_size();
        let plan = table.plan(total_size)?;
        let id = match media.file_id {
            Some(id) => id,
            None => random_file_id()?,
        };

        let thumbnail = match media.thumbnail {
            Some(thumb) if media.kind.is_document() && !thumb.bytes.is_empty() => {
                let thumb_id = match thumb.id {
                    Some(id) => id,
                    None => random_file_id()?,
                };
                Some(Thumbnail::split(thumb_id, &thumb.bytes))
            }
            _ => None,
        };

        Ok(Self {
            msg_id,
            id,
            kind: media.kind,
            filename: media.filename,
            media_id: media.media_id,
            total_size,
            plan,
            next_part: 0,
            sent_parts: 0,
            sent_bytes: 0,
            big: false,
            hasher: Some(md5::Context::new()),
            digest: None,
            source: media.source,
            reader: None,
            digest_job: None,
            thumbnail,
        })
    }

    pub fn msg_id(&self) -> FullMsgId {
        self.msg_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn media_id(&self) -> u64 {
        self.media_id
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn plan(&self) -> PartPlan {
        self.plan
    }

    pub fn parts_count(&self) -> u32 {
        self.plan.parts_count
    }

    pub fn next_part(&self) -> u32 {
        self.next_part
    }

    pub fn sent_parts(&self) -> u32 {
        self.sent_parts
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    pub fn is_big(&self) -> bool {
        self.big
    }

    pub fn thumbnail(&self) -> Option<&Thumbnail> {
        self.thumbnail.as_ref()
    }

    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Bytes(_) => None,
        }
    }

    pub fn is_reader_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Name sent to the server in the finalize record.
    pub fn wire_name(&self) -> String {
        if self.kind == FileKind::Photo || self.filename.is_empty() {
            PHOTO_WIRE_NAME.to_string()
        } else {
            self.filename.clone()
        }
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(str::to_ascii_lowercase)
    }

    pub(crate) fn set_big(&mut self, big: bool) {
        self.big = big;
    }

    pub(crate) fn disable_hash(&mut self) {
        self.hasher = None;
    }

    pub(crate) fn drop_thumbnail(&mut self) -> bool {
        self.thumbnail.take().is_some()
    }

    pub fn has_pending_thumb_parts(&self) -> bool {
        self.thumbnail.as_ref().is_some_and(|t| t.pending_parts() > 0)
    }

    pub fn has_unrequested_parts(&self) -> bool {
        self.next_part < self.plan.parts_count
    }

    /// Ready to finalize: every body part acknowledged, thumbnail drained and
    /// nothing left in flight.
    pub fn is_resolved(&self, outstanding: bool) -> bool {
        self.sent_parts == self.plan.parts_count && !self.has_pending_thumb_parts() && !outstanding
    }

    pub(crate) fn take_thumb_part(&mut self) -> Option<FilePart> {
        let thumb = self.thumbnail.as_mut()?;
        let bytes = thumb.parts.pop_front()?;
        let index = thumb.next_index;
        thumb.next_index += 1;
        Some(FilePart {
            target: PartTarget::Thumbnail,
            file_id: thumb.id,
            index,
            bytes,
        })
    }

    pub(crate) fn read_next_part(&mut self) -> Result<FilePart> {
        let index = self.next_part;
        let offset = u64::from(index) * self.plan.part_size as u64;
        let len = self
            .total_size
            .saturating_sub(offset)
            .min(self.plan.part_size as u64) as usize;

        let bytes = match &self.source {
            FileSource::Bytes(data) => {
                let start = offset as usize;
                data.get(start..start + len)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| Error::SourceRead {
                        path: self.source.display_path(),
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("buffer ends before part {index}"),
                        ),
                    })?
            }
            FileSource::Path(path) => {
                let reader = match self.reader.take() {
                    Some(reader) => reader,
                    None => File::open(path).map_err(|source| Error::SourceRead {
                        path: path.clone(),
                        source,
                    })?,
                };
                let reader = self.reader.insert(reader);
                let mut buf = vec![0u8; len];
                reader
                    .read_exact(&mut buf)
                    .map_err(|source| Error::SourceRead {
                        path: path.clone(),
                        source,
                    })?;
                buf
            }
        };

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.consume(&bytes);
        }
        self.next_part += 1;
        if self.next_part >= self.plan.parts_count {
            self.reader = None;
        }

        Ok(FilePart {
            target: PartTarget::Body,
            file_id: self.id,
            index,
            bytes,
        })
    }

    pub(crate) fn mark_part_sent(&mut self, bytes: usize) {
        debug_assert!(self.sent_parts < self.plan.parts_count);
        self.sent_parts = (self.sent_parts + 1).min(self.plan.parts_count);
        self.sent_bytes = (self.sent_bytes + bytes as u64).min(self.total_size);
    }

    /// Finishes the rolling digest. Returns `None` when hashing was disabled.
    pub(crate) fn finish_hash(&mut self) -> Option<[u8; 16]> {
        if let Some(hasher) = self.hasher.take() {
            self.digest = Some(hasher.compute().0);
        }
        self.digest
    }

    pub fn digest(&self) -> Option<[u8; 16]> {
        self.digest
    }

    /// Hashes up to `budget` more bytes of the first `total_size` bytes of the
    /// source, the same bytes the parts carry. Returns the MD5 once all of
    /// them are consumed and replaces the rolling digest with it.
    pub(crate) fn advance_digest(&mut self, budget: u64) -> Result<Option<[u8; 16]>> {
        let total = self.total_size;
        let digest = match &self.source {
            FileSource::Bytes(data) => {
                let data = usize::try_from(total)
                    .ok()
                    .and_then(|len| data.get(..len))
                    .ok_or_else(|| Error::SourceRead {
                        path: self.source.display_path(),
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("buffer holds {} of {total} bytes", data.len()),
                        ),
                    })?;
                md5::compute(data).0
            }
            FileSource::Path(path) => {
                let read_err = |source| Error::SourceRead {
                    path: path.clone(),
                    source,
                };
                let job = match self.digest_job.take() {
                    Some(job) => job,
                    None => DigestJob {
                        reader: File::open(path).map_err(read_err)?.take(total),
                        ctx: md5::Context::new(),
                        hashed: 0,
                    },
                };
                let job = self.digest_job.insert(job);

                let mut buf = vec![0u8; DIGEST_READ_BUFFER];
                let mut left = budget;
                while job.hashed < total && left > 0 {
                    let want = left.min(buf.len() as u64) as usize;
                    let n = job.reader.read(&mut buf[..want]).map_err(read_err)?;
                    if n == 0 {
                        return Err(read_err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("file ends after {} of {total} bytes", job.hashed),
                        )));
                    }
                    job.ctx.consume(&buf[..n]);
                    job.hashed += n as u64;
                    left -= n as u64;
                }
                if job.hashed < total {
                    return Ok(None);
                }
                match self.digest_job.take() {
                    Some(job) => job.ctx.compute().0,
                    None => return Ok(None),
                }
            }
        };
        self.hasher = None;
        self.digest = Some(digest);
        Ok(Some(digest))
    }

    pub(crate) fn close(&mut self) {
        self.reader = None;
        self.digest_job = None;
    }
}

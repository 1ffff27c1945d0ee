use serde::Deserialize;
use tracing::{debug, warn};

use crate::events::InputFile;
use crate::file::{FilePart, MB, PartTable, PartTarget, PartTier, UploadFile};
use crate::media::SessionContext;
use crate::strategy::{Completion, RequestId, UploadStrategy};
use crate::{Error, Result};

pub const WEB_MAX_PARTS: u32 = 1000;
const DEFAULT_FILE_TYPE: &str = "bin";
/// Bytes hashed per controller pass while the digest of a file is computed.
pub const DIGEST_STEP: u64 = 16 * MB as u64;

pub static WEB_PART_TABLE: PartTable = PartTable {
    tiers: &[
        PartTier {
            part_size: MB,
            max_total: None,
        },
        PartTier {
            part_size: 2 * MB,
            max_total: None,
        },
        PartTier {
            part_size: 4 * MB,
            max_total: None,
        },
        PartTier {
            part_size: 8 * MB,
            max_total: None,
        },
    ],
    max_parts: WEB_MAX_PARTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebCall {
    UploadPart,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebFilePart {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One multipart POST: text fields plus an optional `file` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRequest {
    pub call: WebCall,
    pub fields: Vec<(&'static str, String)>,
    pub file: Option<WebFilePart>,
}

impl WebRequest {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP layer as seen by the uploader. The raw response body is delivered
/// back through [`crate::Uploader::on_response`].
pub trait HttpTransport {
    fn post(&mut self, request: WebRequest) -> RequestId;

    fn cancel(&mut self, request: RequestId);
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    error: i64,
}

#[derive(Debug, Deserialize)]
struct VerifyReply {
    file_name: String,
    file_url_prefix: String,
    path: String,
}

#[derive(Debug, Clone, Copy)]
enum Outstanding {
    Part {
        id: RequestId,
        bytes: usize,
        target: PartTarget,
    },
    Verify {
        id: RequestId,
    },
}

impl Outstanding {
    fn id(&self) -> RequestId {
        match self {
            Self::Part { id, .. } | Self::Verify { id } => *id,
        }
    }
}

#[derive(Debug, Clone)]
struct WebUpload {
    md5: Option<String>,
    file_type: String,
    total: u32,
    name: String,
}

pub struct WebStrategy<T: HttpTransport> {
    transport: T,
    context: SessionContext,
    outstanding: Option<Outstanding>,
    current: Option<WebUpload>,
}

impl<T: HttpTransport> WebStrategy<T> {
    pub fn new(transport: T, context: SessionContext) -> Self {
        Self {
            transport,
            context,
            outstanding: None,
            current: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn upload(&self) -> Result<&WebUpload> {
        self.current.as_ref().ok_or_else(|| Error::Http {
            message: "no web upload in progress".to_string(),
        })
    }

    fn base_fields(&self, upload: &WebUpload) -> Vec<(&'static str, String)> {
        vec![
            ("uid", self.context.user_id.to_string()),
            ("token", self.context.auth_token.clone()),
            ("md5", upload.md5.clone().unwrap_or_default()),
            ("type", upload.file_type.clone()),
            ("total", upload.total.to_string()),
        ]
    }
}

impl<T: HttpTransport> UploadStrategy for WebStrategy<T> {
    type Response = Vec<u8>;

    fn name(&self) -> &'static str {
        "web"
    }

    fn part_table(&self) -> PartTable {
        WEB_PART_TABLE
    }

    fn begin(&mut self, file: &mut UploadFile) -> Result<()> {
        if file.drop_thumbnail() {
            debug!(
                event = "web.thumbnail_skipped",
                msg_id = %file.msg_id(),
                "web.thumbnail_skipped"
            );
        }
        self.current = Some(WebUpload {
            md5: None,
            file_type: file
                .extension()
                .unwrap_or_else(|| DEFAULT_FILE_TYPE.to_string()),
            total: file.parts_count(),
            name: file.wire_name(),
        });
        Ok(())
    }

    /// The digest goes into every part request, so no part leaves before the
    /// whole file is hashed.
    fn prepare(&mut self, file: &mut UploadFile) -> Result<bool> {
        let Some(upload) = self.current.as_mut() else {
            return Ok(true);
        };
        if upload.md5.is_some() {
            return Ok(true);
        }
        let Some(digest) = file.advance_digest(DIGEST_STEP)? else {
            return Ok(false);
        };
        let md5 = hex::encode(digest);
        debug!(
            event = "web.digest_ready",
            msg_id = %file.msg_id(),
            md5 = %md5,
            "web.digest_ready"
        );
        upload.md5 = Some(md5);
        Ok(true)
    }

    fn can_send(&self) -> bool {
        self.outstanding.is_none()
    }

    fn send_part(&mut self, _file: &UploadFile, part: FilePart) -> Result<()> {
        let upload = self.upload()?;
        let mut fields = self.base_fields(upload);
        fields.push(("index", (part.index + 1).to_string()));
        let name = upload.name.clone();

        let bytes = part.bytes.len();
        let id = self.transport.post(WebRequest {
            call: WebCall::UploadPart,
            fields,
            file: Some(WebFilePart {
                name,
                bytes: part.bytes,
            }),
        });
        self.outstanding = Some(Outstanding::Part {
            id,
            bytes,
            target: part.target,
        });
        Ok(())
    }

    fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    fn finalize(&mut self, _file: &mut UploadFile) -> Result<Option<InputFile>> {
        let fields = self.base_fields(self.upload()?);
        let id = self.transport.post(WebRequest {
            call: WebCall::Verify,
            fields,
            file: None,
        });
        self.outstanding = Some(Outstanding::Verify { id });
        Ok(None)
    }

    fn complete(&mut self, request: RequestId, response: Result<Vec<u8>>) -> Result<Completion> {
        let Some(outstanding) = self.outstanding.take_if(|o| o.id() == request) else {
            return Ok(Completion::Stale);
        };
        let body = response?;
        check_status(&body)?;

        match outstanding {
            Outstanding::Part { bytes, target, .. } => Ok(Completion::Part { target, bytes }),
            Outstanding::Verify { .. } => {
                let reply: VerifyReply =
                    serde_json::from_slice(&body).map_err(|e| bad_response(&body, e))?;
                self.current = None;
                Ok(Completion::Finalized(InputFile::Url {
                    url: format!("{}{}", reply.file_url_prefix, reply.path),
                    name: reply.file_name,
                }))
            }
        }
    }

    fn abort(&mut self) {
        if let Some(outstanding) = self.outstanding.take() {
            self.transport.cancel(outstanding.id());
        }
        self.current = None;
    }
}

/// Every reply is a JSON object with an integer `error`; anything else fails the file.
fn check_status(body: &[u8]) -> Result<()> {
    let reply: StatusReply = serde_json::from_slice(body).map_err(|e| bad_response(body, e))?;
    if reply.error != 0 {
        let text = String::from_utf8_lossy(body);
        warn!(
            event = "web.server_error",
            code = reply.error,
            body = %text,
            "web.server_error"
        );
        return Err(Error::Http {
            message: format!("server returned error {}; body={text}", reply.error),
        });
    }
    Ok(())
}

fn bad_response(body: &[u8], e: serde_json::Error) -> Error {
    let text = String::from_utf8_lossy(body);
    warn!(
        event = "web.bad_response",
        error = %e,
        body = %text,
        "web.bad_response"
    );
    Error::Http {
        message: format!("invalid json: {e}; body={text}"),
    }
}

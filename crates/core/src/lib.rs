pub mod config;
pub mod driver;
mod error;
pub mod events;
pub mod file;
pub mod http;
pub mod logging;
pub mod media;
pub mod mtp;
pub mod strategy;
pub mod uploader;
pub mod web;

pub const APP_NAME: &str = "tgupload";

pub use driver::{Command, UploaderHandle, run_uploader, spawn_uploader};
pub use error::{Error, Result};
pub use events::{InputFile, UploadEvent};
pub use file::{FileKind, FileSource, FullMsgId, PartPlan, UploadFile};
pub use http::{ReqwestTransport, WebEndpoints};
pub use media::{
    FileLoadResult, InMemoryRegistry, MediaCache, MediaDescriptor, MediaRegistry, SessionContext,
    UploadingState,
};
pub use mtp::{MtpLimits, MtpStrategy, MtpTransport, SaveFilePart};
pub use strategy::{Completion, RequestId, UploadStrategy};
pub use uploader::Uploader;
pub use web::{HttpTransport, WebCall, WebRequest, WebStrategy};

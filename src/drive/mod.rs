// OneDrive API 模块

pub mod auth;
pub mod client;
#[cfg(test)]
pub mod mock;
pub mod transport;
pub mod types;

pub use auth::{StaticTokenProvider, TokenProvider};
pub use client::{DriveClient, DEFAULT_COPY_POLL_INTERVAL};
pub use transport::{
    is_local_read_error, local_read_error, HttpRequest, HttpResponse, HttpTransport,
    LocalReadError, ReqwestTransport, RequestBody, SegmentStream, StreamingResponse,
};
pub use types::{
    parse_range_start, ApiError, DriveItem, ListResult, UploadSessionInfo, UploadSessionStatus,
};

//! Segment copy wire protocol
//!
//! Requests and responses of the four copy actions plus the framing used to
//! carry them between nodes.

mod frame;
mod messages;

pub use frame::{CopyMessage, CopyMessageType, FailureKind, MAX_FRAME_BYTES, PROTOCOL_VERSION};
pub use messages::{
    CopyCleanFilesRequest, CopyErrorType, CopyFileChunkRequest, CopyFilesInfoRequest,
    CopyRequest, CopyResponse, CopyTransportRequest, ErrorResponse, SegmentsInfoRequest,
    SegmentsInfoResponse,
};

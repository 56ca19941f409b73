mod b64;
mod frame;
mod messages;
mod payload;
mod status;
mod traceback;

pub use frame::{
    AuthInfo, FrameHeader, MAGIC, MAX_BODY_LEN, MAX_HEADER_LEN,
    decode_header_json, encode_header_json,
};
#[cfg(feature = "tokio")]
pub use frame::{read_frame_async, write_frame_async};
pub use messages::{
    BlobGetRequest, BlobPutResponse, ContainerArguments, DefinitionType,
    FunctionDef, FunctionType, GenStatus, GenericResult, GetInputsRequest,
    GetInputsResponse, GetSerializedRequest, GetSerializedResponse,
    HandlerSpec, HeartbeatRequest, InputArgs, InputEnvelope, OutputRecord,
    ProxyInfo, PtyInfo, PtyInputRequest, PutOutputsRequest, ResultStatus,
    TaskResultRequest, WebhookConfig, WebhookKind, method,
};
pub use payload::{
    ArgsPayload, ExceptionPayload, Kwargs, PayloadError, Value, decode_args,
    decode_exception, decode_value, encode_args, encode_exception,
    encode_value,
};
pub use status::RpcStatus;
pub use traceback::{
    CachedLine, TracebackFrame, TracebackPayload, decode_line_cache,
    encode_line_cache,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("header too large: {0} bytes")]
    HeaderTooLarge(u32),
    #[error("body too large: {0} bytes")]
    BodyTooLarge(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header encode error: {0}")]
    HeaderEncode(String),
    #[error("header decode error: {0}")]
    HeaderDecode(String),
    #[error("body decode error: {0}")]
    BodyDecode(String),
}

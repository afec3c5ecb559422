use http::Method;
use thiserror::Error;

use crate::context::Cancellation;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    ConnectionReset,
    BrokenPipe,
    UnexpectedEof,
    Other,
}

impl TransportErrorKind {
    /// Whether a failed attempt with this kind may be retried.
    ///
    /// Only peer resets and broken pipes are retried unconditionally; an unexpected
    /// end of stream is retried when the request opted into it.
    pub const fn is_retryable(self, retry_on_eof: bool) -> bool {
        match self {
            Self::ConnectionReset | Self::BrokenPipe => true,
            Self::UnexpectedEof => retry_on_eof,
            Self::Dns | Self::Connect | Self::Tls | Self::Other => false,
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::ConnectionReset => "connection_reset",
            Self::BrokenPipe => "broken_pipe",
            Self::UnexpectedEof => "unexpected_eof",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    RequestBuild,
    Encode,
    SerializeQuery,
    SerializeForm,
    PayloadFile,
    Payload,
    Transport,
    Cancelled,
    DeadlineExceeded,
    RateLimiterClosed,
    ReadBody,
    BodyConsumed,
    UndeterminedDecoder,
    Decode,
    AfterExecute,
    TlsBackendInit,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::RequestBuild => "request_build",
            Self::Encode => "encode",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::PayloadFile => "payload_file",
            Self::Payload => "payload",
            Self::Transport => "transport",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::RateLimiterClosed => "rate_limiter_closed",
            Self::ReadBody => "read_body",
            Self::BodyConsumed => "body_consumed",
            Self::UndeterminedDecoder => "undetermined_decoder",
            Self::Decode => "decode",
            Self::AfterExecute => "after_execute",
            Self::TlsBackendInit => "tls_backend_init",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to encode request payload as {format}: {source}")]
    Encode {
        format: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to open payload file {path}: {source}")]
    PayloadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("streaming request payload failed for {method} {uri}: {source}")]
    Payload {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("request cancelled for {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("request deadline exceeded for {method} {uri}")]
    DeadlineExceeded { method: Method, uri: String },
    #[error("rate limiter is closed")]
    RateLimiterClosed,
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("response body was already consumed")]
    BodyConsumed,
    #[error("cannot determine a decoder for content-type {content_type:?}")]
    UndeterminedDecoder { content_type: String },
    #[error("failed to decode response {format}: {source}; body={body}")]
    Decode {
        format: &'static str,
        #[source]
        source: BoxError,
        body: String,
    },
    #[error("after-execute hook #{index} failed: {source}")]
    AfterExecute {
        index: usize,
        #[source]
        source: BoxError,
    },
    #[error("failed to initialize tls backend: {message}")]
    TlsBackendInit { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Encode { .. } => ErrorCode::Encode,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::PayloadFile { .. } => ErrorCode::PayloadFile,
            Self::Payload { .. } => ErrorCode::Payload,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::RateLimiterClosed => ErrorCode::RateLimiterClosed,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::BodyConsumed => ErrorCode::BodyConsumed,
            Self::UndeterminedDecoder { .. } => ErrorCode::UndeterminedDecoder,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::AfterExecute { .. } => ErrorCode::AfterExecute,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
        }
    }

    /// True when the call gave up because its context was cancelled or its deadline passed.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }

    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn from_cancellation(reason: Cancellation, method: &Method, uri: &str) -> Self {
        match reason {
            Cancellation::Cancelled => Self::Cancelled {
                method: method.clone(),
                uri: uri.to_owned(),
            },
            Cancellation::DeadlineExceeded => Self::DeadlineExceeded {
                method: method.clone(),
                uri: uri.to_owned(),
            },
        }
    }
}

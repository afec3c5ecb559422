use std::convert::Infallible;
use std::error::Error as StdError;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::oneshot;

use crate::error::{BoxError, Error};
use crate::multipart::Multipart;

/// Body type handed to a [`Transport`](crate::Transport).
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;
/// Body type a [`Transport`](crate::Transport) hands back.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

pub fn empty_body() -> RequestBody {
    Empty::<Bytes>::new()
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

pub fn full_body(body: impl Into<Bytes>) -> RequestBody {
    Full::new(body.into())
        .map_err(map_infallible_to_box_error)
        .boxed_unsync()
}

pub(crate) fn stream_body<S, E>(stream: S) -> RequestBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    StreamBody::new(stream.map(|item| {
        item.map(Frame::data)
            .map_err(|error| Box::new(error) as BoxError)
    }))
    .boxed_unsync()
}

/// Request payload as held between attempts.
pub(crate) enum Payload {
    Empty,
    /// Replayed verbatim on every attempt.
    Buffered(Bytes),
    /// Single pass; taken by the first attempt.
    Streaming(Option<RequestBody>),
    /// Single pass; encoded by a background task started by the first attempt.
    Multipart(Option<Multipart>),
}

pub(crate) struct AttemptBody {
    pub(crate) body: RequestBody,
    pub(crate) failure: Option<oneshot::Receiver<BoxError>>,
}

impl Payload {
    pub(crate) fn is_replayable(&self) -> bool {
        matches!(self, Self::Empty | Self::Buffered(_))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Buffered(_) => "buffered",
            Self::Streaming(_) => "streaming",
            Self::Multipart(_) => "multipart",
        }
    }

    pub(crate) fn attempt_body(&mut self) -> AttemptBody {
        match self {
            Self::Empty => AttemptBody {
                body: empty_body(),
                failure: None,
            },
            Self::Buffered(bytes) => AttemptBody {
                body: full_body(bytes.clone()),
                failure: None,
            },
            Self::Streaming(body) => AttemptBody {
                body: body.take().unwrap_or_else(empty_body),
                failure: None,
            },
            Self::Multipart(multipart) => match multipart.take() {
                Some(multipart) => {
                    let (body, failure) = multipart.spawn_encoder();
                    AttemptBody {
                        body,
                        failure: Some(failure),
                    }
                }
                None => AttemptBody {
                    body: empty_body(),
                    failure: None,
                },
            },
        }
    }
}

pub(crate) fn build_http_request(
    method: Method,
    uri: Uri,
    headers: &HeaderMap,
    body: RequestBody,
) -> Result<Request<RequestBody>, Error> {
    let mut request_builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request_builder = request_builder.header(name, value);
    }
    request_builder
        .body(body)
        .map_err(|source| Error::RequestBuild { source })
}

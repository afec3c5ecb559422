use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::Stream;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

use crate::backoff::{BackoffStrategy, ExponentialBackoff, LinearBackoff, NoBackoff};
use crate::body::{Payload, stream_body};
use crate::client::Client;
use crate::context::Context;
use crate::decode::DecodeFormat;
use crate::error::{BoxError, Error};
use crate::hooks::AfterExecute;
use crate::multipart::Multipart;
use crate::response::Response;
use crate::util::{
    append_query_pairs, merge_headers, parse_header_name, parse_header_value, redact_uri_for_logs,
    resolve_uri,
};

/// A fully resolved request, ready for [`Client::execute`].
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) redacted_uri: String,
    pub(crate) headers: HeaderMap,
    pub(crate) payload: Payload,
    pub(crate) max_attempts: usize,
    pub(crate) backoff: Arc<dyn BackoffStrategy>,
    pub(crate) retry_on_eof: bool,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) hooks: Vec<Arc<dyn AfterExecute>>,
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The URI with credentials, query and fragment removed.
    pub fn redacted_uri(&self) -> &str {
        &self.redacted_uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &dyn BackoffStrategy {
        self.backoff.as_ref()
    }

    pub fn retry_on_eof(&self) -> bool {
        self.retry_on_eof
    }

    /// Whether the payload can be sent again on a retry.
    pub fn is_replayable(&self) -> bool {
        self.payload.is_replayable()
    }

    /// Child of `parent` bounded by this request's deadline and timeout, whichever ends first.
    pub(crate) fn scoped_context(&self, parent: &Context) -> Context {
        let timeout_deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let deadline = match (self.deadline, timeout_deadline) {
            (Some(deadline), Some(timeout)) => Some(deadline.min(timeout)),
            (deadline, timeout) => deadline.or(timeout),
        };
        match deadline {
            Some(deadline) => parent.with_deadline(deadline),
            None => parent.child(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.redacted_uri)
            .field("payload", &self.payload.kind())
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_on_eof", &self.retry_on_eof)
            .field("deadline", &self.deadline)
            .field("timeout", &self.timeout)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Builds a [`Request`] against a [`Client`], starting from the client's defaults.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    payload: Payload,
    max_attempts: Option<usize>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    retry_on_eof: Option<bool>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    hooks: Vec<Arc<dyn AfterExecute>>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            payload: Payload::Empty,
            max_attempts: None,
            backoff: None,
            retry_on_eof: None,
            deadline: None,
            timeout: None,
            hooks: Vec::new(),
        }
    }

    /// Appends a value; client defaults with the same name are dropped.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    fn set_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn accept_json(self) -> Self {
        self.set_header(ACCEPT, HeaderValue::from_static("application/json"))
    }

    /// Adds a cookie. All cookies are sent in a single `Cookie` header.
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn basic_auth(self, username: &str, password: Option<&str>) -> crate::Result<Self> {
        let credentials = format!("{username}:{}", password.unwrap_or_default());
        let encoded = format!("Basic {}", STANDARD.encode(credentials));
        let mut value = parse_header_value(AUTHORIZATION.as_str(), &encoded)?;
        value.set_sensitive(true);
        Ok(self.set_header(AUTHORIZATION, value))
    }

    pub fn bearer_auth(self, token: &str) -> crate::Result<Self> {
        let mut value = parse_header_value(AUTHORIZATION.as_str(), &format!("Bearer {token}"))?;
        value.set_sensitive(true);
        Ok(self.set_header(AUTHORIZATION, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(params).map_err(|source| Error::SerializeQuery { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.payload = Payload::Buffered(body.into());
        self
    }

    /// Streams the body from `stream`. Streamed bodies are sent at most once, so the request
    /// gets a single attempt.
    pub fn body_stream<S, E>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.payload = Payload::Streaming(Some(stream_body(stream)));
        self
    }

    pub fn body_reader<R>(self, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        self.body_stream(ReaderStream::new(reader))
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Encode {
            format: DecodeFormat::Json.as_str(),
            source: source.into(),
        })?;
        Ok(self.encoded_body(DecodeFormat::Json, body))
    }

    pub fn xml<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize,
    {
        let body = quick_xml::se::to_string(payload).map_err(|source| Error::Encode {
            format: DecodeFormat::Xml.as_str(),
            source: source.into(),
        })?;
        Ok(self.encoded_body(DecodeFormat::Xml, body))
    }

    pub fn postcard<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = postcard::to_stdvec(payload).map_err(|source| Error::Encode {
            format: DecodeFormat::Postcard.as_str(),
            source: source.into(),
        })?;
        Ok(self.encoded_body(DecodeFormat::Postcard, body))
    }

    fn encoded_body(self, format: DecodeFormat, body: impl Into<Bytes>) -> Self {
        self.body(body)
            .set_header(CONTENT_TYPE, HeaderValue::from_static(format.media_type()))
    }

    pub fn form<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(payload).map_err(|source| Error::SerializeForm { source })?;
        Ok(self.body(encoded).set_header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    /// Sends `multipart` as the body. Like other streamed bodies it gets a single attempt.
    pub fn multipart(mut self, multipart: Multipart) -> crate::Result<Self> {
        let content_type = multipart.content_type()?;
        self.payload = Payload::Multipart(Some(multipart));
        Ok(self.set_header(CONTENT_TYPE, content_type))
    }

    /// Total physical attempts, including the first. Values below one are raised to one.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn no_backoff(self, delay: Duration) -> Self {
        self.backoff(Arc::new(NoBackoff::new(delay)))
    }

    pub fn linear_backoff(self, interval: Duration, min: Duration, max: Duration) -> Self {
        self.backoff(Arc::new(LinearBackoff::new(interval, min, max)))
    }

    pub fn linear_jitter_backoff(self, interval: Duration, min: Duration, max: Duration) -> Self {
        self.backoff(Arc::new(LinearBackoff::new(interval, min, max).jitter(true)))
    }

    pub fn exponential_backoff(self, min: Duration, max: Duration) -> Self {
        self.backoff(Arc::new(ExponentialBackoff::new(min, max)))
    }

    pub fn exponential_jitter_backoff(self, min: Duration, max: Duration) -> Self {
        self.backoff(Arc::new(ExponentialBackoff::new(min, max).jitter(true)))
    }

    /// Also retry when the connection ends before a complete response arrives.
    pub fn retry_on_eof(mut self, retry_on_eof: bool) -> Self {
        self.retry_on_eof = Some(retry_on_eof);
        self
    }

    /// Bounds the whole attempt sequence, backoff waits included.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Bounds the whole attempt sequence, measured from the start of execution.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn after_execute<F>(self, hook: F) -> Self
    where
        F: Fn(&Request, &Response) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.after_execute_hook(Arc::new(hook))
    }

    pub fn after_execute_hook(mut self, hook: Arc<dyn AfterExecute>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> crate::Result<Request> {
        let client = self.client;
        let path = append_query_pairs(&self.path, &self.query_pairs);
        let (uri_text, uri) = resolve_uri(client.base_url(), &path)?;

        let mut headers = merge_headers(client.default_headers(), &self.headers);
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.insert(COOKIE, parse_header_value(COOKIE.as_str(), &cookie)?);
        }

        Ok(Request {
            method: self.method,
            uri,
            redacted_uri: redact_uri_for_logs(&uri_text),
            headers,
            payload: self.payload,
            max_attempts: self.max_attempts.unwrap_or(client.default_max_attempts()),
            backoff: self
                .backoff
                .unwrap_or_else(|| Arc::clone(client.default_backoff())),
            retry_on_eof: self.retry_on_eof.unwrap_or(client.default_retry_on_eof()),
            deadline: self.deadline,
            timeout: self.timeout.or(client.default_timeout()),
            hooks: self.hooks,
        })
    }

    pub async fn send(self, cx: &Context) -> crate::Result<Response> {
        let client = self.client;
        let request = self.build()?;
        client.execute(cx, request).await
    }
}

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode, Version};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::body::ResponseBody;
use crate::context::Context;
use crate::decode::{DecodeOptions, decode_error};
use crate::error::{BoxError, Error};
use crate::pool::BufferPool;

/// Borrowed view of a response body, see [`Response::body`].
pub enum Body<'a> {
    /// Copy kept by [`Response::bytes`] or a decode with `retain_body`.
    Copied(&'a [u8]),
    /// The unread body as it arrives from the transport.
    Stream(&'a mut ResponseBody),
}

/// An HTTP response together with the resources backing its body.
///
/// The raw body can be consumed once. A pooled copy may be kept alongside it; closing or
/// dropping the response releases both.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    copy: Option<BytesMut>,
    pool: Arc<BufferPool>,
    method: Method,
    uri: String,
    attempts: usize,
}

impl Response {
    pub(crate) fn new(
        response: http::Response<ResponseBody>,
        pool: Arc<BufferPool>,
        method: Method,
        uri: String,
        attempts: usize,
    ) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body: Some(body),
            copy: None,
            pool,
            method,
            uri,
            attempts,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Physical attempts made to obtain this response.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI with credentials, query and fragment removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_consumed(&self) -> bool {
        self.body.is_none()
    }

    /// The retained copy if there is one, otherwise the unread raw body.
    pub fn body(&mut self) -> crate::Result<Body<'_>> {
        if let Some(copy) = &self.copy {
            return Ok(Body::Copied(copy));
        }
        match &mut self.body {
            Some(body) => Ok(Body::Stream(body)),
            None => Err(Error::BodyConsumed),
        }
    }

    /// Reads the whole body and keeps a pooled copy for later [`Response::body`] calls.
    ///
    /// Once the raw body is gone this returns the retained copy.
    pub async fn bytes(&mut self, cx: &Context) -> crate::Result<Bytes> {
        if self.body.is_none() {
            return match &self.copy {
                Some(copy) => Ok(Bytes::copy_from_slice(copy)),
                None => Err(Error::BodyConsumed),
            };
        }

        let mut buffer = self.pool.acquire();
        if let Err(error) = self.read_body(cx, &mut buffer).await {
            self.pool.release(buffer);
            return Err(error);
        }
        let bytes = Bytes::copy_from_slice(&buffer);
        self.keep_copy(buffer);
        Ok(bytes)
    }

    pub async fn text_lossy(&mut self, cx: &Context) -> crate::Result<String> {
        let bytes = self.bytes(cx).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decodes the body with the explicit format from `options`, or with the format named by
    /// the `Content-Type` header.
    ///
    /// The raw body is read exactly once. When no format can be determined the call fails
    /// with [`Error::UndeterminedDecoder`] and leaves the body unread.
    pub async fn decode<T>(&mut self, cx: &Context, options: DecodeOptions) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        if self.body.is_none() {
            return Err(Error::BodyConsumed);
        }
        let format = match options.explicit_format() {
            Some(format) => format,
            None => {
                let content_type = self.content_type().unwrap_or_default();
                crate::decode::DecodeFormat::from_content_type(content_type).ok_or_else(|| {
                    Error::UndeterminedDecoder {
                        content_type: content_type.to_owned(),
                    }
                })?
            }
        };

        let scratch = self.read_scratch(cx).await?;
        let decoded = format.decode(&scratch);
        self.finish_scratch(scratch, options.retains_body());
        decoded
    }

    /// Decodes the body with a caller-supplied function, ignoring `Content-Type` and any
    /// format set in `options`.
    pub async fn decode_with<T, F>(
        &mut self,
        cx: &Context,
        options: DecodeOptions,
        decode: F,
    ) -> crate::Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T, BoxError>,
    {
        if self.body.is_none() {
            return Err(Error::BodyConsumed);
        }

        let scratch = self.read_scratch(cx).await?;
        let decoded = decode(&scratch).map_err(|source| decode_error("custom", source, &scratch));
        self.finish_scratch(scratch, options.retains_body());
        decoded
    }

    /// Releases the raw body and returns the copy buffer to the pool.
    ///
    /// Safe to call any number of times, also after the body was consumed.
    pub fn close(&mut self) {
        drop(self.body.take());
        if let Some(copy) = self.copy.take() {
            self.pool.release(copy);
        }
    }

    async fn read_scratch(&mut self, cx: &Context) -> crate::Result<BytesMut> {
        let mut scratch = self.pool.acquire();
        match self.read_body(cx, &mut scratch).await {
            Ok(()) => Ok(scratch),
            Err(error) => {
                self.pool.release(scratch);
                Err(error)
            }
        }
    }

    fn finish_scratch(&mut self, scratch: BytesMut, retain: bool) {
        if retain {
            self.keep_copy(scratch);
        } else {
            self.pool.release(scratch);
        }
    }

    fn keep_copy(&mut self, buffer: BytesMut) {
        if let Some(previous) = self.copy.replace(buffer) {
            self.pool.release(previous);
        }
    }

    /// Drains the raw body into `buffer`. The raw body is gone afterwards, whatever the outcome.
    async fn read_body(&mut self, cx: &Context, buffer: &mut BytesMut) -> crate::Result<()> {
        let Some(mut body) = self.body.take() else {
            return Err(Error::BodyConsumed);
        };

        loop {
            let frame = tokio::select! {
                biased;
                reason = cx.done() => {
                    return Err(Error::from_cancellation(reason, &self.method, &self.uri));
                }
                frame = body.frame() => frame,
            };
            match frame {
                None => return Ok(()),
                Some(Err(source)) => return Err(Error::ReadBody { source }),
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        buffer.extend_from_slice(data);
                    }
                }
            }
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("attempts", &self.attempts)
            .field("consumed", &self.body.is_none())
            .field("copied", &self.copy.as_ref().map(BytesMut::len))
            .finish()
    }
}

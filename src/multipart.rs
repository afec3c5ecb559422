use std::fmt;
use std::path::Path;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use http::HeaderValue;
use rand::RngExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use crate::body::{RequestBody, stream_body};
use crate::error::{BoxError, Error};

const CHANNEL_CAPACITY: usize = 8;
const READ_CHUNK_SIZE: usize = 16 * 1024;
const BOUNDARY_BYTES: usize = 30;

type PartReader = Pin<Box<dyn AsyncRead + Send>>;

enum PartSource {
    Text(String),
    Reader { filename: String, reader: PartReader },
}

struct Part {
    name: String,
    source: PartSource,
}

/// A `multipart/form-data` payload.
///
/// The encoded body is produced by a background task while the request is in flight,
/// so file and reader parts are never buffered whole. The payload can be sent once.
pub struct Multipart {
    boundary: String,
    parts: Vec<Part>,
}

impl Multipart {
    pub fn new() -> Self {
        Self {
            boundary: random_boundary(),
            parts: Vec::new(),
        }
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part {
            name: name.into(),
            source: PartSource::Text(value.into()),
        });
        self
    }

    pub fn reader<R>(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        reader: R,
    ) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        self.parts.push(Part {
            name: name.into(),
            source: PartSource::Reader {
                filename: filename.into(),
                reader: Box::pin(reader),
            },
        });
        self
    }

    /// Adds a file part. The file is opened now so a missing file fails here rather than
    /// mid-request.
    pub fn file(self, name: impl Into<String>, path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| Error::PayloadFile {
            path: path.display().to_string(),
            source,
        })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.reader(name, filename, tokio::fs::File::from_std(file)))
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub(crate) fn content_type(&self) -> Result<HeaderValue, Error> {
        let value = format!("multipart/form-data; boundary={}", self.boundary);
        crate::util::parse_header_value(http::header::CONTENT_TYPE.as_str(), &value)
    }

    /// Starts the encoder task and returns the streaming body it feeds.
    ///
    /// An encoding failure is written to the returned receiver before the body stream ends.
    pub(crate) fn spawn_encoder(self) -> (RequestBody, oneshot::Receiver<BoxError>) {
        let (sender, receiver) = mpsc::channel::<std::io::Result<Bytes>>(CHANNEL_CAPACITY);
        let (failure_sender, failure_receiver) = oneshot::channel();

        tokio::spawn(async move {
            match self.encode(&sender).await {
                Ok(()) | Err(EncodeError::ReceiverGone) => {}
                Err(EncodeError::Source(source)) => {
                    tracing::warn!(error = %source, "multipart payload encoding failed");
                    let _ = failure_sender.send(source);
                    let _ = sender
                        .send(Err(std::io::Error::other("multipart payload encoding failed")))
                        .await;
                }
            }
        });

        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        (stream_body(stream), failure_receiver)
    }

    async fn encode(self, sender: &mpsc::Sender<std::io::Result<Bytes>>) -> Result<(), EncodeError> {
        let boundary = self.boundary;
        for part in self.parts {
            match part.source {
                PartSource::Text(value) => {
                    let header = format!(
                        "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        escape_quotes(&part.name)
                    );
                    send_chunk(sender, Bytes::from(header)).await?;
                    send_chunk(sender, Bytes::from(value)).await?;
                }
                PartSource::Reader {
                    filename,
                    mut reader,
                } => {
                    let header = format!(
                        "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        escape_quotes(&part.name),
                        escape_quotes(&filename)
                    );
                    send_chunk(sender, Bytes::from(header)).await?;
                    loop {
                        let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
                        let read = reader
                            .read_buf(&mut chunk)
                            .await
                            .map_err(|source| EncodeError::Source(Box::new(source)))?;
                        if read == 0 {
                            break;
                        }
                        send_chunk(sender, chunk.freeze()).await?;
                    }
                }
            }
            send_chunk(sender, Bytes::from_static(b"\r\n")).await?;
        }
        send_chunk(sender, Bytes::from(format!("--{boundary}--\r\n"))).await
    }
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Multipart {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Multipart")
            .field("boundary", &self.boundary)
            .field("parts", &self.parts.len())
            .finish()
    }
}

enum EncodeError {
    ReceiverGone,
    Source(BoxError),
}

async fn send_chunk(
    sender: &mpsc::Sender<std::io::Result<Bytes>>,
    chunk: Bytes,
) -> Result<(), EncodeError> {
    sender
        .send(Ok(chunk))
        .await
        .map_err(|_| EncodeError::ReceiverGone)
}

fn random_boundary() -> String {
    let mut rng = rand::rng();
    let mut boundary = String::with_capacity(BOUNDARY_BYTES * 2);
    for _ in 0..BOUNDARY_BYTES {
        let byte: u8 = rng.random_range(0..=u8::MAX);
        boundary.push_str(&format!("{byte:02x}"));
    }
    boundary
}

fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

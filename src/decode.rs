use serde::de::DeserializeOwned;

use crate::error::{BoxError, Error};
use crate::util::truncate_body;

pub const APPLICATION_POSTCARD: &str = "application/postcard";

/// Structured body formats the response decoder understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecodeFormat {
    Json,
    /// `postcard`, a compact serde binary format.
    Postcard,
    Xml,
}

impl DecodeFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Postcard => "postcard",
            Self::Xml => "xml",
        }
    }

    pub const fn media_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Postcard => APPLICATION_POSTCARD,
            Self::Xml => "application/xml",
        }
    }

    /// Picks a format from a `Content-Type` value, ignoring parameters such as `charset`.
    ///
    /// Recognises `application/json` and `+json` types, `application/postcard`,
    /// `application/xml`, `text/xml` and `+xml` types. Anything else yields `None`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let parsed = content_type.trim().parse::<mime::Mime>().ok()?;
        let subtype = parsed.subtype();
        let suffix = parsed.suffix();

        if subtype == mime::JSON || suffix == Some(mime::JSON) {
            return (parsed.type_() == mime::APPLICATION).then_some(Self::Json);
        }
        if subtype == mime::XML || suffix == Some(mime::XML) {
            let text_or_application =
                parsed.type_() == mime::APPLICATION || parsed.type_() == mime::TEXT;
            return text_or_application.then_some(Self::Xml);
        }
        if parsed.type_() == mime::APPLICATION && subtype.as_str() == "postcard" {
            return Some(Self::Postcard);
        }
        None
    }

    pub(crate) fn decode<T>(self, bytes: &[u8]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let decoded: Result<T, BoxError> = match self {
            Self::Json => serde_json::from_slice(bytes).map_err(Into::into),
            Self::Postcard => postcard::from_bytes(bytes).map_err(Into::into),
            Self::Xml => quick_xml::de::from_reader(bytes).map_err(Into::into),
        };
        decoded.map_err(|source| decode_error(self.as_str(), source, bytes))
    }
}

pub(crate) fn decode_error(format: &'static str, source: BoxError, bytes: &[u8]) -> Error {
    Error::Decode {
        format,
        source,
        body: truncate_body(bytes),
    }
}

/// How [`Response::decode`](crate::Response::decode) reads the body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    format: Option<DecodeFormat>,
    retain_body: bool,
}

impl DecodeOptions {
    pub const fn new() -> Self {
        Self {
            format: None,
            retain_body: false,
        }
    }

    pub const fn json() -> Self {
        Self::new().format(DecodeFormat::Json)
    }

    pub const fn xml() -> Self {
        Self::new().format(DecodeFormat::Xml)
    }

    pub const fn postcard() -> Self {
        Self::new().format(DecodeFormat::Postcard)
    }

    /// Decode with `format` regardless of the response `Content-Type`.
    pub const fn format(mut self, format: DecodeFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Keep a pooled copy of the body so it stays readable through `Response::body` after
    /// decoding.
    pub const fn retain_body(mut self, retain_body: bool) -> Self {
        self.retain_body = retain_body;
        self
    }

    pub const fn explicit_format(&self) -> Option<DecodeFormat> {
        self.format
    }

    pub const fn retains_body(&self) -> bool {
        self.retain_body
    }
}

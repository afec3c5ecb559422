use std::error::Error as StdError;
use std::io;
use std::sync::Mutex;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};

use crate::error::{Error, TransportErrorKind};

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for name in request_headers.keys() {
        merged.remove(name);
    }
    for (name, value) in request_headers {
        merged.append(name.clone(), value.clone());
    }
    merged
}

/// Strips userinfo, query and fragment so URIs can be logged and stored in errors.
pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        let without_fragment = uri_text.split('#').next().unwrap_or(uri_text);
        return without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment)
            .to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn resolve_uri(base_url: &str, path: &str) -> Result<(String, Uri), Error> {
    let uri_text = if is_absolute_http_uri(path) {
        path.to_owned()
    } else {
        join_base_path(base_url, path)
    };
    let uri = uri_text.parse().map_err(|_| Error::InvalidUri {
        uri: redact_uri_for_logs(&uri_text),
    })?;
    Ok((uri_text, uri))
}

fn is_absolute_http_uri(path: &str) -> bool {
    let Some((scheme, _)) = path.split_once("://") else {
        return false;
    };
    scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

pub(crate) fn append_query_pairs(path: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return path.to_owned();
    }

    if let Ok(mut url) = url::Url::parse(path) {
        let existing = parse_query(url.query());
        let query = build_query_string(&existing, query_pairs);
        url.set_query(Some(&query));
        return url.to_string();
    }

    let (without_fragment, fragment) = match path.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (path, None),
    };
    let (base, existing_query) = match without_fragment.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (without_fragment, None),
    };
    let existing = parse_query(existing_query);
    let query = build_query_string(&existing, query_pairs);

    let mut merged = format!("{base}?{query}");
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn build_query_string(existing: &[(String, String)], appended: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in existing.iter().chain(appended) {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

/// Walks the source chain looking for the underlying I/O or connector failure.
pub(crate) fn classify_transport_error(error: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(item) = current {
        if let Some(io_error) = item.downcast_ref::<io::Error>() {
            match io_error.kind() {
                io::ErrorKind::ConnectionReset => return TransportErrorKind::ConnectionReset,
                io::ErrorKind::BrokenPipe => return TransportErrorKind::BrokenPipe,
                io::ErrorKind::UnexpectedEof => return TransportErrorKind::UnexpectedEof,
                _ => {}
            }
        }
        if let Some(hyper_error) = item.downcast_ref::<hyper::Error>()
            && hyper_error.is_incomplete_message()
        {
            return TransportErrorKind::UnexpectedEof;
        }
        if let Some(legacy_error) = item.downcast_ref::<hyper_util::client::legacy::Error>()
            && legacy_error.is_connect()
        {
            return classify_connect_error(&error_chain_text(legacy_error));
        }
        current = item.source();
    }

    classify_by_text(&error_chain_text(error))
}

fn classify_connect_error(text: &str) -> TransportErrorKind {
    if text.contains("dns")
        || text.contains("name or service not known")
        || text.contains("failed to lookup address")
    {
        return TransportErrorKind::Dns;
    }
    if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Connect
}

fn classify_by_text(text: &str) -> TransportErrorKind {
    if text.contains("connection reset") {
        return TransportErrorKind::ConnectionReset;
    }
    if text.contains("broken pipe") {
        return TransportErrorKind::BrokenPipe;
    }
    if text.contains("unexpected eof") || text.contains("incomplete message") {
        return TransportErrorKind::UnexpectedEof;
    }
    TransportErrorKind::Other
}

fn error_chain_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut current = error.source();
    while let Some(item) = current {
        text.push_str(": ");
        text.push_str(&item.to_string());
        current = item.source();
    }
    text.to_ascii_lowercase()
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

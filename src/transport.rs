use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

#[cfg(feature = "tls-rustls-ring")]
use hyper_rustls::HttpsConnectorBuilder;

use crate::body::{RequestBody, ResponseBody};
use crate::error::{BoxError, Error};

pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<http::Response<ResponseBody>, BoxError>> + Send>>;

/// Performs exactly one physical HTTP exchange.
///
/// Implementations must not retry internally; retry decisions belong to the client.
pub trait Transport: Send + Sync {
    fn call(&self, request: http::Request<RequestBody>) -> TransportFuture;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TransportSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) tcp_keepalive: Duration,
    pub(crate) pool_idle_timeout: Duration,
    pub(crate) pool_max_idle_per_host: usize,
    pub(crate) http2_only: bool,
}

#[cfg(feature = "tls-rustls-ring")]
type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
#[cfg(not(feature = "tls-rustls-ring"))]
type Connector = HttpConnector;

/// [`Transport`] backed by the pooled `hyper-util` client.
///
/// Speaks HTTP/1.1 and HTTP/2. HTTPS requires the `tls-rustls-ring` feature.
#[derive(Clone, Debug)]
pub struct HyperTransport {
    client: Client<Connector, RequestBody>,
}

impl HyperTransport {
    pub(crate) fn new(settings: TransportSettings) -> Result<Self, Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(settings.connect_timeout));
        http.set_keepalive(Some(settings.tcp_keepalive));
        http.set_nodelay(true);

        let connector = wrap_connector(http)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .http2_only(settings.http2_only)
            .build(connector);
        Ok(Self { client })
    }
}

#[cfg(feature = "tls-rustls-ring")]
fn wrap_connector(http: HttpConnector) -> Result<Connector, Error> {
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::TlsBackendInit {
            message: source.to_string(),
        })?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);
    Ok(https)
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn wrap_connector(http: HttpConnector) -> Result<Connector, Error> {
    Ok(http)
}

impl Transport for HyperTransport {
    fn call(&self, request: http::Request<RequestBody>) -> TransportFuture {
        let response = self.client.request(request);
        Box::pin(async move {
            match response.await {
                Ok(response) => Ok(response.map(|body| {
                    body.map_err(|error| Box::new(error) as BoxError)
                        .boxed_unsync()
                })),
                Err(error) => Err(Box::new(error) as BoxError),
            }
        })
    }
}

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, StatusCode};
use tokio::time::{Instant, sleep};
use tracing::{Instrument, debug, info_span, warn};

use crate::backoff::{BackoffStrategy, default_backoff};
use crate::body::{AttemptBody, ResponseBody, build_http_request};
use crate::context::Context;
use crate::error::Error;
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::pool::BufferPool;
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::request::{Request, RequestBuilder};
use crate::response::Response;
use crate::transport::{HyperTransport, Transport, TransportSettings};
use crate::util::{classify_transport_error, parse_header_name, parse_header_value};

const DEFAULT_CLIENT_NAME: &str = "refetch";
const DEFAULT_MAX_ATTEMPTS: usize = 1;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(60);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub struct ClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    client_name: String,
    max_attempts: usize,
    backoff: Arc<dyn BackoffStrategy>,
    retry_on_eof: bool,
    timeout: Option<Duration>,
    rate_limit: Option<(u32, Duration)>,
    connect_timeout: Duration,
    tcp_keepalive: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    http2_only: bool,
    buffer_pool: Option<Arc<BufferPool>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            base_url: String::new(),
            default_headers: HeaderMap::new(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: default_backoff(),
            retry_on_eof: false,
            timeout: None,
            rate_limit: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tcp_keepalive: DEFAULT_TCP_KEEPALIVE,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            http2_only: false,
            buffer_pool: None,
            transport: None,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_on_eof(mut self, retry_on_eof: bool) -> Self {
        self.retry_on_eof = retry_on_eof;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn rate_limit(mut self, rate: u32, duration: Duration) -> Self {
        self.rate_limit = Some((rate, duration));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn tcp_keepalive(mut self, tcp_keepalive: Duration) -> Self {
        self.tcp_keepalive = tcp_keepalive;
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn http2_only(mut self, http2_only: bool) -> Self {
        self.http2_only = http2_only;
        self
    }

    pub fn buffer_pool(mut self, buffer_pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(buffer_pool);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(TransportSettings {
                connect_timeout: self.connect_timeout,
                tcp_keepalive: self.tcp_keepalive,
                pool_idle_timeout: self.pool_idle_timeout,
                pool_max_idle_per_host: self.pool_max_idle_per_host,
                http2_only: self.http2_only,
            })?),
        };

        let mut default_headers = self.default_headers;
        if !default_headers.contains_key(USER_AGENT) {
            let user_agent = parse_header_value(USER_AGENT.as_str(), &self.client_name)?;
            default_headers.insert(USER_AGENT, user_agent);
        }

        Ok(Client {
            base_url: self.base_url,
            default_headers,
            client_name: self.client_name,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            retry_on_eof: self.retry_on_eof,
            timeout: self.timeout,
            rate_limiter: self
                .rate_limit
                .map(|(rate, duration)| Arc::new(RateLimiter::new(rate, duration))),
            buffer_pool: self.buffer_pool.unwrap_or_default(),
            transport,
            metrics: ClientMetrics::default(),
        })
    }
}

#[derive(Clone)]
pub struct Client {
    base_url: String,
    default_headers: HeaderMap,
    client_name: String,
    max_attempts: usize,
    backoff: Arc<dyn BackoffStrategy>,
    retry_on_eof: bool,
    timeout: Option<Duration>,
    rate_limiter: Option<Arc<RateLimiter>>,
    buffer_pool: Arc<BufferPool>,
    transport: Arc<dyn Transport>,
    metrics: ClientMetrics,
}

enum Attempt {
    Success(http::Response<ResponseBody>),
    ServerError(http::Response<ResponseBody>),
    Retryable(Error),
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn head(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_deref()
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub(crate) fn default_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub(crate) fn default_backoff(&self) -> &Arc<dyn BackoffStrategy> {
        &self.backoff
    }

    pub(crate) fn default_retry_on_eof(&self) -> bool {
        self.retry_on_eof
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Runs `request` with retries; a final 5xx is returned as a response, not an error.
    pub async fn execute(&self, cx: &Context, mut request: Request) -> crate::Result<Response> {
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();
        let started = Instant::now();

        let result = match self.execute_with_retry(cx, &mut request).await {
            Ok(response) => run_after_execute_hooks(&request, response),
            Err(error) => Err(error),
        };
        self.metrics
            .record_request_completed(&result, started.elapsed());
        result
    }

    async fn execute_with_retry(
        &self,
        parent: &Context,
        request: &mut Request,
    ) -> crate::Result<Response> {
        if let Some(reason) = parent.err() {
            return Err(Error::from_cancellation(
                reason,
                &request.method,
                &request.redacted_uri,
            ));
        }
        let cx = request.scoped_context(parent);

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.limit(&cx).await.map_err(|error| match error {
                RateLimitError::Interrupted(reason) => {
                    Error::from_cancellation(reason, &request.method, &request.redacted_uri)
                }
                RateLimitError::Closed => Error::RateLimiterClosed,
            })?;
        }

        let max_attempts = if request.payload.is_replayable() {
            request.max_attempts
        } else {
            if request.max_attempts > 1 {
                debug!(
                    payload = request.payload.kind(),
                    "payload cannot be replayed, limiting request to one attempt"
                );
            }
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let span = info_span!(
                "refetch.request",
                client = %self.client_name,
                method = %request.method,
                uri = %request.redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            match self
                .run_attempt(&cx, request, attempt, max_attempts)
                .instrument(span)
                .await
            {
                ControlFlow::Break(result) => return result,
                ControlFlow::Continue(()) => self.metrics.record_retry(),
            }
        }
    }

    async fn run_attempt(
        &self,
        cx: &Context,
        request: &mut Request,
        attempt: usize,
        max_attempts: usize,
    ) -> ControlFlow<crate::Result<Response>> {
        self.metrics.record_attempt();
        debug!("sending request");

        let outcome = match self.send_once(cx, request, attempt).await {
            Ok(outcome) => outcome,
            Err(error) => return ControlFlow::Break(Err(error)),
        };

        match outcome {
            Attempt::Success(response) => {
                return ControlFlow::Break(Ok(self.wrap_response(response, request, attempt)));
            }
            Attempt::ServerError(response) if attempt >= max_attempts => {
                debug!(status = response.status().as_u16(), "attempts exhausted");
                return ControlFlow::Break(Ok(self.wrap_response(response, request, attempt)));
            }
            Attempt::Retryable(error) if attempt >= max_attempts => {
                debug!(error = %error, "attempts exhausted");
                return ControlFlow::Break(Err(error));
            }
            Attempt::ServerError(response) => {
                debug!(status = response.status().as_u16(), "server error, will retry");
                drop(response);
            }
            Attempt::Retryable(error) => {
                debug!(error = %error, "transport error, will retry");
            }
        }

        let delay = request.backoff.wait_duration(attempt);
        debug!(delay_ms = delay.as_millis() as u64, "waiting before retry");
        tokio::select! {
            biased;
            reason = cx.done() => {
                debug!(?reason, "context finished during backoff");
                ControlFlow::Break(Err(Error::from_cancellation(
                    reason,
                    &request.method,
                    &request.redacted_uri,
                )))
            }
            () = sleep(delay) => ControlFlow::Continue(()),
        }
    }

    async fn send_once(
        &self,
        cx: &Context,
        request: &mut Request,
        attempt: usize,
    ) -> crate::Result<Attempt> {
        let AttemptBody { body, failure } = request.payload.attempt_body();
        let http_request = build_http_request(
            request.method.clone(),
            request.uri.clone(),
            &request.headers,
            body,
        )?;

        let result = tokio::select! {
            biased;
            reason = cx.done() => {
                return Err(Error::from_cancellation(
                    reason,
                    &request.method,
                    &request.redacted_uri,
                ));
            }
            result = self.transport.call(http_request) => result,
        };

        if attempt == 1
            && let Some(mut failure) = failure
            && let Ok(source) = failure.try_recv()
        {
            warn!(error = %source, "request payload failed");
            return Err(Error::Payload {
                method: request.method.clone(),
                uri: request.redacted_uri.clone(),
                source,
            });
        }

        match result {
            Ok(response) if response.status() < StatusCode::INTERNAL_SERVER_ERROR => {
                Ok(Attempt::Success(response))
            }
            Ok(response) => Ok(Attempt::ServerError(response)),
            Err(source) => {
                let kind = classify_transport_error(source.as_ref());
                let error = Error::Transport {
                    kind,
                    method: request.method.clone(),
                    uri: request.redacted_uri.clone(),
                    source,
                };
                if kind.is_retryable(request.retry_on_eof) {
                    Ok(Attempt::Retryable(error))
                } else {
                    warn!(error = %error, "request failed with non-retryable transport error");
                    Err(error)
                }
            }
        }
    }

    fn wrap_response(
        &self,
        response: http::Response<ResponseBody>,
        request: &Request,
        attempts: usize,
    ) -> Response {
        Response::new(
            response,
            Arc::clone(&self.buffer_pool),
            request.method.clone(),
            request.redacted_uri.clone(),
            attempts,
        )
    }
}

fn run_after_execute_hooks(request: &Request, response: Response) -> crate::Result<Response> {
    for (index, hook) in request.hooks.iter().enumerate() {
        if let Err(source) = hook.after_execute(request, &response) {
            warn!(index, error = %source, "after-execute hook failed");
            return Err(Error::AfterExecute { index, source });
        }
    }
    Ok(response)
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("client_name", &self.client_name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retry_on_eof", &self.retry_on_eof)
            .field("timeout", &self.timeout)
            .field("rate_limiter", &self.rate_limiter)
            .finish()
    }
}

use std::time::Duration;

use bytes::Bytes;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use url::Url;

use crate::header::HeaderValue;
use crate::{
    Body, Error, Method, OptionsContext, Request, RequestOption, Response, Result, StatusCode,
    StatusError, with_body, with_method,
};

/// Connection and timeout settings for a [`Client`].
///
/// The default configuration has no timeouts and hyper's stock pool limits.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Overall deadline applied to every call, covering the network exchange
    /// and the response body drain. Overridden per call by
    /// [`with_timeout`](crate::with_timeout). `None` means no deadline.
    pub timeout: Option<Duration>,
    /// Limit on establishing each TCP connection. Applied to the stock
    /// connector only; see [`Client::with_connector`].
    pub connect_timeout: Option<Duration>,
    /// How long an idle pooled connection is kept around.
    pub pool_idle_timeout: Option<Duration>,
    /// Maximum number of idle pooled connections per host.
    pub pool_max_idle_per_host: Option<usize>,
}

/// An asynchronous `Client` holding a connection pool and a baseline option
/// set.
///
/// Construction is the only place connection pooling, timeouts and baseline
/// options can be configured; a built client is immutable. `Client` uses
/// `Arc` internally, so cloning is cheap and clones share the pool.
///
/// The connector decides how connections are opened. Plain construction
/// uses hyper's TCP connector; [`Client::with_connector`] swaps in any
/// other hyper connector.
///
/// Baseline options run before call-site options on every call made through
/// this client, so call sites can override what the baseline set.
#[derive(Debug, Clone)]
pub struct Client<C = HttpConnector> {
    inner: HyperClient<C, Body>,
    timeout: Option<Duration>,
    baseline: Vec<RequestOption>,
}

impl Client {
    /// Creates a client with default settings and no baseline options.
    pub fn new() -> Self {
        Self::with_config(Config::default(), Vec::new())
    }

    /// Creates a client from explicit settings and a baseline option set.
    pub fn with_config(config: Config, baseline: Vec<RequestOption>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(config.connect_timeout);
        Self::with_connector(connector, config, baseline)
    }
}

impl<C> Client<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    /// Creates a client that opens connections through `connector`.
    ///
    /// The connector owns the dial layer, so `config.connect_timeout` has
    /// no effect here; the pool settings and the overall timeout still
    /// apply.
    pub fn with_connector(connector: C, config: Config, baseline: Vec<RequestOption>) -> Client<C> {
        let mut builder = HyperClient::builder(TokioExecutor::new());
        builder.pool_timer(TokioTimer::new());
        if let Some(idle) = config.pool_idle_timeout {
            builder.pool_idle_timeout(idle);
        }
        if let Some(max) = config.pool_max_idle_per_host {
            builder.pool_max_idle_per_host(max);
        }

        Client {
            inner: builder.build(connector),
            timeout: config.timeout,
            baseline,
        }
    }

    fn assemble(&self, url: &str, options: &[RequestOption]) -> Result<(Request, bool)> {
        let url: Url = url.parse()?;
        let request = Request::new(Method::GET, url);

        let mut cx = OptionsContext::new(request);
        for opt in self.baseline.iter().chain(options) {
            opt.apply(&mut cx)?;
        }

        Ok(cx.into_request())
    }

    /// Runs the option pipeline against `url` and dispatches the resulting
    /// request, handing back the streaming [`Response`].
    ///
    /// The request starts as a `GET` with no body; options change anything
    /// about it. The response body has not been read when this returns.
    ///
    /// # Errors
    ///
    /// This method fails if the URL cannot be parsed, if an option fails, or
    /// if there was an error while sending the request.
    pub async fn do_request(&self, url: &str, options: &[RequestOption]) -> Result<Response> {
        let (request, _) = self.assemble(url, options)?;
        self.execute(request).await
    }

    /// Runs the option pipeline against `url`, dispatches the request and
    /// buffers the whole response body.
    ///
    /// With [`with_check_status`](crate::with_check_status) applied, any
    /// status other than 200 turns into a [`StatusError`] carrying the
    /// drained body and the code.
    ///
    /// # Errors
    ///
    /// This method fails if the URL cannot be parsed, if an option fails, if
    /// there was an error while sending the request, or if the body cannot
    /// be drained.
    pub async fn do_bytes(&self, url: &str, options: &[RequestOption]) -> Result<(Bytes, StatusCode)> {
        let (request, check_status) = self.assemble(url, options)?;
        let response = self.execute(request).await?;
        let status = response.status();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                return Err(Error::ReadError {
                    code: status,
                    source: Box::new(err),
                });
            }
        };

        if check_status && status != StatusCode::OK {
            tracing::warn!(code = status.as_u16(), "unexpected status code");
            return Err(StatusError::new(status, body).into());
        }

        Ok((body, status))
    }

    /// Makes a GET request to `url`, handing back the streaming [`Response`].
    ///
    /// # Errors
    ///
    /// See [`Client::do_request`].
    pub async fn get(&self, url: &str, options: &[RequestOption]) -> Result<Response> {
        self.do_request(url, options).await
    }

    /// Makes a GET request to `url` and buffers the whole response body.
    ///
    /// # Errors
    ///
    /// See [`Client::do_bytes`].
    pub async fn get_bytes(&self, url: &str, options: &[RequestOption]) -> Result<(Bytes, StatusCode)> {
        self.do_bytes(url, options).await
    }

    /// Makes a POST request carrying `body` under `content_type`, handing
    /// back the streaming [`Response`].
    ///
    /// Shorthand for prepending [`with_method`] and [`with_body`] to
    /// `options`; later options can still override the method and body.
    ///
    /// # Errors
    ///
    /// See [`Client::do_request`].
    pub async fn post<V, B>(
        &self,
        url: &str,
        content_type: V,
        body: B,
        options: &[RequestOption],
    ) -> Result<Response>
    where
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
        V: Clone + Send + Sync + 'static,
        B: Into<Body>,
    {
        let mut combined = vec![with_method(Method::POST), with_body(content_type, body)];
        combined.extend_from_slice(options);
        self.do_request(url, &combined).await
    }

    /// Makes a POST request carrying `body` under `content_type` and buffers
    /// the whole response body.
    ///
    /// # Errors
    ///
    /// See [`Client::do_bytes`].
    pub async fn post_bytes<V, B>(
        &self,
        url: &str,
        content_type: V,
        body: B,
        options: &[RequestOption],
    ) -> Result<(Bytes, StatusCode)>
    where
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
        V: Clone + Send + Sync + 'static,
        B: Into<Body>,
    {
        let mut combined = vec![with_method(Method::POST), with_body(content_type, body)];
        combined.extend_from_slice(options);
        self.do_bytes(url, &combined).await
    }

    /// Executes a [`Request`] as-is, skipping the option pipeline and the
    /// baseline options entirely.
    ///
    /// A `Request` can be built manually with `Request::new()`. The call's
    /// deadline is fixed here, from the request timeout or else the
    /// client-level timeout, and covers both the exchange and any later
    /// body reads on the returned [`Response`].
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending the request or
    /// the deadline expired before the response header arrived.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let (method, url, headers, body, timeout, version, extensions) = request.pieces();
        let deadline = timeout
            .or(self.timeout)
            .map(|timeout| tokio::time::Instant::now() + timeout);
        tracing::debug!(method = %method, url = %url, "dispatching request");

        let body = body.unwrap_or_else(Body::empty);
        let mut builder = http::Request::builder()
            .method(method)
            .uri(url.as_str())
            .version(version);
        if let Some(builder_headers) = builder.headers_mut() {
            builder_headers.extend(headers);
        }
        if let Some(builder_extensions) = builder.extensions_mut() {
            builder_extensions.extend(extensions);
        }
        let req = builder.body(body)?;

        let fut = self.inner.request(req);
        let resp = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::Timeout)??,
            None => fut.await?,
        };
        tracing::debug!(code = resp.status().as_u16(), "response received");

        Ok(Response::new(resp, url, deadline))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

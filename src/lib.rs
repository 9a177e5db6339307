#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(test, deny(warnings))]

//! # optreq
//!
//! Composable request options over a shared pooled HTTP client.
//! Every call starts from a plain `GET` and a URL; a slice of
//! [`RequestOption`] values then reshapes the request, in order, before it is
//! sent. The response surface mimics the [reqwest](https://docs.rs/reqwest/latest/reqwest/)
//! crate. The [`Client`] is asynchronous (requiring Tokio).
//!
//! ## Examples
//!
//! ### Making a GET request
//!
//! For a single request, you can use the [`get_bytes`] shortcut method.
//!
//! ```rust
//! # use optreq::{Error, get_bytes, with_query_value};
//! #
//! # async fn run() -> Result<(), Error> {
//! let (body, code) = get_bytes(
//!     "http://127.0.0.1:3000/items?name=abc",
//!     &[with_query_value("age", "18")],
//! )
//! .await?;
//!
//! println!("{code}: {body:?}");
//! #   Ok(())
//! # }
//! ```
//!
//! **NOTE**: The free functions all go through one lazily created default
//! [`Client`], so they share a keep-alive connection pool. Create your own
//! [`Client`] to control timeouts, pooling, or a baseline option set.
//!
//! ### Forms
//!
//! It's very common to want to send form data in a request body. Form
//! entries are encoded sorted by key, so the body below is deterministic.
//!
//! ```rust
//! # use optreq::{Client, Error, with_form};
//! #
//! # async fn run() -> Result<(), Error> {
//! // This will POST a body of `baz=quux&foo=bar`
//! let client = Client::new();
//! let (body, _) = client
//!     .do_bytes(
//!         "http://127.0.0.1:3000/submit",
//!         &[with_form([("foo", "bar"), ("baz", "quux")])],
//!     )
//!     .await?;
//!
//! println!("echoed: {body:?}");
//! #   Ok(())
//! # }
//! ```
//!
//! ### JSON
//!
//! [`with_json`] works in a similar fashion to [`with_form`]. It can take
//! any value that can be serialized into JSON.
//!
//! ```rust
//! # use optreq::{Client, Error, with_json};
//! # use std::collections::HashMap;
//! #
//! # async fn run() -> Result<(), Error> {
//! // This will POST a body of `{"lang":"rust","body":"json"}`
//! let mut map = HashMap::new();
//! map.insert("lang", "rust");
//! map.insert("body", "json");
//! let client = Client::new();
//! let res = client
//!     .do_request("http://127.0.0.1:3000/submit", &[with_json(map)])
//!     .await?;
//! #   drop(res);
//! #   Ok(())
//! # }
//! ```
//!
//! ### Sharing a configured client
//!
//! Construction is the one place where timeouts, pooling and baseline
//! options are set; the built client is immutable and cheap to clone.
//!
//! ```rust
//! # use optreq::{Client, Config, Error, with_header};
//! # use std::time::Duration;
//! #
//! # async fn run() -> Result<(), Error> {
//! let client = Client::with_config(
//!     Config {
//!         timeout: Some(Duration::from_secs(10)),
//!         ..Config::default()
//!     },
//!     vec![with_header("user-agent", "optreq-demo")],
//! );
//! let res = client.do_request("http://127.0.0.1:3000/health", &[]).await?;
//! #   drop(res);
//! #   Ok(())
//! # }
//! ```

mod body;
mod client;
mod error;
pub mod multipart;
mod options;
mod request;
mod response;

pub use body::Body;
pub use client::{Client, Config};
pub use cookie::Cookie;
pub use error::{BuilderError, Error, Result, StatusError};
pub use http::{Extensions, Method, StatusCode, Version, header};
pub use options::{
    OptionsContext, RequestOption, with_append_header, with_basic_auth, with_bearer_auth,
    with_body, with_body_stream, with_check_status, with_cookie, with_form, with_header,
    with_headers, with_json, with_method, with_multipart, with_multipart_file,
    with_multipart_form, with_query, with_query_value, with_request, with_timeout,
};
pub use request::Request;
pub use response::Response;
pub use url::Url;

use bytes::Bytes;
use http::header::HeaderValue;
use once_cell::sync::Lazy;

static DEFAULT_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// The process-wide default [`Client`] the free functions dispatch through.
///
/// It is created on first use with [`Client::new`] and lives for the rest of
/// the process.
pub fn default_client() -> &'static Client {
    &DEFAULT_CLIENT
}

/// Shortcut method to run the option pipeline against `url` and dispatch the
/// request through the default client.
///
/// See also the methods on the [`Response`] type.
///
/// # Errors
///
/// This function fails if:
///
/// - supplied `url` cannot be parsed
/// - an option fails to apply
/// - there was an error while sending request
pub async fn do_request(url: &str, options: &[RequestOption]) -> crate::Result<Response> {
    DEFAULT_CLIENT.do_request(url, options).await
}

/// Shortcut method to dispatch a request through the default client and
/// buffer the whole response body.
///
/// # Errors
///
/// This function fails if:
///
/// - supplied `url` cannot be parsed
/// - an option fails to apply
/// - there was an error while sending request or draining the body
pub async fn do_bytes(url: &str, options: &[RequestOption]) -> crate::Result<(Bytes, StatusCode)> {
    DEFAULT_CLIENT.do_bytes(url, options).await
}

/// Shortcut method to quickly make a `GET` request through the default
/// client.
///
/// See also the methods on the [`Response`] type.
///
/// # Examples
///
/// ```rust
/// # use optreq::Error;
///
/// # async fn run() -> Result<(), Error> {
/// let body = optreq::get("http://127.0.0.1:3000/", &[]).await?
///     .text().await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// See [`do_request`].
pub async fn get(url: &str, options: &[RequestOption]) -> crate::Result<Response> {
    DEFAULT_CLIENT.get(url, options).await
}

/// Shortcut method to quickly make a `GET` request and buffer the whole
/// response body.
///
/// # Examples
///
/// ```rust
/// # use optreq::Error;
///
/// # async fn run() -> Result<(), Error> {
/// let (body, code) = optreq::get_bytes("http://127.0.0.1:3000/", &[]).await?;
/// # drop((body, code));
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// See [`do_bytes`].
pub async fn get_bytes(url: &str, options: &[RequestOption]) -> crate::Result<(Bytes, StatusCode)> {
    DEFAULT_CLIENT.get_bytes(url, options).await
}

/// Shortcut method to quickly make a `POST` request carrying `body` under
/// `content_type`.
///
/// # Errors
///
/// See [`do_request`].
pub async fn post<V, B>(
    url: &str,
    content_type: V,
    body: B,
    options: &[RequestOption],
) -> crate::Result<Response>
where
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    V: Clone + Send + Sync + 'static,
    B: Into<Body>,
{
    DEFAULT_CLIENT.post(url, content_type, body, options).await
}

/// Shortcut method to quickly make a `POST` request and buffer the whole
/// response body.
///
/// # Errors
///
/// See [`do_bytes`].
pub async fn post_bytes<V, B>(
    url: &str,
    content_type: V,
    body: B,
    options: &[RequestOption],
) -> crate::Result<(Bytes, StatusCode)>
where
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    V: Clone + Send + Sync + 'static,
    B: Into<Body>,
{
    DEFAULT_CLIENT
        .post_bytes(url, content_type, body, options)
        .await
}

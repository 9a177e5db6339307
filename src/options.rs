use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::{Engine, prelude::BASE64_STANDARD};
use bytes::Bytes;
use futures_util::TryStream;
use serde::Serialize;

use crate::{
    Body, Method, Request,
    error::BuilderError,
    header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue},
    multipart::Form,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A composable unit of request-construction mutation.
///
/// Options are applied strictly in the order supplied, baseline options
/// ahead of call-site options. Each option either mutates the
/// [`OptionsContext`] or fails, and the first failure aborts the call before
/// any network I/O happens.
///
/// An option value is immutable and may be reused across any number of
/// calls; cloning it is cheap. The `with_*` constructors in this crate cover
/// the common mutations, and [`RequestOption::new`] builds custom ones.
#[derive(Clone)]
pub struct RequestOption {
    inner: Arc<dyn Fn(&mut OptionsContext) -> Result<(), BuilderError> + Send + Sync>,
}

impl RequestOption {
    /// Creates an option from a closure over the construction context.
    ///
    /// # Example
    ///
    /// ```rust
    /// use optreq::{OptionsContext, RequestOption};
    ///
    /// // Tags every call it is applied to for server-side tracing.
    /// let tagged = RequestOption::new(|cx: &mut OptionsContext| {
    ///     cx.set_query_value("trace", "1");
    ///     Ok(())
    /// });
    /// # drop(tagged);
    /// ```
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut OptionsContext) -> Result<(), BuilderError> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Applies this option to a construction context.
    pub fn apply(&self, cx: &mut OptionsContext) -> Result<(), BuilderError> {
        (self.inner)(cx)
    }
}

impl fmt::Debug for RequestOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOption").finish_non_exhaustive()
    }
}

/// The mutable per-call state threaded through the option pipeline.
///
/// Wraps the request under construction together with the accumulated query
/// map and the status-check flag. Exactly one context exists per call and it
/// is discarded once the request is dispatched.
///
/// The query map is seeded from the query string baked into the call's URL.
/// Keys are case-sensitive and unique; the last write for a key wins. After
/// the pipeline runs, the map is percent-encoded sorted by key and written
/// back onto the URL, replacing whatever query string the URL carried.
#[derive(Debug)]
pub struct OptionsContext {
    request: Request,
    query: BTreeMap<String, String>,
    check_status: bool,
}

impl OptionsContext {
    /// Creates a context around `request`, seeding the query map from the
    /// request URL.
    pub fn new(request: Request) -> Self {
        let query = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Self {
            request,
            query,
            check_status: false,
        }
    }

    /// The request under construction.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// A mutable reference to the request under construction.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Replaces the request wholesale and re-seeds the query map from the
    /// new request's URL.
    pub fn replace_request(&mut self, request: Request) {
        self.query = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        self.request = request;
    }

    /// The accumulated query parameters.
    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// Replaces the accumulated query map entirely, dropping URL-seeded
    /// entries.
    pub fn set_query(&mut self, query: BTreeMap<String, String>) {
        self.query = query;
    }

    /// Sets one query parameter, overwriting any previous value for the key.
    pub fn set_query_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.insert(key.into(), value.into());
    }

    /// Whether the byte-buffering call paths treat non-200 responses as errors.
    pub fn check_status(&self) -> bool {
        self.check_status
    }

    /// Enables or disables the status-check policy for this call.
    pub fn set_check_status(&mut self, check: bool) {
        self.check_status = check;
    }

    /// Attaches a body and sets the `Content-Type` header to `content_type`,
    /// overwriting any previously attached body and content type.
    pub fn attach_body<V>(&mut self, content_type: V, body: Body) -> Result<(), BuilderError>
    where
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let content_type =
            HeaderValue::try_from(content_type).map_err(|err| BuilderError::Http(err.into()))?;
        self.request.headers_mut().insert(CONTENT_TYPE, content_type);
        *self.request.body_mut() = Some(body);
        Ok(())
    }

    /// Consumes the context, writing the accumulated query back onto the URL.
    pub(crate) fn into_request(self) -> (Request, bool) {
        let Self {
            mut request,
            query,
            check_status,
        } = self;

        request
            .url_mut()
            .query_pairs_mut()
            .clear()
            .extend_pairs(query.iter());
        if let Some("") = request.url().query() {
            request.url_mut().set_query(None);
        }

        (request, check_status)
    }
}

fn header_pair<K, V>(key: &K, value: &V) -> Result<(HeaderName, HeaderValue), BuilderError>
where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    K: Clone,
    V: Clone,
{
    let key = HeaderName::try_from(key.clone()).map_err(|err| BuilderError::Http(err.into()))?;
    let value =
        HeaderValue::try_from(value.clone()).map_err(|err| BuilderError::Http(err.into()))?;
    Ok((key, value))
}

/// Replaces the request's header map entirely.
pub fn with_headers(headers: HeaderMap) -> RequestOption {
    RequestOption::new(move |cx| {
        *cx.request_mut().headers_mut() = headers.clone();
        Ok(())
    })
}

/// Sets one header, overwriting any previous values for the key.
///
/// # Example
///
/// ```rust
/// # use optreq::with_header;
/// let opt = with_header("x-request-id", "f3a81");
/// # drop(opt);
/// ```
pub fn with_header<K, V>(key: K, value: V) -> RequestOption
where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    RequestOption::new(move |cx| {
        let (key, value) = header_pair(&key, &value)?;
        cx.request_mut().headers_mut().insert(key, value);
        Ok(())
    })
}

/// Appends one header, keeping any previous values for the key.
pub fn with_append_header<K, V>(key: K, value: V) -> RequestOption
where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    RequestOption::new(move |cx| {
        let (key, value) = header_pair(&key, &value)?;
        cx.request_mut().headers_mut().append(key, value);
        Ok(())
    })
}

/// Sets the per-call timeout.
///
/// The deadline is fixed when the request is dispatched and covers both the
/// network call and the response body drain. It overrides the client-level
/// timeout for this call.
pub fn with_timeout(timeout: Duration) -> RequestOption {
    RequestOption::new(move |cx| {
        *cx.request_mut().timeout_mut() = Some(timeout);
        Ok(())
    })
}

/// Replaces the request method.
pub fn with_method(method: Method) -> RequestOption {
    RequestOption::new(move |cx| {
        *cx.request_mut().method_mut() = method.clone();
        Ok(())
    })
}

/// Attaches a request body and sets the `Content-Type` header.
///
/// Accepts anything convertible into a [`Body`]. A body built from buffered
/// data is snapshotted on every application, so the option can be reused
/// across calls; a stream-backed body is handed over once and a second
/// application fails with a builder error.
///
/// # Example
///
/// ```rust
/// # use optreq::with_body;
/// let opt = with_body("text/plain; charset=utf-8", "ping");
/// # drop(opt);
/// ```
pub fn with_body<V, B>(content_type: V, body: B) -> RequestOption
where
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    V: Clone + Send + Sync + 'static,
    B: Into<Body>,
{
    let slot = Mutex::new(Some(body.into()));
    RequestOption::new(move |cx| {
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let body = match guard.as_ref().and_then(Body::try_clone) {
            Some(snapshot) => Some(snapshot),
            None => guard.take(),
        };
        drop(guard);

        let body = body.ok_or(BuilderError::BodyConsumed)?;
        cx.attach_body(content_type.clone(), body)
    })
}

/// Attaches a streaming request body and sets the `Content-Type` header.
///
/// The body is sent with chunked transfer encoding, reports an unknown
/// length and cannot be replayed, so the returned option is good for exactly
/// one application.
pub fn with_body_stream<V, S>(content_type: V, stream: S) -> RequestOption
where
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    V: Clone + Send + Sync + 'static,
    S: TryStream + Send + 'static,
    S::Error: Into<BoxError>,
    Bytes: From<S::Ok>,
{
    with_body(content_type, Body::wrap_stream(stream))
}

/// Merges the given parameters into the query.
///
/// Each entry overwrites any previous value for its key; entries under
/// other keys, including those baked into the call URL, survive.
pub fn with_query<I, K, V>(query: I) -> RequestOption
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let query: BTreeMap<String, String> = query
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    RequestOption::new(move |cx| {
        for (key, value) in &query {
            cx.set_query_value(key.clone(), value.clone());
        }
        Ok(())
    })
}

/// Sets one query parameter, overwriting any previous value for the key.
///
/// # Example
///
/// ```rust
/// # use optreq::with_query_value;
/// // GET http://host/items?name=abc plus this option yields
/// // ?age=18&name=abc on the wire.
/// let opt = with_query_value("age", "18");
/// # drop(opt);
/// ```
pub fn with_query_value(key: impl Into<String>, value: impl Into<String>) -> RequestOption {
    let key = key.into();
    let value = value.into();
    RequestOption::new(move |cx| {
        cx.set_query_value(key.clone(), value.clone());
        Ok(())
    })
}

/// Attaches a URL-encoded form body, setting the method to `POST` and the
/// `Content-Type` header to `application/x-www-form-urlencoded`.
///
/// Entries are encoded sorted by key, so encoding the same map twice yields
/// byte-identical bodies.
pub fn with_form<I, K, V>(form: I) -> RequestOption
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let form: BTreeMap<String, String> = form
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    RequestOption::new(move |cx| {
        let encoded = serde_urlencoded::to_string(&form)?;
        *cx.request_mut().method_mut() = Method::POST;
        cx.attach_body(
            HeaderValue::from_static("application/x-www-form-urlencoded"),
            encoded.into(),
        )
    })
}

/// Attaches a JSON body, setting the method to `POST` and the `Content-Type`
/// header to `application/json`.
///
/// The value is serialized when the option is applied. If serialization
/// fails the call aborts with a builder error before any network I/O, and
/// the request is left untouched.
///
/// # Example
///
/// ```rust
/// # use optreq::with_json;
/// let opt = with_json(serde_json::json!({ "name": "jack", "age": 18 }));
/// # drop(opt);
/// ```
pub fn with_json<T>(value: T) -> RequestOption
where
    T: Serialize + Send + Sync + 'static,
{
    RequestOption::new(move |cx| {
        let body = serde_json::to_vec(&value)?;
        *cx.request_mut().method_mut() = Method::POST;
        cx.attach_body(HeaderValue::from_static("application/json"), body.into())
    })
}

/// Adds one cookie to the `Cookie` header, keeping cookies added earlier.
pub fn with_cookie<N, V>(name: N, value: V) -> RequestOption
where
    N: fmt::Display + Send + Sync + 'static,
    V: fmt::Display + Send + Sync + 'static,
{
    RequestOption::new(move |cx| {
        let pair = format!("{name}={value}");
        let headers = cx.request_mut().headers_mut();
        let combined = match headers.get(COOKIE) {
            Some(existing) => {
                let mut buf = existing.as_bytes().to_vec();
                buf.extend_from_slice(b"; ");
                buf.extend_from_slice(pair.as_bytes());
                HeaderValue::from_bytes(&buf)?
            }
            None => HeaderValue::from_str(&pair)?,
        };
        headers.insert(COOKIE, combined);
        Ok(())
    })
}

/// Replaces the request under construction wholesale.
///
/// This is the escape hatch for requests assembled by hand: method, URL,
/// headers, body and timeout all come from `request`, and the accumulated
/// query map is re-seeded from its URL. Options applied earlier in the
/// pipeline are discarded; options applied later operate on the new request.
///
/// When `request` carries a stream-backed body the option is good for one
/// application, and reusing it fails with a builder error.
pub fn with_request(request: Request) -> RequestOption {
    let slot = Mutex::new(Some(request));
    RequestOption::new(move |cx| {
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let request = match guard.as_ref().and_then(Request::try_clone) {
            Some(snapshot) => Some(snapshot),
            None => guard.take(),
        };
        drop(guard);

        let request = request.ok_or(BuilderError::BodyConsumed)?;
        cx.replace_request(request);
        Ok(())
    })
}

/// Makes the byte-buffering call paths treat any status other than 200 as an
/// error carrying the drained body and the code.
pub fn with_check_status(check: bool) -> RequestOption {
    RequestOption::new(move |cx| {
        cx.set_check_status(check);
        Ok(())
    })
}

fn apply_multipart(cx: &mut OptionsContext, form: &Form) -> Result<(), BuilderError> {
    let content_type = form.content_type();
    let body = form.encode();
    *cx.request_mut().method_mut() = Method::POST;
    cx.attach_body(content_type, body.into())
}

/// Attaches a `multipart/form-data` body built from text fields, setting the
/// method to `POST` and the boundary-bearing `Content-Type` header.
///
/// A fresh boundary is generated on every application.
pub fn with_multipart<I, K, V>(fields: I) -> RequestOption
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let fields: BTreeMap<String, String> = fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    RequestOption::new(move |cx| {
        let mut form = Form::new();
        for (name, value) in &fields {
            form = form.text(name.clone(), value.clone());
        }
        apply_multipart(cx, &form)
    })
}

/// Attaches a `multipart/form-data` body carrying one file part, preceded by
/// any extra text fields, setting the method to `POST` and the
/// boundary-bearing `Content-Type` header.
///
/// The file part is named `field_name`, carries `file_name` in its
/// disposition header and is sent as `application/octet-stream`.
///
/// # Example
///
/// ```rust
/// # use optreq::with_multipart_file;
/// let opt = with_multipart_file("media", "1.txt", &b"hello world"[..], []);
/// # drop(opt);
/// ```
pub fn with_multipart_file(
    field_name: impl Into<String>,
    file_name: impl Into<String>,
    data: impl Into<Bytes>,
    fields: impl IntoIterator<Item = (String, String)>,
) -> RequestOption {
    let field_name = field_name.into();
    let file_name = file_name.into();
    let data = data.into();
    let fields: BTreeMap<String, String> = fields.into_iter().collect();
    RequestOption::new(move |cx| {
        let mut form = Form::new();
        for (name, value) in &fields {
            form = form.text(name.clone(), value.clone());
        }
        form = form.file(field_name.clone(), file_name.clone(), data.clone());
        apply_multipart(cx, &form)
    })
}

/// Attaches a prebuilt [`multipart::Form`](crate::multipart::Form), setting
/// the method to `POST` and the boundary-bearing `Content-Type` header.
///
/// Unlike [`with_multipart`], the form's boundary is generated once at form
/// construction and shared by every application of the option.
pub fn with_multipart_form(form: Form) -> RequestOption {
    RequestOption::new(move |cx| apply_multipart(cx, &form))
}

/// Enables HTTP basic authentication, marking the header value sensitive.
pub fn with_basic_auth<U, P>(username: U, password: Option<P>) -> RequestOption
where
    U: fmt::Display + Send + Sync + 'static,
    P: fmt::Display + Send + Sync + 'static,
{
    RequestOption::new(move |cx| {
        let decode = match &password {
            Some(password) => format!("{username}:{password}"),
            None => username.to_string(),
        };
        let encode = BASE64_STANDARD.encode(decode.as_bytes());
        let mut value = HeaderValue::from_str(&format!("Basic {encode}"))?;
        value.set_sensitive(true);
        cx.request_mut().headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    })
}

/// Enables HTTP bearer authentication, marking the header value sensitive.
pub fn with_bearer_auth<T>(token: T) -> RequestOption
where
    T: fmt::Display + Send + Sync + 'static,
{
    RequestOption::new(move |cx| {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        value.set_sensitive(true);
        cx.request_mut().headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use url::Url;

    fn apply(url: &str, options: &[RequestOption]) -> Result<(Request, bool), BuilderError> {
        let request = Request::new(Method::GET, Url::parse(url).expect("test url"));
        let mut cx = OptionsContext::new(request);
        for opt in options {
            opt.apply(&mut cx)?;
        }
        Ok(cx.into_request())
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            Err(S::Error::custom("value cannot be serialized"))
        }
    }

    #[test]
    fn query_value_merges_with_url_query() {
        let (req, _) = apply(
            "http://example.com/query_params?name=abc",
            &[with_query_value("age", "18")],
        )
        .unwrap();
        assert_eq!(req.url().query(), Some("age=18&name=abc"));
    }

    #[test]
    fn query_value_last_write_wins() {
        let (req, _) = apply(
            "http://example.com/",
            &[with_query_value("k", "1"), with_query_value("k", "2")],
        )
        .unwrap();
        assert_eq!(req.url().query(), Some("k=2"));
    }

    #[test]
    fn query_map_merges_per_key() {
        let (req, _) = apply(
            "http://example.com/test?name=abc",
            &[with_query([("age", "18")])],
        )
        .unwrap();
        assert_eq!(req.url().query(), Some("age=18&name=abc"));
    }

    #[test]
    fn query_map_overwrites_only_its_own_keys() {
        let (req, _) = apply(
            "http://example.com/?a=1&b=1",
            &[with_query([("b", "2"), ("c", "3")])],
        )
        .unwrap();
        assert_eq!(req.url().query(), Some("a=1&b=2&c=3"));
    }

    #[test]
    fn custom_option_can_replace_the_query_map() {
        let wipe = RequestOption::new(|cx: &mut OptionsContext| {
            let mut fresh = BTreeMap::new();
            fresh.insert("only".to_string(), "this".to_string());
            cx.set_query(fresh);
            Ok(())
        });

        let (req, _) = apply("http://example.com/?a=1&b=2", &[wipe]).unwrap();
        assert_eq!(req.url().query(), Some("only=this"));
    }

    #[test]
    fn multibyte_query_round_trips() {
        let (req, _) = apply(
            "http://example.com/",
            &[with_query_value("city", "深圳"), with_query_value("dept", "技术部")],
        )
        .unwrap();
        assert_eq!(
            req.url().query(),
            Some("city=%E6%B7%B1%E5%9C%B3&dept=%E6%8A%80%E6%9C%AF%E9%83%A8")
        );

        let decoded: HashMap<String, String> = req
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(decoded.get("city").map(String::as_str), Some("深圳"));
        assert_eq!(decoded.get("dept").map(String::as_str), Some("技术部"));
    }

    #[test]
    fn empty_query_is_normalized_away() {
        let (req, _) = apply("http://example.com/?", &[]).unwrap();
        assert_eq!(req.url().query(), None);
        assert_eq!(req.url().as_str(), "http://example.com/");
    }

    #[test]
    fn header_set_is_last_write_wins() {
        let (req, _) = apply(
            "http://example.com/",
            &[with_header("x-tag", "a"), with_header("x-tag", "b")],
        )
        .unwrap();
        let values = req.headers().get_all("x-tag").iter().collect::<Vec<_>>();
        assert_eq!(values, vec!["b"]);
    }

    #[test]
    fn append_header_keeps_previous_values() {
        let (req, _) = apply(
            "http://example.com/",
            &[
                with_header("x-tag", "a"),
                with_append_header("x-tag", "b"),
            ],
        )
        .unwrap();
        let values = req.headers().get_all("x-tag").iter().collect::<Vec<_>>();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn headers_option_replaces_whole_map() {
        let mut headers = HeaderMap::new();
        headers.insert("x-new", "1".parse().unwrap());

        let (req, _) = apply(
            "http://example.com/",
            &[with_header("x-old", "1"), with_headers(headers)],
        )
        .unwrap();
        assert!(req.headers().get("x-old").is_none());
        assert_eq!(req.headers()["x-new"], "1");
    }

    #[test]
    fn cookies_accumulate() {
        let (req, _) = apply(
            "http://example.com/",
            &[with_cookie("a", "1"), with_cookie("b", "2")],
        )
        .unwrap();
        assert_eq!(req.headers()[COOKIE], "a=1; b=2");
    }

    #[test]
    fn method_and_timeout_and_flag() {
        let (req, check) = apply(
            "http://example.com/",
            &[
                with_method(Method::DELETE),
                with_timeout(Duration::from_secs(3)),
                with_check_status(true),
            ],
        )
        .unwrap();
        assert_eq!(req.method(), Method::DELETE);
        assert_eq!(req.timeout(), Some(&Duration::from_secs(3)));
        assert!(check);
    }

    #[test]
    fn body_overwrites_previous_body_and_content_type() {
        let (req, _) = apply(
            "http://example.com/",
            &[
                with_body("text/plain", "aa"),
                with_body("application/json", "bb"),
            ],
        )
        .unwrap();
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(req.body().and_then(Body::as_bytes), Some(&b"bb"[..]));
    }

    #[test]
    fn buffered_body_option_is_reusable() {
        let opt = with_body("text/plain", "hello");
        let (first, _) = apply("http://example.com/", &[opt.clone()]).unwrap();
        let (second, _) = apply("http://example.com/", &[opt]).unwrap();
        assert_eq!(first.body().and_then(Body::as_bytes), Some(&b"hello"[..]));
        assert_eq!(second.body().and_then(Body::as_bytes), Some(&b"hello"[..]));
    }

    #[test]
    fn stream_body_option_is_take_once() {
        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("data")];
        let opt = with_body_stream(
            "application/octet-stream",
            futures_util::stream::iter(chunks),
        );

        let (first, _) = apply("http://example.com/", &[opt.clone()]).unwrap();
        assert!(first.body().is_some());

        let err = apply("http://example.com/", &[opt]).unwrap_err();
        assert!(matches!(err, BuilderError::BodyConsumed));
    }

    #[test]
    fn form_is_deterministic_and_sets_method() {
        let fields = [("name", "abc"), ("age", "18")];
        let (req, _) = apply("http://example.com/", &[with_form(fields)]).unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(
            req.headers()[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
        assert_eq!(req.body().and_then(Body::as_bytes), Some(&b"age=18&name=abc"[..]));

        let (again, _) = apply("http://example.com/", &[with_form(fields)]).unwrap();
        assert_eq!(req.body().and_then(Body::as_bytes), again.body().and_then(Body::as_bytes));
    }

    #[test]
    fn form_encodes_multibyte_values() {
        let (req, _) = apply("http://example.com/", &[with_form([("city", "深圳")])]).unwrap();
        assert_eq!(
            req.body().and_then(Body::as_bytes),
            Some(&b"city=%E6%B7%B1%E5%9C%B3"[..])
        );
    }

    #[test]
    fn json_sets_canonical_body() {
        let payload = serde_json::json!({ "name": "jack", "age": 18 });
        let expected = serde_json::to_vec(&payload).unwrap();

        let (req, _) = apply("http://example.com/", &[with_json(payload)]).unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(req.body().and_then(Body::as_bytes), Some(&expected[..]));
    }

    #[test]
    fn json_failure_short_circuits_pipeline() {
        let hit = Arc::new(AtomicBool::new(false));
        let tail = {
            let hit = hit.clone();
            RequestOption::new(move |_| {
                hit.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        let err = apply(
            "http://example.com/",
            &[with_json(Unserializable), tail],
        )
        .unwrap_err();
        assert!(matches!(err, BuilderError::SerializeJson(..)));
        assert!(!hit.load(Ordering::SeqCst));
    }

    #[test]
    fn request_replacement_reseeds_query() {
        let replacement = Request::new(
            Method::PUT,
            Url::parse("http://example.com/other?x=9").unwrap(),
        );
        let (req, _) = apply(
            "http://example.com/?dropped=1",
            &[with_request(replacement), with_query_value("y", "2")],
        )
        .unwrap();
        assert_eq!(req.method(), Method::PUT);
        assert_eq!(req.url().path(), "/other");
        assert_eq!(req.url().query(), Some("x=9&y=2"));
    }

    #[test]
    fn request_replacement_with_stream_body_is_take_once() {
        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("data")];
        let mut replacement = Request::new(Method::POST, Url::parse("http://example.com/").unwrap());
        *replacement.body_mut() = Some(Body::wrap_stream(futures_util::stream::iter(chunks)));

        let opt = with_request(replacement);
        apply("http://example.com/", &[opt.clone()]).unwrap();
        let err = apply("http://example.com/", &[opt]).unwrap_err();
        assert!(matches!(err, BuilderError::BodyConsumed));
    }

    #[test]
    fn multipart_fields_sorted_with_fresh_boundary() {
        let opt = with_multipart([("b", "2"), ("a", "1")]);
        let (req, _) = apply("http://example.com/", &[opt.clone()]).unwrap();
        assert_eq!(req.method(), Method::POST);

        let content_type = req.headers()[CONTENT_TYPE].to_str().unwrap().to_string();
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .expect("boundary-bearing content type");
        let body = String::from_utf8(req.body().and_then(Body::as_bytes).unwrap().to_vec()).unwrap();
        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
        // Map iteration order: "a" before "b".
        let a = body.find("name=\"a\"").unwrap();
        let b = body.find("name=\"b\"").unwrap();
        assert!(a < b);

        let (second, _) = apply("http://example.com/", &[opt]).unwrap();
        assert_ne!(second.headers()[CONTENT_TYPE], content_type.as_str());
    }

    #[test]
    fn multipart_file_appends_file_after_fields() {
        let (req, _) = apply(
            "http://example.com/",
            &[with_multipart_file(
                "media",
                "1.txt",
                &b"hello world"[..],
                [("name".to_string(), "jack".to_string())],
            )],
        )
        .unwrap();
        let body = String::from_utf8(req.body().and_then(Body::as_bytes).unwrap().to_vec()).unwrap();
        let field = body.find("name=\"name\"").unwrap();
        let file = body
            .find("name=\"media\"; filename=\"1.txt\"")
            .unwrap();
        assert!(field < file);
        assert!(body.contains("Content-Type: application/octet-stream"));
        assert!(body.contains("hello world"));
    }

    #[test]
    fn basic_auth_header() {
        let (req, _) = apply(
            "http://example.com/",
            &[with_basic_auth("Aladdin", Some("open sesame"))],
        )
        .unwrap();
        assert_eq!(
            req.headers()[AUTHORIZATION],
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
        assert!(req.headers()[AUTHORIZATION].is_sensitive());
    }

    #[test]
    fn bearer_auth_header() {
        let (req, _) = apply("http://example.com/", &[with_bearer_auth("token123")]).unwrap();
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer token123");
        assert!(req.headers()[AUTHORIZATION].is_sensitive());
    }
}

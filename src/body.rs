use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{TryStream, TryStreamExt};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents the body of an HTTP request.
///
/// A body created from buffered data (bytes or strings) reports its exact
/// length and can produce a fresh read cursor via [`Body::try_clone`], so the
/// request carrying it can be replayed. A body created from a stream is
/// consumed while it is sent, reports an unknown length and cannot be cloned.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming(UnsyncBoxBody<Bytes, BoxError>),
}

impl Body {
    /// Returns an empty body.
    #[inline]
    pub fn empty() -> Body {
        Bytes::new().into()
    }

    /// Wraps a futures [`Stream`](futures_util::Stream) of byte chunks in a body.
    ///
    /// The resulting body is sent with chunked transfer encoding and cannot
    /// be replayed.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use optreq::Body;
    /// let chunks: Vec<Result<_, ::std::io::Error>> = vec![Ok("hello"), Ok(" "), Ok("world")];
    /// let stream = futures_util::stream::iter(chunks);
    /// let body = Body::wrap_stream(stream);
    /// assert!(body.try_clone().is_none());
    /// ```
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: TryStream + Send + 'static,
        S::Error: Into<BoxError>,
        Bytes: From<S::Ok>,
    {
        let body = StreamBody::new(
            stream
                .map_ok(|chunk| Frame::data(Bytes::from(chunk)))
                .map_err(Into::into),
        );

        Body {
            inner: Inner::Streaming(BodyExt::boxed_unsync(body)),
        }
    }

    /// Returns the body as bytes, if it was created from buffered data.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            Inner::Streaming(..) => None,
        }
    }

    /// Returns the exact byte length of the body, known only for buffered data.
    pub fn content_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.len() as u64),
            Inner::Streaming(..) => None,
        }
    }

    /// Attempts to clone the body, producing an independent read cursor over
    /// the same buffered data.
    ///
    /// Returns `None` for stream-backed bodies, which can only be read once.
    pub fn try_clone(&self) -> Option<Body> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(Body {
                inner: Inner::Reusable(bytes.clone()),
            }),
            Inner::Streaming(..) => None,
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            Inner::Reusable(bytes) => {
                let out = bytes.split_off(0);
                if out.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Frame::data(out))))
                }
            }
            Inner::Streaming(body) => Pin::new(body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Inner::Reusable(bytes) => bytes.is_empty(),
            Inner::Streaming(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Inner::Reusable(bytes) => SizeHint::with_exact(bytes.len() as u64),
            Inner::Streaming(body) => body.size_hint(),
        }
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(value: Bytes) -> Self {
        Self {
            inner: Inner::Reusable(value),
        }
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(value: Vec<u8>) -> Self {
        Bytes::from(value).into()
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(value: &'static [u8]) -> Self {
        Bytes::from_static(value).into()
    }
}

impl From<String> for Body {
    #[inline]
    fn from(value: String) -> Self {
        Bytes::from(value).into()
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(value: &'static str) -> Self {
        Bytes::from_static(value.as_bytes()).into()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Reusable(bytes) => f.debug_struct("Body").field("len", &bytes.len()).finish(),
            Inner::Streaming(..) => f.debug_struct("Body").field("stream", &true).finish(),
        }
    }
}

//! The unit of data moved by the relay, and adapters that present a
//! WebSocket connection as a stream and sink of [`Frame`]s.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::extract::ws::Message as DownstreamMessage;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

/// One data message, passed through the relay without inspection.
///
/// The variant is the binary/text discriminator and is preserved on every
/// hop. Ping, pong and close messages are not frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a raw WebSocket message means to the relay.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// The peer started the closing handshake.
    Close,
    /// Ping/pong or raw frames, answered by the WebSocket layer itself.
    Control,
}

/// A WebSocket message type that can be converted to and from [`Frame`].
pub trait WireMessage: Sized {
    fn classify(self) -> Inbound;
    fn from_frame(frame: Frame) -> Self;
}

impl WireMessage for DownstreamMessage {
    fn classify(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Frame(Frame::Text(text.as_str().to_owned())),
            Self::Binary(bytes) => Inbound::Frame(Frame::Binary(bytes)),
            Self::Close(_) => Inbound::Close,
            Self::Ping(_) | Self::Pong(_) => Inbound::Control,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(bytes) => Self::Binary(bytes),
        }
    }
}

impl WireMessage for UpstreamMessage {
    fn classify(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Frame(Frame::Text(text.as_str().to_owned())),
            Self::Binary(bytes) => Inbound::Frame(Frame::Binary(bytes)),
            Self::Close(_) => Inbound::Close,
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Inbound::Control,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(bytes) => Self::Binary(bytes),
        }
    }
}

/// Wraps a WebSocket so it reads and writes [`Frame`]s.
///
/// The stream half skips control messages and ends at the first close
/// message. Errors from the underlying socket are passed through.
pub struct FrameLink<S, M> {
    inner: S,
    finished: bool,
    _message: PhantomData<fn() -> M>,
}

impl<S, M> FrameLink<S, M> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            finished: false,
            _message: PhantomData,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, M, E> Stream for FrameLink<S, M>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: WireMessage,
{
    type Item = Result<Frame, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(message)) => match message.classify() {
                    Inbound::Frame(frame) => return Poll::Ready(Some(Ok(frame))),
                    Inbound::Close => {
                        self.finished = true;
                        return Poll::Ready(None);
                    }
                    Inbound::Control => continue,
                },
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<S, M, E> Sink<Frame> for FrameLink<S, M>
where
    S: Sink<M, Error = E> + Unpin,
    M: WireMessage,
{
    type Error = E;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), E>> {
        Pin::new(&mut self.inner).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), E> {
        Pin::new(&mut self.inner).start_send(M::from_frame(frame))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), E>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), E>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

//! One connected control-channel client.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::future::poll_fn;
use futures::task::{Context, Poll};
use futures::{Future as _, SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::{Dispatcher, Subscription};
use crate::ipc::{FramedReader, FramedWriter, framed};
use crate::protocol::{Frame, Request, Response, ServerMessage};

/// Every write must finish within this, or the client is considered stuck.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DaemonSession<S> {
    rx: FramedReader<S>,
    tx: FramedWriter<S>,
    pushes: mpsc::Receiver<ServerMessage>,
    subscription: Subscription,
    dispatcher: Dispatcher,
    terminate: Pin<Box<WaitForCancellationFutureOwned>>,
}

enum Event {
    Request(Frame),
    Push(ServerMessage),
    PushesDropped,
    Disconnected,
    ProtocolError(std::io::Error),
    Terminate,
}

/// Why a session ended. None of these affect other sessions.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum SessionOk {
    ClientDisconnected,
    /// The push queue overflowed.
    FellBehind,
    Err,
    ServiceTerminating,
}

impl<S> DaemonSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, dispatcher: Dispatcher, terminate: CancellationToken) -> Self {
        let (rx, tx) = framed(stream);
        let (subscription, pushes) = dispatcher.subscribe();

        Self {
            rx,
            tx,
            pushes,
            subscription,
            dispatcher,
            terminate: Box::pin(terminate.cancelled_owned()),
        }
    }

    pub fn id(&self) -> u64 {
        self.subscription.id()
    }

    /// Serves the client until it leaves, misbehaves or we terminate.
    ///
    /// Infallible so that giving up on a client is always explicit.
    pub async fn run(mut self) -> SessionOk {
        let id = self.id();

        loop {
            match poll_fn(|cx| self.next_event(cx)).await {
                Event::Request(frame) => {
                    let response = self.answer(&frame);

                    if let Err(error) = self.send(&ServerMessage::Response(response)).await {
                        tracing::info!(session = id, "Failed to send response: {error:#}");
                        break SessionOk::Err;
                    }
                }
                Event::Push(message) => {
                    if let Err(error) = self.send(&message).await {
                        tracing::info!(session = id, "Failed to send push: {error:#}");
                        break SessionOk::Err;
                    }
                }
                Event::PushesDropped => {
                    tracing::warn!(session = id, "Client fell behind, disconnecting it");
                    break SessionOk::FellBehind;
                }
                Event::Disconnected => {
                    tracing::info!(session = id, "Client disconnected");
                    break SessionOk::ClientDisconnected;
                }
                Event::ProtocolError(error) => {
                    tracing::warn!(session = id, "Protocol error: {error}");
                    break SessionOk::Err;
                }
                Event::Terminate => {
                    // Ignore the result here because we're terminating anyway.
                    let _ = self.send(&ServerMessage::Terminating).await;
                    break SessionOk::ServiceTerminating;
                }
            }
        }
    }

    fn next_event(&mut self, cx: &mut Context<'_>) -> Poll<Event> {
        if let Poll::Ready(()) = self.terminate.as_mut().poll(cx) {
            return Poll::Ready(Event::Terminate);
        }
        // `FramedRead::next` is cancel-safe.
        if let Poll::Ready(result) = self.rx.poll_next_unpin(cx) {
            return Poll::Ready(match result {
                Some(Ok(frame)) => Event::Request(frame),
                Some(Err(error)) => Event::ProtocolError(error),
                None => Event::Disconnected,
            });
        }
        // The dispatcher drops our sender once the queue is full.
        if let Poll::Ready(option) = self.pushes.poll_recv(cx) {
            return Poll::Ready(match option {
                Some(message) => Event::Push(message),
                None => Event::PushesDropped,
            });
        }

        Poll::Pending
    }

    fn answer(&self, frame: &Frame) -> Response {
        match Request::from_frame(frame) {
            Ok(request) => {
                let _entered =
                    tracing::debug_span!("handle_request", request = request.name()).entered();

                self.dispatcher.handle(request)
            }
            Err(error) => {
                tracing::debug!(session = self.id(), "Rejecting request: {error}");

                Response::error(error.to_string())
            }
        }
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<()> {
        let frame = message.to_frame()?;

        tokio::time::timeout(WRITE_TIMEOUT, self.tx.send(frame))
            .await
            .context("Timed out writing to the client")??;

        Ok(())
    }
}

use anyhow::Result;
use futures::{
    StreamExt as _,
    channel::mpsc,
    future::poll_fn,
    task::{Context, Poll},
};
use tokio::signal::unix::{Signal, SignalKind, signal};

pub struct Terminate {
    inner: Inner,
}

enum Inner {
    Signals {
        /// For Ctrl+C from a terminal
        sigint: Signal,
        /// For systemd / launchd stopping us
        sigterm: Signal,
    },
    /// Driven by whoever holds the sender, e.g. tests.
    Channel(mpsc::Receiver<()>),
}

impl Terminate {
    pub fn new() -> Result<Self> {
        let sigint = signal(SignalKind::interrupt())?;
        let sigterm = signal(SignalKind::terminate())?;

        Ok(Self {
            inner: Inner::Signals { sigint, sigterm },
        })
    }

    pub fn from_channel(rx: mpsc::Receiver<()>) -> Self {
        Self {
            inner: Inner::Channel(rx),
        }
    }

    /// Dropping the sender of a channel-backed [`Terminate`] counts as a terminate request.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.inner {
            Inner::Signals { sigint, sigterm } => {
                if let Poll::Ready(_) = sigint.poll_recv(cx) {
                    Poll::Ready(())
                } else if let Poll::Ready(_) = sigterm.poll_recv(cx) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            Inner::Channel(rx) => rx.poll_next_unpin(cx).map(|_| ()),
        }
    }

    /// Waits for SIGINT or SIGTERM
    pub async fn recv(&mut self) {
        poll_fn(|cx| self.poll_recv(cx)).await
    }
}

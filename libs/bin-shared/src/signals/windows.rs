use anyhow::Result;
use futures::{
    StreamExt as _,
    channel::mpsc,
    future::poll_fn,
    task::{Context, Poll},
};

pub struct Terminate {
    inner: Inner,
}

enum Inner {
    CtrlC(tokio::signal::windows::CtrlC),
    /// Driven by the service control handler, which gets Stop and Shutdown from the SCM.
    Channel(mpsc::Receiver<()>),
}

impl Terminate {
    pub fn new() -> Result<Self> {
        let sigint = tokio::signal::windows::ctrl_c()?;

        Ok(Self {
            inner: Inner::CtrlC(sigint),
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
            Inner::CtrlC(sigint) => sigint.poll_recv(cx).map(|_| ()),
            Inner::Channel(rx) => rx.poll_next_unpin(cx).map(|_| ()),
        }
    }

    /// Waits for Ctrl+C or a stop request from the SCM
    pub async fn recv(&mut self) {
        poll_fn(|cx| self.poll_recv(cx)).await
    }
}

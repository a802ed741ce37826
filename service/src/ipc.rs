//! Transport of the control channel: a named pipe on Windows, a Unix domain socket elsewhere.

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use futures::{SinkExt as _, StreamExt as _};
use platform::ClientStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::protocol::{FrameCodec, Request, Response, ServerMessage};

pub use platform::{Server, ServerStream};

#[cfg(unix)]
#[path = "ipc/unix.rs"]
mod platform;

#[cfg(windows)]
#[path = "ipc/windows.rs"]
mod platform;

pub type FramedReader<S> = FramedRead<ReadHalf<S>, FrameCodec>;
pub type FramedWriter<S> = FramedWrite<WriteHalf<S>, FrameCodec>;

#[derive(Debug, thiserror::Error)]
#[error("Couldn't find IPC socket `{0}`")]
pub struct NotFound(String);

/// A name that both the service and its clients can use to find each other.
///
/// Translated to a named pipe on Windows and a socket path elsewhere.
#[derive(Clone, Copy, Debug)]
pub enum SocketId {
    /// The control channel of an installed service.
    Control,
    /// For tests, so they can run in parallel with each other and an installed service.
    ///
    /// Only A-Z and 0-9, named pipe names are restrictive.
    Test(&'static str),
}

/// Splits `stream` and frames both halves.
pub fn framed<S>(stream: S) -> (FramedReader<S>, FramedWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (rx, tx) = tokio::io::split(stream);

    (
        FramedRead::new(rx, FrameCodec::default()),
        FramedWrite::new(tx, FrameCodec::default()),
    )
}

pub struct ConnectOptions {
    pub num_attempts: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { num_attempts: 10 }
    }
}

/// The launcher's end of the control channel.
pub struct Client {
    rx: FramedReader<ClientStream>,
    tx: FramedWriter<ClientStream>,
}

impl Client {
    /// Attempts to connect, sleeping 100 ms between attempts.
    pub async fn connect(id: SocketId, options: ConnectOptions) -> Result<Self> {
        tracing::debug!(
            ?id,
            client_pid = std::process::id(),
            "Connecting to IPC socket"
        );

        let mut last_err = None;

        for _ in 0..options.num_attempts {
            match platform::connect_to_socket(id).await {
                Ok(stream) => {
                    let (rx, tx) = framed(stream);
                    return Ok(Self { rx, tx });
                }
                Err(error) => {
                    tracing::debug!("Couldn't connect to IPC socket: {error}");
                    last_err = Some(error);

                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        match last_err {
            Some(error) => Err(error),
            None => bail!("`num_attempts` must be at least 1"),
        }
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        self.tx
            .send(request.to_frame()?)
            .await
            .context("Failed to send request")?;

        Ok(())
    }

    /// The next message from the service, skipping kinds this build doesn't know.
    ///
    /// `Ok(None)` once the service has closed the connection.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(frame) = self.rx.next().await {
            let frame = frame.context("Failed to read from the service")?;
            match ServerMessage::from_frame(&frame)
                .with_context(|| format!("Malformed message of kind 0x{:04x}", frame.kind))?
            {
                Some(message) => return Ok(Some(message)),
                None => tracing::debug!(kind = frame.kind, "Ignoring unknown message kind"),
            }
        }

        Ok(None)
    }

    /// Sends `request` and waits for its response.
    ///
    /// Also returns the pushes that arrived in the meantime, in order.
    pub async fn request(&mut self, request: &Request) -> Result<(Response, Vec<ServerMessage>)> {
        self.send(request).await?;

        let mut pushes = Vec::new();
        loop {
            match self.next_message().await? {
                Some(ServerMessage::Response(response)) => return Ok((response, pushes)),
                Some(push) => pushes.push(push),
                None => bail!("Service closed the connection before responding"),
            }
        }
    }
}

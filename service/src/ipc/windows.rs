//! Named pipes, the production transport.

use std::ffi::c_void;
use std::io::ErrorKind;
use std::os::windows::io::AsRawHandle as _;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use bin_shared::BUNDLE_ID;
use security_descriptor::{AccessRights, AccessRule, Sid, build_exclusive_access, set_access};
use tokio::net::windows::named_pipe;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::Pipes::{GetNamedPipeClientProcessId, GetNamedPipeServerProcessId};

use super::{NotFound, SocketId};
use crate::windows::AlignedBytes;

pub struct Server {
    pipe_path: String,
    security: AlignedBytes,
    /// Created ahead of time so a client never finds the pipe missing between two accepts.
    pending: Option<ServerStream>,
}

pub(crate) type ClientStream = named_pipe::NamedPipeClient;

pub type ServerStream = named_pipe::NamedPipeServer;

#[expect(clippy::unused_async, reason = "The Unix impl is async")]
#[expect(clippy::wildcard_enum_match_arm)]
pub(crate) async fn connect_to_socket(id: SocketId) -> Result<ClientStream> {
    let path = ipc_path(id);
    let stream = named_pipe::ClientOptions::new()
        .open(&path)
        .map_err(|error| match error.kind() {
            ErrorKind::NotFound => anyhow::Error::new(NotFound(path)),
            _ => anyhow::Error::new(error),
        })
        .context("Couldn't connect to named pipe")?;
    let handle = HANDLE(stream.as_raw_handle());
    let mut server_pid: u32 = 0;
    // SAFETY: Windows doesn't store this pointer or handle, and we just got the handle
    // from Tokio, so it should be valid.
    unsafe { GetNamedPipeServerProcessId(handle, &mut server_pid) }
        .context("Couldn't get PID of named pipe server")?;

    tracing::debug!(?server_pid, "Made IPC connection");

    Ok(stream)
}

impl Server {
    /// Fails if another process serves the same pipe.
    pub fn new(id: SocketId) -> Result<Self> {
        let pipe_path = ipc_path(id);
        let security = AlignedBytes::new(&pipe_descriptor());
        let first = create_pipe_server(&pipe_path, &security, true)
            .with_context(|| format!("Couldn't create named pipe `{pipe_path}`"))?;

        Ok(Self {
            pipe_path,
            security,
            pending: Some(first),
        })
    }

    /// Cancel-safe: the pending pipe instance survives a dropped call.
    pub async fn next_client(&mut self) -> Result<ServerStream> {
        if self.pending.is_none() {
            self.pending = Some(self.bind_to_pipe().await?);
        }
        if let Some(server) = &self.pending {
            server
                .connect()
                .await
                .context("Couldn't accept IPC connection")?;
        }
        let server = self
            .pending
            .take()
            .context("Pending pipe instance vanished")?;
        let handle = HANDLE(server.as_raw_handle());
        let mut client_pid: u32 = 0;
        // SAFETY: Windows doesn't store this pointer or handle, and we just got the handle
        // from Tokio, so it should be valid.
        unsafe { GetNamedPipeClientProcessId(handle, &mut client_pid) }
            .context("Couldn't get PID of named pipe client")?;
        tracing::info!(?client_pid, "Accepted IPC connection");

        match create_pipe_server(&self.pipe_path, &self.security, false) {
            Ok(next) => self.pending = Some(next),
            Err(error) => tracing::debug!("Couldn't create the next pipe instance yet: {error:#}"),
        }

        Ok(server)
    }

    async fn bind_to_pipe(&self) -> Result<ServerStream> {
        const NUM_ITERS: usize = 10;

        for i in 0..NUM_ITERS {
            match create_pipe_server(&self.pipe_path, &self.security, false) {
                Ok(server) => return Ok(server),
                Err(error) => {
                    tracing::debug!("Couldn't bind the pipe, sleeping... (loop {i}): {error:#}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        bail!("Tried {NUM_ITERS} times to bind the pipe and failed");
    }
}

/// SYSTEM and administrators get full control, signed-in users may read and write.
///
/// No owner, the creator's token supplies it.
fn pipe_descriptor() -> Vec<u8> {
    let mut sd = build_exclusive_access(&AccessRule::allow(
        Sid::local_system(),
        AccessRights::FULL_CONTROL,
    ));
    sd.set_owner(None);
    set_access(
        &mut sd,
        &AccessRule::allow(Sid::builtin_administrators(), AccessRights::FULL_CONTROL),
    );
    set_access(
        &mut sd,
        &AccessRule::allow(
            Sid::authenticated_users(),
            AccessRights::READ | AccessRights::WRITE,
        ),
    );

    sd.to_bytes()
}

fn create_pipe_server(
    pipe_path: &str,
    security: &AlignedBytes,
    first: bool,
) -> Result<ServerStream> {
    let mut server_options = named_pipe::ServerOptions::new();
    server_options
        .first_pipe_instance(first)
        .reject_remote_clients(true);

    let mut sa = SECURITY_ATTRIBUTES {
        nLength: 0,
        lpSecurityDescriptor: security.as_ptr().cast_mut(),
        bInheritHandle: false.into(),
    };
    sa.nLength = std::mem::size_of_val(&sa)
        .try_into()
        .context("Size of SECURITY_ATTRIBUTES struct is not right")?;

    let sa_ptr = &mut sa as *mut _ as *mut c_void;
    // SAFETY: `sa` and the descriptor it points to outlive the call and Windows copies them.
    let server = unsafe { server_options.create_with_security_attributes_raw(pipe_path, sa_ptr) }?;

    Ok(server)
}

/// e.g. `\\.\pipe\dev.tunnelkeeper.service_control.ipc`
fn ipc_path(id: SocketId) -> String {
    let name = match id {
        SocketId::Control => format!("{BUNDLE_ID}_control.ipc"),
        SocketId::Test(id) => format!("{BUNDLE_ID}_test_{id}.ipc"),
    };

    format!(r"\\.\pipe\{name}")
}

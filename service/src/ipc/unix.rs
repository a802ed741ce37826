//! Unix domain sockets, for running the daemon and its tests on Linux and macOS.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use bin_shared::known_dirs;
use tokio::net::{UnixListener, UnixStream};

use super::{NotFound, SocketId};

pub struct Server {
    listener: UnixListener,
    path: PathBuf,
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), "Failed to delete IPC socket: {e}");
        }
    }
}

pub(crate) type ClientStream = UnixStream;

pub type ServerStream = UnixStream;

#[expect(clippy::wildcard_enum_match_arm)]
pub(crate) async fn connect_to_socket(id: SocketId) -> Result<ClientStream> {
    let path = ipc_path(id);
    let stream = UnixStream::connect(&path)
        .await
        .map_err(|error| match error.kind() {
            ErrorKind::NotFound => anyhow::Error::new(NotFound(path.display().to_string())),
            _ => anyhow::Error::new(error),
        })
        .context("Couldn't connect to Unix domain socket")?;
    let cred = stream
        .peer_cred()
        .context("Couldn't get PID of UDS server")?;
    tracing::debug!(
        uid = cred.uid(),
        gid = cred.gid(),
        pid = cred.pid(),
        "Made an IPC connection"
    );

    Ok(stream)
}

impl Server {
    pub fn new(id: SocketId) -> Result<Self> {
        let path = ipc_path(id);

        tracing::debug!(socket = %path.display(), "Creating new IPC server");

        // A socket nobody answers on was left by a previous run. One that answers belongs to a
        // live service, maybe of another installation, and unlinking it would orphan that service.
        match std::os::unix::net::UnixStream::connect(&path) {
            Ok(_) => bail!("Another service is already listening on `{}`", path.display()),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                tracing::debug!(socket = %path.display(), "Removing stale IPC socket: {error}");
                std::fs::remove_file(&path)
                    .with_context(|| format!("Couldn't remove stale UDS `{}`", path.display()))?;
            }
        }
        let dir = path
            .parent()
            .context("`path` should always have a parent")?;
        std::fs::create_dir_all(dir).context("Failed to create socket parent directory")?;
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Couldn't bind UDS `{}`", path.display()))?;
        let perms = std::fs::Permissions::from_mode(0o660);
        std::fs::set_permissions(&path, perms).context("Failed to set permissions on UDS")?;

        Ok(Self { listener, path })
    }

    pub async fn next_client(&mut self) -> Result<ServerStream> {
        let (stream, _) = self.listener.accept().await?;
        let cred = stream.peer_cred()?;
        tracing::info!(
            uid = cred.uid(),
            gid = cred.gid(),
            pid = cred.pid(),
            "Accepted an IPC connection"
        );

        Ok(stream)
    }
}

/// e.g. `/run/user/1000/dev.tunnelkeeper.service/control.sock`
fn ipc_path(id: SocketId) -> PathBuf {
    let dir = known_dirs::runtime();

    match id {
        SocketId::Control => dir.join("control.sock"),
        SocketId::Test(id) => dir.join(format!("ipc_test_{id}.sock")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn socket_lives_in_the_runtime_dir() {
        let path = ipc_path(SocketId::Control);

        assert!(path.starts_with(known_dirs::runtime()));
        assert_ne!(path, ipc_path(SocketId::Test("A")));
    }

    #[tokio::test]
    async fn live_socket_is_never_taken_over() {
        let _guard = logging::test("debug");
        const ID: SocketId = SocketId::Test("LIVE1");
        let mut first = Server::new(ID).unwrap();

        let err = Server::new(ID).err().unwrap();
        assert!(err.to_string().starts_with("Another service is already listening"));

        // The first server still owns the path and accepts clients.
        let client = tokio::spawn(connect_to_socket(ID));
        tokio::time::timeout(Duration::from_secs(5), first.next_client())
            .await
            .unwrap()
            .unwrap();
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        const ID: SocketId = SocketId::Test("STALE1");
        let path = ipc_path(ID);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let _ = std::fs::remove_file(&path);
        // A std listener leaves its socket file behind when dropped, like a crashed daemon.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = Server::new(ID).unwrap();

        assert_eq!(server.path, path);
    }

    #[tokio::test]
    async fn socket_is_group_accessible_and_removed_on_drop() {
        let server = Server::new(SocketId::Test("PERMS1")).unwrap();
        let path = server.path.clone();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        drop(server);
        assert!(!path.exists());
    }
}

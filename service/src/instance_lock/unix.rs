use std::fs::{self, File, OpenOptions};
use std::io::Write as _;

use anyhow::{Context as _, Result};
use bin_shared::known_dirs;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

/// An exclusive `flock` on `<runtime dir>/<name>.lock`.
///
/// The kernel drops the lock when the process dies, so a stale file never blocks a new instance.
#[derive(Debug)]
pub(crate) struct Lock {
    _file: Flock<File>,
}

impl Lock {
    pub(crate) fn acquire(name: &str) -> Result<Option<Self>> {
        let dir = known_dirs::runtime();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create `{}`", dir.display()))?;
        let path = dir.join(format!("{name}.lock"));

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;

        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, Errno::EWOULDBLOCK)) => return Ok(None),
            Err((_, errno)) => {
                return Err(errno).with_context(|| format!("Failed to lock `{}`", path.display()));
            }
        };

        // Only for humans looking for the owner.
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;

        Ok(Some(Self { _file: file }))
    }
}

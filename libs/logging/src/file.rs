//! File logger for the service.
//!
//! Each process writes one file, `<base>.<timestamp>.log`, in the log directory.
//! Files are never rotated while the process runs. Old files are pruned by
//! [`crate::cleanup::enforce_size_cap`] when the daemon starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{Layer, registry::LookupSpan};

const FILE_EXTENSION: &str = "log";

const TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");

/// Lines buffered on the way to the writer thread. Only needs to absorb bursts.
const MAX_BUFFERED_LINES: usize = 1024;

/// Creates a layer that writes to a new file in `log_dir`.
///
/// The directory is created on the first write if needed.
pub fn layer<T>(
    log_dir: &Path,
    file_base_name: &'static str,
) -> (Box<dyn Layer<T> + Send + Sync + 'static>, Handle)
where
    T: Subscriber + for<'a> LookupSpan<'a>,
{
    let (writer, guard) = new_appender(log_dir.to_path_buf(), file_base_name);
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .event_format(crate::Format::new())
        .boxed();

    (
        layer,
        Handle {
            _guard: Arc::new(guard),
        },
    )
}

fn new_appender(directory: PathBuf, file_base_name: &'static str) -> (NonBlocking, WorkerGuard) {
    let appender = Appender {
        directory,
        file_base_name,
        current: None,
    };

    NonBlockingBuilder::default()
        .buffered_lines_limit(MAX_BUFFERED_LINES)
        .finish(appender)
}

/// Keeps the writer thread alive.
///
/// Dropping the last clone flushes and stops it, so hold on to this for as long as the process logs.
#[must_use]
#[derive(Clone, Debug)]
pub struct Handle {
    _guard: Arc<WorkerGuard>,
}

#[derive(Debug)]
struct Appender {
    directory: PathBuf,
    file_base_name: &'static str,
    /// Opened lazily so that I/O errors surface through `write`.
    current: Option<(fs::File, PathBuf)>,
}

impl Appender {
    fn file(&mut self) -> io::Result<&mut fs::File> {
        // Someone deleted the file underneath us, e.g. a user clearing the log directory.
        if self
            .current
            .as_ref()
            .is_some_and(|(_, path)| !path.exists())
        {
            self.current = None;
        }

        if self.current.is_none() {
            self.current = Some(self.open_new()?);
        }

        match self.current.as_mut() {
            Some((file, _)) => Ok(file),
            None => Err(io::Error::other("Log file vanished")),
        }
    }

    fn open_new(&self) -> io::Result<(fs::File, PathBuf)> {
        let timestamp = OffsetDateTime::now_utc()
            .format(TIMESTAMP)
            .map_err(io::Error::other)?;
        let path = self.directory.join(format!(
            "{}.{timestamp}.{FILE_EXTENSION}",
            self.file_base_name
        ));

        fs::create_dir_all(&self.directory)?;
        let file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)?;

        #[cfg(unix)]
        {
            let latest = self.directory.join("latest");
            let _ = fs::remove_file(&latest);
            let _ = std::os::unix::fs::symlink(&path, &latest);
        }

        Ok((file, path))
    }
}

impl io::Write for Appender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

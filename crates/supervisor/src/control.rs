//! The control FIFO: the on-disk named pipe through which the operator
//! injects replacement channel addresses.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use rustix::fs::{FileType, Mode, OFlags, mknodat, open, CWD};
use rustix::io::Errno;
use tracing::warn;

use crate::SupervisorError;

/// Longest socket path a control message may name, per `sockaddr_un`.
pub const MAX_SOCKET_PATH: usize = 108;

/// An open control FIFO owned by the supervisor.
pub struct ControlPipe {
    path: PathBuf,
    fd: OwnedFd,
    pending: Vec<u8>,
}

impl ControlPipe {
    /// Creates the FIFO at `path` with mode 0644 and opens it.
    ///
    /// The descriptor is opened read-write: with no writer connected a
    /// read-only FIFO would report a hangup on every poll.
    pub fn create(path: &Path) -> Result<Self, SupervisorError> {
        match mknodat(CWD, path, FileType::Fifo, Mode::from_raw_mode(0o644), 0) {
            Ok(()) | Err(Errno::EXIST) => {}
            Err(err) => return Err(err.into()),
        }
        let fd = open(
            path,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self {
            path: path.to_path_buf(),
            fd,
            pending: Vec::new(),
        })
    }

    /// Descriptor for inclusion in a pollset.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Location of the FIFO on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads whatever is available and returns the complete socket paths
    /// seen so far, in write order.
    ///
    /// Messages are NUL-or-newline-terminated; oversized or empty entries
    /// are logged and skipped.
    pub fn read_paths(&mut self) -> Result<Vec<PathBuf>, SupervisorError> {
        let mut buf = [0u8; 4096];
        loop {
            match rustix::io::read(&self.fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(Errno::AGAIN) => break,
                Err(Errno::INTR) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut paths = Vec::new();
        while let Some(end) = self
            .pending
            .iter()
            .position(|&byte| byte == b'\n' || byte == 0)
        {
            let line: Vec<u8> = self.pending.drain(..=end).take(end).collect();
            if line.is_empty() {
                continue;
            }
            if line.len() >= MAX_SOCKET_PATH {
                warn!("control message of {} bytes exceeds socket path limit", line.len());
                continue;
            }
            paths.push(PathBuf::from(String::from_utf8_lossy(&line).into_owned()));
        }
        Ok(paths)
    }

}

impl Drop for ControlPipe {
    /// The supervisor owns the FIFO it created; it does not outlive the
    /// session.
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(
                "could not unlink control pipe {}: {err}",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_round_trips_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fifo_path = dir.path().join("control");
        let mut pipe = ControlPipe::create(&fifo_path).expect("create fifo");

        let metadata = std::fs::metadata(&fifo_path).expect("stat fifo");
        assert!(std::os::unix::fs::FileTypeExt::is_fifo(&metadata.file_type()));

        // The pipe is open read-write, so this write cannot block on a
        // missing reader.
        rustix::io::write(&pipe.fd, b"/tmp/new-socket\n/tmp/other\0").expect("write");
        let paths = pipe.read_paths().expect("read");
        assert_eq!(
            paths,
            vec![PathBuf::from("/tmp/new-socket"), PathBuf::from("/tmp/other")]
        );
        assert!(pipe.read_paths().expect("read again").is_empty());
    }

    #[test]
    fn oversized_messages_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pipe = ControlPipe::create(&dir.path().join("control")).expect("create fifo");
        let mut message = vec![b'x'; 200];
        message.push(b'\n');
        message.extend_from_slice(b"/tmp/fine\n");
        rustix::io::write(&pipe.fd, &message).expect("write");
        let paths = pipe.read_paths().expect("read");
        assert_eq!(paths, vec![PathBuf::from("/tmp/fine")]);
    }

    #[test]
    fn partial_writes_wait_for_their_terminator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut pipe = ControlPipe::create(&dir.path().join("control")).expect("create fifo");
        rustix::io::write(&pipe.fd, b"/tmp/half").expect("write");
        assert!(pipe.read_paths().expect("read").is_empty());
        rustix::io::write(&pipe.fd, b"way\n").expect("write");
        assert_eq!(
            pipe.read_paths().expect("read"),
            vec![PathBuf::from("/tmp/halfway")]
        );
    }
}

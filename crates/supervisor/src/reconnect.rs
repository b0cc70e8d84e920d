//! The reconnection helper: watches the control FIFO for a replacement
//! channel address and hands freshly-dialed sockets to its worker.

use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;

use protocol::ConnectionToken;
use rustix::event::{PollFd, PollFlags, Timespec, poll};
use rustix::io::Errno;
use tracing::{debug, info, warn};

use crate::SupervisorError;
use crate::control::ControlPipe;
use crate::link;
use crate::signal;

/// Runs the helper loop until the worker hangs up the link.
///
/// On every control message: dial the named socket, write the session's
/// update-flagged token, pass the socket across the link, return to
/// waiting. A failed dial is logged and does not terminate the helper.
pub fn run_helper(
    mut control: ControlPipe,
    link: &UnixStream,
    token: ConnectionToken,
    stop: &signal::StopFlag,
) {
    let update = token.flag_update();
    loop {
        if stop.should_stop() {
            return;
        }
        let control_fd = control.as_fd();
        let mut fds = [
            PollFd::new(&control_fd, PollFlags::IN),
            PollFd::new(link, PollFlags::IN),
        ];
        let wait = Timespec {
            tv_sec: 0,
            tv_nsec: 500_000_000,
        };
        match poll(&mut fds, Some(&wait)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(err) => {
                warn!("reconnection helper poll failed: {err}");
                return;
            }
        }
        // Any link event is the worker going away; it never writes here.
        if !fds[1].revents().is_empty() {
            debug!("worker hung up the link, reconnection helper exiting");
            return;
        }
        if fds[0].revents().contains(PollFlags::IN) {
            let paths = match control.read_paths() {
                Ok(paths) => paths,
                Err(err) => {
                    warn!("control pipe read failed: {err}");
                    continue;
                }
            };
            for path in paths {
                if let Err(err) = push_replacement(&path, link, update) {
                    info!(
                        "reconnect to {} failed, keeping current channel: {err}",
                        path.display()
                    );
                }
            }
        }
    }
}

fn push_replacement(
    path: &Path,
    link: &UnixStream,
    update: ConnectionToken,
) -> Result<(), SupervisorError> {
    let mut channel = UnixStream::connect(path)?;
    channel.write_all(&update.encode())?;
    link::send_fd(link, channel.as_fd())?;
    info!("replacement channel {} handed to worker", path.display());
    // The local copy closes here; the worker owns the passed duplicate.
    Ok(())
}

/// Spawns the helper on its own thread.
pub fn spawn_helper(
    control: ControlPipe,
    link: UnixStream,
    token: ConnectionToken,
    stop: signal::StopFlag,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("reconnect-helper".to_owned())
        .spawn(move || run_helper(control, &link, token, &stop))
        .expect("spawn reconnection helper")
}

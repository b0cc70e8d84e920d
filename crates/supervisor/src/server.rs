//! Session entry point: application lifecycle, display socket, and the
//! oneshot/multi connection runners.

use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::thread;

use protocol::ConnectionToken;
use rustix::event::{PollFd, PollFlags, Timespec, poll};
use rustix::io::Errno;
use tracing::{debug, info, warn};

use crate::SupervisorError;
use crate::config::SessionConfig;
use crate::control::{ControlPipe, MAX_SOCKET_PATH};
use crate::link;
use crate::reconnect;
use crate::signal;
use crate::spawn::{AppSocket, launch_application};
use crate::worker;

/// Everything `run_server` needs to know, assembled by the front-end.
pub struct ServerOptions {
    /// Unix socket path of the channel (the tunnel's local end).
    pub channel_socket: PathBuf,
    /// Display socket: absolute path, or a name under `$XDG_RUNTIME_DIR`.
    pub wayland_display: OsString,
    /// Control FIFO path; presence makes the session reconnectable.
    pub control_path: Option<PathBuf>,
    /// Session configuration shared with every worker.
    pub config: SessionConfig,
    /// One application connection over one channel connection, no accept
    /// loop.
    pub oneshot: bool,
    /// Unlink the display socket when the session ends.
    pub unlink_at_end: bool,
    /// Application argv; empty launches a shell from `$SHELL`.
    pub command: Vec<OsString>,
    /// Request a login shell when falling back to `$SHELL`.
    pub login_shell: bool,
}

/// One live reconnectable connection.
struct ConnectionRow {
    token: ConnectionToken,
    link: Option<UnixStream>,
    handle: thread::JoinHandle<()>,
}

/// Runs a server-side session to completion.
///
/// Returns the application's exit status; supervisor-level bring-up
/// failures surface as errors instead.
pub fn run_server(options: ServerOptions) -> Result<i32, SupervisorError> {
    let display_path = display_socket_path(
        &options.wayland_display,
        std::env::var_os("XDG_RUNTIME_DIR").as_deref(),
    )?;
    let control = options
        .control_path
        .as_deref()
        .map(ControlPipe::create)
        .transpose()?;

    let result = if options.oneshot {
        run_oneshot(&options, control)
    } else {
        run_multi(&options, &display_path, control)
    };

    if options.unlink_at_end && !options.oneshot {
        if let Err(err) = std::fs::remove_file(&display_path) {
            debug!("display socket already gone: {err}");
        }
    }
    result
}

/// Resolves the display socket location per the Wayland convention.
fn display_socket_path(
    display: &OsStr,
    runtime_dir: Option<&OsStr>,
) -> Result<PathBuf, SupervisorError> {
    let path = if display.as_bytes().starts_with(b"/") {
        PathBuf::from(display)
    } else {
        let runtime = runtime_dir.ok_or_else(|| SupervisorError::MissingRuntimeDir {
            display: display.to_string_lossy().into_owned(),
        })?;
        Path::new(runtime).join(display)
    };
    if path.as_os_str().as_bytes().len() >= MAX_SOCKET_PATH {
        return Err(SupervisorError::NameTooLong { path });
    }
    Ok(path)
}

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map_or(1, |signal| 128 + signal)
    })
}

fn wait_application(mut child: Child) -> Result<i32, SupervisorError> {
    Ok(status_code(child.wait()?))
}

fn dial_channel(path: &Path, token: &ConnectionToken) -> Result<UnixStream, SupervisorError> {
    let mut channel = UnixStream::connect(path)?;
    channel.write_all(&token.encode())?;
    Ok(channel)
}

fn run_oneshot(
    options: &ServerOptions,
    control: Option<ControlPipe>,
) -> Result<i32, SupervisorError> {
    let (app_side, child_side) = UnixStream::pair()?;
    let child = launch_application(
        &options.command,
        AppSocket::Inherited(child_side.into()),
        options.login_shell,
    )?;

    let reconnectable = control.is_some();
    let token = ConnectionToken::mint(reconnectable, false)?;
    let channel = dial_channel(&options.channel_socket, &token)?;
    info!(
        "oneshot session established over {}",
        options.channel_socket.display()
    );

    let stop = signal::StopFlag::new();
    let mut helper = None;
    let mut worker_link = None;
    if let Some(control) = control {
        let (helper_side, worker_side) = UnixStream::pair()?;
        helper = Some(reconnect::spawn_helper(
            control,
            helper_side,
            token,
            stop.clone(),
        ));
        worker_link = Some(worker_side);
    }

    let session = worker::main_interface_loop(
        channel,
        app_side,
        worker_link,
        &options.config,
        false,
        stop.clone(),
    );
    if let Err(err) = session {
        warn!("connection worker failed: {err}");
    }
    stop.raise();
    if let Some(handle) = helper {
        // The worker's link end is gone; the helper notices the hangup.
        if handle.join().is_err() {
            warn!("reconnection helper panicked");
        }
    }
    wait_application(child)
}

fn run_multi(
    options: &ServerOptions,
    display_path: &Path,
    mut control: Option<ControlPipe>,
) -> Result<i32, SupervisorError> {
    let listener = UnixListener::bind(display_path)?;
    listener.set_nonblocking(true)?;
    info!("listening on {}", display_path.display());

    let mut child = launch_application(
        &options.command,
        AppSocket::Display(options.wayland_display.clone()),
        options.login_shell,
    )?;

    let stop = signal::StopFlag::new();
    let mut channel_path = options.channel_socket.clone();
    let mut rows: Vec<ConnectionRow> = Vec::new();
    let mut app_status = None;

    loop {
        if stop.should_stop() {
            break;
        }
        if let Some(status) = child.try_wait()? {
            app_status = Some(status_code(status));
            break;
        }
        reap_finished(&mut rows);

        let tick = Timespec {
            tv_sec: 0,
            tv_nsec: 200_000_000,
        };
        let (accept_ready, control_ready) = {
            let control_fd = control.as_ref().map(ControlPipe::as_fd);
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(&listener, PollFlags::IN));
            if let Some(fd) = &control_fd {
                fds.push(PollFd::new(fd, PollFlags::IN));
            }
            match poll(&mut fds, Some(&tick)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
            (
                fds[0].revents().contains(PollFlags::IN),
                fds.get(1)
                    .is_some_and(|fd| fd.revents().contains(PollFlags::IN)),
            )
        };

        if accept_ready {
            accept_connections(
                &listener,
                &channel_path,
                options,
                control.is_some(),
                &mut rows,
                &stop,
            );
        }
        if control_ready {
            if let Some(control) = control.as_mut() {
                for path in control.read_paths()? {
                    if migrate_rows(&mut rows, &path) {
                        channel_path = path;
                    }
                }
            }
        }
    }

    stop.raise();
    for row in rows {
        drop(row.link);
        if row.handle.join().is_err() {
            warn!("connection worker panicked during shutdown");
        }
    }
    // Dropping the control pipe unlinks its FIFO.
    drop(control);

    match app_status {
        Some(code) => Ok(code),
        None => wait_application(child),
    }
}

fn reap_finished(rows: &mut Vec<ConnectionRow>) {
    let mut index = 0;
    while index < rows.len() {
        if rows[index].handle.is_finished() {
            let row = rows.remove(index);
            if row.handle.join().is_err() {
                warn!("connection worker panicked");
            }
            debug!("reaped finished connection worker");
        } else {
            index += 1;
        }
    }
}

fn accept_connections(
    listener: &UnixListener,
    channel_path: &Path,
    options: &ServerOptions,
    reconnectable: bool,
    rows: &mut Vec<ConnectionRow>,
    stop: &signal::StopFlag,
) {
    loop {
        let app_stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("accept failed: {err}");
                return;
            }
        };
        if let Err(err) =
            start_connection(app_stream, channel_path, options, reconnectable, rows, stop)
        {
            warn!("could not establish connection worker: {err}");
        }
    }
}

fn start_connection(
    app_stream: UnixStream,
    channel_path: &Path,
    options: &ServerOptions,
    reconnectable: bool,
    rows: &mut Vec<ConnectionRow>,
    stop: &signal::StopFlag,
) -> Result<(), SupervisorError> {
    let token = ConnectionToken::mint(reconnectable, false)?;
    let channel = dial_channel(channel_path, &token)?;
    let (link, worker_link) = if reconnectable {
        let (supervisor_side, worker_side) = UnixStream::pair()?;
        (Some(supervisor_side), Some(worker_side))
    } else {
        (None, None)
    };
    let config = options.config.clone();
    let stop = stop.clone();
    let handle = thread::Builder::new()
        .name("connection-worker".to_owned())
        .spawn(move || {
            if let Err(err) =
                worker::main_interface_loop(channel, app_stream, worker_link, &config, false, stop)
            {
                warn!("connection worker failed: {err}");
            }
        })
        .expect("spawn connection worker");
    rows.push(ConnectionRow {
        token,
        link,
        handle,
    });
    debug!("connection worker started");
    Ok(())
}

/// Moves every surviving row to a new channel address.
///
/// All-or-nothing: every row is dialed and token-stamped before any fd is
/// passed; the first failure closes the fresh sockets and leaves every
/// worker on the old address. Returns whether the new address was adopted.
fn migrate_rows(rows: &mut [ConnectionRow], path: &Path) -> bool {
    let mut dialed = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        match dial_channel(path, &row.token.flag_update()) {
            Ok(stream) => dialed.push(stream),
            Err(err) => {
                warn!(
                    "migration to {} aborted, keeping current channel: {err}",
                    path.display()
                );
                return false;
            }
        }
    }
    for (row, stream) in rows.iter().zip(dialed) {
        let Some(link) = &row.link else { continue };
        if let Err(err) = link::send_fd(link, stream.as_fd()) {
            // The worker is likely gone; its row reaps on the next loop.
            warn!("could not hand replacement channel to worker: {err}");
        }
    }
    info!("migrated {} connection(s) to {}", rows.len(), path.display());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_display_is_used_verbatim() {
        let path = display_socket_path(OsStr::new("/run/user/1000/wayland-9"), None)
            .expect("absolute path");
        assert_eq!(path, PathBuf::from("/run/user/1000/wayland-9"));
    }

    #[test]
    fn relative_display_joins_the_runtime_dir() {
        let path = display_socket_path(
            OsStr::new("wayland-1"),
            Some(OsStr::new("/run/user/1000")),
        )
        .expect("joined path");
        assert_eq!(path, PathBuf::from("/run/user/1000/wayland-1"));
    }

    #[test]
    fn relative_display_without_runtime_dir_fails() {
        assert!(matches!(
            display_socket_path(OsStr::new("wayland-1"), None),
            Err(SupervisorError::MissingRuntimeDir { .. })
        ));
    }

    #[test]
    fn oversized_path_is_refused() {
        let long = format!("/tmp/{}", "x".repeat(150));
        assert!(matches!(
            display_socket_path(OsStr::new(&long), None),
            Err(SupervisorError::NameTooLong { .. })
        ));
    }
}

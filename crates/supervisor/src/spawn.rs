//! Application launch: environment wiring, login-shell fallback, and the
//! descriptor handed to the child in oneshot mode.

use std::ffi::OsString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};

use crate::SupervisorError;

/// How the application finds its compositor-facing socket.
pub enum AppSocket {
    /// Oneshot mode: the child inherits this descriptor as
    /// `WAYLAND_SOCKET`.
    Inherited(OwnedFd),
    /// Multi mode: the child connects to `WAYLAND_DISPLAY` itself.
    Display(OsString),
}

/// Launches the application process.
///
/// An empty `command` falls back to `$SHELL` (or `/bin/sh`); with
/// `login_shell` set the invocation name is prefixed with `-` so the shell
/// initializes as a login shell.
pub fn launch_application(
    command: &[OsString],
    socket: AppSocket,
    login_shell: bool,
) -> Result<Child, SupervisorError> {
    let shell;
    let (program, args) = if command.is_empty() {
        shell = std::env::var_os("SHELL").unwrap_or_else(|| OsString::from("/bin/sh"));
        (&shell, &[] as &[OsString])
    } else {
        (&command[0], &command[1..])
    };

    let mut child = Command::new(program);
    child.args(args);

    if command.is_empty() && login_shell {
        let name = Path::new(program)
            .file_name()
            .map_or_else(|| program.clone(), OsString::from);
        let mut argv0 = OsString::from("-");
        argv0.push(name);
        child.arg0(argv0);
    }

    match &socket {
        AppSocket::Inherited(fd) => {
            let raw = fd.as_raw_fd();
            child.env("WAYLAND_SOCKET", raw.to_string());
            child.env_remove("WAYLAND_DISPLAY");
            // SAFETY: the hook only calls fcntl, which is safe after fork.
            unsafe {
                child.pre_exec(move || {
                    let flags = libc::fcntl(raw, libc::F_GETFD);
                    if flags == -1
                        || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        AppSocket::Display(display) => {
            child.env("WAYLAND_DISPLAY", display);
            child.env_remove("WAYLAND_SOCKET");
        }
    }

    let spawned = child.spawn().map_err(|source| SupervisorError::Spawn {
        command: program.to_string_lossy().into_owned(),
        source,
    })?;
    // The parent's copy of the inherited descriptor closes here; the child
    // keeps its own.
    drop(socket);
    Ok(spawned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    #[test]
    fn exit_status_propagates() {
        let command = [
            OsString::from("sh"),
            OsString::from("-c"),
            OsString::from("exit 7"),
        ];
        let mut child = launch_application(
            &command,
            AppSocket::Display(OsString::from("wayland-test")),
            false,
        )
        .expect("spawn");
        let status = child.wait().expect("wait");
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn oneshot_child_sees_a_usable_wayland_socket() {
        let (parent, child_end) = UnixStream::pair().expect("socketpair");
        let command = [
            OsString::from("sh"),
            OsString::from("-c"),
            OsString::from("eval \"printf hello >&$WAYLAND_SOCKET\""),
        ];
        let mut spawned = launch_application(
            &command,
            AppSocket::Inherited(child_end.into()),
            false,
        )
        .expect("spawn");
        assert!(spawned.wait().expect("wait").success());

        let mut parent = parent;
        let mut buf = [0u8; 5];
        parent.read_exact(&mut buf).expect("read child bytes");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn display_mode_clears_the_socket_variable() {
        let command = [
            OsString::from("sh"),
            OsString::from("-c"),
            OsString::from("test -z \"$WAYLAND_SOCKET\" && test \"$WAYLAND_DISPLAY\" = wl-7"),
        ];
        let mut child = launch_application(
            &command,
            AppSocket::Display(OsString::from("wl-7")),
            false,
        )
        .expect("spawn");
        assert!(child.wait().expect("wait").success());
    }

    #[test]
    fn missing_program_reports_spawn_error() {
        let command = [OsString::from("/nonexistent/waybridge-app")];
        assert!(matches!(
            launch_application(
                &command,
                AppSocket::Display(OsString::from("wl-0")),
                false
            ),
            Err(SupervisorError::Spawn { .. })
        ));
    }
}

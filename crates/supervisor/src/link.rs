//! Link sockets: ancillary-message fd passing between the supervisor or
//! reconnection helper and a per-connection worker.

use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use rustix::io::retry_on_intr;
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};

use crate::SupervisorError;

/// Byte carried alongside a passed descriptor, so the receiver always has
/// one datum to read.
const FD_MARKER: u8 = 0x66;

/// Passes one descriptor across the link.
pub fn send_fd(link: &UnixStream, fd: BorrowedFd<'_>) -> Result<(), SupervisorError> {
    let iov = [IoSlice::new(&[FD_MARKER])];
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space);
    let fds = [fd];
    cmsg_buffer.push(SendAncillaryMessage::ScmRights(&fds));
    retry_on_intr(|| sendmsg(link, &iov, &mut cmsg_buffer, SendFlags::NOSIGNAL))?;
    Ok(())
}

/// Receives one descriptor from the link, blocking until it arrives.
///
/// Returns [`SupervisorError::LinkClosed`] when the peer hung up instead.
pub fn recv_fd(link: &UnixStream) -> Result<OwnedFd, SupervisorError> {
    let mut marker = [0u8; 1];
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);
    let mut iov = [IoSliceMut::new(&mut marker)];
    let msg = retry_on_intr(|| recvmsg(link, &mut iov, &mut cmsg_buffer, RecvFlags::CMSG_CLOEXEC))?;
    if msg.bytes == 0 {
        return Err(SupervisorError::LinkClosed);
    }
    cmsg_buffer
        .drain()
        .filter_map(|cmsg| match cmsg {
            RecvAncillaryMessage::ScmRights(fds) => Some(fds),
            _ => None,
        })
        .flatten()
        .next()
        .ok_or(SupervisorError::LinkClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    #[test]
    fn descriptor_survives_the_crossing() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        let (mut payload_in, payload_out) = UnixStream::pair().expect("payload pair");

        send_fd(&left, payload_out.as_fd()).expect("send fd");
        let received = recv_fd(&right).expect("receive fd");
        drop(payload_out);

        let mut received = UnixStream::from(received);
        received.write_all(b"crossed").expect("write");
        drop(received);
        let mut buf = String::new();
        payload_in.read_to_string(&mut buf).expect("read");
        assert_eq!(buf, "crossed");
    }

    #[test]
    fn hangup_reports_link_closed() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        drop(left);
        assert!(matches!(recv_fd(&right), Err(SupervisorError::LinkClosed)));
    }
}

//! The per-connection worker: one channel socket, one application socket,
//! one shadow table, one pool.
//!
//! The loop forwards the application byte stream as `Protocol` blocks,
//! pumps shadow-table updates through the pool and transfer queue, and
//! applies received blocks. When a link socket is present it survives
//! channel loss by blocking for a replacement descriptor and replaying
//! retained segments past the peer's acknowledgement.

use std::collections::{HashSet, VecDeque};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use pool::WorkerPool;
use protocol::frame::{self, FrameHeader, HEADER_LEN, TransferKind};
use rustix::event::{PollFd, PollFlags, Timespec, poll};
use rustix::io::Errno;
use shadow::{Role, ShadowError, ShadowTable};
use tracing::{debug, trace, warn};
use transfer::TransferQueue;

use crate::SupervisorError;
use crate::config::SessionConfig;
use crate::link;
use crate::signal;

/// Receiver acknowledges after this many data blocks, bounding the
/// sender's replay retention.
const ACK_INTERVAL: u64 = 64;

const READ_CHUNK: usize = 16 * 1024;

/// Drives one connection until the channel or application side closes.
///
/// With `link` present, a channel loss blocks on the link for a
/// replacement descriptor and resumes from the last acknowledged message
/// number instead of terminating.
pub fn main_interface_loop(
    channel: UnixStream,
    application: UnixStream,
    link: Option<UnixStream>,
    config: &SessionConfig,
    is_client: bool,
    stop: signal::StopFlag,
) -> Result<(), SupervisorError> {
    channel.set_nonblocking(true)?;
    application.set_nonblocking(true)?;
    let role = if is_client { Role::Client } else { Role::Server };
    let mut worker = Worker {
        channel,
        application,
        link,
        stop,
        table: ShadowTable::new(role, config.compression, config.gpu_enabled()),
        workers: WorkerPool::new(config.effective_threads())?,
        queue: Arc::new(TransferQueue::new()),
        recv_buf: Vec::new(),
        app_out: Vec::new(),
        control_out: Vec::new(),
        current: None,
        flushed_below: 0,
        replay_watermark: None,
        recv_count: 0,
        acked_sent: 0,
        pending_finish: VecDeque::new(),
        collecting: HashSet::new(),
        resuming: false,
        awaiting_restart: false,
        app_eof: false,
        replicas: Vec::new(),
    };
    worker.run()
}

struct Worker {
    channel: UnixStream,
    application: UnixStream,
    link: Option<UnixStream>,
    stop: signal::StopFlag,
    table: ShadowTable,
    workers: WorkerPool,
    queue: Arc<TransferQueue>,
    /// Partial frames accumulated from the channel.
    recv_buf: Vec<u8>,
    /// Bytes owed to the application socket.
    app_out: Vec<u8>,
    /// Session-control frames (acks, restarts, replays); written ahead of
    /// queued segments.
    control_out: Vec<u8>,
    /// Segment mid-write: `(number, bytes, offset)`.
    current: Option<(u64, Arc<[u8]>, usize)>,
    /// Every segment numbered below this has fully left this endpoint.
    flushed_below: u64,
    /// After a replay: once `control_out` drains, advance `flushed_below`
    /// here.
    replay_watermark: Option<u64>,
    /// Data blocks received so far.
    recv_count: u64,
    /// Receive count last acknowledged to the peer.
    acked_sent: u64,
    /// Collected rounds awaiting `finish_update`: `(first number past the
    /// round, entry ids)`.
    pending_finish: VecDeque<(u64, Vec<i32>)>,
    /// Ids with a round in `pending_finish`, excluded from re-collection.
    collecting: HashSet<i32>,
    /// A reconnect happened; replay once the peer's acknowledgement
    /// arrives.
    resuming: bool,
    /// A reconnect happened; the next control frame must be the peer's
    /// `Restart`.
    awaiting_restart: bool,
    app_eof: bool,
    /// Replica descriptors reconstituted by `apply_update`, held for the
    /// protocol layer.
    replicas: Vec<(i32, OwnedFd)>,
}

impl Worker {
    fn run(&mut self) -> Result<(), SupervisorError> {
        loop {
            if self.stop.should_stop() {
                debug!("shutdown flag observed, worker exiting");
                return Ok(());
            }
            self.table.drain_streams();
            self.table.flush_streams();
            self.collect_dirty()?;
            if let Some(error) = self.workers.take_error() {
                return Err(error.into());
            }
            self.prime_current();
            self.try_finish()?;
            self.replicas.extend(self.table.take_pending_fds());

            if self.app_eof && self.outgoing_idle() {
                return Ok(());
            }

            let mut want_channel = PollFlags::IN;
            if !self.control_out.is_empty() || self.current.is_some() {
                want_channel |= PollFlags::OUT;
            }
            let mut want_app = PollFlags::empty();
            if !self.app_eof {
                want_app |= PollFlags::IN;
            }
            if !self.app_out.is_empty() {
                want_app |= PollFlags::OUT;
            }
            let completion = self.workers.completion_fd();
            let tick = Timespec {
                tv_sec: 0,
                tv_nsec: 100_000_000,
            };
            {
                let mut fds = [
                    PollFd::new(&self.channel, want_channel),
                    PollFd::new(&self.application, want_app),
                    PollFd::new(&completion, PollFlags::IN),
                ];
                match poll(&mut fds, Some(&tick)) {
                    Ok(_) => {}
                    Err(Errno::INTR) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            self.workers.drain_completions();

            if !self.read_channel()? || !self.write_channel()? {
                if !self.reconnect()? {
                    debug!("channel closed, worker exiting");
                    return Ok(());
                }
                continue;
            }
            self.process_frames()?;
            self.read_application()?;
            self.write_application();
        }
    }

    fn outgoing_idle(&self) -> bool {
        self.control_out.is_empty() && self.current.is_none() && self.queue.is_finished()
    }

    fn collect_dirty(&mut self) -> Result<(), SupervisorError> {
        let dirty: Vec<i32> = self
            .table
            .dirty_ids()
            .into_iter()
            .filter(|id| !self.collecting.contains(id))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        for &id in &dirty {
            self.table.collect_update(id, &self.workers, &self.queue)?;
            self.collecting.insert(id);
        }
        self.pending_finish.push_back((self.queue.reserved(), dirty));
        Ok(())
    }

    fn try_finish(&mut self) -> Result<(), SupervisorError> {
        while let Some((end, ids)) = self.pending_finish.front().cloned() {
            if end > self.flushed_below {
                break;
            }
            for id in ids {
                match self.table.finish_update(id) {
                    Ok(()) => {
                        self.collecting.remove(&id);
                    }
                    // A task committed its block but has not torn down yet;
                    // retry on the next wakeup.
                    Err(ShadowError::TasksInFlight { .. }) => return Ok(()),
                    Err(ShadowError::UnknownId { .. }) => {
                        self.collecting.remove(&id);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            self.pending_finish.pop_front();
        }
        Ok(())
    }

    /// Takes the next committed segment into the write slot, accounting
    /// skipped empties.
    fn prime_current(&mut self) {
        while self.current.is_none() {
            match self.queue.try_next() {
                Some(segment) if segment.bytes.is_empty() => {
                    self.flushed_below = segment.number + 1;
                }
                Some(segment) => {
                    self.current = Some((segment.number, segment.bytes, 0));
                }
                None => break,
            }
        }
    }

    /// Reads everything the channel has; `false` means the peer is gone.
    fn read_channel(&mut self) -> Result<bool, SupervisorError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match rustix::io::read(&self.channel, &mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.recv_buf.extend_from_slice(&buf[..n]),
                Err(Errno::AGAIN) => return Ok(true),
                Err(Errno::INTR) => {}
                Err(Errno::CONNRESET | Errno::PIPE) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn process_frames(&mut self) -> Result<(), SupervisorError> {
        while self.recv_buf.len() >= HEADER_LEN {
            let header =
                FrameHeader::decode(self.recv_buf[..HEADER_LEN].try_into().expect("header"))?;
            let total = frame::block_len(header.size);
            if self.recv_buf.len() < total {
                break;
            }
            let payload: Vec<u8> = self.recv_buf[HEADER_LEN..HEADER_LEN + header.size].to_vec();
            self.recv_buf.drain(..total);
            self.handle_frame(&header, &payload)?;
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<(), SupervisorError> {
        match header.kind {
            TransferKind::Protocol => {
                self.app_out.extend_from_slice(payload);
                self.bump_recv_count();
            }
            TransferKind::Ack => {
                let number = control_word(payload)?;
                self.queue.acknowledge(number.min(self.queue.drained()))?;
                if self.resuming {
                    self.replay_from(number)?;
                    self.resuming = false;
                }
            }
            TransferKind::Restart => {
                let number = control_word(payload)?;
                if !self.awaiting_restart || number != self.recv_count {
                    return Err(SupervisorError::ReplayUnavailable {
                        requested: number,
                        available: self.recv_count,
                    });
                }
                self.awaiting_restart = false;
            }
            _ => {
                self.table.apply_update(header, payload, &self.workers)?;
                self.bump_recv_count();
            }
        }
        Ok(())
    }

    fn bump_recv_count(&mut self) {
        self.recv_count += 1;
        if self.recv_count - self.acked_sent >= ACK_INTERVAL {
            self.push_ack();
        }
    }

    fn push_ack(&mut self) {
        let mut block = Vec::with_capacity(frame::block_len(8));
        frame::write_block(
            &mut block,
            TransferKind::Ack,
            0,
            &self.recv_count.to_le_bytes(),
        )
        .expect("ack frame fits");
        self.control_out.extend_from_slice(&block);
        self.acked_sent = self.recv_count;
    }

    /// Replays retained segments numbered `from` and up onto the fresh
    /// channel, preceded by a `Restart` marker.
    fn replay_from(&mut self, from: u64) -> Result<(), SupervisorError> {
        let segments = self.queue.replay_from(from);
        if let Some(first) = segments.first() {
            if first.number != from && from < self.queue.drained() {
                return Err(SupervisorError::ReplayUnavailable {
                    requested: from,
                    available: first.number,
                });
            }
        }
        let mut restart = Vec::with_capacity(frame::block_len(8));
        frame::write_block(&mut restart, TransferKind::Restart, 0, &from.to_le_bytes())
            .expect("restart frame fits");
        self.control_out.extend_from_slice(&restart);
        let mut replayed = 0usize;
        for segment in segments {
            self.control_out.extend_from_slice(&segment.bytes);
            replayed += 1;
        }
        self.replay_watermark = Some(self.queue.drained());
        debug!(from, replayed, "replayed retained segments");
        Ok(())
    }

    /// Flushes control frames, then queued segments, in message order.
    /// `false` means the peer is gone.
    fn write_channel(&mut self) -> Result<bool, SupervisorError> {
        while !self.control_out.is_empty() {
            match rustix::io::write(&self.channel, &self.control_out) {
                Ok(n) => {
                    self.control_out.drain(..n);
                }
                Err(Errno::AGAIN) => return Ok(true),
                Err(Errno::INTR) => {}
                Err(Errno::PIPE | Errno::CONNRESET) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(watermark) = self.replay_watermark.take() {
            self.flushed_below = self.flushed_below.max(watermark);
        }
        loop {
            self.prime_current();
            let Some((number, bytes, offset)) = &mut self.current else {
                return Ok(true);
            };
            match rustix::io::write(&self.channel, &bytes[*offset..]) {
                Ok(n) => {
                    *offset += n;
                    if *offset == bytes.len() {
                        self.flushed_below = *number + 1;
                        self.current = None;
                    }
                }
                Err(Errno::AGAIN) => return Ok(true),
                Err(Errno::INTR) => {}
                Err(Errno::PIPE | Errno::CONNRESET) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn read_application(&mut self) -> Result<(), SupervisorError> {
        if self.app_eof {
            return Ok(());
        }
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match rustix::io::read(&self.application, &mut buf) {
                Ok(0) => {
                    debug!("application closed its socket");
                    self.app_eof = true;
                    self.queue.stop();
                    return Ok(());
                }
                Ok(n) => {
                    let mut block = Vec::with_capacity(frame::block_len(n));
                    frame::write_block(&mut block, TransferKind::Protocol, 0, &buf[..n])?;
                    self.queue.push(block);
                }
                Err(Errno::AGAIN) => return Ok(()),
                Err(Errno::INTR) => {}
                Err(Errno::CONNRESET) => {
                    self.app_eof = true;
                    self.queue.stop();
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write_application(&mut self) {
        while !self.app_out.is_empty() {
            match rustix::io::write(&self.application, &self.app_out) {
                Ok(n) => {
                    self.app_out.drain(..n);
                }
                Err(Errno::AGAIN) => return,
                Err(Errno::INTR) => {}
                Err(err) => {
                    trace!("application write failed: {err}");
                    self.app_eof = true;
                    self.app_out.clear();
                    self.queue.stop();
                    return;
                }
            }
        }
    }

    /// Blocks for a replacement channel descriptor over the link.
    ///
    /// Returns `false` when there is no link (or it is gone), meaning the
    /// session ends cleanly.
    fn reconnect(&mut self) -> Result<bool, SupervisorError> {
        let Some(link_socket) = &self.link else {
            return Ok(false);
        };
        warn!("channel lost, waiting for a replacement descriptor");
        let fd = match link::recv_fd(link_socket) {
            Ok(fd) => fd,
            Err(SupervisorError::LinkClosed) => return Ok(false),
            Err(err) => return Err(err),
        };
        self.channel = UnixStream::from(fd);
        self.channel.set_nonblocking(true)?;

        // Everything mid-flight on the dead socket is suspect; the replay
        // protocol re-covers it from the retention window.
        self.recv_buf.clear();
        self.control_out.clear();
        self.current = None;
        self.replay_watermark = None;
        self.push_ack();
        self.resuming = true;
        self.awaiting_restart = true;
        debug!("resumed on a fresh channel descriptor");
        Ok(true)
    }
}

fn control_word(payload: &[u8]) -> Result<u64, SupervisorError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| SupervisorError::BadControlFrame { len: payload.len() })?;
    Ok(u64::from_le_bytes(bytes))
}

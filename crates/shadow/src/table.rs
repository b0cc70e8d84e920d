//! The shadow-fd table: one entry per descriptor shared over the channel.

use std::collections::HashMap;
use std::ops::Range;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use compress::Algorithm;
use pool::{TaskKind, WorkerPool};
use protocol::frame::{self, TransferKind};
use rustix::fs::{FileType, OFlags, fcntl_getfl, fcntl_setfl, fstat};
use rustix::io::Errno;
use tracing::{debug, trace};
use transfer::TransferQueue;

use crate::damage::Damage;
use crate::diff;
use crate::map::{Mapping, Region};
use crate::meta::{
    DMABUF_META_LEN, DmabufMeta, dmabuf_sync_begin, dmabuf_sync_end,
};
use crate::ShadowError;

/// Which end of the channel this table serves; decides the sign of minted
/// remote ids so the two namespaces never collide.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    /// Application-side endpoint; mints negative ids.
    Server,
    /// Compositor-side endpoint; mints positive ids.
    Client,
}

/// Classification of a shadowed descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShadowKind {
    /// Regular file or memfd, replicated by damage-ranged diffs.
    File,
    /// GPU buffer, replicated as its full surface.
    Dmabuf,
    /// Pipe end we read from; bytes stream to the peer.
    PipeRead,
    /// Pipe end we write into; bytes stream from the peer.
    PipeWrite,
    /// Connected socket, streamed in both directions.
    Socket,
}

impl ShadowKind {
    const fn is_memory(self) -> bool {
        matches!(self, Self::File | Self::Dmabuf)
    }

    const fn reads_locally(self) -> bool {
        matches!(self, Self::PipeRead | Self::Socket)
    }
}

/// Caller-supplied classification for [`ShadowTable::translate`]; the
/// protocol layer knows what role a descriptor plays before the table sees
/// it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KindHint {
    /// Shared-memory file contents.
    File,
    /// GPU buffer with explicit plane metadata.
    Dmabuf,
    /// Pipe whose readable end was handed over.
    PipeRead,
    /// Pipe whose writable end was handed over.
    PipeWrite,
    /// Connected stream socket.
    Socket,
}

// Metadata record tags.
const META_FILE: u8 = 1;
const META_DMABUF: u8 = 2;
const META_PIPE_READ: u8 = 3;
const META_PIPE_WRITE: u8 = 4;
const META_SOCKET: u8 = 5;

struct MemoryBacking {
    mapping: Mapping,
    mirror: Vec<u8>,
    /// `(st_dev, st_ino)` for duplicate-offer detection.
    identity: Option<(u64, u64)>,
    dmabuf: Option<DmabufMeta>,
    /// Entry is backed by a real dmabuf fd and needs CPU sync bracketing.
    true_dmabuf: bool,
    /// Intervals emitted by the last `collect_update`, awaiting
    /// `finish_update`.
    collected: Vec<Range<usize>>,
    /// The peer has been told about this resource.
    announced: bool,
}

struct StreamBacking {
    fd: Option<OwnedFd>,
    /// Bytes read locally, waiting to be framed.
    staged: Vec<u8>,
    /// Bytes received from the peer, waiting for the fd to accept them.
    outgoing: Vec<u8>,
    /// Local side returned EOF; a close record must be sent.
    close_pending: bool,
    close_sent: bool,
    /// The peer closed its side; drop the fd once `outgoing` drains.
    remote_closed: bool,
    announced: bool,
}

enum Backing {
    Memory(MemoryBacking),
    Stream(StreamBacking),
}

/// One shadowed descriptor.
pub struct ShadowEntry {
    remote_id: i32,
    kind: ShadowKind,
    backing: Backing,
    refcount: u32,
    dirty: bool,
    damage: Damage,
    /// Pool tasks currently reading or writing this entry's buffers.
    in_flight: Arc<AtomicUsize>,
}

impl ShadowEntry {
    /// Session-unique id of this entry.
    #[must_use]
    pub const fn remote_id(&self) -> i32 {
        self.remote_id
    }

    /// Classification of the shadowed descriptor.
    #[must_use]
    pub const fn kind(&self) -> ShadowKind {
        self.kind
    }

    /// Mapped length for memory kinds, zero for streams.
    #[must_use]
    pub fn size(&self) -> usize {
        match &self.backing {
            Backing::Memory(memory) => memory.mapping.len(),
            Backing::Stream(_) => 0,
        }
    }

    /// Whether local contents have diverged from the last transmitted
    /// snapshot.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of live references to this entry.
    #[must_use]
    pub const fn refcount(&self) -> u32 {
        self.refcount
    }

    fn memory(&self) -> Result<&MemoryBacking, ShadowError> {
        match &self.backing {
            Backing::Memory(memory) => Ok(memory),
            Backing::Stream(_) => Err(ShadowError::WrongKind {
                id: self.remote_id,
                expected: "memory-backed",
            }),
        }
    }

    fn memory_mut(&mut self) -> Result<&mut MemoryBacking, ShadowError> {
        match &mut self.backing {
            Backing::Memory(memory) => Ok(memory),
            Backing::Stream(_) => Err(ShadowError::WrongKind {
                id: self.remote_id,
                expected: "memory-backed",
            }),
        }
    }

    fn stream_mut(&mut self) -> Result<&mut StreamBacking, ShadowError> {
        match &mut self.backing {
            Backing::Stream(stream) => Ok(stream),
            Backing::Memory(_) => Err(ShadowError::WrongKind {
                id: self.remote_id,
                expected: "stream-backed",
            }),
        }
    }
}

/// Decrements the entry's in-flight counter when a pool task finishes.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Maps remote ids to local descriptor mirrors plus their dirty state.
pub struct ShadowTable {
    role: Role,
    algorithm: Algorithm,
    gpu_enabled: bool,
    entries: HashMap<i32, ShadowEntry>,
    by_identity: HashMap<(u64, u64), i32>,
    next_serial: i32,
    /// Replica descriptors created by `apply_update`, waiting for the
    /// protocol layer to collect and forward.
    pending_fds: Vec<(i32, OwnedFd)>,
}

impl ShadowTable {
    /// Creates an empty table for one session.
    #[must_use]
    pub fn new(role: Role, algorithm: Algorithm, gpu_enabled: bool) -> Self {
        Self {
            role,
            algorithm,
            gpu_enabled,
            entries: HashMap::new(),
            by_identity: HashMap::new(),
            next_serial: 0,
            pending_fds: Vec::new(),
        }
    }

    fn mint_id(&mut self) -> i32 {
        self.next_serial += 1;
        match self.role {
            Role::Server => -self.next_serial,
            Role::Client => self.next_serial,
        }
    }

    /// Looks up an entry by id.
    pub fn lookup(&self, id: i32) -> Result<&ShadowEntry, ShadowError> {
        self.entries.get(&id).ok_or(ShadowError::UnknownId { id })
    }

    /// Ids currently present, in no particular order.
    #[must_use]
    pub fn ids(&self) -> Vec<i32> {
        self.entries.keys().copied().collect()
    }

    /// Adds a reference to an entry.
    pub fn retain(&mut self, id: i32) -> Result<(), ShadowError> {
        let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
        entry.refcount += 1;
        Ok(())
    }

    /// Classifies a locally-owned descriptor and records it in the table.
    ///
    /// Offering the same underlying file twice returns the existing id,
    /// bumps its refcount, and closes the duplicate descriptor.
    pub fn translate(
        &mut self,
        fd: OwnedFd,
        hint: KindHint,
        dmabuf_meta: Option<DmabufMeta>,
    ) -> Result<i32, ShadowError> {
        let stat = fstat(&fd)?;
        #[allow(clippy::cast_sign_loss)]
        let identity = (stat.st_dev as u64, stat.st_ino as u64);

        let kind = match hint {
            KindHint::File => {
                if FileType::from_raw_mode(stat.st_mode) != FileType::RegularFile {
                    return Err(ShadowError::BadMetadata {
                        detail: "file hint for a non-regular descriptor".to_owned(),
                    });
                }
                ShadowKind::File
            }
            KindHint::Dmabuf => {
                if !self.gpu_enabled {
                    return Err(ShadowError::GpuDisabled);
                }
                ShadowKind::Dmabuf
            }
            KindHint::PipeRead => ShadowKind::PipeRead,
            KindHint::PipeWrite => ShadowKind::PipeWrite,
            KindHint::Socket => ShadowKind::Socket,
        };

        if kind.is_memory() {
            if let Some(&id) = self.by_identity.get(&identity) {
                // Duplicate offer; `fd` is dropped here.
                self.retain(id)?;
                trace!(id, "duplicate shadow offer");
                return Ok(id);
            }
        }

        let id = self.mint_id();
        let backing = match kind {
            ShadowKind::File => {
                let len = usize::try_from(stat.st_size).unwrap_or(0);
                Backing::Memory(MemoryBacking {
                    mapping: Mapping::from_fd(fd, len)?,
                    mirror: vec![0; len],
                    identity: Some(identity),
                    dmabuf: None,
                    true_dmabuf: false,
                    collected: Vec::new(),
                    announced: false,
                })
            }
            ShadowKind::Dmabuf => {
                let meta = dmabuf_meta.ok_or_else(|| ShadowError::BadMetadata {
                    detail: "dmabuf offered without plane metadata".to_owned(),
                })?;
                let len = meta.nominal_size();
                Backing::Memory(MemoryBacking {
                    mapping: Mapping::from_fd(fd, len)?,
                    mirror: vec![0; len],
                    identity: Some(identity),
                    dmabuf: Some(meta),
                    true_dmabuf: true,
                    collected: Vec::new(),
                    announced: false,
                })
            }
            ShadowKind::PipeRead | ShadowKind::PipeWrite | ShadowKind::Socket => {
                set_nonblocking(&fd)?;
                Backing::Stream(StreamBacking {
                    fd: Some(fd),
                    staged: Vec::new(),
                    outgoing: Vec::new(),
                    close_pending: false,
                    close_sent: false,
                    remote_closed: false,
                    announced: false,
                })
            }
        };

        let dirty = kind.is_memory();
        let mut damage = Damage::default();
        if kind.is_memory() {
            damage.add_everything();
            self.by_identity.insert(identity, id);
        }
        self.entries.insert(
            id,
            ShadowEntry {
                remote_id: id,
                kind,
                backing,
                refcount: 1,
                dirty,
                damage,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        debug!(id, ?kind, "shadow entry created");
        Ok(id)
    }

    /// Unions `interval` into the entry's damage; `None` marks everything.
    pub fn mark_dirty(
        &mut self,
        id: i32,
        interval: Option<Range<usize>>,
    ) -> Result<(), ShadowError> {
        let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
        if !entry.kind.is_memory() {
            return Err(ShadowError::WrongKind {
                id,
                expected: "memory-backed",
            });
        }
        // DMABUF damage is always the full surface; subregions from the
        // protocol layer are widened here.
        match interval {
            Some(range) if entry.kind == ShadowKind::File => entry.damage.add(range),
            _ => entry.damage.add_everything(),
        }
        entry.dirty = !entry.damage.is_empty();
        Ok(())
    }

    /// Re-reads a file entry's size after the application may have resized
    /// it. Growth extends the mirror and damages the tail; truncation
    /// forces a full resend.
    pub fn refresh_file(&mut self, id: i32) -> Result<(), ShadowError> {
        let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
        if entry.in_flight.load(Ordering::Acquire) != 0 {
            return Err(ShadowError::TasksInFlight { id });
        }
        let memory = entry.memory_mut()?;
        let old = memory.mapping.len();
        let new = memory.mapping.refresh_len()?;
        if new == old {
            return Ok(());
        }
        if new > old {
            memory.mirror.resize(new, 0);
            memory.announced = false;
            entry.damage.add(old..new);
        } else {
            memory.mirror.resize(new, 0);
            entry.damage.add_everything();
        }
        entry.dirty = true;
        Ok(())
    }

    /// Ids that currently have something to transmit.
    #[must_use]
    pub fn dirty_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .entries
            .values()
            .filter(|entry| match &entry.backing {
                Backing::Memory(_) => entry.dirty,
                Backing::Stream(stream) => {
                    !stream.announced
                        || !stream.staged.is_empty()
                        || (stream.close_pending && !stream.close_sent)
                }
            })
            .map(|entry| entry.remote_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Reads whatever the readable stream entries have to offer, staging it
    /// for the next `collect_update`. EOF marks the close record pending.
    pub fn drain_streams(&mut self) {
        for entry in self.entries.values_mut() {
            if !entry.kind.reads_locally() {
                continue;
            }
            let Backing::Stream(stream) = &mut entry.backing else {
                continue;
            };
            let Some(fd) = &stream.fd else { continue };
            if stream.close_pending {
                continue;
            }
            let mut buf = [0u8; 4096];
            loop {
                match rustix::io::read(fd, &mut buf) {
                    Ok(0) => {
                        stream.close_pending = true;
                        break;
                    }
                    Ok(n) => stream.staged.extend_from_slice(&buf[..n]),
                    Err(Errno::AGAIN) => break,
                    Err(Errno::INTR) => {}
                    Err(err) => {
                        trace!(id = entry.remote_id, "stream read failed: {err}");
                        stream.close_pending = true;
                        break;
                    }
                }
            }
        }
    }

    /// Retries writes of peer bytes that earlier hit `EAGAIN`, and performs
    /// deferred closes.
    pub fn flush_streams(&mut self) {
        for entry in self.entries.values_mut() {
            let Backing::Stream(stream) = &mut entry.backing else {
                continue;
            };
            flush_stream(entry.remote_id, stream);
        }
    }

    /// Schedules the transfer blocks describing an entry's divergence.
    ///
    /// Memory kinds enqueue diff or fill tasks on the pool; streams frame
    /// their staged bytes inline. Returns once every task is queued.
    pub fn collect_update(
        &mut self,
        id: i32,
        workers: &WorkerPool,
        queue: &Arc<TransferQueue>,
    ) -> Result<(), ShadowError> {
        let algorithm = self.algorithm;
        let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
        match &mut entry.backing {
            Backing::Stream(stream) => {
                if !stream.announced {
                    let mut block = Vec::new();
                    frame::write_block(
                        &mut block,
                        TransferKind::Metadata,
                        id,
                        &meta_record(entry.kind, 0, None),
                    )?;
                    queue.push(block);
                    stream.announced = true;
                }
                if !stream.staged.is_empty() {
                    let staged = std::mem::take(&mut stream.staged);
                    let mut block = Vec::new();
                    frame::write_block(&mut block, TransferKind::PipeData, id, &staged)?;
                    queue.push(block);
                }
                if stream.close_pending && !stream.close_sent {
                    let mut block = Vec::new();
                    frame::write_block(&mut block, TransferKind::PipeClose, id, &[])?;
                    queue.push(block);
                    stream.close_sent = true;
                    if stream.outgoing.is_empty() {
                        stream.fd = None;
                    }
                }
                Ok(())
            }
            Backing::Memory(memory) => {
                if !entry.dirty {
                    // Empty damage produces no transfer segments.
                    return Ok(());
                }
                let size = memory.mapping.len();
                if !memory.announced {
                    let mut block = Vec::new();
                    frame::write_block(
                        &mut block,
                        TransferKind::Metadata,
                        id,
                        &meta_record(entry.kind, size, memory.dmabuf.as_ref()),
                    )?;
                    queue.push(block);
                    memory.announced = true;
                }
                if memory.true_dmabuf {
                    dmabuf_sync_begin(memory.mapping.as_fd())?;
                }
                let intervals = entry.damage.intervals(size);
                let full_resend = entry.damage == Damage::Everything;
                memory.collected = intervals.clone();

                if full_resend {
                    schedule_fill(entry, algorithm, workers, queue, size);
                } else {
                    let current = memory.mapping.region(0..size);
                    let mirror = Region::of_slice(&memory.mirror);
                    for interval in intervals {
                        schedule_diff(
                            entry, algorithm, workers, queue, current, mirror, size, interval,
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Publishes the transmitted contents as the new baseline.
    ///
    /// Call after the channel writer drained the entry's blocks (and the
    /// pool with them). Copies current contents into the mirror over the
    /// collected intervals and clears the dirty state.
    pub fn finish_update(&mut self, id: i32) -> Result<(), ShadowError> {
        let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
        if entry.in_flight.load(Ordering::Acquire) != 0 {
            return Err(ShadowError::TasksInFlight { id });
        }
        match &mut entry.backing {
            Backing::Stream(_) => {}
            Backing::Memory(memory) => {
                for interval in memory.collected.drain(..) {
                    let bytes = memory.mapping.snapshot(interval.clone());
                    memory.mirror[interval].copy_from_slice(&bytes);
                }
                if memory.true_dmabuf {
                    dmabuf_sync_end(memory.mapping.as_fd())?;
                }
                entry.damage.clear();
                entry.dirty = false;
            }
        }
        Ok(())
    }

    /// Applies one received transfer block to the mirror table,
    /// reconstituting the resource on first sighting.
    pub fn apply_update(
        &mut self,
        header: &protocol::FrameHeader,
        payload: &[u8],
        workers: &WorkerPool,
    ) -> Result<(), ShadowError> {
        let id = header.xid;
        match header.kind {
            TransferKind::Metadata => self.apply_metadata(id, payload),
            TransferKind::Fill | TransferKind::Diff => {
                let algorithm = self.algorithm;
                let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
                // Blocks for one entry must land in message order; wait out
                // any apply still running for it before queueing the next.
                if entry.in_flight.load(Ordering::Acquire) != 0 {
                    workers.wait_for_drain()?;
                }
                if header.kind == TransferKind::Fill {
                    let new_size = fill_size(payload)?;
                    let memory = entry.memory_mut()?;
                    if memory.mapping.len() != new_size {
                        memory.mapping.set_len(new_size)?;
                        memory.mirror.resize(new_size, 0);
                    }
                }
                let memory = entry.memory_mut()?;
                let size = memory.mapping.len();
                let current = memory.mapping.region(0..size);
                let mirror = Region::of_slice(&memory.mirror);
                schedule_apply(
                    entry,
                    algorithm,
                    workers,
                    header.kind,
                    payload.to_vec(),
                    current,
                    mirror,
                    size,
                );
                Ok(())
            }
            TransferKind::PipeData => {
                let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
                let stream = entry.stream_mut()?;
                stream.outgoing.extend_from_slice(payload);
                flush_stream(id, stream);
                Ok(())
            }
            TransferKind::PipeClose => {
                let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
                let stream = entry.stream_mut()?;
                stream.remote_closed = true;
                flush_stream(id, stream);
                Ok(())
            }
            kind => Err(ShadowError::UnexpectedBlock { kind }),
        }
    }

    fn apply_metadata(&mut self, id: i32, payload: &[u8]) -> Result<(), ShadowError> {
        if payload.len() < 4 {
            return Err(ShadowError::BadMetadata {
                detail: "metadata record shorter than its tag".to_owned(),
            });
        }
        let (tag, record) = (payload[0], &payload[4..]);

        if let Some(entry) = self.entries.get_mut(&id) {
            // Re-announcement: a file grew on the sending side.
            if tag == META_FILE {
                if entry.in_flight.load(Ordering::Acquire) != 0 {
                    return Err(ShadowError::TasksInFlight { id });
                }
                let new_size = file_meta_size(record)?;
                let memory = entry.memory_mut()?;
                if memory.mapping.len() != new_size {
                    memory.mapping.set_len(new_size)?;
                    memory.mirror.resize(new_size, 0);
                }
            }
            return Ok(());
        }

        let (kind, backing, handoff) = match tag {
            META_FILE => {
                let size = file_meta_size(record)?;
                let mapping = Mapping::create_memfd("waybridge-shadow", size)?;
                let handoff = mapping.clone_fd()?;
                (
                    ShadowKind::File,
                    Backing::Memory(MemoryBacking {
                        mapping,
                        mirror: vec![0; size],
                        identity: None,
                        dmabuf: None,
                        true_dmabuf: false,
                        collected: Vec::new(),
                        announced: true,
                    }),
                    handoff,
                )
            }
            META_DMABUF => {
                if record.len() != DMABUF_META_LEN {
                    return Err(ShadowError::BadMetadata {
                        detail: "dmabuf metadata record of wrong length".to_owned(),
                    });
                }
                let meta = DmabufMeta::decode(record)?;
                let size = meta.nominal_size();
                // Without a GPU allocator on this side the surface is
                // reconstituted into a memfd staging buffer of identical
                // contents.
                let mapping = Mapping::create_memfd("waybridge-dmabuf", size)?;
                let handoff = mapping.clone_fd()?;
                (
                    ShadowKind::Dmabuf,
                    Backing::Memory(MemoryBacking {
                        mapping,
                        mirror: vec![0; size],
                        identity: None,
                        dmabuf: Some(meta),
                        true_dmabuf: false,
                        collected: Vec::new(),
                        announced: true,
                    }),
                    handoff,
                )
            }
            META_PIPE_READ | META_PIPE_WRITE | META_SOCKET => {
                let (kind, keep, hand) = replica_stream(tag)?;
                (
                    kind,
                    Backing::Stream(StreamBacking {
                        fd: Some(keep),
                        staged: Vec::new(),
                        outgoing: Vec::new(),
                        close_pending: false,
                        close_sent: false,
                        remote_closed: false,
                        announced: true,
                    }),
                    hand,
                )
            }
            other => {
                return Err(ShadowError::BadMetadata {
                    detail: format!("unknown metadata tag {other}"),
                });
            }
        };

        self.entries.insert(
            id,
            ShadowEntry {
                remote_id: id,
                kind,
                backing,
                refcount: 1,
                dirty: false,
                damage: Damage::default(),
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        self.pending_fds.push((id, handoff));
        debug!(id, ?kind, "shadow replica created");
        Ok(())
    }

    /// Replica descriptors created since the last call, for the protocol
    /// layer to forward to the application or compositor.
    pub fn take_pending_fds(&mut self) -> Vec<(i32, OwnedFd)> {
        std::mem::take(&mut self.pending_fds)
    }

    /// Drops one reference; at zero the entry is unmapped, closed, and
    /// freed.
    pub fn release(&mut self, id: i32) -> Result<(), ShadowError> {
        let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(());
        }
        if entry.in_flight.load(Ordering::Acquire) != 0 {
            return Err(ShadowError::TasksInFlight { id });
        }
        let entry = self.entries.remove(&id).expect("entry exists");
        if let Backing::Memory(memory) = &entry.backing {
            if let Some(identity) = memory.identity {
                self.by_identity.remove(&identity);
            }
        }
        debug!(id, "shadow entry released");
        Ok(())
    }

    /// Copy of the entry's current mapped contents.
    pub fn contents_snapshot(&self, id: i32) -> Result<Vec<u8>, ShadowError> {
        let entry = self.lookup(id)?;
        let memory = entry.memory()?;
        Ok(memory.mapping.snapshot(0..memory.mapping.len()))
    }

    /// Copy of the entry's mirror buffer.
    pub fn mirror_snapshot(&self, id: i32) -> Result<Vec<u8>, ShadowError> {
        let entry = self.lookup(id)?;
        Ok(entry.memory()?.mirror.clone())
    }

    /// Writes into the entry's mapping, as the application would through
    /// its own view of the shared pages.
    pub fn write_contents(&mut self, id: i32, offset: usize, bytes: &[u8]) -> Result<(), ShadowError> {
        let entry = self.entries.get_mut(&id).ok_or(ShadowError::UnknownId { id })?;
        let memory = entry.memory()?;
        memory.mapping.write_at(offset, bytes);
        Ok(())
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), ShadowError> {
    let flags = fcntl_getfl(fd)?;
    fcntl_setfl(fd, flags | OFlags::NONBLOCK)?;
    Ok(())
}

fn meta_record(kind: ShadowKind, size: usize, dmabuf: Option<&DmabufMeta>) -> Vec<u8> {
    let mut out = vec![0u8; 4];
    match kind {
        ShadowKind::File => {
            out[0] = META_FILE;
            out.extend_from_slice(&(size as u64).to_le_bytes());
        }
        ShadowKind::Dmabuf => {
            out[0] = META_DMABUF;
            out.extend_from_slice(&dmabuf.expect("dmabuf entries carry metadata").encode());
        }
        ShadowKind::PipeRead => out[0] = META_PIPE_READ,
        ShadowKind::PipeWrite => out[0] = META_PIPE_WRITE,
        ShadowKind::Socket => out[0] = META_SOCKET,
    }
    out
}

fn file_meta_size(record: &[u8]) -> Result<usize, ShadowError> {
    if record.len() != 8 {
        return Err(ShadowError::BadMetadata {
            detail: "file metadata record of wrong length".to_owned(),
        });
    }
    usize::try_from(u64::from_le_bytes(record.try_into().unwrap())).map_err(|_| {
        ShadowError::BadMetadata {
            detail: "file size exceeds address space".to_owned(),
        }
    })
}

/// First u32 of a fill payload: the full resource size.
fn fill_size(payload: &[u8]) -> Result<usize, ShadowError> {
    if payload.len() < 4 {
        return Err(ShadowError::BadMetadata {
            detail: "fill payload shorter than its size word".to_owned(),
        });
    }
    Ok(u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize)
}

/// Creates the local pair for an announced stream: `(kind, kept end,
/// handed-off end)`. Directions flip across the channel: the peer reads,
/// so we write.
fn replica_stream(tag: u8) -> Result<(ShadowKind, OwnedFd, OwnedFd), ShadowError> {
    use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};
    use rustix::pipe::{PipeFlags, pipe_with};

    match tag {
        META_PIPE_READ => {
            // Peer streams to us; we inject into the write end and hand the
            // read end over.
            let (read, write) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC)?;
            Ok((ShadowKind::PipeWrite, write, read))
        }
        META_PIPE_WRITE => {
            let (read, write) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC)?;
            Ok((ShadowKind::PipeRead, read, write))
        }
        META_SOCKET => {
            let (ours, theirs) = socketpair(
                AddressFamily::UNIX,
                SocketType::STREAM,
                SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
                None,
            )?;
            Ok((ShadowKind::Socket, ours, theirs))
        }
        _ => Err(ShadowError::BadMetadata {
            detail: format!("unknown stream tag {tag}"),
        }),
    }
}

fn flush_stream(id: i32, stream: &mut StreamBacking) {
    if let Some(fd) = &stream.fd {
        while !stream.outgoing.is_empty() {
            match rustix::io::write(fd, &stream.outgoing) {
                Ok(n) => {
                    stream.outgoing.drain(..n);
                }
                Err(Errno::AGAIN) => break,
                Err(Errno::INTR) => {}
                Err(err) => {
                    trace!(id, "stream write failed: {err}");
                    stream.outgoing.clear();
                    stream.remote_closed = true;
                    break;
                }
            }
        }
    }
    if stream.remote_closed && stream.outgoing.is_empty() && stream.fd.is_some() {
        // Dropping the write end is the EOF the local reader observes.
        stream.fd = None;
    }
}

#[allow(clippy::too_many_arguments)]
fn schedule_diff(
    entry: &ShadowEntry,
    algorithm: Algorithm,
    workers: &WorkerPool,
    queue: &Arc<TransferQueue>,
    current: Region,
    mirror: Region,
    size: usize,
    interval: Range<usize>,
) {
    let id = entry.remote_id;
    let number = queue.reserve();
    entry.in_flight.fetch_add(1, Ordering::AcqRel);
    let guard = InFlightGuard(Arc::clone(&entry.in_flight));
    let queue = Arc::clone(queue);
    workers.enqueue(
        TaskKind::DiffRegion,
        Box::new(move || {
            let _guard = guard;
            let result = (|| -> Result<Vec<u8>, ShadowError> {
                // SAFETY: the owning worker keeps the mapping and mirror
                // alive and unmoved until the pool drains; intervals given
                // to concurrent tasks are disjoint.
                let current = unsafe { current.as_slice() };
                let mirror = unsafe { mirror.as_slice() };
                debug_assert_eq!(current.len(), size);
                let mut stream = Vec::new();
                diff::diff_interval(&mut stream, current, mirror, interval);
                if stream.is_empty() {
                    // Damage was stale; nothing actually changed.
                    return Ok(Vec::new());
                }
                diff::push_sentinel(&mut stream);
                let payload = diff::encode_payload(algorithm, &stream)?;
                let mut block = Vec::with_capacity(frame::block_len(payload.len()));
                frame::write_block(&mut block, TransferKind::Diff, id, &payload)?;
                Ok(block)
            })();
            match result {
                Ok(block) => {
                    queue.commit(number, block)?;
                    Ok(())
                }
                Err(err) => {
                    // Fill the reserved slot so the writer is not wedged on
                    // a gap, then surface the failure.
                    let _ = queue.commit(number, Vec::new());
                    Err(err.into())
                }
            }
        }),
    );
}

fn schedule_fill(
    entry: &ShadowEntry,
    algorithm: Algorithm,
    workers: &WorkerPool,
    queue: &Arc<TransferQueue>,
    size: usize,
) {
    let Backing::Memory(memory) = &entry.backing else {
        unreachable!("fill scheduled for memory entries only");
    };
    let id = entry.remote_id;
    let current = memory.mapping.region(0..size);
    let number = queue.reserve();
    entry.in_flight.fetch_add(1, Ordering::AcqRel);
    let guard = InFlightGuard(Arc::clone(&entry.in_flight));
    let queue = Arc::clone(queue);
    workers.enqueue(
        TaskKind::DiffRegion,
        Box::new(move || {
            let _guard = guard;
            let result = (|| -> Result<Vec<u8>, ShadowError> {
                // SAFETY: as in `schedule_diff`.
                let current = unsafe { current.as_slice() };
                let payload = diff::encode_payload(algorithm, current)?;
                let mut block = Vec::with_capacity(frame::block_len(payload.len()));
                frame::write_block(&mut block, TransferKind::Fill, id, &payload)?;
                Ok(block)
            })();
            match result {
                Ok(block) => {
                    queue.commit(number, block)?;
                    Ok(())
                }
                Err(err) => {
                    let _ = queue.commit(number, Vec::new());
                    Err(err.into())
                }
            }
        }),
    );
}

#[allow(clippy::too_many_arguments)]
fn schedule_apply(
    entry: &ShadowEntry,
    algorithm: Algorithm,
    workers: &WorkerPool,
    kind: TransferKind,
    payload: Vec<u8>,
    current: Region,
    mirror: Region,
    size: usize,
) {
    let task_kind = if kind == TransferKind::Fill {
        TaskKind::DecompressBlock
    } else {
        TaskKind::ApplyDiff
    };
    entry.in_flight.fetch_add(1, Ordering::AcqRel);
    let guard = InFlightGuard(Arc::clone(&entry.in_flight));
    workers.enqueue(
        task_kind,
        Box::new(move || {
            let _guard = guard;
            // SAFETY: the owning worker keeps the mapping and mirror alive
            // until the pool drains, and serializes applies per entry.
            let current = unsafe { current.as_mut_slice() };
            let mirror = unsafe { mirror.as_mut_slice() };
            match kind {
                TransferKind::Fill => {
                    let raw = diff::decode_payload(algorithm, &payload)?;
                    if raw.len() != size {
                        return Err(Box::new(ShadowError::BadMetadata {
                            detail: format!(
                                "fill of {} bytes for a {size}-byte resource",
                                raw.len()
                            ),
                        }) as pool::BoxedTaskError);
                    }
                    current.copy_from_slice(&raw);
                    mirror.copy_from_slice(&raw);
                }
                _ => {
                    let raw = diff::decode_payload(algorithm, &payload)?;
                    diff::apply_stream(&raw, size, |offset, bytes| {
                        current[offset..offset + bytes.len()].copy_from_slice(bytes);
                        mirror[offset..offset + bytes.len()].copy_from_slice(bytes);
                    })?;
                }
            }
            Ok(())
        }),
    );
}

//! End-to-end replication properties: a source table's damage, pushed
//! through the worker pool and transfer queue, must reconstruct byte-equal
//! contents in a destination table under every compression mode and thread
//! count.

use std::sync::Arc;

use compress::Algorithm;
use pool::WorkerPool;
use proptest::prelude::*;
use protocol::FrameHeader;
use protocol::frame::HEADER_LEN;
use shadow::map::Mapping;
use shadow::table::{KindHint, Role, ShadowTable};
use transfer::TransferQueue;

const ALGORITHMS: [Algorithm; 3] = [
    Algorithm::None,
    Algorithm::Lz4,
    Algorithm::Zstd { level: 5 },
];

struct Endpoint {
    table: ShadowTable,
    workers: WorkerPool,
}

impl Endpoint {
    fn new(role: Role, algorithm: Algorithm, threads: usize) -> Self {
        Self {
            table: ShadowTable::new(role, algorithm, false),
            workers: WorkerPool::new(threads).expect("worker pool"),
        }
    }
}

/// Moves one round of updates for `id` from `source` to `destination`,
/// returning the framed blocks that crossed the wire.
fn transfer_round(source: &mut Endpoint, destination: &mut Endpoint, id: i32) -> Vec<Vec<u8>> {
    let queue = Arc::new(TransferQueue::new());
    source
        .table
        .collect_update(id, &source.workers, &queue)
        .expect("collect update");
    source.workers.wait_for_drain().expect("source drain");

    let mut blocks = Vec::new();
    while let Some(segment) = queue.try_next() {
        if !segment.bytes.is_empty() {
            blocks.push(segment.bytes.to_vec());
        }
    }
    for block in &blocks {
        apply_block(destination, block);
    }
    destination.workers.wait_for_drain().expect("destination drain");
    source.table.finish_update(id).expect("finish update");
    blocks
}

fn apply_block(endpoint: &mut Endpoint, block: &[u8]) {
    let header =
        FrameHeader::decode(block[..HEADER_LEN].try_into().expect("header")).expect("decode");
    let payload = &block[HEADER_LEN..HEADER_LEN + header.size];
    endpoint
        .table
        .apply_update(&header, payload, &endpoint.workers)
        .expect("apply update");
}

/// Seeds a shared file of `contents` into `source` and replicates the
/// initial state into `destination`.
fn seed(source: &mut Endpoint, destination: &mut Endpoint, contents: &[u8]) -> i32 {
    let mapping = Mapping::create_memfd("replication-seed", contents.len()).expect("memfd");
    mapping.write_at(0, contents);
    let id = source
        .table
        .translate(mapping.clone_fd().expect("dup"), KindHint::File, None)
        .expect("translate");
    transfer_round(source, destination, id);
    let _ = destination.table.take_pending_fds();
    id
}

fn check_match(a: &Endpoint, b: &Endpoint, id: i32) {
    assert_eq!(
        a.table.contents_snapshot(id).expect("contents"),
        b.table.contents_snapshot(id).expect("contents"),
        "replicated contents diverged"
    );
}

/// Deterministic xorshift stream, seedable so failures replay.
struct Prng(u64);

impl Prng {
    fn next(&mut self) -> u64 {
        // Zero state would stick; offset like any xorshift seed of 0.
        if self.0 == 0 {
            self.0 = 0x9e37_79b9_7f4a_7c15;
        }
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn range(&mut self, bound: usize) -> usize {
        (self.next() % bound.max(1) as u64) as usize
    }
}

/// The 256x320x2 scenario: five rounds of pseudo-random dirty ranges,
/// alternating which endpoint is the dirty side, across the full
/// compression-by-thread-count matrix.
#[test]
fn alternating_rounds_converge_across_the_matrix() {
    const SIZE: usize = 256 * 320 * 2;
    let base: Vec<u8> = (0..SIZE).map(|i| (i % 256) as u8).collect();

    for algorithm in ALGORITHMS {
        for source_threads in 1..=5 {
            for destination_threads in 1..=5 {
                let mut source = Endpoint::new(Role::Server, algorithm, source_threads);
                let mut destination =
                    Endpoint::new(Role::Client, algorithm, destination_threads);
                let id = seed(&mut source, &mut destination, &base);
                check_match(&source, &destination, id);

                let mut prng = Prng(0);
                for round in 0..5u8 {
                    let start = prng.range(SIZE - 1);
                    let len = 1 + prng.range(SIZE - start - 1);
                    let fill = vec![round; len];
                    let (dirty, clean) = if round % 2 == 0 {
                        (&mut source, &mut destination)
                    } else {
                        (&mut destination, &mut source)
                    };
                    dirty.table.write_contents(id, start, &fill).expect("write");
                    dirty
                        .table
                        .mark_dirty(id, Some(start..start + len))
                        .expect("mark dirty");
                    transfer_round(dirty, clean, id);
                    check_match(&source, &destination, id);
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property 1: random in-place writes always replicate byte-for-byte,
    /// whatever the compression mode and pool sizes.
    #[test]
    fn random_writes_round_trip(
        algorithm_index in 0usize..3,
        source_threads in 1usize..=5,
        destination_threads in 1usize..=5,
        writes in prop::collection::vec((0usize..8192, 1usize..512, any::<u8>()), 1..6),
    ) {
        let algorithm = ALGORITHMS[algorithm_index];
        let mut source = Endpoint::new(Role::Server, algorithm, source_threads);
        let mut destination = Endpoint::new(Role::Client, algorithm, destination_threads);
        let base = vec![0xa5u8; 8192];
        let id = seed(&mut source, &mut destination, &base);

        for (offset, len, value) in writes {
            let end = (offset + len).min(8192);
            if end <= offset {
                continue;
            }
            source.table.write_contents(id, offset, &vec![value; end - offset]).expect("write");
            source.table.mark_dirty(id, Some(offset..end)).expect("mark dirty");
        }
        transfer_round(&mut source, &mut destination, id);
        check_match(&source, &destination, id);
    }

    /// Property 3: bytes outside the damage union never appear in emitted
    /// diff segments.
    #[test]
    fn diffs_never_leak_undamaged_bytes(
        start in 0usize..7000,
        len in 64usize..1024,
    ) {
        let algorithm = Algorithm::None;
        let mut source = Endpoint::new(Role::Server, algorithm, 2);
        let mut destination = Endpoint::new(Role::Client, algorithm, 2);
        let base = vec![0u8; 8192];
        let id = seed(&mut source, &mut destination, &base);

        let end = (start + len).min(8192);
        // The whole buffer changes, but only one range is marked damaged.
        source.table.write_contents(id, 0, &vec![1u8; 8192]).expect("write");
        source.table.mark_dirty(id, Some(start..end)).expect("mark dirty");
        let blocks = transfer_round(&mut source, &mut destination, id);

        for block in blocks {
            let header = FrameHeader::decode(block[..HEADER_LEN].try_into().expect("header"))
                .expect("decode");
            prop_assert_eq!(header.kind, protocol::TransferKind::Diff);
            let payload = &block[HEADER_LEN..HEADER_LEN + header.size];
            let raw = shadow::diff::decode_payload(algorithm, payload).expect("payload");
            shadow::diff::apply_stream(&raw, 8192, |offset, bytes| {
                assert!(offset >= start && offset + bytes.len() <= end,
                    "segment {offset}..{} outside damage {start}..{end}",
                    offset + bytes.len());
            }).expect("stream");
        }
    }

    /// Property 4: applying a received block twice leaves the destination
    /// exactly as one application did, with no dirt and no further work.
    #[test]
    fn apply_is_idempotent(
        offset in 0usize..4000,
        len in 1usize..512,
        value in any::<u8>(),
    ) {
        let algorithm = Algorithm::Lz4;
        let mut source = Endpoint::new(Role::Server, algorithm, 1);
        let mut destination = Endpoint::new(Role::Client, algorithm, 1);
        let base = vec![0u8; 4096];
        let id = seed(&mut source, &mut destination, &base);

        let end = (offset + len).min(4096);
        source.table.write_contents(id, offset, &vec![value; end - offset]).expect("write");
        source.table.mark_dirty(id, Some(offset..end)).expect("mark dirty");
        let blocks = transfer_round(&mut source, &mut destination, id);

        let once = destination.table.contents_snapshot(id).expect("contents");
        for block in &blocks {
            apply_block(&mut destination, block);
        }
        destination.workers.wait_for_drain().expect("drain");
        let twice = destination.table.contents_snapshot(id).expect("contents");
        prop_assert_eq!(once, twice);
        prop_assert!(!destination.table.lookup(id).expect("entry").is_dirty());

        // No further work: a collect on the re-applied entry emits nothing.
        let queue = Arc::new(TransferQueue::new());
        destination.table.collect_update(id, &destination.workers, &queue).expect("collect");
        destination.workers.wait_for_drain().expect("drain");
        prop_assert!(queue.try_next().is_none());
    }

    /// Property 5: after `finish_update`, the mirror matches current
    /// contents over the previously damaged intervals.
    #[test]
    fn finish_update_syncs_the_mirror(
        offset in 0usize..4000,
        len in 1usize..512,
        value in any::<u8>(),
    ) {
        let algorithm = Algorithm::Zstd { level: 3 };
        let mut source = Endpoint::new(Role::Server, algorithm, 3);
        let mut destination = Endpoint::new(Role::Client, algorithm, 1);
        let base = vec![9u8; 4096];
        let id = seed(&mut source, &mut destination, &base);

        let end = (offset + len).min(4096);
        source.table.write_contents(id, offset, &vec![value; end - offset]).expect("write");
        source.table.mark_dirty(id, Some(offset..end)).expect("mark dirty");
        transfer_round(&mut source, &mut destination, id);

        let contents = source.table.contents_snapshot(id).expect("contents");
        let mirror = source.table.mirror_snapshot(id).expect("mirror");
        prop_assert_eq!(&contents[offset..end], &mirror[offset..end]);
        prop_assert!(!source.table.lookup(id).expect("entry").is_dirty());
    }
}

/// Property 2 in end-to-end form: an untouched entry transmits nothing at
/// all, compressed or not.
#[test]
fn clean_round_transmits_nothing() {
    for algorithm in ALGORITHMS {
        let mut source = Endpoint::new(Role::Server, algorithm, 2);
        let mut destination = Endpoint::new(Role::Client, algorithm, 2);
        let base: Vec<u8> = (0..4096u32).map(|i| (i % 13) as u8).collect();
        let id = seed(&mut source, &mut destination, &base);

        let blocks = transfer_round(&mut source, &mut destination, id);
        assert!(
            blocks.is_empty(),
            "clean entry produced {} blocks under {algorithm}",
            blocks.len()
        );
    }
}

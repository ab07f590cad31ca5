// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Two-node scenarios driven over a real loopback TCP pair, the same way
//! `rpc_protocol`'s own `pipe` module exercises its server/client without a real network.
//! These build `Peer`s directly rather than going through `mesh::bootstrap`, since that
//! installs a single process-wide `OnceLock` and a test binary runs many tests in one
//! process.

use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use fabric::bulk::{self, RemoteRegion};
use fabric::channel;
use fabric::peer::Peer;
use fabric::port::{QueuePair, RawCompletion};
use fabric::wire::Header;

const QUEUE_ENTRIES: u32 = 64;
const RECEIVE_ITEMS: u32 = 8;
const MAX_MESSAGE_SIZE: usize = 4096;
const RING_CHUNKS: usize = 2;
const RING_CHUNK_SIZE: usize = 4096;

/// A connected pair of peers over real loopback sockets: `a` plays node 0, `b` plays
/// node 1.
fn peer_pair() -> (Peer, Peer) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let connector = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (accepted, _) = listener.accept().unwrap();
    let connected = connector.join().unwrap();

    let qp_a = QueuePair::new(connected, QUEUE_ENTRIES).unwrap();
    let qp_b = QueuePair::new(accepted, QUEUE_ENTRIES).unwrap();

    let a = Peer::new(1, 0, qp_a, RECEIVE_ITEMS, MAX_MESSAGE_SIZE, RING_CHUNKS, RING_CHUNK_SIZE);
    let b = Peer::new(0, 1, qp_b, RECEIVE_ITEMS, MAX_MESSAGE_SIZE, RING_CHUNKS, RING_CHUNK_SIZE);

    for peer in [&a, &b] {
        for _ in 0..RECEIVE_ITEMS {
            let item = peer.recv_pool.take(0).unwrap();
            peer.qp.post_recv(item);
        }
    }

    (a, b)
}

/// Drain `peer`'s completion queue until `classify` returns `Some`, dispatching anything
/// else it sees the way `completion::handle_completion` would for a peer with no
/// application handlers registered: ordinary receives are treated as test-visible
/// messages, bulk completions are routed to `bulk`'s handlers.
fn pump<T>(peer: &Peer, mut classify: impl FnMut(RawCompletion) -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        for completion in peer.qp.drain() {
            if let Some(result) = classify(completion) {
                return result;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for a completion");
        thread::sleep(Duration::from_micros(200));
    }
}

fn route_bulk_or_return_message(peer: &Peer, completion: RawCompletion) -> Option<Vec<u8>> {
    match completion {
        RawCompletion::Send { tag, payload } => {
            if let fabric::port::SendPayload::Ring(block) = payload {
                peer.ring.put(block);
            }
            peer.send_station.fulfil(tag as u32, ());
            None
        }
        RawCompletion::Receive { item } => {
            let header = Header::decode(&item.buffer[..item.len]);
            if header.is_rdma {
                if header.rdma_ack {
                    if header.msg_type == bulk::MSG_TYPE_BULK_REPLY {
                        bulk::handle_reply(&item, peer);
                    } else {
                        bulk::handle_ack_request(peer.id, &header, &item, peer);
                    }
                } else {
                    bulk::handle_unacked_write(peer.id, &header, &item, peer);
                }
                peer.recv_pool.recycle(item);
                None
            } else {
                let payload = item.buffer[fabric::wire::HEADER_LEN..item.len].to_vec();
                peer.recv_pool.recycle(item);
                Some(payload)
            }
        }
        _ => None,
    }
}

/// Background pump for the responder side of a bulk request, running until `stop` fires.
fn spawn_background_pump(peer: &'static Peer) -> std::sync::mpsc::Sender<()> {
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    thread::spawn(move || loop {
        for completion in peer.qp.drain() {
            route_bulk_or_return_message(peer, completion);
        }
        if rx.try_recv().is_ok() {
            return;
        }
        thread::sleep(Duration::from_micros(200));
    });
    tx
}

#[test]
fn small_message_round_trips() {
    let (a, b) = peer_pair();

    channel::send_to_peer(&a, 7, b"hello from node 1").unwrap();

    let payload = pump(&b, |c| route_bulk_or_return_message(&b, c));
    assert_eq!(&payload, b"hello from node 1");
}

#[test]
fn acknowledged_read_returns_responder_memory() {
    let (a, b): (Peer, Peer) = peer_pair();
    let a: &'static Peer = Box::leak(Box::new(a));
    let b: &'static Peer = Box::leak(Box::new(b));

    let mut source = b"responder-owned payload!".to_vec();
    let remote = bulk::advertise_region(b, &mut source).unwrap();

    let stop = spawn_background_pump(b);

    let mut dest = vec![0u8; source.len()];
    bulk::read(a, remote, &mut dest).unwrap();
    assert_eq!(dest, source);

    let _ = stop.send(());
    bulk::release_region(b, remote);
}

#[test]
fn acknowledged_write_lands_in_responder_memory() {
    let (a, b): (Peer, Peer) = peer_pair();
    let a: &'static Peer = Box::leak(Box::new(a));
    let b: &'static Peer = Box::leak(Box::new(b));

    let mut dest = vec![0u8; 16];
    let remote = bulk::advertise_region(b, &mut dest).unwrap();

    let stop = spawn_background_pump(b);

    let payload = b"write-me-please!";
    bulk::write(a, remote, payload).unwrap();

    let _ = stop.send(());
    assert_eq!(&dest[..payload.len()], payload);
    bulk::release_region(b, remote);
}

#[test]
fn polled_write_inline_lands_before_caller_observes_it() {
    let (a, b): (Peer, Peer) = peer_pair();
    let a: &'static Peer = Box::leak(Box::new(a));
    let b: &'static Peer = Box::leak(Box::new(b));

    let payload = b"inline-signal!!!";
    let mut dest = vec![0u8; payload.len() + bulk::INLINE_FRAME_OVERHEAD];
    let remote = bulk::advertise_region(b, &mut dest).unwrap();

    let stop = spawn_background_pump(b);

    bulk::write_polled_inline(a, remote, payload).unwrap();

    // The inline contract only guarantees the caller can tell the local send went out;
    // the responder's background pump lands the self-describing frame shortly after, and
    // the reader (here, whoever holds `dest`) recognizes it landed once `poll_inline`
    // observes both the head and tail flags set — not by racing on a raw byte compare.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(recovered) = bulk::poll_inline(&dest, payload.len()) {
            assert_eq!(recovered, payload);
            break;
        }
        assert!(Instant::now() < deadline, "polled inline write never landed");
        thread::sleep(Duration::from_millis(1));
    }

    let _ = stop.send(());
    bulk::release_region(b, remote);
}

#[test]
fn region_pool_serves_at_most_k_concurrent_slots() {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    // Scenario 5 (spec.md §8): 128 concurrent bulk initiators against a peer with K=64
    // must all eventually complete, and at no point does the bitmap hold more than 64
    // set bits. A background monitor samples `bound_count` for the whole run while every
    // initiator retries through the pool's transient-exhaustion contract (yield and
    // retry, never fail outright) and releases its slot once done.
    struct NullPort;
    impl fabric::region::RegionPort for NullPort {
        fn post_invalidate(&self, _slot: u16) {}
        fn post_register(&self, _slot: u16, _binding: fabric::region::RegionBinding) {}
    }

    let pool = Arc::new(fabric::region::RegionPool::new());
    let concurrent_initiators = 128;
    let completed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(concurrent_initiators));
    let done = Arc::new(AtomicBool::new(false));

    let monitor = {
        let pool = pool.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                assert!(
                    pool.bound_count() <= fabric::region::SLOTS_PER_POOL,
                    "region bitmap exceeded K slots"
                );
                thread::sleep(Duration::from_micros(50));
            }
        })
    };

    let handles: Vec<_> = (0..concurrent_initiators)
        .map(|_| {
            let pool = pool.clone();
            let completed = completed.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let slot = loop {
                    match pool.acquire(1) {
                        Ok(slot) => break slot,
                        Err(_) => thread::sleep(Duration::from_micros(100)),
                    }
                };
                pool.bind(slot, 0x1000, 64, &NullPort);
                thread::sleep(Duration::from_micros(200));
                pool.release(slot);
                completed.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    done.store(true, Ordering::Release);
    monitor.join().unwrap();

    assert_eq!(completed.load(Ordering::Relaxed), concurrent_initiators);
    assert_eq!(pool.bound_count(), 0, "every slot should be released once all initiators finish");
}

#[test]
fn fault_wakes_every_outstanding_waiter_and_fails_fast() {
    let (a, _b) = peer_pair();

    a.send_station.register(1);
    a.reply_station.register(2);

    let waiter = {
        let a = &a as *const Peer as usize;
        thread::spawn(move || {
            // SAFETY: `a` outlives this thread, which is joined before the test returns.
            let a = unsafe { &*(a as *const Peer) };
            (a.send_station.wait(1), a.reply_station.wait(2))
        })
    };

    thread::sleep(Duration::from_millis(20));
    a.fault();

    let (send_result, reply_result) = waiter.join().unwrap();
    assert!(send_result.is_err());
    assert!(reply_result.is_err());
    assert!(a.conn.is_error());

    let err = channel::send_to_peer(&a, 0, b"should fail fast").unwrap_err();
    assert!(matches!(err, fabric::Error::PeerUnreachable(1)));
}

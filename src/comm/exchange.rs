//! Symmetric all-to-all exchange rounds.
//!
//! Every collective in this crate is built from the same two-phase shape:
//! post receives for a 4-byte count from every fellow PE, send counts, wait;
//! then post receives for exactly the announced number of bytes, send
//! payloads, wait. Zero-length payloads are never put on the wire. The
//! pattern tolerates arbitrary arrival interleavings across senders because
//! every receive is matched by (peer, tag).

use crate::comm::communicator::{CommTag, Communicator, ExchangeTags, Wait};
use crate::error::InvariantViolation;

/// Exchange one byte payload with every fellow PE.
///
/// `outgoing` must hold one entry per rank; the entry for the local rank is
/// ignored. Returns the payloads received from every rank, with an empty
/// entry for the local rank. Completion of the round implies every peer has
/// received this PE's payloads (an N-event wait, N = number of peers).
pub fn exchange_all<C: Communicator>(
    comm: &C,
    tags: ExchangeTags,
    outgoing: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>, InvariantViolation> {
    let me = comm.rank();
    let size = comm.size();
    debug_assert_eq!(outgoing.len(), size, "one outgoing payload per rank");

    // Phase 1: counts.
    let mut size_recvs = Vec::with_capacity(size.saturating_sub(1));
    for peer in 0..size {
        if peer == me {
            continue;
        }
        let mut buf = [0u8; 4];
        size_recvs.push((peer, comm.irecv(peer, tags.sizes, &mut buf)));
    }
    let mut size_sends = Vec::with_capacity(size.saturating_sub(1));
    for peer in 0..size {
        if peer == me {
            continue;
        }
        let count = (outgoing[peer].len() as u32).to_le_bytes();
        size_sends.push(comm.isend(peer, tags.sizes, &count));
    }
    let mut incoming_len = vec![0usize; size];
    for (peer, h) in size_recvs {
        let raw = h.wait().ok_or(InvariantViolation::Comm {
            peer,
            what: "size receive returned no data",
        })?;
        if raw.len() != 4 {
            return Err(InvariantViolation::Comm {
                peer,
                what: "short size message",
            });
        }
        incoming_len[peer] = u32::from_le_bytes(raw.try_into().expect("4 bytes")) as usize;
    }
    for s in size_sends {
        let _ = s.wait();
    }

    // Phase 2: payloads.
    let mut data_recvs = Vec::new();
    for peer in 0..size {
        if peer == me || incoming_len[peer] == 0 {
            continue;
        }
        let mut buf = vec![0u8; incoming_len[peer]];
        let h = comm.irecv(peer, tags.data, &mut buf);
        data_recvs.push((peer, h));
    }
    let mut data_sends = Vec::new();
    for peer in 0..size {
        if peer == me || outgoing[peer].is_empty() {
            continue;
        }
        data_sends.push(comm.isend(peer, tags.data, &outgoing[peer]));
    }
    let mut incoming = vec![Vec::new(); size];
    for (peer, h) in data_recvs {
        let raw = h.wait().ok_or(InvariantViolation::Comm {
            peer,
            what: "data receive returned no data",
        })?;
        if raw.len() != incoming_len[peer] {
            return Err(InvariantViolation::Comm {
                peer,
                what: "payload length does not match announced size",
            });
        }
        incoming[peer] = raw;
    }
    for s in data_sends {
        let _ = s.wait();
    }

    Ok(incoming)
}

/// Broadcast the same payload to every fellow PE; returns everyone's
/// payload, own entry included.
pub fn allgather<C: Communicator>(
    comm: &C,
    tags: ExchangeTags,
    payload: Vec<u8>,
) -> Result<Vec<Vec<u8>>, InvariantViolation> {
    let size = comm.size();
    let mut outgoing = vec![Vec::new(); size];
    for (peer, slot) in outgoing.iter_mut().enumerate() {
        if peer != comm.rank() {
            *slot = payload.clone();
        }
    }
    let mut incoming = exchange_all(comm, tags, &outgoing)?;
    incoming[comm.rank()] = payload;
    Ok(incoming)
}

/// Send a fixed-length message to one peer (no size phase).
pub fn send_fixed<C: Communicator>(comm: &C, peer: usize, tag: CommTag, bytes: &[u8]) {
    let _ = comm.isend(peer, tag, bytes);
}

/// Receive a fixed-length message from one peer (no size phase).
pub fn recv_fixed<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: CommTag,
    len: usize,
) -> Result<Vec<u8>, InvariantViolation> {
    let mut buf = vec![0u8; len];
    let h = comm.irecv(peer, tag, &mut buf);
    let raw = h.wait().ok_or(InvariantViolation::Comm {
        peer,
        what: "receive returned no data",
    })?;
    if raw.len() != len {
        return Err(InvariantViolation::Comm {
            peer,
            what: "fixed-length message truncated",
        });
    }
    Ok(raw)
}

//! Cross-PE reductions built on the symmetric exchange.
//!
//! Reductions here are associative and commutative; each participant ends
//! up with the combined result (all-reduce) or the root alone does
//! (gather-style reduce). Contribution order never matters.

use crate::comm::communicator::{Communicator, ExchangeTags};
use crate::comm::exchange::allgather;
use crate::comm::wire::{kind, ByteReader, ByteWriter};
use crate::error::InvariantViolation;

fn encode_f64s(vals: &[f64]) -> Vec<u8> {
    let mut w = ByteWriter::message(kind::REDUCE);
    w.put_u32(vals.len() as u32);
    for &v in vals {
        w.put_f64(v);
    }
    w.finish()
}

fn decode_f64s(peer: usize, bytes: &[u8], expect: usize) -> Result<Vec<f64>, InvariantViolation> {
    let fail = |what| InvariantViolation::WireDecode { peer, what };
    let mut r = ByteReader::message(bytes, kind::REDUCE).map_err(|e| fail(e))?;
    let n = r.get_u32().map_err(|e| fail(e))? as usize;
    if n != expect {
        return Err(fail("reduction contribution length mismatch"));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(r.get_f64().map_err(|e| fail(e))?);
    }
    r.done().map_err(|e| fail(e))?;
    Ok(out)
}

/// Elementwise-sum all-reduce over a fixed-length f64 vector.
pub fn allreduce_sum<C: Communicator>(
    comm: &C,
    tags: ExchangeTags,
    local: &[f64],
) -> Result<Vec<f64>, InvariantViolation> {
    let all = allgather(comm, tags, encode_f64s(local))?;
    let mut acc = vec![0.0; local.len()];
    for (peer, bytes) in all.iter().enumerate() {
        let vals = decode_f64s(peer, bytes, local.len())?;
        for (a, v) in acc.iter_mut().zip(vals) {
            *a += v;
        }
    }
    Ok(acc)
}

/// Elementwise-max all-reduce over a fixed-length f64 vector.
pub fn allreduce_max<C: Communicator>(
    comm: &C,
    tags: ExchangeTags,
    local: &[f64],
) -> Result<Vec<f64>, InvariantViolation> {
    let all = allgather(comm, tags, encode_f64s(local))?;
    let mut acc = vec![f64::NEG_INFINITY; local.len()];
    for (peer, bytes) in all.iter().enumerate() {
        let vals = decode_f64s(peer, bytes, local.len())?;
        for (a, v) in acc.iter_mut().zip(vals) {
            if v > *a {
                *a = v;
            }
        }
    }
    Ok(acc)
}

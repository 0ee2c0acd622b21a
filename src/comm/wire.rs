//! Fixed, versioned, little-endian wire encoding for inter-PE messages.
//!
//! Every message starts with a [`WireHdr`] naming the protocol version and
//! the message kind, followed by kind-specific payload encoded through
//! [`ByteWriter`]/[`ByteReader`]. Bulk id and value arrays go through
//! `bytemuck` casts of `#[repr(transparent)]`/`#[repr(C)]` Pod records.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Message kinds carried in [`WireHdr`].
pub mod kind {
    pub const CHARE_NODES: u16 = 1;
    pub const QUERY: u16 = 2;
    pub const MASK: u16 = 3;
    pub const OFFSET: u16 = 4;
    pub const REQUEST: u16 = 5;
    pub const NEW_ORDER: u16 = 6;
    pub const BOUNDS: u16 = 7;
    pub const ROWS: u16 = 8;
    pub const SOL: u16 = 9;
    pub const LHS: u16 = 10;
    pub const RHS: u16 = 11;
    pub const LOW_RHS: u16 = 12;
    pub const LOW_LHS: u16 = 13;
    pub const BC: u16 = 14;
    pub const DIAG: u16 = 15;
    pub const SCATTER: u16 = 16;
    pub const GATHER: u16 = 17;
    pub const REDUCE: u16 = 18;
}

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_from<T: Pod>(v: &[u8]) -> &[T] {
    bytemuck::cast_slice(v)
}

/// Message header.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireHdr {
    version_le: u16,
    kind_le: u16,
    reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }

    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }

    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
}

/// Decode failure description; higher layers attach the offending peer.
pub type WireError = &'static str;

/// Append-only little-endian message builder.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Start a message of the given kind.
    pub fn message(kind: u16) -> Self {
        let mut w = ByteWriter { buf: Vec::new() };
        w.buf.extend_from_slice(cast_slice(&[WireHdr::new(kind)]));
        w
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed array of Pod records.
    pub fn put_pod_slice<T: Pod>(&mut self, v: &[T]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(cast_slice(v));
    }

    /// Unprefixed array of Pod records (count carried elsewhere).
    pub fn put_pod_raw<T: Pod>(&mut self, v: &[T]) {
        self.buf.extend_from_slice(cast_slice(v));
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received message.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Wrap a message and validate its header against `kind`.
    pub fn message(buf: &'a [u8], kind: u16) -> Result<Self, WireError> {
        let mut r = ByteReader { buf, pos: 0 };
        let hdr: WireHdr = r.get_pod()?;
        if hdr.version() != WIRE_VERSION {
            return Err("wire version mismatch");
        }
        if hdr.kind() != kind {
            return Err("unexpected message kind");
        }
        Ok(r)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err("message truncated");
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_pod<T: Pod>(&mut self) -> Result<T, WireError> {
        let bytes = self.take(size_of::<T>())?;
        bytemuck::try_pod_read_unaligned(bytes).map_err(|_| "bad record layout")
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn get_f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    /// Length-prefixed array of Pod records, copied out.
    pub fn get_pod_vec<T: Pod + Copy>(&mut self) -> Result<Vec<T>, WireError> {
        let n = self.get_u32()? as usize;
        self.get_pod_raw(n)
    }

    /// Unprefixed array of `n` Pod records, copied out.
    pub fn get_pod_raw<T: Pod + Copy>(&mut self, n: usize) -> Result<Vec<T>, WireError> {
        let nbytes = n
            .checked_mul(size_of::<T>())
            .ok_or("record count overflow")?;
        let bytes = self.take(nbytes)?;
        let mut out = Vec::with_capacity(n);
        for chunk in bytes.chunks_exact(size_of::<T>()) {
            out.push(bytemuck::try_pod_read_unaligned(chunk).map_err(|_| "bad record layout")?);
        }
        Ok(out)
    }

    /// Assert the full message was consumed.
    pub fn done(self) -> Result<(), WireError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err("trailing bytes in message")
        }
    }
}

// ===== Compile-time sanity checks =========================================

const _: () = {
    assert!(size_of::<WireHdr>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Edge, NodeId};

    #[test]
    fn header_roundtrip() {
        let w = ByteWriter::message(kind::QUERY);
        let buf = w.finish();
        let r = ByteReader::message(&buf, kind::QUERY).unwrap();
        r.done().unwrap();
    }

    #[test]
    fn kind_mismatch_rejected() {
        let buf = ByteWriter::message(kind::QUERY).finish();
        assert!(ByteReader::message(&buf, kind::MASK).is_err());
    }

    #[test]
    fn version_guard() {
        let mut buf = ByteWriter::message(kind::ROWS).finish();
        buf[0] = 0xFF; // corrupt the version
        assert!(ByteReader::message(&buf, kind::ROWS).is_err());
    }

    #[test]
    fn scalar_and_slice_roundtrip() {
        let ids = [NodeId::new(3), NodeId::new(1)];
        let edges = [Edge::new(NodeId::new(5), NodeId::new(2))];
        let mut w = ByteWriter::message(kind::MASK);
        w.put_u32(7);
        w.put_u64(u64::MAX);
        w.put_f64(0.25);
        w.put_pod_slice(&ids);
        w.put_pod_slice(&edges);
        let buf = w.finish();

        let mut r = ByteReader::message(&buf, kind::MASK).unwrap();
        assert_eq!(r.get_u32().unwrap(), 7);
        assert_eq!(r.get_u64().unwrap(), u64::MAX);
        assert_eq!(r.get_f64().unwrap(), 0.25);
        assert_eq!(r.get_pod_vec::<NodeId>().unwrap(), ids);
        assert_eq!(r.get_pod_vec::<Edge>().unwrap(), edges);
        r.done().unwrap();
    }

    #[test]
    fn truncation_detected() {
        let mut w = ByteWriter::message(kind::SOL);
        w.put_u64(42);
        let mut buf = w.finish();
        buf.truncate(buf.len() - 1);
        let mut r = ByteReader::message(&buf, kind::SOL).unwrap();
        assert!(r.get_u64().is_err());
    }

    #[test]
    fn trailing_bytes_detected() {
        let mut w = ByteWriter::message(kind::SOL);
        w.put_u32(1);
        let buf = w.finish();
        let r = ByteReader::message(&buf, kind::SOL).unwrap();
        assert!(r.done().is_err());
    }
}

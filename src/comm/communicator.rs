//! Communication abstraction for serial and intra-process message passing.
//!
//! Every cross-PE operation in this crate is a non-blocking send or receive
//! against this trait; completion is expressed by waiting on the returned
//! handles. Wire format conventions for higher-level protocols:
//! - All integers are LE fixed width (u32 counts/tags/ranks, u64 IDs).
//! - Structs are `#[repr(C)]` and `bytemuck::Pod`-safe.
//! - Receivers may truncate to their provided buffer length; higher layers
//!   exchange sizes first when exact lengths are required.
//!
//! Between any two endpoints, delivery is FIFO per tag. Across different
//! senders no order is assumed.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: CommTag, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this PE (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of PEs.
    fn size(&self) -> usize;
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Tag pair for a two-phase (sizes, then data) exchange round.
#[derive(Copy, Clone, Debug)]
pub struct ExchangeTags {
    /// Tag used during the size-exchange phase.
    pub sizes: CommTag,
    /// Tag used during the data-exchange phase.
    pub data: CommTag,
}

impl ExchangeTags {
    /// Construct tags from a base, assigning deterministic offsets per phase.
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// No-op comm for pure serial runs and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: CommTag, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: CommTag, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- LocalComm: intra-process, one thread per PE ---

type Key = (usize, usize, u16); // (src, dst, tag)

type Cell = Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>;

#[derive(Default)]
struct Mailboxes {
    map: Mutex<HashMap<Key, Cell>>,
}

impl Mailboxes {
    fn entry(&self, key: Key) -> Cell {
        let mut g = self.map.lock();
        g.entry(key).or_default().clone()
    }
}

pub struct LocalSendHandle;

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct LocalRecvHandle {
    cell: Cell,
    want_len: usize,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut q = lock.lock();
        while q.is_empty() {
            cv.wait(&mut q);
        }
        let mut msg = q.pop_front().expect("queue non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

/// Intra-process communicator: ranks are threads of one process sharing a
/// mailbox table. Construct all endpoints at once with [`LocalComm::cluster`]
/// and move one endpoint into each PE thread; distinct clusters do not see
/// each other's traffic.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    mailboxes: Arc<Mailboxes>,
}

impl LocalComm {
    /// Endpoints for a cluster of `size` ranks.
    pub fn cluster(size: usize) -> Vec<LocalComm> {
        let mailboxes = Arc::new(Mailboxes::default());
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle {
        let cell = self.mailboxes.entry((self.rank, peer, tag.as_u16()));
        let (lock, cv) = &*cell;
        lock.lock().push_back(buf.to_vec());
        cv.notify_all();
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: CommTag, buf: &mut [u8]) -> Self::RecvHandle {
        LocalRecvHandle {
            cell: self.mailboxes.entry((peer, self.rank, tag.as_u16())),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

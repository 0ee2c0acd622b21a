//! Binary tetrahedral-mesh file with random access.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic  "TPRT"            4 bytes
//! version u16, reserved u16
//! nnode   u64
//! nblock  u64
//! ntet    u64  x nblock        per-block element counts
//! conn    4 x u64 per element  block after block, row-major
//! coords  3 x f64 per node     x, y, z interleaved
//! ```
//!
//! Element blocks are contiguous on disk, so a PE can read any contiguous
//! element range with one seek, and coordinates for an arbitrary node
//! subset with per-node seeks. The reader never synchronizes with peers.

use crate::error::InputError;
use crate::mesh::{NodeId, Tet};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

const MAGIC: [u8; 4] = *b"TPRT";
const VERSION: u16 = 1;

const HEADER_FIXED: u64 = 4 + 2 + 2 + 8 + 8;
const TET_BYTES: u64 = 4 * 8;
const COORD_BYTES: u64 = 3 * 8;

/// Parsed file header.
#[derive(Clone, Debug)]
pub struct TetHeader {
    /// Number of nodes in the file.
    pub nnode: u64,
    /// Per-block tetrahedron counts.
    pub blocks: Vec<u64>,
}

impl TetHeader {
    /// Total number of tetrahedra across all blocks.
    pub fn ntet_total(&self) -> u64 {
        self.blocks.iter().sum()
    }
}

/// Random-access handle on a tet mesh file.
pub struct TetFile {
    file: File,
    header: TetHeader,
    conn_start: u64,
    coord_start: u64,
}

impl TetFile {
    /// Open and validate a mesh file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InputError> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| InputError::Truncated { what: "header" })?;
        if magic != MAGIC {
            return Err(InputError::BadMagic);
        }
        let version = read_u16(&mut file)?;
        if version != VERSION {
            return Err(InputError::UnsupportedVersion {
                found: version,
                expected: VERSION,
            });
        }
        let _reserved = read_u16(&mut file)?;
        let nnode = read_u64(&mut file)?;
        let nblock = read_u64(&mut file)?;
        let mut blocks = Vec::with_capacity(nblock as usize);
        for _ in 0..nblock {
            blocks.push(read_u64(&mut file)?);
        }
        let header = TetHeader { nnode, blocks };

        let conn_start = HEADER_FIXED + 8 * nblock;
        let coord_start = conn_start + TET_BYTES * header.ntet_total();
        let expect = coord_start + COORD_BYTES * nnode;
        let actual = file.metadata()?.len();
        if actual != expect {
            return Err(InputError::Truncated {
                what: "file length does not match declared counts",
            });
        }

        Ok(TetFile {
            file,
            header,
            conn_start,
            coord_start,
        })
    }

    /// File header.
    pub fn header(&self) -> &TetHeader {
        &self.header
    }

    /// Read a contiguous global element range (spanning blocks as needed).
    pub fn read_elements(&mut self, range: Range<u64>) -> Result<Vec<Tet>, InputError> {
        let nelem = self.header.ntet_total();
        if range.start > range.end || range.end > nelem {
            return Err(InputError::ElemOutOfRange {
                from: range.start,
                till: range.end,
                nelem,
            });
        }
        let count = (range.end - range.start) as usize;
        self.file
            .seek(SeekFrom::Start(self.conn_start + TET_BYTES * range.start))?;
        let mut raw = vec![0u8; count * TET_BYTES as usize];
        self.file
            .read_exact(&mut raw)
            .map_err(|_| InputError::Truncated {
                what: "element connectivity",
            })?;
        let mut out = Vec::with_capacity(count);
        for rec in raw.chunks_exact(TET_BYTES as usize) {
            let mut tet = [NodeId::new(0); 4];
            for (k, w) in rec.chunks_exact(8).enumerate() {
                let id = u64::from_le_bytes(w.try_into().expect("8 bytes"));
                if id >= self.header.nnode {
                    return Err(InputError::NodeOutOfRange {
                        node: NodeId::new(id),
                        nnode: self.header.nnode,
                    });
                }
                tet[k] = NodeId::new(id);
            }
            out.push(tet);
        }
        Ok(out)
    }

    /// Read an element range within one block.
    pub fn read_block_range(&mut self, block: usize, range: Range<u64>) -> Result<Vec<Tet>, InputError> {
        let nblock = self.header.blocks.len();
        let ntet = *self
            .header
            .blocks
            .get(block)
            .ok_or(InputError::BlockOutOfRange { block, nblock })?;
        if range.start > range.end || range.end > ntet {
            return Err(InputError::ElemOutOfRange {
                from: range.start,
                till: range.end,
                nelem: ntet,
            });
        }
        let base: u64 = self.header.blocks[..block].iter().sum();
        self.read_elements(base + range.start..base + range.end)
    }

    /// Coordinates for an explicit node subset, in input order.
    pub fn read_coords(&mut self, ids: &[NodeId]) -> Result<Vec<[f64; 3]>, InputError> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if id.get() >= self.header.nnode {
                return Err(InputError::NodeOutOfRange {
                    node: id,
                    nnode: self.header.nnode,
                });
            }
            self.file
                .seek(SeekFrom::Start(self.coord_start + COORD_BYTES * id.get()))?;
            let mut raw = [0u8; COORD_BYTES as usize];
            self.file
                .read_exact(&mut raw)
                .map_err(|_| InputError::Truncated {
                    what: "node coordinates",
                })?;
            let x = f64::from_le_bytes(raw[0..8].try_into().expect("8 bytes"));
            let y = f64::from_le_bytes(raw[8..16].try_into().expect("8 bytes"));
            let z = f64::from_le_bytes(raw[16..24].try_into().expect("8 bytes"));
            out.push([x, y, z]);
        }
        Ok(out)
    }

    /// Read this PE's contiguous element slab.
    ///
    /// Elements `[rank*chunk, (rank+1)*chunk)` with `chunk = nelem/nranks`;
    /// the last PE absorbs the remainder. Returns the connectivity and the
    /// matching global element indices.
    pub fn read_slab(&mut self, rank: usize, nranks: usize) -> Result<(Vec<Tet>, Vec<u64>), InputError> {
        let nelem = self.header.ntet_total();
        let chunk = nelem / nranks as u64;
        let from = rank as u64 * chunk;
        let mut till = from + chunk;
        if rank == nranks - 1 {
            till += nelem % nranks as u64;
        }
        let tets = self.read_elements(from..till)?;
        let gelemid = (from..till).collect();
        Ok((tets, gelemid))
    }

    /// Write a mesh file (tooling and test fixtures).
    pub fn create(
        path: impl AsRef<Path>,
        blocks: &[Vec<Tet>],
        coords: &[[f64; 3]],
    ) -> Result<(), InputError> {
        let nnode = coords.len() as u64;
        for block in blocks {
            for tet in block {
                for &n in tet {
                    if n.get() >= nnode {
                        return Err(InputError::NodeOutOfRange { node: n, nnode });
                    }
                }
            }
        }
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&0u16.to_le_bytes())?;
        w.write_all(&nnode.to_le_bytes())?;
        w.write_all(&(blocks.len() as u64).to_le_bytes())?;
        for block in blocks {
            w.write_all(&(block.len() as u64).to_le_bytes())?;
        }
        for block in blocks {
            for tet in block {
                for &n in tet {
                    w.write_all(&n.get().to_le_bytes())?;
                }
            }
        }
        for &[x, y, z] in coords {
            w.write_all(&x.to_le_bytes())?;
            w.write_all(&y.to_le_bytes())?;
            w.write_all(&z.to_le_bytes())?;
        }
        w.flush()?;
        Ok(())
    }
}

fn read_u16(file: &mut File) -> Result<u16, InputError> {
    let mut b = [0u8; 2];
    file.read_exact(&mut b)
        .map_err(|_| InputError::Truncated { what: "header" })?;
    Ok(u16::from_le_bytes(b))
}

fn read_u64(file: &mut File) -> Result<u64, InputError> {
    let mut b = [0u8; 8];
    file.read_exact(&mut b)
        .map_err(|_| InputError::Truncated { what: "header" })?;
    Ok(u64::from_le_bytes(b))
}

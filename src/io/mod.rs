//! Mesh file access.
//!
//! Only the binary tetrahedral format consumed by the slab reader lives
//! here; general mesh readers and writers are external collaborators.

pub mod tetfile;

pub use tetfile::{TetFile, TetHeader};

//! Inter-PE communication: the non-blocking message layer, wire encoding,
//! and the symmetric exchange/reduction protocols built on top of them.

pub mod communicator;
pub mod exchange;
pub mod reduce;
pub mod wire;

//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use tet_part::io::TetFile;
use tet_part::mesh::{NodeId, Tet};

pub fn n(i: u64) -> NodeId {
    NodeId::new(i)
}

/// Two tetrahedra sharing face 1-2-3; nodes 0..4.
pub fn two_tets() -> (Vec<Tet>, Vec<[f64; 3]>) {
    let conn = vec![
        [n(0), n(1), n(2), n(3)],
        [n(1), n(2), n(3), n(4)],
    ];
    let coords = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
    ];
    (conn, coords)
}

/// Unit cube split into five tetrahedra; nodes 0..7.
pub fn cube_five_tets() -> (Vec<Tet>, Vec<[f64; 3]>) {
    let conn = vec![
        [n(0), n(1), n(2), n(5)],
        [n(0), n(2), n(3), n(7)],
        [n(0), n(4), n(5), n(7)],
        [n(2), n(5), n(6), n(7)],
        [n(0), n(2), n(5), n(7)],
    ];
    let coords = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
        [0.0, 1.0, 1.0],
    ];
    (conn, coords)
}

/// Chain of `len` tets where tet `e` is (e, e+1, e+2, e+3), spread along x.
pub fn tet_chain(len: u64) -> (Vec<Tet>, Vec<[f64; 3]>) {
    let conn: Vec<Tet> = (0..len)
        .map(|e| [n(e), n(e + 1), n(e + 2), n(e + 3)])
        .collect();
    let coords: Vec<[f64; 3]> = (0..len + 3)
        .map(|i| [i as f64, (i % 2) as f64, ((i / 2) % 2) as f64])
        .collect();
    (conn, coords)
}

pub fn write_mesh(
    dir: &std::path::Path,
    name: &str,
    conn: &[Tet],
    coords: &[[f64; 3]],
) -> std::path::PathBuf {
    let path = dir.join(name);
    TetFile::create(&path, &[conn.to_vec()], coords).unwrap();
    path
}

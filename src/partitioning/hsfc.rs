//! Hilbert space-filling-curve partitioning over element centroids.
//!
//! Centroids are quantized onto a `2^ORDER` lattice inside the global
//! bounding box, ordered by their Hilbert index (Skilling's transpose
//! construction), and the curve is cut into `nparts` balanced runs.
//! Elements close on the curve are close in space, so the runs are
//! spatially compact.

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Bits per dimension; 3 * ORDER key bits must fit in a u64.
const ORDER: u32 = 20;

/// Assign `nparts` part ids by Hilbert-curve ordering.
pub fn partition(centroids: &[[f64; 3]], nparts: u64) -> Vec<u64> {
    let (lo, extent) = bounding_box(centroids);
    let quantize = |c: &[f64; 3]| {
        let mut q = [0u32; 3];
        for a in 0..3 {
            let t = if extent[a] > 0.0 {
                ((c[a] - lo[a]) / extent[a]).clamp(0.0, 1.0)
            } else {
                0.0
            };
            q[a] = (t * ((1u64 << ORDER) - 1) as f64) as u32;
        }
        q
    };

    #[cfg(feature = "rayon")]
    let mut keyed: Vec<(u64, usize)> = centroids
        .par_iter()
        .enumerate()
        .map(|(i, c)| (hilbert_key(quantize(c)), i))
        .collect();
    #[cfg(not(feature = "rayon"))]
    let mut keyed: Vec<(u64, usize)> = centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (hilbert_key(quantize(c)), i))
        .collect();

    keyed.sort_unstable();

    let n = centroids.len();
    let mut out = vec![0u64; n];
    for p in 0..nparts {
        let from = crate::partitioning::balanced_cut(n, nparts, p);
        let till = crate::partitioning::balanced_cut(n, nparts, p + 1);
        for &(_, i) in &keyed[from..till] {
            out[i] = p;
        }
    }
    out
}

fn bounding_box(centroids: &[[f64; 3]]) -> ([f64; 3], [f64; 3]) {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for c in centroids {
        for a in 0..3 {
            lo[a] = lo[a].min(c[a]);
            hi[a] = hi[a].max(c[a]);
        }
    }
    let extent = [hi[0] - lo[0], hi[1] - lo[1], hi[2] - lo[2]];
    (lo, extent)
}

/// Hilbert index of a lattice point (Skilling's axes-to-transpose pass,
/// then bit interleave, most significant plane first).
fn hilbert_key(mut x: [u32; 3]) -> u64 {
    let mut q: u32 = 1 << (ORDER - 1);
    while q > 1 {
        let p = q - 1;
        for i in 0..3 {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }
    for i in 1..3 {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u32;
    let mut q: u32 = 1 << (ORDER - 1);
    while q > 1 {
        if x[2] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in &mut x {
        *xi ^= t;
    }

    let mut key = 0u64;
    for b in (0..ORDER).rev() {
        for xi in &x {
            key = (key << 1) | ((xi >> b) & 1) as u64;
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_keys_are_distinct_on_a_grid() {
        let mut keys = std::collections::BTreeSet::new();
        for x in 0..4u32 {
            for y in 0..4u32 {
                for z in 0..4u32 {
                    keys.insert(hilbert_key([x << 15, y << 15, z << 15]));
                }
            }
        }
        assert_eq!(keys.len(), 64);
    }

    #[test]
    fn adjacent_lattice_steps_stay_close() {
        // Successive curve positions differ by one lattice step; walk a
        // small grid and check every element lands somewhere.
        let cents: Vec<[f64; 3]> = (0..16)
            .map(|i| [(i % 4) as f64, (i / 4) as f64, 0.0])
            .collect();
        let part = partition(&cents, 4);
        let mut sizes = [0usize; 4];
        for &p in &part {
            sizes[p as usize] += 1;
        }
        assert_eq!(sizes, [4, 4, 4, 4]);
    }

    #[test]
    fn degenerate_extent_is_tolerated() {
        let cents = vec![[1.0, 2.0, 3.0]; 3];
        let part = partition(&cents, 1);
        assert_eq!(part, vec![0, 0, 0]);
    }
}

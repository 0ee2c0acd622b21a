//! Recursive inertial bisection over element centroids.
//!
//! Like coordinate bisection, but each split is taken at the median of the
//! projection onto the principal axis of the subset's inertia (covariance)
//! tensor, found by power iteration. Better cuts on meshes that are long
//! in an oblique direction.

/// Assign `nparts` part ids by recursive inertial bisection. Deterministic:
/// the power iteration starts from a fixed vector and projection ties break
/// on element index.
pub fn partition(centroids: &[[f64; 3]], nparts: u64) -> Vec<u64> {
    let mut out = vec![0u64; centroids.len()];
    let mut idx: Vec<usize> = (0..centroids.len()).collect();
    bisect(centroids, &mut idx, 0, nparts, &mut out);
    out
}

fn bisect(centroids: &[[f64; 3]], idx: &mut [usize], first: u64, nparts: u64, out: &mut [u64]) {
    if nparts <= 1 {
        for &i in idx.iter() {
            out[i] = first;
        }
        return;
    }
    let k0 = nparts / 2;
    let cut = (idx.len() as u64 * k0 / nparts) as usize;
    let axis = principal_axis(centroids, idx);
    let proj = |i: usize| {
        centroids[i][0] * axis[0] + centroids[i][1] * axis[1] + centroids[i][2] * axis[2]
    };
    idx.select_nth_unstable_by(cut, |&a, &b| proj(a).total_cmp(&proj(b)).then(a.cmp(&b)));
    let (lo, hi) = idx.split_at_mut(cut);
    bisect(centroids, lo, first, k0, out);
    bisect(centroids, hi, first + k0, nparts - k0, out);
}

/// Dominant eigenvector of the covariance tensor of the subset.
fn principal_axis(centroids: &[[f64; 3]], idx: &[usize]) -> [f64; 3] {
    let n = idx.len() as f64;
    let mut mean = [0.0f64; 3];
    for &i in idx {
        for a in 0..3 {
            mean[a] += centroids[i][a];
        }
    }
    for m in &mut mean {
        *m /= n;
    }
    // Symmetric 3x3 covariance: xx, xy, xz, yy, yz, zz.
    let mut c = [0.0f64; 6];
    for &i in idx {
        let d = [
            centroids[i][0] - mean[0],
            centroids[i][1] - mean[1],
            centroids[i][2] - mean[2],
        ];
        c[0] += d[0] * d[0];
        c[1] += d[0] * d[1];
        c[2] += d[0] * d[2];
        c[3] += d[1] * d[1];
        c[4] += d[1] * d[2];
        c[5] += d[2] * d[2];
    }
    // Fixed, non-axis-aligned start so the iteration cannot stall on a
    // perpendicular eigenvector of an axis-aligned cloud.
    let mut v = [0.577_350_269, 0.577_350_269, 0.577_350_269];
    for _ in 0..64 {
        let w = [
            c[0] * v[0] + c[1] * v[1] + c[2] * v[2],
            c[1] * v[0] + c[3] * v[1] + c[4] * v[2],
            c[2] * v[0] + c[4] * v[1] + c[5] * v[2],
        ];
        let norm = (w[0] * w[0] + w[1] * w[1] + w[2] * w[2]).sqrt();
        if norm < 1e-30 {
            // Degenerate cloud (single point or numerically flat): any axis.
            return [1.0, 0.0, 0.0];
        }
        v = [w[0] / norm, w[1] / norm, w[2] / norm];
    }
    v
}

//! Recursive coordinate bisection over element centroids.

/// Assign `nparts` part ids by recursively splitting the element set at the
/// median of the widest bounding-box axis. Part sizes stay balanced to
/// within one element; ties on a coordinate break on element index, so the
/// assignment is deterministic.
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
    let axis = widest_axis(centroids, idx);
    idx.select_nth_unstable_by(cut, |&a, &b| {
        centroids[a][axis]
            .total_cmp(&centroids[b][axis])
            .then(a.cmp(&b))
    });
    let (lo, hi) = idx.split_at_mut(cut);
    bisect(centroids, lo, first, k0, out);
    bisect(centroids, hi, first + k0, nparts - k0, out);
}

fn widest_axis(centroids: &[[f64; 3]], idx: &[usize]) -> usize {
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for &i in idx {
        for a in 0..3 {
            min[a] = min[a].min(centroids[i][a]);
            max[a] = max[a].max(centroids[i][a]);
        }
    }
    let mut axis = 0;
    let mut width = max[0] - min[0];
    for a in 1..3 {
        if max[a] - min[a] > width {
            width = max[a] - min[a];
            axis = a;
        }
    }
    axis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_a_line_in_half() {
        let cents: Vec<[f64; 3]> = (0..8).map(|i| [i as f64, 0.0, 0.0]).collect();
        let part = partition(&cents, 2);
        assert_eq!(part, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn balanced_sizes_for_odd_counts() {
        let cents: Vec<[f64; 3]> = (0..7).map(|i| [0.0, i as f64, 0.0]).collect();
        let part = partition(&cents, 3);
        let mut sizes = [0usize; 3];
        for &p in &part {
            sizes[p as usize] += 1;
        }
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.iter().all(|&s| s == 2 || s == 3));
    }

    #[test]
    fn picks_the_widest_axis() {
        // Points spread along z only; a split along x or y would degenerate.
        let cents: Vec<[f64; 3]> = (0..4).map(|i| [0.5, 0.5, i as f64]).collect();
        let part = partition(&cents, 2);
        assert_eq!(part, vec![0, 0, 1, 1]);
    }
}

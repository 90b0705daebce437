//! Candidate error bounds from order statistics of the per-value bounds.

use std::cmp::Ordering;

use crate::qoi::Qoi;

/// One candidate bound per value: the largest error at that value that keeps
/// the QoI within tolerance, capped at `cap`.
pub fn per_value_bounds(chunk: &[f64], qoi: &dyn Qoi, cap: f64) -> Vec<f64> {
    chunk.iter().map(|&v| qoi.interpret_eb(v).min(cap)).collect()
}

/// Index of each fraction's order statistic within the lowest
/// `k = ceil(rate·n)` bounds.
pub fn quantile_positions(n: usize, rate: f64, fractions: &[f64]) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let k = ((rate * n as f64).ceil() as usize).clamp(1, n);
    fractions
        .iter()
        .map(|&f| ((f * k as f64) as usize).min(n - 1))
        .collect()
}

/// Candidate bounds at each quantile position, in the order of `fractions`.
///
/// Uses partial selection rather than a sort. After the first selection every
/// smaller order statistic lies in the prefix before it, so later
/// selections only reorder that prefix. `ebs` is left partially reordered.
pub fn candidate_bounds(ebs: &mut [f64], rate: f64, fractions: &[f64]) -> Vec<f64> {
    let positions = quantile_positions(ebs.len(), rate, fractions);
    let mut out = Vec::with_capacity(positions.len());
    let mut prefix = ebs.len();

    for pos in positions {
        let window = if pos < prefix { &mut ebs[..prefix] } else { &mut ebs[..] };
        window.select_nth_unstable_by(pos, cmp_bound);
        out.push(ebs[pos]);
        prefix = pos + 1;
    }
    out
}

fn cmp_bound(a: &f64, b: &f64) -> Ordering {
    a.total_cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRACTIONS: [f64; 7] = [1.0, 0.5, 0.25, 0.10, 0.05, 0.025, 0.01];

    #[test]
    fn positions_follow_fractions_of_k() {
        // n = 1000 -> k = 200
        let pos = quantile_positions(1000, 0.2, &FRACTIONS);
        assert_eq!(pos, vec![200, 100, 50, 20, 10, 5, 2]);
    }

    #[test]
    fn tiny_chunks_stay_in_bounds() {
        let pos = quantile_positions(3, 0.2, &FRACTIONS);
        assert!(pos.iter().all(|&p| p < 3));
    }

    #[test]
    fn candidates_match_sorted_order_statistics() {
        let mut rng = 0x9E37_79B9_7F4A_7C15u64;
        let mut ebs: Vec<f64> = (0..5000)
            .map(|_| {
                rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (rng >> 11) as f64 / (1u64 << 53) as f64
            })
            .collect();
        let mut sorted = ebs.clone();
        sorted.sort_by(f64::total_cmp);

        let cands = candidate_bounds(&mut ebs, 0.2, &FRACTIONS);
        let pos = quantile_positions(5000, 0.2, &FRACTIONS);
        for (c, p) in cands.iter().zip(pos) {
            assert_eq!(*c, sorted[p]);
        }
        assert!(cands.windows(2).all(|w| w[0] >= w[1]), "loosest first");
    }
}

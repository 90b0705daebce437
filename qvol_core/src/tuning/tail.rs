//! Hoeffding-style pre-scaling of the QoI tolerance for regional QoIs.
//!
//! Errors averaged over a block of `n` values partially cancel, so with high
//! probability the per-value bound can be looser than the naive one by a
//! factor that grows with `sqrt(n)`.

/// Inflation factor `k · sqrt(0.5·n / ln(2/p))`.
///
/// `p` is the per-block failure probability implied by confidence `q` over
/// `num_blocks` blocks: the union bound `(1-q)/N` for high confidence and
/// many blocks, otherwise the exact `1 - q^(1/N)`.
pub fn hoeffding_rate(n: usize, num_blocks: usize, q: f64, k: f64) -> f64 {
    let blocks = num_blocks.max(1) as f64;
    let p = if q >= 0.95 && num_blocks >= 1000 {
        (1.0 - q) / blocks
    } else {
        1.0 - q.powf(1.0 / blocks)
    };
    k * (0.5 * n as f64 / (2.0 / p).ln()).sqrt()
}

/// Empirical upper limit of the inflation factor for near-identity QoIs,
/// keyed by block edge length.
pub fn rate_ceiling(block_size: usize, ceilings: &[(usize, f64)], fallback: f64) -> f64 {
    ceilings
        .iter()
        .find(|&&(edge, _)| block_size <= edge)
        .map_or(fallback, |&(_, cap)| cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_block_rate_matches_formula() {
        // n = 8^3, q = 0.999, one block: p = 0.001
        let rate = hoeffding_rate(512, 1, 0.999, 2.0);
        let expected = 2.0 * (256.0f64 / 2000.0f64.ln()).sqrt();
        assert!((rate - expected).abs() < 1e-9);
        assert!(rate > 11.0 && rate < 12.0);
    }

    #[test]
    fn many_blocks_use_union_bound() {
        let rate = hoeffding_rate(64, 5000, 0.99, 1.0);
        let p: f64 = 0.01 / 5000.0;
        assert!((rate - (32.0 / (2.0 / p).ln()).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn ceilings_step_with_block_edge() {
        let table = [(4, 4.0), (8, 8.0), (16, 12.0), (32, 16.0)];
        assert_eq!(rate_ceiling(2, &table, 32.0), 4.0);
        assert_eq!(rate_ceiling(8, &table, 32.0), 8.0);
        assert_eq!(rate_ceiling(9, &table, 32.0), 12.0);
        assert_eq!(rate_ceiling(32, &table, 32.0), 16.0);
        assert_eq!(rate_ceiling(64, &table, 32.0), 32.0);
    }
}

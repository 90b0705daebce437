//! Rate/distortion trial and the accept/reject loop over candidate bounds.

use tracing::debug;

use super::sampling::Sample;
use crate::codec::{Codec, CodecError};
use crate::qoi::Qoi;

/// Result of searching one chunk's candidate bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOutcome {
    pub best_eb: f64,
    /// Bits per value measured for `best_eb`; infinite when no trial ran.
    pub best_rate: f64,
    pub trials: usize,
}

/// A candidate replaces the current best when its rate is below
/// `slack × best`. With slack above one, a looser bound wins near-ties.
pub fn accept_candidate(rate: f64, best_rate: f64, slack: f64) -> bool {
    rate < best_rate * slack
}

/// Walk `candidates` in order, measuring each with `trial`.
///
/// `initial` is the answer if nothing is accepted. A candidate at or below
/// `floor` ends the search; when it is the very first candidate, `floor`
/// itself becomes the answer.
pub fn search_best_bound<E>(
    candidates: &[f64],
    initial: f64,
    floor: f64,
    slack: f64,
    mut trial: impl FnMut(f64) -> Result<f64, E>,
) -> Result<SearchOutcome, E> {
    let mut best = SearchOutcome {
        best_eb: initial,
        best_rate: f64::INFINITY,
        trials: 0,
    };

    for (idx, &eb) in candidates.iter().enumerate() {
        if eb <= floor {
            if idx == 0 {
                best.best_eb = floor;
            }
            break;
        }

        let rate = trial(eb)?;
        best.trials += 1;
        debug!(eb, rate, "trial compression");
        if accept_candidate(rate, best.best_rate, slack) {
            best.best_rate = rate;
            best.best_eb = eb;
        }
    }

    if !best.best_eb.is_finite() {
        if let Some(&first) = candidates.first() {
            best.best_eb = first.max(floor);
        }
    }
    Ok(best)
}

/// Settings shared by every trial of one chunk.
#[derive(Debug, Clone, Copy)]
pub struct TrialSettings {
    pub qoi_tolerance: f64,
    pub qoi_block_size: usize,
    pub high_prec: bool,
}

/// Compress every sampled block at tolerance `eb` and return the realised
/// bits per value over the whole sample.
pub fn trial_rate<C: Codec + ?Sized>(
    codec: &mut C,
    sample: &Sample,
    eb: f64,
    qoi: &dyn Qoi,
    settings: TrialSettings,
) -> Result<f64, CodecError> {
    let mut model = qoi.box_clone();
    model.set_global_eb(eb);

    codec.set_dims(sample.dims);
    codec.set_tolerance(eb);
    codec.set_qoi(model);
    codec.set_qoi_tolerance(settings.qoi_tolerance);
    codec.set_qoi_block_size(settings.qoi_block_size);

    let mut bytes = 0usize;
    for block in &sample.blocks {
        codec.take_data(block.clone());
        codec.compress(settings.high_prec)?;
        bytes += codec.encoded_len();
    }

    let values = sample.num_values();
    if values == 0 {
        return Ok(0.0);
    }
    Ok(bytes as f64 * 8.0 / values as f64)
}

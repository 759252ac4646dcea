//! Per-spectrum survival-function modeling: the score histogram tail is
//! smoothed, fit to a log-Weibull (Gumbel) response by gradient descent,
//! and the log-survival tail is reduced to a line whose extrapolation at
//! the best hyperscore yields the expectation value.

use crate::codec::{dequantize, PartialRecord};
use crate::error::EngineError;
use crate::math;

/// Largest representable hyperscore; histogram bins are `score * 10`.
pub const MAX_HYPERSCORE: usize = 100;

/// Number of bins in a score histogram.
pub const HISTOGRAM_BINS: usize = 2 + MAX_HYPERSCORE * 10;

const FIT_ITERS: usize = 100;
const FIT_RATE: f64 = 0.1;
const FIT_CUTOFF: f64 = 1e-4;

/// Fraction of the smoothed curve mixed into the raw tail.
const SMOOTH_MIX: f64 = 0.35;

/// The fitted tail line in log10-survival space.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TailFit {
    pub slope: f64,
    pub intercept: f64,
}

/// Outcome of a survival-function fit. Degenerate histograms are ordinary
/// values here, not errors; the caller suppresses the E-value and keeps
/// scoring.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FitOutcome {
    Fitted(TailFit),
    NotEnoughData,
}

impl FitOutcome {
    pub fn fit(&self) -> Option<&TailFit> {
        match self {
            FitOutcome::Fitted(fit) => Some(fit),
            FitOutcome::NotEnoughData => None,
        }
    }
}

/// Expected number of equally good or better matches among `vaa` random
/// scorings, for a score landing in histogram bin `hyp_bin`.
pub fn evalue(fit: &TailFit, hyp_bin: usize, vaa: i64) -> f64 {
    10f64.powf(hyp_bin as f64 * fit.slope + fit.intercept) * vaa as f64
}

/// Rightmost index in `data[lo..=hi]` whose value reaches `value`;
/// falls back to `hi` when nothing qualifies.
pub(crate) fn rightmost_at_least(data: &[f64], lo: usize, hi: usize, value: f64) -> usize {
    for p in (lo..=hi).rev() {
        if data[p] >= value {
            return p;
        }
    }
    hi
}

/// Leftmost index in `data[lo..=hi]` whose value reaches `value`;
/// falls back to `lo` when nothing qualifies.
pub(crate) fn leftmost_at_least(data: &[f64], lo: usize, hi: usize, value: f64) -> usize {
    for p in lo..=hi {
        if data[p] >= value {
            return p;
        }
    }
    lo
}

/// Leftmost index in `data[lo..=hi]` whose value has dropped to `value`;
/// falls back to `lo` when nothing qualifies.
fn leftmost_at_most(data: &[f64], lo: usize, hi: usize, value: f64) -> usize {
    for p in lo..=hi {
        if data[p] <= value {
            return p;
        }
    }
    lo
}

fn argmax(data: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in data.iter().enumerate() {
        if v > data[best] {
            best = i;
        }
    }
    best
}

#[inline]
fn gumbel_response(x: f64, mu: f64, beta: f64) -> f64 {
    let z = (x - mu) / beta;
    (1.0 / beta) * (-(z + (-z).exp())).exp()
}

/// Fit `(mu, beta)` to the normalized tail `y` spanning bins `s..=e` by
/// gradient descent on the mean-squared error of the Gumbel pdf.
fn log_weibull_fit(y: &[f64], s: usize, e: usize, mu: &mut f64, beta: &mut f64) -> f64 {
    let xs = (s..=e).map(|x| x as f64).collect::<Vec<_>>();
    let mut err = f64::INFINITY;

    for _ in 0..FIT_ITERS {
        let mut d_beta = 0.0;
        let mut d_mu = 0.0;
        err = 0.0;

        for (i, &x) in xs.iter().enumerate() {
            let h = gumbel_response(x, *mu, *beta);
            let diff = y[i] - h;
            err += diff * diff;

            // zn = (mu - x) / beta = -z; exp(zn) = e^-z
            let zn = (*mu - x) / *beta;
            let ez = zn.exp();

            // d h / d beta = -(h / beta) * (1 + zn - zn * e^-z)
            d_beta += diff * (-(h / *beta) * (1.0 + zn - zn * ez));
            // d h / d mu = (h / beta) * (1 - e^-z)
            d_mu += diff * ((h / *beta) * (1.0 - ez));
        }

        if err < FIT_CUTOFF {
            break;
        }
        *mu += FIT_RATE * d_mu;
        *beta += FIT_RATE * d_beta;
    }
    err
}

/// Model the survival function of a score histogram.
///
/// `yy` is the raw per-bin PSM count histogram, `vaa` the number of
/// candidate PSMs that contributed, and `hyp_bin` the bin of the best
/// hyperscore observed; only `yy[..hyp_bin]` is modeled.
pub fn model_survival(yy: &[f64], vaa: i64, hyp_bin: usize) -> FitOutcome {
    if yy.is_empty() {
        return FitOutcome::NotEnoughData;
    }
    let hi = hyp_bin.clamp(1, yy.len()) - 1;

    // Tail region: rightmost and leftmost occupied bins
    let mut end1 = rightmost_at_least(yy, 0, hi, 1.0);
    let stt1 = leftmost_at_least(yy, 0, end1, 1.0);
    if stt1 == end1 {
        end1 = (end1 + 1).min(yy.len() - 1);
    }
    if vaa < 1 || stt1 == end1 {
        return FitOutcome::NotEnoughData;
    }

    let mut tail = yy[stt1..=end1].to_vec();
    let raw_peak = argmax(&tail);
    let mut smooth_peak = raw_peak;

    let mut window = (end1 - stt1).min(7);
    if window % 2 == 0 {
        window -= 1;
    }

    if window > 1 {
        let order = (window - 1).min(5);
        if tail.len() >= window + 1 {
            let half = ((window - 1) / 2).max(1);
            let mut smoothed = math::savgol_smooth(&tail, half, order);
            for v in &mut smoothed {
                if *v < 0.0 {
                    *v = 0.0;
                }
            }

            // Both curves are normalized by the same mass before mixing
            let norm = smoothed.iter().sum::<f64>().max(vaa as f64);
            for v in &mut smoothed {
                *v /= norm;
            }
            for v in &mut tail {
                *v /= norm;
            }

            smooth_peak = argmax(&smoothed);
            for (raw, smooth) in tail.iter_mut().zip(&smoothed) {
                *raw = SMOOTH_MIX * smooth + (1.0 - SMOOTH_MIX) * *raw;
            }
        } else {
            let norm = tail.iter().sum::<f64>().max(vaa as f64);
            for v in &mut tail {
                *v /= norm;
            }
        }
    } else {
        let norm = tail.iter().sum::<f64>().max(vaa as f64);
        for v in &mut tail {
            *v /= norm;
        }
    }

    let mut mu = stt1 as f64 + (raw_peak + smooth_peak) as f64 / 2.0;
    let mut beta = 4.0;
    log_weibull_fit(&tail, stt1, end1, &mut mu, &mut beta);

    // Modeled response across the full scored range, scaled back to counts
    let response = (0..=hi)
        .map(|x| vaa as f64 * gumbel_response(x as f64, mu, beta))
        .collect::<Vec<_>>();

    // Trim to the region carrying the distribution mass
    let ends = rightmost_at_least(&response, 0, hi, 0.99);
    let stt = leftmost_at_least(&response, 0, ends, 0.99);
    let window = &response[stt..=ends];

    // s(x) = 1 - cumsum(response) / vaa, clamped into (0, 1)
    let mut sx = Vec::with_capacity(window.len());
    let mut cumulative = 0.0;
    for &v in window {
        cumulative += v;
        sx.push(1.0 - cumulative / vaa as f64);
    }
    for v in &mut sx {
        if *v > 1.0 {
            *v = 0.999;
        }
    }
    let smallest_positive = sx[rightmost_at_least(&sx, 0, sx.len() - 1, 1e-4)];
    for v in &mut sx {
        if *v <= 0.0 {
            *v = smallest_positive;
        }
    }
    for v in &mut sx {
        *v = v.log10();
    }

    // Regression window between 22% and 87% of the log-survival drop
    let len = sx.len();
    let height = sx[len - 1] - sx[0];
    let (mut mark, mark2);
    if len > 3 {
        mark = leftmost_at_most(&sx, 0, len - 1, sx[0] + height * 0.22).saturating_sub(1);
        mark2 = rightmost_at_least(&sx, 0, len - 1, sx[0] + height * 0.87);
    } else if len == 3 {
        mark = leftmost_at_most(&sx, 0, len - 1, sx[0] + height * 0.22).saturating_sub(1);
        mark2 = len - 1;
    } else {
        mark = 0;
        mark2 = len - 1;
    }
    if mark >= mark2 {
        mark = mark2.saturating_sub(1);
    }

    let xs = (stt + mark..=stt + mark2)
        .map(|x| x as f64)
        .collect::<Vec<_>>();
    let (slope, intercept) = math::linear_fit(&xs, &sx[mark..=mark2]);

    FitOutcome::Fitted(TailFit { slope, intercept })
}

/// Accumulates decoded histogram tails from every shard of the database,
/// then fits the combined distribution on the owner node.
#[derive(Clone, Debug)]
pub struct PartialSurvival {
    pdata: Vec<f64>,
    p_n: i64,
    max_hyperscore: f32,
}

impl Default for PartialSurvival {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialSurvival {
    pub fn new() -> Self {
        Self {
            pdata: vec![0.0; HISTOGRAM_BINS],
            p_n: 0,
            max_hyperscore: 0.0,
        }
    }

    pub fn psms(&self) -> i64 {
        self.p_n
    }

    pub fn max_hyperscore(&self) -> f32 {
        self.max_hyperscore
    }

    /// Blit one node's contribution into the combined histogram. The
    /// aggregate is commutative, so receive order does not matter.
    pub fn accumulate(
        &mut self,
        record: &PartialRecord,
        samples: &[u16],
    ) -> Result<(), EngineError> {
        let min = record.min as usize;
        let max2 = record.max2 as usize;
        if max2 >= self.pdata.len() || min > max2 || max2 - min + 1 > samples.len() {
            return Err(EngineError::InvalidIndex { min, max: max2 });
        }

        for bin in min..=max2 {
            self.pdata[bin] += dequantize(samples[bin - min], record.n);
        }
        self.p_n += record.n as i64;
        if record.max > self.max_hyperscore {
            self.max_hyperscore = record.max;
        }
        Ok(())
    }

    /// Fit the combined histogram and return the global E-value, or `None`
    /// when the distribution never accumulated enough data.
    pub fn finish(&self) -> Option<f64> {
        let hyp_bin =
            (((self.max_hyperscore as f64) * 10.0).round() as usize).min(HISTOGRAM_BINS - 1);
        model_survival(&self.pdata, self.p_n, hyp_bin)
            .fit()
            .map(|fit| evalue(fit, hyp_bin, self.p_n))
    }
}

//! Digital filters for biosignal processing
//!
//! IIR designs are produced as transfer-function coefficient pairs `(b, a)`
//! and applied forward-backward so the output carries no phase shift.

use emg_core::{EmgError, EmgResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Filter types supported by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    /// Butterworth lowpass filter
    ButterworthLowpass,
    /// Butterworth highpass filter
    ButterworthHighpass,
    /// Butterworth bandpass filter
    ButterworthBandpass,
    /// Notch filter for powerline interference
    Notch,
}

/// Filter configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter type
    pub filter_type: FilterType,
    /// Filter order (for Butterworth designs)
    pub order: usize,
    /// Cutoff frequency for lowpass/highpass (Hz)
    pub cutoff_freq: Option<f64>,
    /// Low cutoff for bandpass (Hz)
    pub low_cutoff: Option<f64>,
    /// High cutoff for bandpass (Hz)
    pub high_cutoff: Option<f64>,
    /// Notch frequency (Hz) - typically 50 or 60
    pub notch_freq: Option<f64>,
    /// Notch quality factor
    pub notch_q: Option<f64>,
}

impl FilterConfig {
    /// Create lowpass filter configuration
    pub fn lowpass(cutoff_freq: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::ButterworthLowpass,
            order,
            cutoff_freq: Some(cutoff_freq),
            low_cutoff: None,
            high_cutoff: None,
            notch_freq: None,
            notch_q: None,
        }
    }

    /// Create highpass filter configuration
    pub fn highpass(cutoff_freq: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::ButterworthHighpass,
            order,
            cutoff_freq: Some(cutoff_freq),
            low_cutoff: None,
            high_cutoff: None,
            notch_freq: None,
            notch_q: None,
        }
    }

    /// Create bandpass filter configuration
    pub fn bandpass(low_cutoff: f64, high_cutoff: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::ButterworthBandpass,
            order,
            cutoff_freq: None,
            low_cutoff: Some(low_cutoff),
            high_cutoff: Some(high_cutoff),
            notch_freq: None,
            notch_q: None,
        }
    }

    /// Create notch filter configuration
    pub fn notch(freq: f64, q: f64) -> Self {
        Self {
            filter_type: FilterType::Notch,
            order: 2,
            cutoff_freq: None,
            low_cutoff: None,
            high_cutoff: None,
            notch_freq: Some(freq),
            notch_q: Some(q),
        }
    }

    /// Design coefficients for the given sampling rate
    pub fn design(&self, sampling_rate: f64) -> EmgResult<FilterCoefficients> {
        if !(sampling_rate > 0.0) {
            return Err(design_error("sampling rate must be positive"));
        }
        let nyquist = sampling_rate / 2.0;

        match self.filter_type {
            FilterType::ButterworthLowpass | FilterType::ButterworthHighpass => {
                let cutoff = self.cutoff_freq
                    .ok_or_else(|| design_error("lowpass/highpass filter requires cutoff frequency"))?;
                check_band_edge(cutoff, nyquist)?;
                let prototype = Zpk::butterworth_prototype(self.order)?;
                let warped = prewarp(cutoff, sampling_rate);
                let analog = if self.filter_type == FilterType::ButterworthLowpass {
                    prototype.lowpass(warped)
                } else {
                    prototype.highpass(warped)
                };
                Ok(analog.bilinear().into_coefficients())
            }
            FilterType::ButterworthBandpass => {
                let (low, high) = match (self.low_cutoff, self.high_cutoff) {
                    (Some(low), Some(high)) => (low, high),
                    _ => return Err(design_error("bandpass filter requires low and high cutoff frequencies")),
                };
                if low >= high {
                    return Err(design_error("low cutoff must be less than high cutoff"));
                }
                check_band_edge(low, nyquist)?;
                check_band_edge(high, nyquist)?;
                let prototype = Zpk::butterworth_prototype(self.order)?;
                let w1 = prewarp(low, sampling_rate);
                let w2 = prewarp(high, sampling_rate);
                Ok(prototype.bandpass((w1 * w2).sqrt(), w2 - w1).bilinear().into_coefficients())
            }
            FilterType::Notch => {
                let freq = self.notch_freq
                    .ok_or_else(|| design_error("notch filter requires notch frequency"))?;
                let q = self.notch_q
                    .ok_or_else(|| design_error("notch filter requires quality factor"))?;
                check_band_edge(freq, nyquist)?;
                if !(q > 0.0) {
                    return Err(design_error("notch quality factor must be positive"));
                }
                Ok(FilterCoefficients::notch(freq / nyquist, q))
            }
        }
    }

    /// Short stage name used in diagnostics
    pub fn stage_name(&self) -> &'static str {
        match self.filter_type {
            FilterType::ButterworthLowpass => "lowpass",
            FilterType::ButterworthHighpass => "highpass",
            FilterType::ButterworthBandpass => "bandpass",
            FilterType::Notch => "notch",
        }
    }
}

fn design_error(reason: &str) -> EmgError {
    EmgError::InvalidFilterDesign { reason: reason.to_string() }
}

fn check_band_edge(freq: f64, nyquist: f64) -> EmgResult<()> {
    if !(freq > 0.0) || freq >= nyquist {
        return Err(EmgError::InvalidFilterDesign {
            reason: format!("frequency {} Hz must lie in (0, {}) Hz", freq, nyquist),
        });
    }
    Ok(())
}

/// Analog frequency for a digital one, with the bilinear transform at fs = 2
fn prewarp(freq: f64, sampling_rate: f64) -> f64 {
    4.0 * (PI * freq / sampling_rate).tan()
}

/// Zeros, poles and gain of an analog or digital filter
#[derive(Debug, Clone)]
struct Zpk {
    zeros: Vec<Complex64>,
    poles: Vec<Complex64>,
    gain: f64,
}

impl Zpk {
    /// Normalized analog Butterworth lowpass, cutoff 1 rad/s
    fn butterworth_prototype(order: usize) -> EmgResult<Self> {
        if order == 0 {
            return Err(design_error("Butterworth order must be at least 1"));
        }
        let n = order as f64;
        let poles = (0..order)
            .map(|k| {
                let m = 2.0 * k as f64 - (n - 1.0);
                -Complex64::from_polar(1.0, PI * m / (2.0 * n))
            })
            .collect();
        Ok(Zpk { zeros: Vec::new(), poles, gain: 1.0 })
    }

    fn relative_degree(&self) -> usize {
        self.poles.len() - self.zeros.len()
    }

    fn lowpass(self, wo: f64) -> Self {
        let degree = self.relative_degree();
        Zpk {
            zeros: self.zeros.iter().map(|&z| z * wo).collect(),
            poles: self.poles.iter().map(|&p| p * wo).collect(),
            gain: self.gain * wo.powi(degree as i32),
        }
    }

    fn highpass(self, wo: f64) -> Self {
        let degree = self.relative_degree();
        let num: Complex64 = self.zeros.iter().map(|&z| -z).product();
        let den: Complex64 = self.poles.iter().map(|&p| -p).product();
        let wo = Complex64::new(wo, 0.0);

        let mut zeros: Vec<Complex64> = self.zeros.iter().map(|&z| wo / z).collect();
        zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
        Zpk {
            zeros,
            poles: self.poles.iter().map(|&p| wo / p).collect(),
            gain: self.gain * (num / den).re,
        }
    }

    fn bandpass(self, wo: f64, bw: f64) -> Self {
        let degree = self.relative_degree();
        let wo2 = Complex64::new(wo * wo, 0.0);
        let split = |roots: &[Complex64]| -> Vec<Complex64> {
            let scaled: Vec<Complex64> = roots.iter().map(|&r| r * (bw / 2.0)).collect();
            let upper = scaled.iter().map(|&r| r + (r * r - wo2).sqrt());
            let lower = scaled.iter().map(|&r| r - (r * r - wo2).sqrt());
            upper.chain(lower).collect()
        };

        let mut zeros = split(&self.zeros);
        zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
        Zpk {
            zeros,
            poles: split(&self.poles),
            gain: self.gain * bw.powi(degree as i32),
        }
    }

    /// Map the analog filter to the z-plane (fs = 2, matching `prewarp`)
    fn bilinear(self) -> Self {
        let fs2 = Complex64::new(4.0, 0.0);
        let degree = self.relative_degree();
        let num: Complex64 = self.zeros.iter().map(|&z| fs2 - z).product();
        let den: Complex64 = self.poles.iter().map(|&p| fs2 - p).product();

        let mut zeros: Vec<Complex64> = self.zeros.iter().map(|&z| (fs2 + z) / (fs2 - z)).collect();
        zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
        Zpk {
            zeros,
            poles: self.poles.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect(),
            gain: self.gain * (num / den).re,
        }
    }

    fn into_coefficients(self) -> FilterCoefficients {
        let b = poly(&self.zeros).into_iter().map(|c| c.re * self.gain).collect();
        let a = poly(&self.poles).into_iter().map(|c| c.re).collect();
        FilterCoefficients { b, a }
    }
}

/// Polynomial coefficients (highest power first) with the given roots
fn poly(roots: &[Complex64]) -> Vec<Complex64> {
    let mut coeffs = vec![Complex64::new(1.0, 0.0)];
    for &root in roots {
        let mut next = vec![Complex64::new(0.0, 0.0); coeffs.len() + 1];
        for (i, &c) in coeffs.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= c * root;
        }
        coeffs = next;
    }
    coeffs
}

/// Transfer-function coefficients of one IIR stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCoefficients {
    /// Numerator coefficients
    pub b: Vec<f64>,
    /// Denominator coefficients, `a[0]` normalised to 1
    pub a: Vec<f64>,
}

impl FilterCoefficients {
    /// Second-order IIR notch; `w0` is the notch frequency as a fraction of Nyquist
    pub fn notch(w0: f64, q: f64) -> Self {
        let bw = (w0 / q) * PI;
        let w0 = w0 * PI;
        // -3 dB bandwidth: gb = 1/sqrt(2), so sqrt(1 - gb^2) / gb == 1
        let beta = (bw / 2.0).tan();
        let gain = 1.0 / (1.0 + beta);
        let cos_w0 = w0.cos();

        FilterCoefficients {
            b: vec![gain, -2.0 * gain * cos_w0, gain],
            a: vec![1.0, -2.0 * gain * cos_w0, 2.0 * gain - 1.0],
        }
    }

    /// Number of taps once `b` and `a` are padded to equal length
    pub fn taps(&self) -> usize {
        self.b.len().max(self.a.len())
    }

    /// Samples of odd-reflection padding applied at each edge by `filtfilt`
    pub fn padlen(&self) -> usize {
        3 * self.taps()
    }

    /// Coefficients padded to equal length with `a[0] == 1`
    fn normalized(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.taps();
        let a0 = self.a.first().copied().unwrap_or(1.0);
        let mut b: Vec<f64> = self.b.iter().map(|v| v / a0).collect();
        let mut a: Vec<f64> = self.a.iter().map(|v| v / a0).collect();
        b.resize(n, 0.0);
        a.resize(n, 0.0);
        (b, a)
    }

    /// Steady-state filter state for a unit step input
    pub fn lfilter_zi(&self) -> Vec<f64> {
        let (b, a) = self.normalized();
        let n = b.len();
        if n < 2 {
            return Vec::new();
        }
        let m = n - 1;

        // (I - companion(a)^T) zi = b[1:] - a[1:] * b[0]
        let mut matrix = vec![vec![0.0; m]; m];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
            row[0] += a[i + 1];
            if i + 1 < m {
                row[i + 1] -= 1.0;
            }
        }
        let rhs: Vec<f64> = (0..m).map(|i| b[i + 1] - a[i + 1] * b[0]).collect();

        solve_linear(matrix, rhs)
    }

    /// Direct-form II transposed filter with an initial state
    pub fn lfilter(&self, input: &[f64], zi: &[f64]) -> Vec<f64> {
        let (b, a) = self.normalized();
        let n = b.len();
        let mut state = zi.to_vec();
        state.resize(n.saturating_sub(1), 0.0);

        let mut output = Vec::with_capacity(input.len());
        for &x in input {
            let y = b[0] * x + state.first().copied().unwrap_or(0.0);
            for i in 0..state.len() {
                let next = state.get(i + 1).copied().unwrap_or(0.0);
                state[i] = b[i + 1] * x + next - a[i + 1] * y;
            }
            output.push(y);
        }
        output
    }

    /// Zero-phase forward-backward filtering with odd-reflection padding
    pub fn filtfilt(&self, input: &[f64]) -> EmgResult<Vec<f64>> {
        let len = input.len();
        let edge = self.padlen();
        if len <= edge {
            return Err(EmgError::InvalidFilterDesign {
                reason: format!(
                    "input of {} samples must be longer than the {} sample padding",
                    len, edge
                ),
            });
        }

        let first = input[0];
        let last = input[len - 1];
        let mut extended = Vec::with_capacity(len + 2 * edge);
        extended.extend((1..=edge).rev().map(|i| 2.0 * first - input[i]));
        extended.extend_from_slice(input);
        extended.extend((len - 1 - edge..len - 1).rev().map(|i| 2.0 * last - input[i]));

        let zi = self.lfilter_zi();
        let scaled = |x0: f64| -> Vec<f64> { zi.iter().map(|z| z * x0).collect() };

        let forward = self.lfilter(&extended, &scaled(extended[0]));
        let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
        let x0 = reversed[0];
        reversed = self.lfilter(&reversed, &scaled(x0));
        reversed.reverse();

        Ok(reversed[edge..edge + len].to_vec())
    }

    /// Complex gain at `freq` Hz for sampling rate `sampling_rate`
    pub fn frequency_response(&self, freq: f64, sampling_rate: f64) -> Complex64 {
        let w = 2.0 * PI * freq / sampling_rate;
        let eval = |coeffs: &[f64]| -> Complex64 {
            coeffs
                .iter()
                .enumerate()
                .map(|(k, c)| Complex64::from_polar(*c, -w * k as f64))
                .sum()
        };
        eval(&self.b) / eval(&self.a)
    }
}

/// Gaussian elimination with partial pivoting for the small systems of `lfilter_zi`
fn solve_linear(mut matrix: Vec<Vec<f64>>, mut rhs: Vec<f64>) -> Vec<f64> {
    let n = rhs.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| matrix[i][col].abs().total_cmp(&matrix[j][col].abs()))
            .unwrap_or(col);
        matrix.swap(col, pivot);
        rhs.swap(col, pivot);

        let diag = matrix[col][col];
        if diag == 0.0 {
            continue;
        }
        for row in col + 1..n {
            let factor = matrix[row][col] / diag;
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                matrix[row][k] -= factor * matrix[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut solution = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| matrix[row][k] * solution[k]).sum();
        let diag = matrix[row][row];
        solution[row] = if diag == 0.0 { 0.0 } else { (rhs[row] - tail) / diag };
    }
    solution
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 2000.0;

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < tol, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_butterworth_lowpass_matches_biquad() {
        let coeffs = FilterConfig::lowpass(10.0, 2).design(FS).unwrap();

        // Closed-form second-order Butterworth lowpass
        let k = (PI * 10.0 / FS).tan();
        let norm = 1.0 / (k * k + std::f64::consts::SQRT_2 * k + 1.0);
        let b0 = k * k * norm;
        let expected_b = [b0, 2.0 * b0, b0];
        let expected_a = [1.0, 2.0 * (k * k - 1.0) * norm, (k * k - std::f64::consts::SQRT_2 * k + 1.0) * norm];

        assert_close(&coeffs.b, &expected_b, 1e-12);
        assert_close(&coeffs.a, &expected_a, 1e-12);
    }

    #[test]
    fn test_butterworth_highpass_matches_biquad() {
        let coeffs = FilterConfig::highpass(0.5, 2).design(FS).unwrap();

        let k = (PI * 0.5 / FS).tan();
        let norm = 1.0 / (k * k + std::f64::consts::SQRT_2 * k + 1.0);
        let expected_b = [norm, -2.0 * norm, norm];
        let expected_a = [1.0, 2.0 * (k * k - 1.0) * norm, (k * k - std::f64::consts::SQRT_2 * k + 1.0) * norm];

        assert_close(&coeffs.b, &expected_b, 1e-12);
        assert_close(&coeffs.a, &expected_a, 1e-12);
    }

    #[test]
    fn test_bandpass_shape() {
        let coeffs = FilterConfig::bandpass(20.0, 450.0, 4).design(FS).unwrap();
        assert_eq!(coeffs.b.len(), 9);
        assert_eq!(coeffs.a.len(), 9);
        assert_eq!(coeffs.padlen(), 27);

        let center = (20.0f64 * 450.0).sqrt();
        assert!((coeffs.frequency_response(center, FS).norm() - 1.0).abs() < 1e-3);
        assert!(coeffs.frequency_response(20.0, FS).norm() > 0.69);
        assert!(coeffs.frequency_response(20.0, FS).norm() < 0.72);
        assert!(coeffs.frequency_response(1.0, FS).norm() < 1e-4);
        assert!(coeffs.frequency_response(950.0, FS).norm() < 1e-3);
    }

    #[test]
    fn test_notch_response() {
        let coeffs = FilterConfig::notch(60.0, 30.0).design(FS).unwrap();
        assert!(coeffs.frequency_response(60.0, FS).norm() < 1e-9);
        assert!((coeffs.frequency_response(0.0, FS).norm() - 1.0).abs() < 1e-9);
        assert!((coeffs.frequency_response(200.0, FS).norm() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_design_rejects_cutoff_above_nyquist() {
        assert!(FilterConfig::lowpass(1000.0, 2).design(FS).is_err());
        assert!(FilterConfig::bandpass(450.0, 20.0, 4).design(FS).is_err());
        assert!(FilterConfig::highpass(0.5, 0).design(FS).is_err());
    }

    #[test]
    fn test_lfilter_zi_is_steady_state() {
        let coeffs = FilterConfig::bandpass(20.0, 450.0, 4).design(FS).unwrap();
        let zi = coeffs.lfilter_zi();
        let dc_gain = coeffs.b.iter().sum::<f64>() / coeffs.a.iter().sum::<f64>();

        // A unit step started from the steady state stays at the DC gain
        let output = coeffs.lfilter(&vec![1.0; 50], &zi);
        for y in output {
            assert!((y - dc_gain).abs() < 1e-6);
        }
    }

    #[test]
    fn test_filtfilt_is_zero_phase() {
        let coeffs = FilterConfig::lowpass(10.0, 2).design(FS).unwrap();
        let input: Vec<f64> = (0..4000)
            .map(|i| (2.0 * PI * 2.0 * i as f64 / FS).sin())
            .collect();

        let output = coeffs.filtfilt(&input).unwrap();
        assert_eq!(output.len(), input.len());

        // Passband sinusoid comes back in phase; compare away from the edges
        for i in 1000..3000 {
            assert!((output[i] - input[i]).abs() < 0.01);
        }
    }

    #[test]
    fn test_filtfilt_removes_constant_offset() {
        let coeffs = FilterConfig::highpass(0.5, 2).design(FS).unwrap();
        let output = coeffs.filtfilt(&vec![3.5; 75]).unwrap();
        for y in output {
            assert!(y.abs() < 1e-9);
        }
    }

    #[test]
    fn test_filtfilt_requires_length_beyond_padding() {
        let coeffs = FilterConfig::bandpass(20.0, 450.0, 4).design(FS).unwrap();
        assert!(coeffs.filtfilt(&vec![0.0; 27]).is_err());
        assert!(coeffs.filtfilt(&vec![0.0; 28]).is_ok());
    }
}

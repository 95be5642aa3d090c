use crate::constants::SOFT_CLIP_THRESHOLD;

/// `tanh(x/θ)·θ`: bounded by ±θ, near-linear for small inputs.
#[inline]
pub fn soft_clip(x: f64, threshold: f64) -> f64 {
    (x / threshold).tanh() * threshold
}

/// Largest `f32` strictly below `threshold`.
fn f32_ceiling(threshold: f64) -> f32 {
    let t = threshold as f32;
    if t as f64 >= threshold && t > 0.0 {
        f32::from_bits(t.to_bits() - 1)
    } else {
        t
    }
}

/// [`soft_clip`] rounded to an output sample. `tanh` reaches 1.0 in `f64`
/// for large inputs, so the result is pulled below `threshold` after the
/// cast.
#[inline]
pub fn clip_sample(x: f64, threshold: f64) -> f32 {
    let ceiling = f32_ceiling(threshold);
    (soft_clip(x, threshold) as f32).clamp(-ceiling, ceiling)
}

/// Soft-clip a block in place with the default threshold.
pub fn soft_clip_block(buf: &mut [f32]) {
    for s in buf.iter_mut() {
        *s = clip_sample(*s as f64, SOFT_CLIP_THRESHOLD);
    }
}

/// Odd-order nonlinearity `x + g·x³` that adds harmonic color.
#[inline]
pub fn cubic_shaper(x: f64, gain: f64) -> f64 {
    x + gain * x * x * x
}

pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

pub fn linear_to_db(lin: f64) -> f64 {
    20.0 * (lin + 1e-10).log10()
}

/// Linear approach to a target value over a fixed number of samples.
///
/// Retargeting mid-ramp starts a fresh ramp from the current value, so the
/// output never jumps.
#[derive(Debug, Clone)]
pub struct LinearRamp {
    current: f64,
    target: f64,
    step: f64,
    remaining: usize,
    length: usize,
}

impl LinearRamp {
    pub fn new(value: f64, length: usize) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
            remaining: 0,
            length: length.max(1),
        }
    }

    pub fn set_target(&mut self, target: f64) {
        if target == self.target {
            return;
        }
        self.target = target;
        self.remaining = self.length;
        self.step = (target - self.current) / self.length as f64;
    }

    /// Jump straight to `value`, cancelling any ramp in progress.
    pub fn reset(&mut self, value: f64) {
        self.current = value;
        self.target = value;
        self.step = 0.0;
        self.remaining = 0;
    }

    #[inline]
    pub fn next_value(&mut self) -> f64 {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        self.current
    }

    pub fn value(&self) -> f64 {
        self.current
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn is_settled(&self) -> bool {
        self.remaining == 0
    }
}

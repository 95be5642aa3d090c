use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::acoustics::normalize_peak;
use crate::TubeError;

/// Offset of each bimodal peak from the centre, in tube lengths.
const BIMODAL_SPREAD: f64 = 0.2;
/// Bimodal peak width relative to the configured width.
const BIMODAL_WIDTH_RATIO: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    #[default]
    Gaussian,
    Sine,
    Square,
    Bimodal,
    Uniform,
}

impl ProfileKind {
    pub fn name(self) -> &'static str {
        match self {
            ProfileKind::Gaussian => "gaussian",
            ProfileKind::Sine => "sine",
            ProfileKind::Square => "square",
            ProfileKind::Bimodal => "bimodal",
            ProfileKind::Uniform => "uniform",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProfileKind {
    type Err = TubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" => Ok(ProfileKind::Gaussian),
            "sine" => Ok(ProfileKind::Sine),
            "square" => Ok(ProfileKind::Square),
            "bimodal" => Ok(ProfileKind::Bimodal),
            "uniform" => Ok(ProfileKind::Uniform),
            _ => Err(TubeError::InvalidParameter {
                name: "profile",
                value: f64::NAN,
            }),
        }
    }
}

/// Build a profile over positions normalised to [0, 1] along the tube.
///
/// Every profile peaks at 1 unless it is identically zero (a square band
/// narrower than the position spacing can miss every sample).
pub fn target_profile(kind: ProfileKind, positions: &[f64], center: f64, width: f64) -> Vec<f64> {
    let width = width.max(1e-6);
    let gaussian = |x: f64, c: f64, w: f64| (-(x - c).powi(2) / (2.0 * w * w)).exp();

    let mut profile: Vec<f64> = match kind {
        ProfileKind::Gaussian => positions.iter().map(|&x| gaussian(x, center, width)).collect(),
        ProfileKind::Sine => positions
            .iter()
            .map(|&x| 0.5 + 0.5 * (2.0 * PI * (x - center)).cos())
            .collect(),
        ProfileKind::Square => positions
            .iter()
            .map(|&x| if (x - center).abs() <= width / 2.0 { 1.0 } else { 0.0 })
            .collect(),
        ProfileKind::Bimodal => {
            let w = width * BIMODAL_WIDTH_RATIO;
            positions
                .iter()
                .map(|&x| {
                    gaussian(x, center - BIMODAL_SPREAD, w) + gaussian(x, center + BIMODAL_SPREAD, w)
                })
                .collect()
        }
        ProfileKind::Uniform => vec![1.0; positions.len()],
    };
    normalize_peak(&mut profile);
    profile
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub profile: ProfileKind,
    /// Static target centre, normalised.
    pub center: f64,
    /// Profile width, normalised.
    pub width: f64,
    /// Seconds for the centre to sweep from 0 to 1.
    pub half_cycle: f64,
    /// Number of pre-generated animation targets.
    pub target_count: usize,
    pub first_center: f64,
    pub last_center: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            profile: ProfileKind::Gaussian,
            center: 0.5,
            width: 0.2,
            half_cycle: 30.0,
            target_count: 8,
            first_center: 0.1,
            last_center: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetState {
    #[default]
    Idle,
    Static,
    Animating,
}

/// Owns the current target and the pre-generated animation frames.
#[derive(Debug, Clone)]
pub struct PressureTargetSystem {
    config: TargetConfig,
    positions: Vec<f64>,
    centers: Vec<f64>,
    targets: Vec<Vec<f64>>,
    current: Option<Vec<f64>>,
    last_index: Option<usize>,
    state: TargetState,
}

impl PressureTargetSystem {
    pub fn new(config: TargetConfig) -> Self {
        Self {
            config,
            positions: Vec::new(),
            centers: Vec::new(),
            targets: Vec::new(),
            current: None,
            last_index: None,
            state: TargetState::Idle,
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn is_animating(&self) -> bool {
        self.state == TargetState::Animating
    }

    /// Normalised positions the profiles are sampled on.
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn centers(&self) -> &[f64] {
        &self.centers
    }

    pub fn targets(&self) -> &[Vec<f64>] {
        &self.targets
    }

    pub fn current_target(&self) -> Option<&[f64]> {
        self.current.as_deref()
    }

    /// Adopt a new position grid (metres) and regenerate the animation set.
    pub fn set_positions(&mut self, positions: &[f64], tube_length: f64) {
        let length = if tube_length > 0.0 { tube_length } else { 1.0 };
        self.positions = positions.iter().map(|x| x / length).collect();
        self.pregenerate();
        if self.state == TargetState::Static {
            self.current = Some(self.profile_at(self.config.center));
        }
    }

    /// Build the fixed set of animation targets at evenly spaced centres.
    pub fn pregenerate(&mut self) {
        let n = self.config.target_count.max(1);
        let (first, last) = (self.config.first_center, self.config.last_center);
        self.centers = if n == 1 {
            vec![0.5 * (first + last)]
        } else {
            (0..n)
                .map(|i| first + (last - first) * i as f64 / (n - 1) as f64)
                .collect()
        };
        self.targets = self.centers.iter().map(|&c| self.profile_at(c)).collect();
        self.last_index = None;
        debug!(count = n, profile = %self.config.profile, "animation targets generated");
    }

    fn profile_at(&self, center: f64) -> Vec<f64> {
        target_profile(self.config.profile, &self.positions, center, self.config.width)
    }

    /// Set a fixed target; stops any animation.
    pub fn set_static(&mut self, kind: ProfileKind, center: f64, width: f64) -> Vec<f64> {
        self.config.profile = kind;
        self.config.center = center;
        self.config.width = width;
        self.pregenerate();
        let target = self.profile_at(center);
        self.current = Some(target.clone());
        self.state = TargetState::Static;
        info!(profile = %kind, center, width, "static target set");
        target
    }

    /// Use an externally supplied target as-is.
    pub fn set_custom(&mut self, target: Vec<f64>) {
        self.current = Some(target);
        self.state = TargetState::Static;
    }

    pub fn start_animation(&mut self, kind: ProfileKind) {
        if kind != self.config.profile || self.targets.is_empty() {
            self.config.profile = kind;
            self.pregenerate();
        }
        self.last_index = None;
        self.state = TargetState::Animating;
        info!(
            profile = %kind,
            targets = self.targets.len(),
            half_cycle = self.config.half_cycle,
            "target animation started"
        );
    }

    pub fn stop(&mut self) {
        self.state = TargetState::Idle;
        self.last_index = None;
        self.current = None;
    }

    fn half_cycle(&self) -> f64 {
        self.config.half_cycle.max(1e-3)
    }

    fn cycle_position(&self, elapsed: f64) -> f64 {
        let d = self.half_cycle();
        elapsed.max(0.0).rem_euclid(2.0 * d) / d
    }

    /// Triangle wave: 0 at t = 0, 1 at t = D, back to 0 at t = 2D.
    pub fn center_position(&self, elapsed: f64) -> f64 {
        let pos = self.cycle_position(elapsed);
        if pos > 1.0 {
            2.0 - pos
        } else {
            pos
        }
    }

    /// Down from the half-cycle point (inclusive) to the end of the cycle.
    pub fn direction(&self, elapsed: f64) -> Direction {
        if self.cycle_position(elapsed) >= 1.0 {
            Direction::Down
        } else {
            Direction::Up
        }
    }

    /// Index of the pre-generated target nearest the animated centre.
    pub fn target_index(&self, elapsed: f64) -> usize {
        let center = self.center_position(elapsed);
        self.centers
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - center).abs().total_cmp(&(b.1 - center).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Advance the animation; returns the new target when the index moves.
    pub fn step(&mut self, elapsed: f64) -> Option<(usize, Vec<f64>)> {
        if self.state != TargetState::Animating || self.targets.is_empty() {
            return None;
        }
        let index = self.target_index(elapsed);
        if self.last_index == Some(index) {
            return None;
        }
        self.last_index = Some(index);
        let target = self.targets[index].clone();
        self.current = Some(target.clone());
        debug!(
            index,
            center = self.centers[index],
            direction = ?self.direction(elapsed),
            "animation target changed"
        );
        Some((index, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 / (n - 1) as f64).collect()
    }

    fn system() -> PressureTargetSystem {
        let mut s = PressureTargetSystem::new(TargetConfig::default());
        s.set_positions(&grid(10), 1.0);
        s
    }

    #[test]
    fn test_profiles_peak_at_one() {
        let x = grid(11);
        for kind in [
            ProfileKind::Gaussian,
            ProfileKind::Sine,
            ProfileKind::Square,
            ProfileKind::Bimodal,
            ProfileKind::Uniform,
        ] {
            let p = target_profile(kind, &x, 0.5, 0.2);
            let peak = p.iter().cloned().fold(f64::MIN, f64::max);
            assert!((peak - 1.0).abs() < 1e-12, "{kind}: peak {peak}");
            assert!(p.iter().all(|v| (0.0..=1.0).contains(v)), "{kind}: {p:?}");
        }
    }

    #[test]
    fn test_gaussian_centered() {
        let p = target_profile(ProfileKind::Gaussian, &grid(11), 0.3, 0.2);
        assert_eq!(p[3], 1.0);
        assert!(p[2] < 1.0 && p[4] < 1.0);
        assert!((p[2] - p[4]).abs() < 1e-12);
    }

    #[test]
    fn test_square_band() {
        let p = target_profile(ProfileKind::Square, &grid(11), 0.5, 0.2);
        assert_eq!(p, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bimodal_has_two_peaks() {
        let p = target_profile(ProfileKind::Bimodal, &grid(11), 0.5, 0.2);
        assert!(p[3] > p[5] && p[7] > p[5], "{p:?}");
        assert!((p[3] - p[7]).abs() < 1e-12);
    }

    #[test]
    fn test_profile_kind_parse() {
        assert_eq!("Bimodal".parse::<ProfileKind>().unwrap(), ProfileKind::Bimodal);
        assert!("triangle".parse::<ProfileKind>().is_err());
        assert_eq!(ProfileKind::Sine.to_string(), "sine");
    }

    #[test]
    fn test_animation_center_and_direction() {
        let s = system();
        let d = s.config().half_cycle;
        assert!(s.center_position(0.0).abs() < 1e-12);
        assert!((s.center_position(d) - 1.0).abs() < 1e-12);
        assert!(s.center_position(2.0 * d).abs() < 1e-12);
        assert!((s.center_position(0.5 * d) - 0.5).abs() < 1e-12);
        assert!((s.center_position(1.5 * d) - 0.5).abs() < 1e-12);

        assert_eq!(s.direction(0.0), Direction::Up);
        assert_eq!(s.direction(d - 1e-6), Direction::Up);
        assert_eq!(s.direction(d), Direction::Down);
        assert_eq!(s.direction(2.0 * d - 1e-6), Direction::Down);
        assert_eq!(s.direction(2.0 * d), Direction::Up);
    }

    #[test]
    fn test_animation_indexing() {
        let s = system();
        let d = s.config().half_cycle;
        assert_eq!(s.centers().len(), 8);
        assert!((s.centers()[0] - 0.1).abs() < 1e-12);
        assert!((s.centers()[7] - 0.9).abs() < 1e-12);

        assert_eq!(s.target_index(0.0), 0);
        assert_eq!(s.target_index(d), 7);
        assert_eq!(s.target_index(2.0 * d), 0);
        // Centre 0.5 lies between targets 3 (0.443) and 4 (0.557); 0.55 is
        // nearer 4.
        assert_eq!(s.target_index(0.55 * d), 4);
    }

    #[test]
    fn test_step_reports_only_index_changes() {
        let mut s = system();
        assert!(s.step(0.0).is_none(), "idle system must not step");

        s.start_animation(ProfileKind::Gaussian);
        let d = s.config().half_cycle;
        let (i0, t0) = s.step(0.0).unwrap();
        assert_eq!(i0, 0);
        assert_eq!(t0, s.targets()[0]);
        assert!(s.step(0.01).is_none());
        let (i1, _) = s.step(d).unwrap();
        assert_eq!(i1, 7);
        assert_eq!(s.current_target(), Some(s.targets()[7].as_slice()));

        s.stop();
        assert_eq!(s.state(), TargetState::Idle);
        assert!(s.step(0.0).is_none());
    }

    #[test]
    fn test_static_target() {
        let mut s = system();
        let t = s.set_static(ProfileKind::Square, 0.5, 0.3);
        assert_eq!(s.state(), TargetState::Static);
        assert_eq!(s.current_target(), Some(t.as_slice()));
        assert!(!s.is_animating());
    }
}

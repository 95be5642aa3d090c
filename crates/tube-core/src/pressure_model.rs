use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{clamp_frequency, NUM_CHANNELS};
use crate::decomposition::{apply_to_channels, ModalDecomposition, Solution, DEFAULT_LAMBDA};
use crate::pressure_matrix::{profile_error, MatrixConfig, PressureMatrix, PressureMatrixCache};
use crate::pressure_source::{PressureRenderConfig, PressureRenderer, PressureSource};
use crate::render::GuardedRender;
use crate::resonance::fallback_frequencies;
use crate::state::{lock, ChannelBank, TubeParamStore};
use crate::targets::{PressureTargetSystem, ProfileKind, TargetConfig, TargetState};
use crate::worker::Worker;
use crate::{TubeError, TubeParams};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    pub matrix: MatrixConfig,
    pub targets: TargetConfig,
    pub render: PressureRenderConfig,
    /// Ridge regularization of the decomposition.
    pub lambda: f64,
    /// Frequencies published to the renderer and the channels, at most 8.
    pub num_freqs: usize,
    pub animated: bool,
    /// Animation worker period, milliseconds.
    pub cadence_ms: u64,
    /// Consecutive re-solves that may be skipped while solves run slow.
    pub max_skipped: u32,
    pub volume: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            matrix: MatrixConfig::default(),
            targets: TargetConfig::default(),
            render: PressureRenderConfig::default(),
            lambda: DEFAULT_LAMBDA,
            num_freqs: 8,
            animated: true,
            cadence_ms: 500,
            max_skipped: 3,
            volume: 1.0,
        }
    }
}

/// Basis size for a requested number of output frequencies.
pub fn mode_count(num_freqs: usize) -> usize {
    (3 * num_freqs).max(12)
}

/// How a target was turned into frequencies.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Solved(Solution),
    /// The solve failed; the previous good solution was reused.
    LastGood(Solution),
    /// The solve failed with nothing to reuse; plain tube resonances.
    Resonances(Vec<(f64, f64)>),
}

impl Resolution {
    pub fn is_fallback(&self) -> bool {
        !matches!(self, Resolution::Solved(_))
    }

    /// Significant pairs, loudest first, at most `limit`.
    pub fn pairs(&self, limit: usize) -> Vec<(f64, f64)> {
        match self {
            Resolution::Solved(s) | Resolution::LastGood(s) => s.strongest(limit),
            Resolution::Resonances(pairs) => pairs.iter().copied().take(limit).collect(),
        }
    }
}

/// Resonances with a 1/n rolloff, for when nothing better is known.
fn resonance_pairs(params: &TubeParams, count: usize) -> Vec<(f64, f64)> {
    fallback_frequencies(params, count)
        .into_iter()
        .enumerate()
        .map(|(i, f)| (f, 1.0 / (i + 1) as f64))
        .collect()
}

struct ModelState {
    params: TubeParams,
    targets: PressureTargetSystem,
    num_freqs: usize,
    last_good: Option<Solution>,
    last_solve: Duration,
    skipped: u32,
}

/// Control calls and the animation worker snapshot state under the lock,
/// solve without it, and write back under it.
pub struct PressureModel {
    config: PressureConfig,
    bank: Arc<ChannelBank>,
    cache: PressureMatrixCache,
    decomposition: ModalDecomposition,
    source: Arc<PressureSource>,
    state: Mutex<ModelState>,
    solves: AtomicUsize,
}

impl PressureModel {
    pub fn new(
        params: &TubeParams,
        config: PressureConfig,
        bank: Arc<ChannelBank>,
    ) -> Result<Self, TubeError> {
        config.matrix.validate()?;
        let safe = params.sanitized();
        let mut targets = PressureTargetSystem::new(config.targets.clone());
        targets.set_positions(
            &safe.positions(config.matrix.position_count),
            safe.tube_length,
        );
        let source = Arc::new(PressureSource::new(safe.clone()));
        source.set_volume(config.volume);

        Ok(Self {
            cache: PressureMatrixCache::new(config.matrix.clone()),
            decomposition: ModalDecomposition::new(config.lambda),
            source,
            bank,
            state: Mutex::new(ModelState {
                params: safe,
                targets,
                num_freqs: config.num_freqs.clamp(1, NUM_CHANNELS),
                last_good: None,
                last_solve: Duration::ZERO,
                skipped: 0,
            }),
            solves: AtomicUsize::new(0),
            config,
        })
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<PressureSource> {
        &self.source
    }

    pub fn cache(&self) -> &PressureMatrixCache {
        &self.cache
    }

    pub fn decomposition(&self) -> &ModalDecomposition {
        &self.decomposition
    }

    pub fn params(&self) -> TubeParams {
        lock(&self.state).params.clone()
    }

    pub fn num_freqs(&self) -> usize {
        lock(&self.state).num_freqs
    }

    pub fn target_state(&self) -> TargetState {
        lock(&self.state).targets.state()
    }

    pub fn is_animating(&self) -> bool {
        lock(&self.state).targets.is_animating()
    }

    pub fn current_target(&self) -> Option<Vec<f64>> {
        lock(&self.state).targets.current_target().map(<[f64]>::to_vec)
    }

    pub fn last_solution(&self) -> Option<Solution> {
        lock(&self.state).last_good.clone()
    }

    /// Decompositions attempted so far.
    pub fn solve_count(&self) -> usize {
        self.solves.load(Ordering::Relaxed)
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.config.cadence_ms.max(1))
    }

    /// The published matrix for the current physics, built on demand.
    pub fn matrix(&self) -> Result<Arc<PressureMatrix>, TubeError> {
        let params = self.params();
        self.cache.get_or_build(&params)
    }

    /// Pick a target profile and solve for it.
    ///
    /// Animated mode solves for the first animation frame right away; the
    /// worker takes over from there.
    pub fn configure(
        &self,
        profile: ProfileKind,
        num_freqs: usize,
        animated: bool,
    ) -> Result<Resolution, TubeError> {
        let num_freqs = num_freqs.clamp(1, NUM_CHANNELS);
        let params = {
            let mut st = lock(&self.state);
            st.num_freqs = num_freqs;
            st.params.clone()
        };
        self.cache.get_or_build(&params)?;

        let target = {
            let mut st = lock(&self.state);
            if animated {
                st.targets.start_animation(profile);
                st.targets.step(0.0).map(|(_, target)| target)
            } else {
                let (center, width) = (self.config.targets.center, self.config.targets.width);
                Some(st.targets.set_static(profile, center, width))
            }
        };
        info!(profile = %profile, num_freqs, animated, "pressure model configured");

        let target = target.ok_or(TubeError::EmptyTarget)?;
        self.on_target_changed(&target)
    }

    pub fn stop_animation(&self) {
        lock(&self.state).targets.stop();
    }

    /// Solve for `target` and publish the result, falling back to the last
    /// good solution and then to the tube resonances if the system is
    /// singular.
    pub fn on_target_changed(&self, target: &[f64]) -> Result<Resolution, TubeError> {
        let (params, num_freqs) = {
            let st = lock(&self.state);
            (st.params.clone(), st.num_freqs)
        };
        let key = params.physics_key(target.len());

        let started = Instant::now();
        let result = self.decomposition.solve(&params, target, mode_count(num_freqs));
        let took = started.elapsed();
        self.solves.fetch_add(1, Ordering::Relaxed);

        let resolution = {
            let mut st = lock(&self.state);
            st.last_solve = took;
            if st.params.physics_key(target.len()) != key {
                debug!("tube changed during solve; result discarded");
                return match result {
                    Ok(solution) => Ok(Resolution::Solved(solution)),
                    Err(e) => Err(e),
                };
            }
            match result {
                Ok(solution) => {
                    st.last_good = Some(solution.clone());
                    Resolution::Solved(solution)
                }
                Err(TubeError::SingularSystem) => {
                    warn!("decomposition singular, using fallback frequencies");
                    match &st.last_good {
                        Some(previous) => Resolution::LastGood(previous.clone()),
                        None => Resolution::Resonances(resonance_pairs(&params, num_freqs)),
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let pairs = resolution.pairs(num_freqs);
        if let Some(matrix) = self.cache.current() {
            if matrix.position_count() == target.len() {
                let error = profile_error(&matrix.combine(&pairs), target);
                debug!(error, "published set against target");
            }
        }
        if let Resolution::Solved(s) = &resolution {
            debug!(error = s.error, residual = s.residual_norm, ?took, "target solved");
        }

        self.source.set_active(pairs.clone());
        apply_to_channels(&pairs, &self.bank)?;
        Ok(resolution)
    }

    /// Play whatever the channels hold: every unmuted, audible channel.
    pub fn update_from_channels(&self, bank: &ChannelBank) -> Vec<(f64, f64)> {
        let pairs: Vec<(f64, f64)> = bank
            .snapshot()
            .iter()
            .filter(|ch| !ch.mute && ch.volume > 0.0)
            .map(|ch| (ch.frequency, ch.volume))
            .collect();
        debug!(count = pairs.len(), "pressure frequencies taken from channels");
        self.source.set_active(pairs.clone());
        pairs
    }

    pub fn set_active_frequencies(&self, pairs: &[(f64, f64)]) {
        let pairs: Vec<(f64, f64)> = pairs
            .iter()
            .filter(|(f, a)| f.is_finite() && a.is_finite())
            .map(|&(f, a)| (clamp_frequency(f), a.clamp(0.0, 1.0)))
            .collect();
        self.source.set_active(pairs);
    }

    pub fn set_volume(&self, volume: f64) {
        self.source.set_volume(volume);
        info!(volume = self.source.volume(), "pressure volume set");
    }

    pub fn volume(&self) -> f64 {
        self.source.volume()
    }

    /// Adopt new tube parameters.
    ///
    /// A physics change drops the matrix and the decomposition basis,
    /// regenerates the animation targets, and re-solves a static target.
    /// Changes that do not touch the physics only update the stored copy.
    pub fn refresh_physics(&self, params: &TubeParams) -> Result<Option<Resolution>, TubeError> {
        let safe = params.sanitized();
        let count = self.config.matrix.position_count;
        let static_target = {
            let mut st = lock(&self.state);
            let unchanged = st.params.physics_key(count) == safe.physics_key(count);
            st.params = safe.clone();
            if unchanged {
                return Ok(None);
            }
            st.targets.set_positions(&safe.positions(count), safe.tube_length);
            st.last_good = None;
            st.skipped = 0;
            if st.targets.state() == TargetState::Static {
                st.targets.current_target().map(<[f64]>::to_vec)
            } else {
                None
            }
        };

        self.cache.invalidate();
        self.decomposition.invalidate();
        self.source.set_params(safe.clone());
        self.cache.get_or_build(&safe)?;
        info!(
            tube_length = safe.tube_length,
            speed_of_sound = safe.speed_of_sound,
            "pressure physics refreshed"
        );

        match static_target {
            Some(target) => self.on_target_changed(&target).map(Some),
            None => Ok(None),
        }
    }

    /// One animation step at `elapsed` seconds.
    ///
    /// While the previous solve took longer than the cadence, up to
    /// `max_skipped` consecutive steps are skipped outright.
    pub fn tick(&self, elapsed: f64) -> Result<Option<Resolution>, TubeError> {
        let target = {
            let mut st = lock(&self.state);
            if !st.targets.is_animating() {
                return Ok(None);
            }
            if st.last_solve > self.cadence() && st.skipped < self.config.max_skipped {
                st.skipped += 1;
                debug!(
                    skipped = st.skipped,
                    last_solve_ms = st.last_solve.as_millis() as u64,
                    "solver behind cadence, step skipped"
                );
                return Ok(None);
            }
            st.skipped = 0;
            match st.targets.step(elapsed) {
                Some((_, target)) => target,
                None => return Ok(None),
            }
        };
        self.on_target_changed(&target).map(Some)
    }

    pub fn renderer(&self, sample_rate: u32) -> GuardedRender<PressureRenderer> {
        self.source
            .guarded_renderer(sample_rate, self.config.render.clone())
    }

    /// Run [`PressureModel::tick`] on a background thread at the cadence.
    pub fn spawn_worker(self: &Arc<Self>) -> Result<Worker, TubeError> {
        let model = Arc::clone(self);
        Worker::spawn("pressure-animation", self.cadence(), move |elapsed| {
            if let Err(e) = model.tick(elapsed.as_secs_f64()) {
                warn!(error = %e, "animation step failed");
            }
        })
    }

    /// Refresh on every physics-affecting parameter change in `store`.
    pub fn watch(self: &Arc<Self>, store: &TubeParamStore) {
        let weak = Arc::downgrade(self);
        store.on_changed(move |param, params| {
            if !param.affects_physics() {
                return;
            }
            if let Some(model) = weak.upgrade() {
                if let Err(e) = model.refresh_physics(params) {
                    warn!(parameter = param.name(), error = %e, "physics refresh failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChannelUpdate;

    fn model(config: PressureConfig) -> (Arc<ChannelBank>, PressureModel) {
        let bank = Arc::new(ChannelBank::new());
        let model = PressureModel::new(&TubeParams::default(), config, bank.clone()).unwrap();
        (bank, model)
    }

    #[test]
    fn test_mode_count_floor() {
        assert_eq!(mode_count(1), 12);
        assert_eq!(mode_count(4), 12);
        assert_eq!(mode_count(8), 24);
    }

    #[test]
    fn test_static_target_publishes_solution() {
        let (bank, model) = model(PressureConfig::default());
        let resolution = model.configure(ProfileKind::Gaussian, 4, false).unwrap();
        assert!(!resolution.is_fallback());
        assert_eq!(model.target_state(), TargetState::Static);

        let pairs = model.source().active().pairs.clone();
        assert!(!pairs.is_empty() && pairs.len() <= 4, "{pairs:?}");
        assert!(pairs.windows(2).all(|w| w[0].1 >= w[1].1));

        let snap = bank.snapshot();
        assert!(!snap[0].mute);
        assert_eq!(snap[0].frequency, pairs[0].0);
        assert!(snap[pairs.len()..].iter().all(|c| c.mute));
        assert_eq!(model.solve_count(), 1);
    }

    #[test]
    fn test_singular_falls_back_to_resonances_then_last_good() {
        let config = PressureConfig {
            lambda: 0.0,
            matrix: MatrixConfig {
                position_count: 2,
                ..MatrixConfig::default()
            },
            ..PressureConfig::default()
        };
        let (bank, model) = model(config);

        let first = model.on_target_changed(&[1.0, 0.0]).unwrap();
        let Resolution::Resonances(pairs) = &first else {
            panic!("expected resonance fallback, got {first:?}");
        };
        assert_eq!(pairs.len(), 8);
        assert!(pairs.iter().any(|(f, _)| (f - 171.5).abs() < 0.5), "{pairs:?}");
        assert_eq!(pairs[0].1, 1.0);
        assert_eq!(pairs[1].1, 0.5);
        assert!(!bank.get(0).unwrap().mute);

        let previous = Solution {
            frequencies: vec![100.0, 300.0],
            amplitudes: vec![0.7, 0.2],
            target_profile: vec![1.0, 0.0],
            achieved_profile: vec![1.0, 0.0],
            error: 0.0,
            residual_norm: 0.0,
        };
        lock(&model.state).last_good = Some(previous.clone());
        let second = model.on_target_changed(&[1.0, 0.0]).unwrap();
        assert_eq!(second, Resolution::LastGood(previous));
        assert_eq!(model.source().active().pairs, vec![(100.0, 0.7), (300.0, 0.2)]);
    }

    #[test]
    fn test_empty_target_is_an_error() {
        let (_, model) = model(PressureConfig::default());
        assert_eq!(model.on_target_changed(&[]).unwrap_err(), TubeError::EmptyTarget);
    }

    #[test]
    fn test_animation_ticks_on_index_change() {
        let (_, model) = model(PressureConfig::default());
        model.configure(ProfileKind::Gaussian, 4, true).unwrap();
        assert!(model.is_animating());
        assert_eq!(model.solve_count(), 1);

        // Still nearest the first centre.
        assert!(model.tick(0.1).unwrap().is_none());
        let half_cycle = model.config().targets.half_cycle;
        assert!(model.tick(half_cycle).unwrap().is_some());
        assert_eq!(model.solve_count(), 2);

        model.stop_animation();
        assert!(model.tick(0.0).unwrap().is_none());
    }

    #[test]
    fn test_slow_solves_skip_bounded_steps() {
        let (_, model) = model(PressureConfig::default());
        model.configure(ProfileKind::Gaussian, 4, true).unwrap();
        let half_cycle = model.config().targets.half_cycle;

        lock(&model.state).last_solve = Duration::from_secs(10);
        for _ in 0..model.config().max_skipped {
            assert!(model.tick(half_cycle).unwrap().is_none());
        }
        assert!(model.tick(half_cycle).unwrap().is_some());
    }

    #[test]
    fn test_physics_change_rebuilds_caches() {
        let (_, model) = model(PressureConfig::default());
        model.configure(ProfileKind::Gaussian, 4, false).unwrap();
        assert_eq!(model.cache().build_count(), 1);
        assert_eq!(model.decomposition().build_count(), 1);

        // Display-only parameter: nothing rebuilt.
        let mut params = model.params();
        params.propane_pressure = 2.0;
        assert!(model.refresh_physics(&params).unwrap().is_none());
        assert_eq!(model.cache().build_count(), 1);

        params.tube_length = 1.2;
        let resolution = model.refresh_physics(&params).unwrap().unwrap();
        assert_eq!(model.cache().build_count(), 2);
        assert_eq!(model.decomposition().build_count(), 2);
        let Resolution::Solved(solution) = resolution else {
            panic!("expected a fresh solve");
        };
        let fundamental = 343.0 / (4.0 * 1.2);
        assert!((solution.frequencies[0] - fundamental).abs() < 1e-9);
        assert_eq!(model.source().active().params.tube_length, 1.2);
    }

    #[test]
    fn test_watch_follows_param_store() {
        let (_, model) = model(PressureConfig::default());
        let model = Arc::new(model);
        let store = TubeParamStore::default();
        model.watch(&store);
        store.update(|p| p.tube_length = 0.8);
        assert_eq!(model.params().tube_length, 0.8);
        assert_eq!(model.cache().build_count(), 1);
    }

    #[test]
    fn test_param_refresh_runs_alongside_channel_writes() {
        let (bank, model) = model(PressureConfig::default());
        let model = Arc::new(model);
        model.configure(ProfileKind::Gaussian, 4, false).unwrap();
        let store = Arc::new(TubeParamStore::default());
        model.watch(&store);

        let start = Instant::now();
        let refresher = {
            let store = store.clone();
            std::thread::spawn(move || store.update(|p| p.tube_length = 1.2))
        };
        let writer = {
            let bank = bank.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    bank.set(7, ChannelUpdate::frequency(100.0 + i as f64)).unwrap();
                }
            })
        };
        writer.join().unwrap();
        assert_eq!(refresher.join().unwrap(), vec![crate::state::TubeParam::TubeLength]);
        assert!(start.elapsed() < Duration::from_secs(10), "took {:?}", start.elapsed());

        assert_eq!(model.params().tube_length, 1.2);
        assert_eq!(model.cache().build_count(), 2);
        assert_eq!(model.source().active().params.tube_length, 1.2);
        // At most four pairs are published, so the solver only ever mutes
        // channel 7 and the last external frequency stands.
        assert_eq!(bank.get(7).unwrap().frequency, 149.0);
    }

    #[test]
    fn test_update_from_channels() {
        let (_, model) = model(PressureConfig::default());
        let bank = ChannelBank::new();
        bank.set(
            1,
            ChannelUpdate {
                frequency: Some(330.0),
                volume: Some(0.4),
                mute: Some(false),
            },
        )
        .unwrap();
        bank.set(2, ChannelUpdate::mute(false)).unwrap();
        bank.set(2, ChannelUpdate::volume(0.0)).unwrap();

        let pairs = model.update_from_channels(&bank);
        let default_volume = bank.get(0).unwrap().volume;
        assert_eq!(pairs, vec![(440.0, default_volume), (330.0, 0.4)]);
        assert_eq!(model.source().active().pairs, pairs);
    }

    #[test]
    fn test_set_active_frequencies_sanitizes() {
        let (_, model) = model(PressureConfig::default());
        model.set_active_frequencies(&[(0.0, 2.0), (f64::NAN, 0.5), (220.0, 0.3)]);
        assert_eq!(model.source().active().pairs, vec![(1.0, 1.0), (220.0, 0.3)]);
        model.set_volume(0.25);
        assert_eq!(model.volume(), 0.25);
    }
}

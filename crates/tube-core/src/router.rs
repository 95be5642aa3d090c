use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{AudioBackend, AudioConfig, StreamHandle};
use crate::mic::{CompressorSettings, MicPassthrough};
use crate::pressure_model::PressureModel;
use crate::render::AudioRender;
use crate::state::{ChangeOrigin, ChannelBank, ChannelEvent};
use crate::synth::ToneSynth;
use crate::worker::Worker;
use crate::TubeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    #[default]
    Synth,
    Mic,
    Pressure,
}

impl AudioSource {
    pub fn name(self) -> &'static str {
        match self {
            AudioSource::Synth => "synth",
            AudioSource::Mic => "mic",
            AudioSource::Pressure => "pressure",
        }
    }

    fn code(self) -> u8 {
        match self {
            AudioSource::Synth => 1,
            AudioSource::Mic => 2,
            AudioSource::Pressure => 3,
        }
    }
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AudioSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "synth" => Ok(AudioSource::Synth),
            "mic" => Ok(AudioSource::Mic),
            "pressure" => Ok(AudioSource::Pressure),
            other => Err(format!("unknown audio source '{other}' (synth, mic, pressure)")),
        }
    }
}

const NO_SOURCE: u8 = 0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterSettings {
    pub source: AudioSource,
    pub mic_volume: f64,
    pub pressure_volume: f64,
}

/// At most one output stream is open at a time: a switch stops and closes
/// the current one, and the animation worker, before the next opens.
pub struct AudioRouter {
    config: AudioConfig,
    backend: Box<dyn AudioBackend>,
    bank: Arc<ChannelBank>,
    synth: Arc<ToneSynth>,
    mic: Arc<MicPassthrough>,
    pressure: Arc<PressureModel>,
    selected: AudioSource,
    active: Option<AudioSource>,
    /// `active` as seen by the channel listener.
    running: Arc<AtomicU8>,
    output: Option<Box<dyn StreamHandle>>,
    input: Option<Box<dyn StreamHandle>>,
    worker: Option<Worker>,
    manual_animation: bool,
}

impl AudioRouter {
    /// Wire the sources to the channel bank. Nothing is opened until
    /// [`AudioRouter::set_source`].
    pub fn new(
        backend: Box<dyn AudioBackend>,
        config: AudioConfig,
        bank: Arc<ChannelBank>,
        synth: Arc<ToneSynth>,
        mic: Arc<MicPassthrough>,
        pressure: Arc<PressureModel>,
    ) -> Self {
        let running = Arc::new(AtomicU8::new(NO_SOURCE));
        subscribe(&bank, &synth, &pressure, &running);
        Self {
            config,
            backend,
            bank,
            synth,
            mic,
            pressure,
            selected: AudioSource::default(),
            active: None,
            running,
            output: None,
            input: None,
            worker: None,
            manual_animation: false,
        }
    }

    /// Never spawn the animation worker; the caller drives
    /// [`PressureModel::tick`] itself, e.g. on rendered-audio time.
    pub fn with_manual_animation(mut self) -> Self {
        self.manual_animation = true;
        self
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn bank(&self) -> &Arc<ChannelBank> {
        &self.bank
    }

    pub fn synth(&self) -> &Arc<ToneSynth> {
        &self.synth
    }

    pub fn mic(&self) -> &Arc<MicPassthrough> {
        &self.mic
    }

    pub fn pressure(&self) -> &Arc<PressureModel> {
        &self.pressure
    }

    pub fn active_source(&self) -> Option<AudioSource> {
        self.active
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(Worker::is_running)
    }

    /// Stop the current source and start `source`.
    ///
    /// On failure the router is left with no active source.
    pub fn set_source(&mut self, source: AudioSource) -> Result<(), TubeError> {
        self.selected = source;
        if self.active == Some(source) {
            return Ok(());
        }
        let previous = self.active;
        self.stop()?;

        if previous == Some(AudioSource::Pressure) && source == AudioSource::Synth {
            self.synth.sync_from_bank(&self.bank);
            info!("synth resynced from channels");
        }

        if let Err(e) = self.start(source) {
            // Tear down whatever part of the source did start.
            self.active = Some(source);
            if let Err(cleanup) = self.stop() {
                warn!(error = %cleanup, "cleanup after failed start");
            }
            warn!(source = %source, error = %e, "audio source failed to start");
            return Err(e);
        }

        self.active = Some(source);
        self.running.store(source.code(), Ordering::Release);
        info!(source = %source, "audio source started");
        Ok(())
    }

    fn start(&mut self, source: AudioSource) -> Result<(), TubeError> {
        match source {
            AudioSource::Synth => {
                let render = Box::new(self.synth.guarded_renderer());
                self.output = Some(self.start_output(render)?);
            }
            AudioSource::Mic => {
                let (capture, renderer) = self.mic.open()?;
                let mut input = self.backend.open_input(&self.config, Box::new(capture))?;
                input.start()?;
                let render = Box::new(MicPassthrough::guarded(renderer));
                self.output = Some(self.start_output(render)?);
                self.input = Some(input);
            }
            AudioSource::Pressure => {
                let config = self.pressure.config().clone();
                let resolution =
                    self.pressure
                        .configure(config.targets.profile, config.num_freqs, config.animated)?;
                if resolution.is_fallback() {
                    warn!("pressure source started on fallback frequencies");
                }
                let render = Box::new(self.pressure.renderer(self.config.sample_rate));
                self.output = Some(self.start_output(render)?);
                if config.animated && !self.manual_animation {
                    self.worker = Some(self.pressure.spawn_worker()?);
                }
            }
        }
        Ok(())
    }

    fn start_output(
        &mut self,
        render: Box<dyn AudioRender>,
    ) -> Result<Box<dyn StreamHandle>, TubeError> {
        let mut handle = self.backend.open_output(&self.config, render)?;
        handle.start()?;
        Ok(handle)
    }

    /// Halt the worker and close every stream. Safe to call when idle.
    pub fn stop(&mut self) -> Result<(), TubeError> {
        self.running.store(NO_SOURCE, Ordering::Release);
        let mut first_error = None;

        if let Some(mut worker) = self.worker.take() {
            if let Err(e) = worker.stop() {
                first_error.get_or_insert(e);
            }
        }
        if self.active == Some(AudioSource::Pressure) {
            self.pressure.stop_animation();
        }
        for mut handle in [self.output.take(), self.input.take()].into_iter().flatten() {
            if handle.is_active() {
                if let Err(e) = handle.stop() {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(source) = self.active.take() {
            info!(source = %source, "audio source stopped");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn settings(&self) -> RouterSettings {
        RouterSettings {
            source: self.selected,
            mic_volume: self.mic.volume(),
            pressure_volume: self.pressure.volume(),
        }
    }

    pub fn set_mic_volume(&self, volume: f64) {
        self.mic.set_volume(volume);
    }

    pub fn set_pressure_volume(&self, volume: f64) {
        self.pressure.set_volume(volume);
    }

    pub fn set_mic_compression(&self, settings: CompressorSettings) {
        self.mic.set_compression(settings);
    }
}

impl Drop for AudioRouter {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "router shutdown incomplete");
        }
    }
}

/// External edits drive the synth; while the pressure source plays a
/// static target they also replace its frequency set. Solver writes are
/// not fed back.
fn subscribe(
    bank: &Arc<ChannelBank>,
    synth: &Arc<ToneSynth>,
    pressure: &Arc<PressureModel>,
    running: &Arc<AtomicU8>,
) {
    let bank_ref: Weak<ChannelBank> = Arc::downgrade(bank);
    let synth = Arc::downgrade(synth);
    let pressure = Arc::downgrade(pressure);
    let running = Arc::clone(running);

    bank.on_changed(move |event: &ChannelEvent| {
        if event.origin != ChangeOrigin::External {
            return;
        }
        if let Some(synth) = synth.upgrade() {
            if let Err(e) = synth.apply_event(event) {
                warn!(channel = event.channel, error = %e, "synth rejected channel change");
            }
        }
        if running.load(Ordering::Acquire) != AudioSource::Pressure.code() {
            return;
        }
        if let (Some(model), Some(bank)) = (pressure.upgrade(), bank_ref.upgrade()) {
            if !model.is_animating() {
                model.update_from_channels(&bank);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OfflineBackend, StreamEvent, StreamKind};
    use crate::mic::MicConfig;
    use crate::pressure_model::PressureConfig;
    use crate::spectrum::dominant_frequencies;
    use crate::state::ChannelUpdate;
    use crate::TubeParams;

    fn router(animated: bool) -> (OfflineBackend, AudioRouter) {
        let backend = OfflineBackend::new(512);
        let bank = Arc::new(ChannelBank::new());
        let synth = Arc::new(ToneSynth::from_bank(44_100, &bank).unwrap());
        let mic = Arc::new(MicPassthrough::new(44_100, MicConfig::default()).unwrap());
        let config = PressureConfig {
            animated,
            num_freqs: 4,
            ..PressureConfig::default()
        };
        let pressure =
            Arc::new(PressureModel::new(&TubeParams::default(), config, bank.clone()).unwrap());
        let router = AudioRouter::new(
            Box::new(backend.clone()),
            AudioConfig::default(),
            bank,
            synth,
            mic,
            pressure,
        );
        (backend, router)
    }

    #[test]
    fn test_synth_source_plays_channel_zero() {
        let (backend, mut router) = router(false);
        router.set_source(AudioSource::Synth).unwrap();
        assert_eq!(router.active_source(), Some(AudioSource::Synth));

        let out = backend.pull(16_384);
        let peaks = dominant_frequencies(&out, 44_100, 1);
        assert!((peaks[0].0 - 440.0).abs() < 3.0, "{peaks:?}");
    }

    #[test]
    fn test_switch_closes_previous_stream_first() {
        let (backend, mut router) = router(false);
        router.set_source(AudioSource::Synth).unwrap();
        router.set_source(AudioSource::Pressure).unwrap();
        router.set_source(AudioSource::Synth).unwrap();

        assert_eq!(
            backend.events(),
            vec![
                StreamEvent::Opened(StreamKind::Output, 0),
                StreamEvent::Started(0),
                StreamEvent::Stopped(0),
                StreamEvent::Closed(0),
                StreamEvent::Opened(StreamKind::Output, 1),
                StreamEvent::Started(1),
                StreamEvent::Stopped(1),
                StreamEvent::Closed(1),
                StreamEvent::Opened(StreamKind::Output, 2),
                StreamEvent::Started(2),
            ]
        );
        assert_eq!(backend.peak_active_outputs(), 1);
        assert_eq!(backend.open_streams(), 1);
    }

    #[test]
    fn test_same_source_is_a_no_op() {
        let (backend, mut router) = router(false);
        router.set_source(AudioSource::Synth).unwrap();
        router.set_source(AudioSource::Synth).unwrap();
        assert_eq!(backend.events().len(), 2);
    }

    #[test]
    fn test_return_from_pressure_resyncs_synth() {
        let (_, mut router) = router(false);
        router.set_source(AudioSource::Pressure).unwrap();
        let solved = router.bank().get(0).unwrap();
        assert_ne!(solved.frequency, 440.0);
        // Solver writes do not reach the synth directly.
        assert_eq!(router.synth().oscillator(0).unwrap().target_frequency, 440.0);

        router.set_source(AudioSource::Synth).unwrap();
        let osc = router.synth().oscillator(0).unwrap();
        assert_eq!(osc.target_frequency, solved.frequency);
        assert!(!osc.muted);
    }

    #[test]
    fn test_external_edits_forward_to_static_pressure() {
        let (_, mut router) = router(false);
        router.set_source(AudioSource::Pressure).unwrap();
        router
            .bank()
            .set(
                5,
                ChannelUpdate {
                    frequency: Some(333.0),
                    volume: Some(0.5),
                    mute: Some(false),
                },
            )
            .unwrap();
        let pairs = router.pressure().source().active().pairs.clone();
        assert!(pairs.contains(&(333.0, 0.5)), "{pairs:?}");
        assert_eq!(router.synth().oscillator(5).unwrap().target_frequency, 333.0);
    }

    #[test]
    fn test_animated_pressure_runs_worker_and_ignores_edits() {
        let (_, mut router) = router(true);
        router.set_source(AudioSource::Pressure).unwrap();
        assert!(router.is_worker_running());
        let before = router.pressure().source().active().pairs.clone();

        router.bank().set(5, ChannelUpdate::frequency(333.0)).unwrap();
        assert_eq!(router.pressure().source().active().pairs, before);

        router.stop().unwrap();
        assert!(!router.is_worker_running());
        assert!(!router.pressure().is_animating());
        assert_eq!(router.active_source(), None);
    }

    #[test]
    fn test_manual_animation_skips_worker() {
        let (_, router) = router(true);
        let mut router = router.with_manual_animation();
        router.set_source(AudioSource::Pressure).unwrap();
        assert!(!router.is_worker_running());
        assert!(router.pressure().is_animating());
        let half_cycle = router.pressure().config().targets.half_cycle;
        assert!(router.pressure().tick(half_cycle).unwrap().is_some());
    }

    #[test]
    fn test_mic_source_passes_input_through() {
        let (backend, mut router) = router(false);
        router.set_mic_volume(1.0);
        router.set_source(AudioSource::Mic).unwrap();
        assert!(backend
            .events()
            .contains(&StreamEvent::Opened(StreamKind::Input, 0)));

        let tone: Vec<f32> = (0..8192)
            .map(|i| (0.2 * (std::f64::consts::TAU * 200.0 * i as f64 / 44_100.0).sin()) as f32)
            .collect();
        backend.push_input(&tone);
        let out = backend.pull(8192);
        assert!(out[4096..].iter().any(|s| s.abs() > 0.01));
        assert!(router.mic().level_db() > -60.0);

        router.set_source(AudioSource::Synth).unwrap();
        assert_eq!(backend.open_streams(), 1);
    }

    #[test]
    fn test_settings_report_volumes() {
        let (_, mut router) = router(false);
        router.set_source(AudioSource::Mic).unwrap();
        router.set_mic_volume(0.3);
        router.set_pressure_volume(0.6);
        router.set_mic_compression(CompressorSettings {
            ratio: 2.0,
            ..CompressorSettings::default()
        });
        assert_eq!(
            router.settings(),
            RouterSettings {
                source: AudioSource::Mic,
                mic_volume: 0.3,
                pressure_volume: 0.6,
            }
        );
        assert_eq!(router.mic().compression().ratio, 2.0);
    }

    struct NoDevice;

    impl AudioBackend for NoDevice {
        fn open_output(
            &mut self,
            _: &AudioConfig,
            _: Box<dyn AudioRender>,
        ) -> Result<Box<dyn StreamHandle>, TubeError> {
            Err(TubeError::Device("no default output device".into()))
        }

        fn open_input(
            &mut self,
            _: &AudioConfig,
            _: Box<dyn crate::backend::AudioCapture>,
        ) -> Result<Box<dyn StreamHandle>, TubeError> {
            Err(TubeError::Device("no default input device".into()))
        }
    }

    #[test]
    fn test_device_failure_leaves_router_idle() {
        let (_, healthy) = router(false);
        let mut router = AudioRouter::new(
            Box::new(NoDevice),
            AudioConfig::default(),
            healthy.bank().clone(),
            healthy.synth().clone(),
            healthy.mic().clone(),
            healthy.pressure().clone(),
        );
        let err = router.set_source(AudioSource::Pressure).unwrap_err();
        assert!(matches!(err, TubeError::Device(_)));
        assert_eq!(router.active_source(), None);
        assert!(!router.pressure().is_animating());
        assert!(router.set_source(AudioSource::Mic).is_err());
        assert_eq!(router.active_source(), None);
    }

    #[test]
    fn test_source_names_parse() {
        assert_eq!("Pressure".parse::<AudioSource>(), Ok(AudioSource::Pressure));
        assert!("radio".parse::<AudioSource>().is_err());
        assert_eq!(AudioSource::Mic.to_string(), "mic");
    }
}

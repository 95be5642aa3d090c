//! Shared, subscribable state: the 8-channel model and the tube parameters.
//!
//! Both are passed around as `Arc` handles. Listeners are invoked with no
//! lock held: the listener list is cloned out first, so a listener may read
//! the store back, write to it, or subscribe further listeners.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::constants::{clamp_frequency, NUM_CHANNELS};
use crate::{TubeError, TubeParams};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every guarded value in this crate is plain data that is never left
/// half-written, so the inner value is always usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    /// Hz, always inside the audible clamp range.
    pub frequency: f64,
    /// 0–1.
    pub volume: f64,
    pub mute: bool,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            volume: 1.0,
            mute: true,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelUpdate {
    pub frequency: Option<f64>,
    pub volume: Option<f64>,
    pub mute: Option<bool>,
}

impl ChannelUpdate {
    pub fn frequency(freq: f64) -> Self {
        Self {
            frequency: Some(freq),
            ..Self::default()
        }
    }

    pub fn volume(volume: f64) -> Self {
        Self {
            volume: Some(volume),
            ..Self::default()
        }
    }

    pub fn mute(mute: bool) -> Self {
        Self {
            mute: Some(mute),
            ..Self::default()
        }
    }
}

/// Who wrote a channel change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// MIDI, web UI, or any other outside controller.
    External,
    /// The modal decomposition writing its solution back.
    Solver,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelEvent {
    pub channel: usize,
    pub state: Channel,
    pub origin: ChangeOrigin,
}

type ChannelListener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

pub struct ChannelBank {
    channels: Mutex<[Channel; NUM_CHANNELS]>,
    listeners: RwLock<Vec<ChannelListener>>,
}

impl Default for ChannelBank {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBank {
    /// Channel 0 starts unmuted, the rest muted.
    pub fn new() -> Self {
        let mut channels = [Channel::default(); NUM_CHANNELS];
        channels[0].mute = false;
        Self {
            channels: Mutex::new(channels),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        NUM_CHANNELS
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, channel: usize) -> Result<Channel, TubeError> {
        check_channel(channel)?;
        Ok(lock(&self.channels)[channel])
    }

    pub fn snapshot(&self) -> [Channel; NUM_CHANNELS] {
        *lock(&self.channels)
    }

    /// Apply an external update and notify listeners.
    pub fn set(&self, channel: usize, update: ChannelUpdate) -> Result<Channel, TubeError> {
        self.set_from(ChangeOrigin::External, channel, update)
    }

    pub fn set_from(
        &self,
        origin: ChangeOrigin,
        channel: usize,
        update: ChannelUpdate,
    ) -> Result<Channel, TubeError> {
        check_channel(channel)?;
        let state = {
            let mut channels = lock(&self.channels);
            let ch = &mut channels[channel];
            if let Some(freq) = update.frequency {
                ch.frequency = clamp_frequency(freq);
            }
            if let Some(volume) = update.volume {
                ch.volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
            }
            if let Some(mute) = update.mute {
                ch.mute = mute;
            }
            *ch
        };
        self.notify(ChannelEvent {
            channel,
            state,
            origin,
        });
        Ok(state)
    }

    /// Subscribe to every channel change.
    pub fn on_changed(&self, listener: impl Fn(&ChannelEvent) + Send + Sync + 'static) {
        write(&self.listeners).push(Arc::new(listener));
    }

    fn notify(&self, event: ChannelEvent) {
        debug!(
            channel = event.channel,
            frequency = event.state.frequency,
            volume = event.state.volume,
            mute = event.state.mute,
            origin = ?event.origin,
            "channel updated"
        );
        let listeners = read(&self.listeners).clone();
        for listener in &listeners {
            listener(&event);
        }
    }
}

fn check_channel(channel: usize) -> Result<(), TubeError> {
    if channel < NUM_CHANNELS {
        Ok(())
    } else {
        Err(TubeError::ChannelOutOfRange {
            channel,
            count: NUM_CHANNELS,
        })
    }
}

// ---------------------------------------------------------------------------
// Tube parameters
// ---------------------------------------------------------------------------

/// Names of the individual tube parameters, as reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TubeParam {
    SpeedOfSound,
    TubeLength,
    TubeDiameter,
    DampingCoefficient,
    HoleSize,
    ReflectionCount,
    QFactor,
    GasDensity,
    HoleEndCorrection,
    PropanePressure,
}

impl TubeParam {
    /// Whether a change to this parameter invalidates physics caches.
    pub fn affects_physics(self) -> bool {
        !matches!(self, TubeParam::PropanePressure)
    }

    pub fn name(self) -> &'static str {
        match self {
            TubeParam::SpeedOfSound => "speed_of_sound",
            TubeParam::TubeLength => "tube_length",
            TubeParam::TubeDiameter => "tube_diameter",
            TubeParam::DampingCoefficient => "damping_coefficient",
            TubeParam::HoleSize => "hole_size",
            TubeParam::ReflectionCount => "reflection_count",
            TubeParam::QFactor => "q_factor",
            TubeParam::GasDensity => "gas_density",
            TubeParam::HoleEndCorrection => "hole_end_correction",
            TubeParam::PropanePressure => "propane_pressure",
        }
    }
}

/// Parameters whose values differ between `a` and `b`.
pub fn changed_params(a: &TubeParams, b: &TubeParams) -> Vec<TubeParam> {
    let mut changed = Vec::new();
    let mut check = |differs: bool, param: TubeParam| {
        if differs {
            changed.push(param);
        }
    };
    check(a.speed_of_sound != b.speed_of_sound, TubeParam::SpeedOfSound);
    check(a.tube_length != b.tube_length, TubeParam::TubeLength);
    check(a.tube_diameter != b.tube_diameter, TubeParam::TubeDiameter);
    check(
        a.damping_coefficient != b.damping_coefficient,
        TubeParam::DampingCoefficient,
    );
    check(a.hole_size != b.hole_size, TubeParam::HoleSize);
    check(a.reflection_count != b.reflection_count, TubeParam::ReflectionCount);
    check(a.q_factor != b.q_factor, TubeParam::QFactor);
    check(a.gas_density != b.gas_density, TubeParam::GasDensity);
    check(
        a.hole_end_correction != b.hole_end_correction,
        TubeParam::HoleEndCorrection,
    );
    check(a.propane_pressure != b.propane_pressure, TubeParam::PropanePressure);
    changed
}

type ParamListener = Arc<dyn Fn(TubeParam, &TubeParams) + Send + Sync>;

pub struct TubeParamStore {
    params: RwLock<TubeParams>,
    listeners: RwLock<Vec<ParamListener>>,
}

impl Default for TubeParamStore {
    fn default() -> Self {
        Self::new(TubeParams::default())
    }
}

impl TubeParamStore {
    pub fn new(params: TubeParams) -> Self {
        Self {
            params: RwLock::new(params),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self) -> TubeParams {
        read(&self.params).clone()
    }

    /// Mutate the parameters in place; returns the names that changed.
    pub fn update(&self, f: impl FnOnce(&mut TubeParams)) -> Vec<TubeParam> {
        let (changed, current) = {
            let mut params = write(&self.params);
            let before = params.clone();
            f(&mut params);
            (changed_params(&before, &params), params.clone())
        };
        if changed.is_empty() {
            return changed;
        }
        let listeners = read(&self.listeners).clone();
        for &param in &changed {
            debug!(parameter = param.name(), "tube parameter changed");
            for listener in &listeners {
                listener(param, &current);
            }
        }
        changed
    }

    pub fn set(&self, params: TubeParams) -> Vec<TubeParam> {
        self.update(|p| *p = params)
    }

    pub fn on_changed(&self, listener: impl Fn(TubeParam, &TubeParams) + Send + Sync + 'static) {
        write(&self.listeners).push(Arc::new(listener));
    }
}

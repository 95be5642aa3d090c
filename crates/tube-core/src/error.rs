use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TubeError {
    /// A tube or audio parameter outside the range the models accept.
    InvalidParameter { name: &'static str, value: f64 },
    ChannelOutOfRange { channel: usize, count: usize },
    /// The regularized normal equations could not be solved.
    SingularSystem,
    EmptyTarget,
    /// Target and position grid disagree in length.
    DimensionMismatch { expected: usize, found: usize },
    Device(String),
    Stream(String),
    UnsupportedSampleFormat(String),
    /// A background thread could not be spawned or joined.
    Thread(String),
    /// A shared lock was poisoned by a panicking holder.
    Poisoned(&'static str),
}

impl fmt::Display for TubeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TubeError::InvalidParameter { name, value } => {
                write!(f, "Invalid parameter {name} = {value}")
            }
            TubeError::ChannelOutOfRange { channel, count } => {
                write!(f, "Channel {channel} out of range (0..{count})")
            }
            TubeError::SingularSystem => write!(f, "Singular regularized system"),
            TubeError::EmptyTarget => write!(f, "Target pressure profile is empty"),
            TubeError::DimensionMismatch { expected, found } => {
                write!(f, "Expected {expected} positions, found {found}")
            }
            TubeError::Device(msg) => write!(f, "Audio device error: {msg}"),
            TubeError::Stream(msg) => write!(f, "Audio stream error: {msg}"),
            TubeError::UnsupportedSampleFormat(fmt_name) => {
                write!(f, "Unsupported sample format {fmt_name}")
            }
            TubeError::Thread(msg) => write!(f, "Background thread error: {msg}"),
            TubeError::Poisoned(what) => write!(f, "Lock poisoned: {what}"),
        }
    }
}

impl std::error::Error for TubeError {}

impl From<cpal::BuildStreamError> for TubeError {
    fn from(e: cpal::BuildStreamError) -> Self {
        TubeError::Stream(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for TubeError {
    fn from(e: cpal::PlayStreamError) -> Self {
        TubeError::Stream(e.to_string())
    }
}

impl From<cpal::PauseStreamError> for TubeError {
    fn from(e: cpal::PauseStreamError) -> Self {
        TubeError::Stream(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for TubeError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        TubeError::Device(e.to_string())
    }
}

impl From<cpal::DevicesError> for TubeError {
    fn from(e: cpal::DevicesError) -> Self {
        TubeError::Device(e.to_string())
    }
}

impl From<cpal::DeviceNameError> for TubeError {
    fn from(e: cpal::DeviceNameError) -> Self {
        TubeError::Device(e.to_string())
    }
}

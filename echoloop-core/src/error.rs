use thiserror::Error;

use crate::ipc::events::ErrorKind;

/// All errors produced by echoloop-core.
#[derive(Debug, Error)]
pub enum EchoError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("playback error: {0}")]
    Playback(String),

    #[error("controller is already running")]
    AlreadyRunning,

    #[error("controller is not running")]
    NotRunning,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EchoError {
    /// Machine-checkable kind for the error event channel.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EchoError::AudioDevice(_) | EchoError::NoDefaultInputDevice => {
                ErrorKind::Initialization
            }
            EchoError::AudioStream(_) => ErrorKind::Recording,
            EchoError::NoDefaultOutputDevice | EchoError::Playback(_) => ErrorKind::Playback,
            EchoError::AlreadyRunning
            | EchoError::NotRunning
            | EchoError::InvalidState(_)
            | EchoError::Io(_)
            | EchoError::Other(_) => ErrorKind::Listening,
        }
    }
}

pub type Result<T> = std::result::Result<T, EchoError>;

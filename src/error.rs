use thiserror::Error;

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Rejected upload: nothing was run, nothing was recorded
    #[error("Invalid input: {message}")]
    Input { message: String },

    /// Detector could not produce an answer; callers downgrade this to "no presence"
    #[error("Detector {detector} failed: {message}")]
    Detector { detector: String, message: String },

    /// Event database or file system unavailable
    #[error("Storage error in {component}: {message}")]
    Storage { component: String, message: String },

    #[error("System error: {message}")]
    System { message: String },
}

impl PresenceError {
    pub fn input<S: Into<String>>(message: S) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    pub fn detector<S: Into<String>>(detector: S, message: S) -> Self {
        Self::Detector {
            detector: detector.into(),
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(component: S, message: S) -> Self {
        Self::Storage {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input { .. })
    }
}

impl From<rusqlite::Error> for PresenceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::storage("event_store".to_string(), e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PresenceError>;

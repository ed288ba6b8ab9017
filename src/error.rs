use thiserror::Error;

pub type Result<T> = std::result::Result<T, CasterError>;

#[derive(Error, Debug)]
pub enum CasterError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("No available port (tried {tried:?})")]
    NoAvailablePort { tried: Vec<u16> },

    /// Re-encoding was required but neither NVENC nor VAAPI is usable.
    #[error("No hardware encoder available: install GPU drivers and an ffmpeg build with NVENC or VAAPI, or convert the file to MP4 manually")]
    NoHardwareEncoder,

    #[error("Playback did not start after {attempts} status checks")]
    PlaybackNotStarted { attempts: u32 },

    #[error("Not connected to a cast device")]
    NotConnected,

    #[error("A load is already in progress")]
    Busy,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CasterError {
    /// Errors the user can fix themselves (drivers, ports, bad input) rather
    /// than transient failures worth retrying.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            CasterError::NoHardwareEncoder
                | CasterError::NoAvailablePort { .. }
                | CasterError::Validation(_)
        )
    }
}

impl From<String> for CasterError {
    fn from(s: String) -> Self {
        CasterError::Unknown(s)
    }
}

impl From<&str> for CasterError {
    fn from(s: &str) -> Self {
        CasterError::Unknown(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_encoder_is_distinct_from_io() {
        let err = CasterError::NoHardwareEncoder;
        assert!(err.is_user_actionable());

        let io: CasterError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(!io.is_user_actionable());
        assert!(matches!(io, CasterError::Io(_)));
    }

    #[test]
    fn test_string_conversion() {
        let err: CasterError = "boom".into();
        assert_eq!(err.to_string(), "Unknown error: boom");
    }
}

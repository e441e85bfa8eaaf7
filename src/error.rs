pub type RenderResult<T> = Result<T, RenderError>;

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// EDL validation failure; carries the offending object/key path.
    #[error("invalid EDL: {0}")]
    InvalidEdl(String),

    #[error("cannot open '{path}': {reason}")]
    IoOpen { path: String, reason: String },

    #[error("codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("hardware init failed: {0}")]
    HardwareInit(String),

    #[error("fatal encoder error: {0}")]
    EncodeFatal(String),

    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RenderError {
    pub fn invalid_edl(msg: impl Into<String>) -> Self {
        Self::InvalidEdl(msg.into())
    }

    pub fn io_open(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::IoOpen {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn codec_unavailable(msg: impl Into<String>) -> Self {
        Self::CodecUnavailable(msg.into())
    }

    pub fn hardware_init(msg: impl Into<String>) -> Self {
        Self::HardwareInit(msg.into())
    }

    pub fn encode_fatal(msg: impl Into<String>) -> Self {
        Self::EncodeFatal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            RenderError::invalid_edl("x")
                .to_string()
                .contains("invalid EDL:")
        );
        assert!(
            RenderError::codec_unavailable("x")
                .to_string()
                .contains("codec unavailable:")
        );
        assert!(
            RenderError::hardware_init("x")
                .to_string()
                .contains("hardware init failed:")
        );
    }

    #[test]
    fn io_open_names_the_path() {
        let err = RenderError::io_open("clips/a.mp4", "no such file");
        let s = err.to_string();
        assert!(s.contains("clips/a.mp4"));
        assert!(s.contains("no such file"));
    }
}

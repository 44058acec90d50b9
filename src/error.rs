use thiserror::Error;

/// Failure taxonomy for the inference loop.
///
/// Functions still return `anyhow::Result`; these variants sit at the root of
/// the chain so callers can `downcast_ref::<EdgeError>()` to decide whether a
/// failure is fatal, per-detection, or best-effort.
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to encode frame: {0}")]
    Encoding(String),

    #[error("failed to stage artifact: {0}")]
    Staging(String),

    #[error("failed to upload artifact: {0}")]
    Upload(String),

    #[error("failed to get frame from the stream: {0}")]
    FrameUnavailable(String),

    #[error("detector failure: {0}")]
    Detector(String),
}

impl EdgeError {
    /// Per-detection failures leave the tick running.
    pub fn is_per_detection(&self) -> bool {
        matches!(self, Self::Staging(_) | Self::Upload(_))
    }
}

/// Returns the `EdgeError` at the root of an anyhow chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&EdgeError> {
    err.chain().find_map(|cause| cause.downcast_ref::<EdgeError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_root_through_context() {
        let err: anyhow::Result<()> = Err(EdgeError::Upload("503".into()).into());
        let err = err.context("uploading crop").unwrap_err();
        let kind = classify(&err).expect("edge error in chain");
        assert!(matches!(kind, EdgeError::Upload(_)));
        assert!(kind.is_per_detection());
    }

    #[test]
    fn frame_unavailable_is_not_per_detection() {
        assert!(!EdgeError::FrameUnavailable("eof".into()).is_per_detection());
        assert!(!EdgeError::Detector("shape".into()).is_per_detection());
    }
}

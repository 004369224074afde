use plandiff_core::error::ErrorKind;

/// Failures of the alignment and diff stages.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Insufficient feature matches: found {found}, need at least {required}")]
    InsufficientFeatureMatches { found: usize, required: usize },

    #[error("Transform out of bounds: scale {scale:.4}, rotation {rotation_degrees:.2} deg")]
    TransformOutOfBounds { scale: f64, rotation_degrees: f64 },

    #[error("Alignment confidence {confidence:.3} below minimum {minimum:.3}")]
    LowConfidence { confidence: f64, minimum: f64 },

    #[error("Image error: {0}")]
    Image(String),

    #[error("Callout detection failed: {0}")]
    Detection(String),

    #[error("Invalid pipeline configuration: {0}")]
    Config(String),
}

impl VisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // The inference collaborator is a remote service.
            Self::Detection(_) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InsufficientFeatureMatches { .. } => "InsufficientFeatureMatches",
            Self::TransformOutOfBounds { .. } => "TransformOutOfBounds",
            Self::LowConfidence { .. } => "LowAlignmentConfidence",
            Self::Image(_) => "InvalidImage",
            Self::Detection(_) => "CalloutDetection",
            Self::Config(_) => "InvalidConfiguration",
        }
    }
}

impl From<image::ImageError> for VisionError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}

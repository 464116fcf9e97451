use std::{fmt, path::PathBuf};

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) value: f64,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A layer name that the feature extractor doesn't have
    UnknownLayer(String),
    /// The extractor didn't produce an activation for a layer the loss needs
    MissingActivation(String),
    /// The pretrained weights for the feature extractor could not be found
    MissingWeights(PathBuf),
    /// The weight record exists, but could not be loaded
    Record(burn::record::RecorderError),
    /// Tensor data could not be read back into host memory
    TensorData(String),
    /// A required input was not provided to the session builder
    MissingInput(&'static str),
    /// The optimizer was handed a pixel vector of the wrong length
    ShapeMismatch { expected: usize, actual: usize },
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::UnknownLayer(name) => {
                write!(f, "the feature extractor has no layer named '{}'", name)
            }
            Self::MissingActivation(name) => write!(
                f,
                "the feature extractor did not produce an activation for '{}'",
                name
            ),
            Self::MissingWeights(path) => write!(
                f,
                "model weights not found at '{}'",
                path.display()
            ),
            Self::Record(re) => write!(f, "failed to load model weights: {:?}", re),
            Self::TensorData(msg) => write!(f, "failed to read tensor data: {}", msg),
            Self::MissingInput(what) => write!(f, "no {} was provided", what),
            Self::ShapeMismatch { expected, actual } => write!(
                f,
                "expected a pixel vector of length {}, but got {}",
                expected, actual
            ),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<burn::record::RecorderError> for Error {
    fn from(re: burn::record::RecorderError) -> Self {
        Self::Record(re)
    }
}

impl From<burn::tensor::DataError> for Error {
    fn from(de: burn::tensor::DataError) -> Self {
        Self::TensorData(format!("{:?}", de))
    }
}

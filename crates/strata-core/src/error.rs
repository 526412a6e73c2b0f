use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within Strata.
///
/// Graph-configuration failures (shape, dimension, parity and parameter
/// errors) are fatal to `build`. Backend failures are surfaced unchanged
/// from whichever sweep hit them. Nothing in this crate retries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Device memory exhausted.
    #[error("allocation of {requested} bytes failed: {in_use} of {limit} bytes in use")]
    Allocation {
        requested: usize,
        in_use: usize,
        limit: usize,
    },

    /// A layer cannot produce an output for the given input shape.
    #[error("incompatible shape {shape}: {reason}")]
    IncompatibleShape { shape: Shape, reason: String },

    /// Shapes that must agree on every non-channel dimension do not.
    #[error("dimension mismatch on axis {axis}: expected {expected}, got {got}")]
    DimensionMismatch {
        axis: usize,
        expected: usize,
        got: usize,
    },

    /// Recommended padding would break odd/even output parity.
    #[error("parity error: (filter-1)*dilation + 1 + offset = {value} is odd")]
    Parity { value: i64 },

    /// A configuration value is out of range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The caller supplied the wrong number of trainers.
    #[error("trainer count mismatch: expected {expected}, got {got}")]
    TrainerCountMismatch { expected: usize, got: usize },

    /// Wiring found a state that should be impossible (e.g. a port bound to
    /// a different volume than the one being propagated).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Operation called in the wrong lifecycle state.
    #[error("`{op}` is not allowed in state {state}")]
    InvalidState { op: &'static str, state: String },

    /// Shape rank does not match what an operation requires.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between volumes or records.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Element count mismatch when loading host data.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// A kernel that needs explicit strides was handed a packed descriptor.
    #[error("`{op}` requires a strided descriptor")]
    DescriptorKind { op: &'static str },

    /// The numeric backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn backend(s: impl Into<String>) -> Self {
        Error::Backend(s.into())
    }

    pub fn invariant(s: impl Into<String>) -> Self {
        Error::InvariantViolation(s.into())
    }

    pub fn incompatible(shape: &Shape, reason: impl Into<String>) -> Self {
        Error::IncompatibleShape {
            shape: shape.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout Strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

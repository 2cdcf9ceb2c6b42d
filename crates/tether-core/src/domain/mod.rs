//! Domain model (ids, descriptors, outcomes, envelope, external objects).

pub mod classifier;
pub mod descriptor;
pub mod envelope;
pub mod errors;
pub mod external;
pub mod ids;
pub mod outcome;

pub use classifier::{ExitClassifier, PatternPreset, PatternSet};
pub use descriptor::{DeclaredOutput, InputDescriptor, MappingError, OutputDescriptor, OutputSource};
pub use envelope::{FileRef, ResultEnvelope};
pub use errors::{ErrorKind, RollupError, TransferError, WrapperError};
pub use external::{
    ExternalObject, ExternalObjectVersion, ObjectStatus, RolloutState, RollupRequest,
    SubResourceDetail,
};
pub use ids::{ContentId, InvocationId, JobId};
pub use outcome::{
    Classification, DEFAULT_RETRYABLE_EXIT_CODE, INTERNAL_ERROR_EXIT_CODE,
    NEVER_STARTED_EXIT_CODE, ProcessOutcome,
};

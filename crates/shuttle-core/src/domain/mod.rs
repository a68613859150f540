//! Domain model (ids, envelope, job status, errors).

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod job;

pub use self::envelope::{Envelope, EnvelopeError};
pub use self::errors::{HandlerError, QueueError};
pub use self::ids::{JobId, ParseJobIdError};
pub use self::job::{JobStatus, QueueIdentity};

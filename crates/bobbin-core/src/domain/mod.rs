//! Domain model (ids, signatures, canvas, envelope, state, records, errors).
//!
//! Nothing in here performs I/O. The `ports` and `app` layers move these
//! values between the broker, the result store and the handlers.

pub mod canvas;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod record;
pub mod signature;
pub mod state;

pub use self::canvas::{Canvas, Chord, ChordErrorPolicy, Group, chain, chord, group};
pub use self::envelope::Envelope;
pub use self::errors::{ERROR_MARKER_KEY, FailureKind, TaskError, TaskFailure};
pub use self::ids::{GroupId, TaskId};
pub use self::record::{ActiveTask, ChordCallback, GroupMeta, ResultRecord, WorkerSnapshot};
pub use self::signature::{Kwargs, Signature, SignatureOptions};
pub use self::state::TaskState;

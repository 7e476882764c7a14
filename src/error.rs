//! Error types for the control-side API.
//!
//! Nothing on the render thread returns these. Render-side failures degrade to
//! silence or a skipped node and are reported through `tracing` and
//! [`MixerEvent`](crate::MixerEvent)s instead.

use thiserror::Error;

use crate::source::SourceHandle;
use crate::submix::SubmixId;

/// Errors returned by [`MixerHandle`](crate::MixerHandle) and friends
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MixerError {
    /// Every source slot is in use
    #[error("No free source slot available (pool of {capacity})")]
    NoFreeSource { capacity: usize },

    /// The handle refers to a slot that was released (or never acquired)
    #[error("Stale source handle: {0:?}")]
    StaleSource(SourceHandle),

    /// `init_source` must run before any other operation on a slot
    #[error("Source {0:?} has not been initialized")]
    NotInitialized(SourceHandle),

    /// `init_source` was called twice for the same acquisition
    #[error("Source {0:?} is already initialized")]
    AlreadyInitialized(SourceHandle),

    /// The submix id is not registered
    #[error("Unknown submix: {0:?}")]
    UnknownSubmix(SubmixId),

    /// Attaching `child` under `parent` would create a cycle
    #[error("Attaching submix {child:?} under {parent:?} would create a cycle")]
    SubmixCycle { child: SubmixId, parent: SubmixId },

    /// The requested parent cannot adopt the submix (endpoints have no parent)
    #[error("Submix {parent:?} cannot be the parent of {child:?}")]
    InvalidSubmixParent { child: SubmixId, parent: SubmixId },

    /// The master submix cannot be unregistered or re-parented
    #[error("The master submix cannot be removed or re-parented")]
    CannotRemoveMaster,

    /// A channel count of zero, or above the supported maximum
    #[error("Invalid channel count {channels} (supported: 1..={max})")]
    InvalidChannelCount { channels: usize, max: usize },

    /// A configuration value is out of range
    #[error("Invalid mixer configuration: {0}")]
    InvalidConfig(String),

    /// The render thread did not drain the command queue in time
    #[error("Command queue flush timed out after {millis} ms")]
    FlushTimeout { millis: u128 },

    /// The platform output stream could not be opened or started
    #[error("Audio output failed: {0}")]
    Output(String),
}

/// Result type for control-side mixer operations
pub type MixerResult<T> = Result<T, MixerError>;

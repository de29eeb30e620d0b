//! Error types for ferroteam

use thiserror::Error;

/// Result type for team operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for team operations
///
/// Faults raised inside a split or collective are fatal to the whole job: the
/// [`Pe`](crate::Pe) aborts every peer before handing the error back. Queries
/// such as [`Pe::team_size`](crate::Pe::team_size) fail locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Negative ranges, zero stride, oversized triplets, mismatched counts
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The team registry has no free slot left
    #[error("Team registry exhausted (capacity {capacity})")]
    ResourceExhausted {
        /// Maximum number of live teams
        capacity: usize,
    },

    /// A buffer is still bound to a collective that has not completed
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The calling PE is not a member of the team (or the team is NULL)
    #[error("Calling PE is not a member of the team")]
    NotMember,

    /// The handle does not name a live team (destroyed or never registered)
    #[error("Invalid team handle")]
    InvalidTeam,

    /// Another PE aborted the job
    #[error("Job aborted by PE {origin}: {reason}")]
    Aborted {
        /// Global rank of the PE that triggered the abort
        origin: i32,
        /// Message supplied by the aborting PE
        reason: String,
    },

    /// Failure reported by the transport layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an [`Error::InvalidArgument`] from anything displayable.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Build an [`Error::ProtocolViolation`] from anything displayable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// Whether this error was raised on another PE and relayed here.
    ///
    /// Relayed errors must not trigger a second abort.
    pub fn is_relayed(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            Error::invalid("stride must be >= 1").to_string(),
            "Invalid argument: stride must be >= 1"
        );
        assert_eq!(
            Error::ResourceExhausted { capacity: 8 }.to_string(),
            "Team registry exhausted (capacity 8)"
        );
        assert_eq!(
            Error::Aborted {
                origin: 3,
                reason: "boom".into()
            }
            .to_string(),
            "Job aborted by PE 3: boom"
        );
    }

    #[test]
    fn only_aborts_are_relayed() {
        assert!(Error::Aborted {
            origin: 0,
            reason: String::new()
        }
        .is_relayed());
        assert!(!Error::NotMember.is_relayed());
        assert!(!Error::protocol("busy").is_relayed());
    }
}

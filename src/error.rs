/*!
 * Defines the [ChroniclerError] and [Result] types.
*/

use std::collections::BTreeSet;

use thiserror::Error;

use crate::record::ObjId;

/// Chronicler error type
#[derive(Error, Debug)]
pub enum ChroniclerError {
    /// Something could not be found in the history.
    #[error("not found: {0}")]
    NotFound(String),
    /// The user tried to interact with a deleted object.
    #[error("object '{0}' has been deleted")]
    ObjectDeleted(ObjId),
    /// A modification of the history encountered a problem, either an
    /// attempt to save a snapshot or an optimistic write conflict.
    #[error("modification error: {0}")]
    Modification(String),
    /// A uniqueness constraint was violated.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    /// A record in the archive is newer than this codebase can read.
    #[error("version error: {0}")]
    Version(String),
    /// A migration step failed.
    #[error("migration error: {0}")]
    Migration(String),
    /// An operation would conflict with an archive constraint.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// An operation would violate reference integrity.  Carries the ids of
    /// the offending referrers.
    #[error("{message}, referenced by: {references:?}")]
    Reference {
        /// What went wrong.
        message: String,
        /// The objects that still hold references.
        references: BTreeSet<ObjId>,
    },
    /// The archive could not be reached or understood.
    #[error("connection error: {0}")]
    Connection(String),
    /// A saved state could not be reduced to archive primitives, or an
    /// encoded state could not be decoded.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// A type id or type has not been registered with the historian.
    #[error("unknown type: {0}")]
    UnknownType(String),
    /// A value could not be interpreted as an archive id.
    #[error("invalid archive id: {0}")]
    InvalidId(String),
    /// Signal used to abandon the enclosing transaction.
    #[error("transaction rolled back")]
    RolledBack,
}

impl ChroniclerError {
    /// True for the not-found family of errors, of which [ObjectDeleted]
    /// is a specialisation.
    ///
    /// [ObjectDeleted]: ChroniclerError::ObjectDeleted
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChroniclerError::NotFound(_) | ChroniclerError::ObjectDeleted(_)
        )
    }
}

/// Chronicler result type
pub type Result<T> = std::result::Result<T, ChroniclerError>;

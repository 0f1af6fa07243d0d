//! Error taxonomy.
//!
//! Business rule violations are [`Rejection`]s, decided by the reducers and
//! classified by [`RejectionKind`]. Storage failures are [`StorageError`]s;
//! the ones raised by a storage guard (slot taken, stale write) translate
//! into rejections so callers see the same outcome whichever layer caught it.

use crate::protocol::Protocol;
use crate::types::{
    AreaId, CondominiumId, KeyId, KeyStatus, KeyTransition, ReservationId, ReservationStatus, Role,
    Transition,
};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Category of a rejection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Malformed or out-of-range input
    Validation,
    /// Competes with existing data (slot, active booking, key custody)
    Conflict,
    /// Transition not allowed from the current state
    State,
    /// Referenced record does not exist
    NotFound,
    /// Actor lacks the required role or ownership
    Authorization,
}

impl RejectionKind {
    /// Wire name, also used as a metric label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::State => "state",
            Self::NotFound => "not_found",
            Self::Authorization => "authorization",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of record a lookup failed to find
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// Common area
    Area,
    /// Reservation
    Reservation,
    /// Physical key
    Key,
    /// Evaluation
    Evaluation,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Area => "area",
            Self::Reservation => "reservation",
            Self::Key => "key",
            Self::Evaluation => "evaluation",
        })
    }
}

/// A request refused by a business rule
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Rejection {
    /// End time not after start time
    #[error("invalid time range: start {start} must be before end {end}")]
    InvalidTimeRange {
        /// Requested start
        start: NaiveTime,
        /// Requested end
        end: NaiveTime,
    },

    /// Requested window sticks out of the area's operating hours
    #[error("requested {start}-{end} is outside operating hours {open}-{close}")]
    OutsideOperatingHours {
        /// Requested start
        start: NaiveTime,
        /// Requested end
        end: NaiveTime,
        /// Area opening time
        open: NaiveTime,
        /// Area closing time
        close: NaiveTime,
    },

    /// Request names a condominium the area does not belong to
    #[error("area {area_id} does not belong to condominium {condominium_id}")]
    ForeignCondominium {
        /// Requested area
        area_id: AreaId,
        /// Condominium named by the request
        condominium_id: CondominiumId,
    },

    /// A required field is missing or blank
    #[error("missing required field: {field}")]
    MissingField {
        /// Field name
        field: String,
    },

    /// Rating outside 1..=5
    #[error("{field} rating must be between 1 and 5, got {value}")]
    InvalidRating {
        /// Rated aspect
        field: String,
        /// Given value
        value: u8,
    },

    /// Booking reference that cannot be a protocol
    #[error("invalid protocol: {input:?}")]
    InvalidProtocol {
        /// Raw input
        input: String,
    },

    /// Check-in attempted before the reservation date
    #[error("check-in for {protocol} opens on {date}")]
    CheckInNotOpen {
        /// Reservation protocol
        protocol: Protocol,
        /// Reservation date
        date: NaiveDate,
    },

    /// The slot overlaps a non-cancelled reservation
    #[error("time slot conflicts with reservation {protocol}")]
    SlotConflict {
        /// Protocol of the reservation holding the slot
        protocol: Protocol,
    },

    /// The requester already holds an active booking for this area and day
    #[error("requester already has active reservation {protocol} for this area and date")]
    DuplicateActiveBooking {
        /// Protocol of the existing booking
        protocol: Protocol,
    },

    /// No unused protocol could be generated
    #[error("protocol {protocol} is already taken")]
    ProtocolTaken {
        /// Colliding protocol
        protocol: Protocol,
    },

    /// Checkout requested while the key is not on the hook
    #[error("key {label} is not available (status {status})")]
    KeyNotAvailable {
        /// Key label
        label: String,
        /// Current status
        status: KeyStatus,
    },

    /// Return requested for a key nobody checked out
    #[error("key {label} is not checked out (status {status})")]
    KeyNotCheckedOut {
        /// Key label
        label: String,
        /// Current status
        status: KeyStatus,
    },

    /// Administrative key transition not allowed from the current status
    #[error("cannot apply {requested} to key {label} in status {from}")]
    InvalidKeyTransition {
        /// Key label
        label: String,
        /// Current status
        from: KeyStatus,
        /// Requested transition
        requested: KeyTransition,
    },

    /// The reservation already has an evaluation
    #[error("reservation {protocol} has already been evaluated")]
    EvaluationExists {
        /// Reservation protocol
        protocol: Protocol,
    },

    /// Another writer changed the record first
    #[error("{entity} {id} was modified concurrently")]
    ConcurrentUpdate {
        /// Record kind
        entity: Entity,
        /// Record identifier
        id: String,
    },

    /// Reservation transition not allowed from the current status
    #[error("invalid transition from {from}: {requested}")]
    InvalidTransition {
        /// Current status
        from: ReservationStatus,
        /// Requested transition
        requested: Transition,
    },

    /// Referenced record does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Record kind
        entity: Entity,
        /// Identifier or protocol used in the lookup
        id: String,
    },

    /// Actor not allowed to perform the action
    #[error("{role} may not {action}")]
    Forbidden {
        /// Actor role
        role: Role,
        /// What was attempted
        action: String,
    },
}

impl Rejection {
    /// Shorthand for [`Rejection::NotFound`]
    pub fn not_found(entity: Entity, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`Rejection::Forbidden`]
    pub fn forbidden(role: Role, action: impl Into<String>) -> Self {
        Self::Forbidden {
            role,
            action: action.into(),
        }
    }

    /// Shorthand for [`Rejection::MissingField`]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Category of the rejection
    #[must_use]
    pub const fn kind(&self) -> RejectionKind {
        match self {
            Self::InvalidTimeRange { .. }
            | Self::OutsideOperatingHours { .. }
            | Self::ForeignCondominium { .. }
            | Self::MissingField { .. }
            | Self::InvalidRating { .. }
            | Self::InvalidProtocol { .. }
            | Self::CheckInNotOpen { .. } => RejectionKind::Validation,
            Self::SlotConflict { .. }
            | Self::DuplicateActiveBooking { .. }
            | Self::ProtocolTaken { .. }
            | Self::KeyNotAvailable { .. }
            | Self::KeyNotCheckedOut { .. }
            | Self::EvaluationExists { .. }
            | Self::ConcurrentUpdate { .. } => RejectionKind::Conflict,
            Self::InvalidTransition { .. } | Self::InvalidKeyTransition { .. } => {
                RejectionKind::State
            },
            Self::NotFound { .. } => RejectionKind::NotFound,
            Self::Forbidden { .. } => RejectionKind::Authorization,
        }
    }
}

/// Errors raised by storage backends
#[derive(Error, Debug)]
pub enum StorageError {
    /// Insert refused: the interval overlaps a non-cancelled reservation
    #[error("slot already taken by reservation {protocol}")]
    SlotTaken {
        /// Protocol of the reservation holding the slot
        protocol: Protocol,
    },

    /// Insert refused: protocol already in use
    #[error("protocol {0} already exists")]
    DuplicateProtocol(Protocol),

    /// Insert refused: the reservation already has an evaluation
    #[error("reservation {0} already has an evaluation")]
    DuplicateEvaluation(ReservationId),

    /// Update refused: the stored status is no longer the one read
    #[error("reservation {reservation_id} is no longer {expected}")]
    StaleReservation {
        /// Reservation being updated
        reservation_id: ReservationId,
        /// Status the writer expected
        expected: ReservationStatus,
    },

    /// Commit refused: the key was written since it was read
    #[error("key {key_id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// Key being written
        key_id: KeyId,
        /// Version the writer read
        expected: u64,
        /// Version in storage
        actual: u64,
    },

    /// Record to update does not exist
    #[error("{entity} {id} not found in storage")]
    Missing {
        /// Record kind
        entity: Entity,
        /// Record identifier
        id: String,
    },

    /// Stored data could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Backend failure (connection, query)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Name of the guard that refused the write, if a guard did
    #[must_use]
    pub const fn guard(&self) -> Option<&'static str> {
        match self {
            Self::SlotTaken { .. } => Some("slot"),
            Self::DuplicateProtocol(_) => Some("protocol"),
            Self::DuplicateEvaluation(_) => Some("evaluation"),
            Self::StaleReservation { .. } => Some("status"),
            Self::VersionConflict { .. } => Some("key_version"),
            Self::Missing { .. } | Self::Corrupt(_) | Self::Backend(_) => None,
        }
    }
}

/// Error returned by [`crate::ReservationManager`] operations
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Refused by a business rule
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// Storage failed
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl ServiceError {
    /// The rejection, when the request was refused by a rule
    #[must_use]
    pub const fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Storage(_) => None,
        }
    }

    /// Category of the rejection, if any
    #[must_use]
    pub const fn kind(&self) -> Option<RejectionKind> {
        match self {
            Self::Rejected(rejection) => Some(rejection.kind()),
            Self::Storage(_) => None,
        }
    }

    /// Metric label for the outcome
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Rejected(rejection) => rejection.kind().as_str(),
            Self::Storage(_) => "storage",
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::SlotTaken { protocol } => {
                Self::Rejected(Rejection::SlotConflict { protocol })
            },
            StorageError::DuplicateProtocol(protocol) => {
                Self::Rejected(Rejection::ProtocolTaken { protocol })
            },
            StorageError::DuplicateEvaluation(reservation_id) => {
                Self::Rejected(Rejection::ConcurrentUpdate {
                    entity: Entity::Evaluation,
                    id: reservation_id.to_string(),
                })
            },
            StorageError::StaleReservation { reservation_id, .. } => {
                Self::Rejected(Rejection::ConcurrentUpdate {
                    entity: Entity::Reservation,
                    id: reservation_id.to_string(),
                })
            },
            StorageError::VersionConflict { key_id, .. } => {
                Self::Rejected(Rejection::ConcurrentUpdate {
                    entity: Entity::Key,
                    id: key_id.to_string(),
                })
            },
            other @ (StorageError::Missing { .. }
            | StorageError::Corrupt(_)
            | StorageError::Backend(_)) => Self::Storage(other),
        }
    }
}

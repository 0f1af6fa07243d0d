//! Domain types for condominium amenity reservations.
//!
//! Value objects (identifiers, money, time windows), the entities the engine
//! reasons about (areas, reservations, keys, evaluations) and the typed
//! requests the manager accepts.

use crate::error::Rejection;
use crate::protocol::Protocol;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a common area (pool, BBQ area, party hall)
    AreaId
);
uuid_id!(
    /// Unique identifier for a reservation
    ReservationId
);
uuid_id!(
    /// Unique identifier for a user (resident, doorkeeper or administrator)
    UserId
);
uuid_id!(
    /// Unique identifier for a condominium
    CondominiumId
);
uuid_id!(
    /// Unique identifier for a physical key
    KeyId
);
uuid_id!(
    /// Unique identifier for a key movement (checkout or return)
    MovementId
);
uuid_id!(
    /// Unique identifier for an evaluation
    EvaluationId
);

/// Error returned when a persisted enum value is not recognised
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Amount in centavos
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from whole reais, saturating on overflow
    #[must_use]
    pub const fn from_reais(reais: u64) -> Self {
        Self(reais.saturating_mul(100))
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R$ {},{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Time
// ============================================================================

/// Half-open wall-clock interval `[start, end)` within one calendar day
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

/// Unchecked wire form of [`TimeWindow`]
#[derive(Deserialize)]
struct RawWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = Rejection;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl TimeWindow {
    /// Build a window, rejecting empty or inverted ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidTimeRange`] unless `start < end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, Rejection> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(Rejection::InvalidTimeRange { start, end })
        }
    }

    /// Start of the window (inclusive)
    #[must_use]
    pub const fn start(&self) -> NaiveTime {
        self.start
    }

    /// End of the window (exclusive)
    #[must_use]
    pub const fn end(&self) -> NaiveTime {
        self.end
    }

    /// Whether the two windows share at least one instant
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies entirely inside this window
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Length of the window
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}–{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

// ============================================================================
// Actors
// ============================================================================

/// Role reported by the identity collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Resident (morador)
    Resident,
    /// Condominium administrator (síndico)
    Administrator,
}

impl Role {
    /// Wire name of the role
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Resident => "resident",
            Self::Administrator => "administrator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller of an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Who is acting
    pub id: UserId,
    /// With which authority
    pub role: Role,
}

impl Actor {
    /// A resident
    #[must_use]
    pub const fn resident(id: UserId) -> Self {
        Self {
            id,
            role: Role::Resident,
        }
    }

    /// An administrator (síndico)
    #[must_use]
    pub const fn administrator(id: UserId) -> Self {
        Self {
            id,
            role: Role::Administrator,
        }
    }

    /// Whether the actor holds administrative authority
    #[must_use]
    pub const fn is_administrator(&self) -> bool {
        matches!(self.role, Role::Administrator)
    }
}

// ============================================================================
// Areas
// ============================================================================

/// Common area that residents can book
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    /// Area identifier
    pub id: AreaId,
    /// Owning condominium
    pub condominium_id: CondominiumId,
    /// Display name ("Piscina", "Churrasqueira")
    pub name: String,
    /// Maximum number of people
    pub capacity: u32,
    /// Booking price
    pub price: Money,
    /// Bookings skip the approval step when set
    pub auto_confirm: bool,
    /// Hours during which the area can be booked, when restricted
    pub operating_hours: Option<TimeWindow>,
}

impl Area {
    /// Create an area without operating-hours restrictions
    #[must_use]
    pub fn new(
        condominium_id: CondominiumId,
        name: impl Into<String>,
        capacity: u32,
        price: Money,
        auto_confirm: bool,
    ) -> Self {
        Self {
            id: AreaId::new(),
            condominium_id,
            name: name.into(),
            capacity,
            price,
            auto_confirm,
            operating_hours: None,
        }
    }

    /// Restrict bookings to `hours`
    #[must_use]
    pub const fn with_operating_hours(mut self, hours: TimeWindow) -> Self {
        self.operating_hours = Some(hours);
        self
    }

    /// Bookable length of one day
    #[must_use]
    pub fn bookable_per_day(&self) -> Duration {
        self.operating_hours
            .as_ref()
            .map_or_else(|| Duration::hours(24), TimeWindow::duration)
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Lifecycle state of a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Waiting for administrator approval
    #[serde(rename = "pendente")]
    Pending,
    /// Approved (or auto-confirmed)
    #[serde(rename = "confirmada")]
    Confirmed,
    /// Cancelled by the requester or rejected by an administrator (terminal)
    #[serde(rename = "cancelada")]
    Cancelled,
    /// Checked in on site (terminal)
    #[serde(rename = "utilizada")]
    Used,
}

impl ReservationStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [Self; 4] = [Self::Pending, Self::Confirmed, Self::Cancelled, Self::Used];

    /// Persisted name of the status
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pendente",
            Self::Confirmed => "confirmada",
            Self::Cancelled => "cancelada",
            Self::Used => "utilizada",
        }
    }

    /// Whether the reservation still occupies its time slot
    #[must_use]
    pub const fn blocks_slot(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Pending or confirmed: the booking has not happened yet
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// No transition leaves this status
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Used)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("reservation status", s))
    }
}

/// Transitions a caller can request on a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// pendente → confirmada
    Approve,
    /// pendente/confirmada → cancelada
    Cancel,
    /// confirmada → utilizada
    CheckIn,
    /// attach an evaluation to a utilizada reservation
    Evaluate,
    /// attach a manager response to an evaluation
    Respond,
}

impl Transition {
    /// Status the reservation ends in, for transitions that change it
    #[must_use]
    pub const fn target(&self) -> Option<ReservationStatus> {
        match self {
            Self::Approve => Some(ReservationStatus::Confirmed),
            Self::Cancel => Some(ReservationStatus::Cancelled),
            Self::CheckIn => Some(ReservationStatus::Used),
            Self::Evaluate | Self::Respond => None,
        }
    }

    /// Wire name of the transition
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Cancel => "cancel",
            Self::CheckIn => "check-in",
            Self::Evaluate => "evaluate",
            Self::Respond => "respond",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target() {
            Some(target) => write!(f, "{} (to {target})", self.as_str()),
            None => f.write_str(self.as_str()),
        }
    }
}

/// A booking of an area for a time window on one day
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier
    pub id: ReservationId,
    /// Human-readable booking reference
    pub protocol: Protocol,
    /// Booked area
    pub area_id: AreaId,
    /// Resident who booked
    pub requester_id: UserId,
    /// Condominium of the area
    pub condominium_id: CondominiumId,
    /// Calendar day of the booking
    pub date: NaiveDate,
    /// Booked hours
    pub window: TimeWindow,
    /// Lifecycle state
    pub status: ReservationStatus,
    /// Area price at admission time
    pub price: Money,
    /// When the reservation was admitted
    pub created_at: DateTime<Utc>,
    /// Administrator approval, if any
    pub approved: Option<Stamp>,
    /// Cancellation, if any
    pub cancelled: Option<Cancellation>,
    /// Check-in, if any
    pub checked_in: Option<Stamp>,
}

impl Reservation {
    /// Whether this reservation and `window` compete for the same slot
    #[must_use]
    pub fn conflicts_with(&self, window: &TimeWindow) -> bool {
        self.status.blocks_slot() && self.window.overlaps(window)
    }
}

/// Who did something, and when
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Acting user
    pub by: UserId,
    /// Moment of the action
    pub at: DateTime<Utc>,
}

/// Cancellation record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    /// Acting user
    pub by: UserId,
    /// Moment of the cancellation
    pub at: DateTime<Utc>,
    /// Free-text reason (rejection motive when an administrator denies)
    pub reason: Option<String>,
}

/// Booking request for [`crate::ReservationManager::admit`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Area to book
    pub area_id: AreaId,
    /// Day to book
    pub date: NaiveDate,
    /// Start time (inclusive)
    pub start: NaiveTime,
    /// End time (exclusive)
    pub end: NaiveTime,
    /// Resident booking the area
    pub requester_id: UserId,
    /// Condominium of the resident
    pub condominium_id: CondominiumId,
}

/// Reservation transitions exposed through [`crate::ReservationManager::transition`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransitionAction {
    /// Administrator approval
    Approve,
    /// Cancellation by the requester, or rejection by an administrator
    Cancel {
        /// Optional motive
        reason: Option<String>,
    },
    /// On-site check-in
    CheckIn,
}

impl TransitionAction {
    /// The transition this action requests
    #[must_use]
    pub const fn transition(&self) -> Transition {
        match self {
            Self::Approve => Transition::Approve,
            Self::Cancel { .. } => Transition::Cancel,
            Self::CheckIn => Transition::CheckIn,
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Administrative override placed on a key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyHold {
    /// The key is lost
    #[serde(rename = "perdida")]
    Lost,
    /// The key (or its lock) is under maintenance
    #[serde(rename = "manutencao")]
    Maintenance,
}

impl KeyHold {
    /// Persisted name of the hold
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lost => "perdida",
            Self::Maintenance => "manutencao",
        }
    }
}

impl FromStr for KeyHold {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "perdida" => Ok(Self::Lost),
            "manutencao" => Ok(Self::Maintenance),
            other => Err(ParseEnumError::new("key hold", other)),
        }
    }
}

/// Observable status of a key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    /// On the hook, can be checked out
    #[serde(rename = "disponivel")]
    Available,
    /// Checked out and not yet returned
    #[serde(rename = "em_uso")]
    InUse,
    /// Marked lost by an administrator
    #[serde(rename = "perdida")]
    Lost,
    /// Under maintenance
    #[serde(rename = "manutencao")]
    Maintenance,
}

impl KeyStatus {
    /// Persisted name of the status
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "disponivel",
            Self::InUse => "em_uso",
            Self::Lost => "perdida",
            Self::Maintenance => "manutencao",
        }
    }
}

impl From<KeyHold> for KeyStatus {
    fn from(hold: KeyHold) -> Self {
        match hold {
            KeyHold::Lost => Self::Lost,
            KeyHold::Maintenance => Self::Maintenance,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key custody transitions, used in rejections
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTransition {
    /// retirada
    CheckOut,
    /// devolução
    Return,
    /// administrative override
    Hold,
    /// administrative reset to disponivel
    Reset,
}

impl fmt::Display for KeyTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CheckOut => "retirada",
            Self::Return => "devolucao",
            Self::Hold => "administrative hold",
            Self::Reset => "administrative reset",
        })
    }
}

/// Physical key of an area
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAsset {
    /// Key identifier
    pub id: KeyId,
    /// Area the key opens
    pub area_id: AreaId,
    /// Label on the key ring ("K1", "Salão - cópia 2")
    pub label: String,
    /// Administrative override, if any
    pub hold: Option<KeyHold>,
    /// Incremented by storage on every committed write
    pub version: u64,
}

impl KeyAsset {
    /// A new key, on the hook, never moved
    #[must_use]
    pub fn new(area_id: AreaId, label: impl Into<String>) -> Self {
        Self {
            id: KeyId::new(),
            area_id,
            label: label.into(),
            hold: None,
            version: 0,
        }
    }
}

/// Direction of a key movement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementKind {
    /// Key handed out
    #[serde(rename = "retirada")]
    CheckOut,
    /// Key handed back
    #[serde(rename = "devolucao")]
    Return,
}

impl MovementKind {
    /// Persisted name of the movement kind
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CheckOut => "retirada",
            Self::Return => "devolucao",
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retirada" => Ok(Self::CheckOut),
            "devolucao" => Ok(Self::Return),
            other => Err(ParseEnumError::new("movement kind", other)),
        }
    }
}

/// Append-only log entry of the key custody trail
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMovement {
    /// Movement identifier
    pub id: MovementId,
    /// Key that moved
    pub key_id: KeyId,
    /// Checkout or return
    pub kind: MovementKind,
    /// Booking the checkout serves, if any
    pub reservation_id: Option<ReservationId>,
    /// Who recorded the movement (doorkeeper, administrator)
    pub actor_id: UserId,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
    /// Free-text notes ("returned with the padlock")
    pub notes: Option<String>,
}

// ============================================================================
// Evaluations
// ============================================================================

/// Star rating, 1 to 5
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    /// Lowest rating
    pub const MIN: u8 = 1;
    /// Highest rating
    pub const MAX: u8 = 5;

    /// Validate a rating given for `field`.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InvalidRating`] outside `1..=5`.
    pub fn new(field: &str, value: u8) -> Result<Self, Rejection> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Rejection::InvalidRating {
                field: field.to_string(),
                value,
            })
        }
    }

    /// Numeric value
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = Rejection;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new("rating", value)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// Evaluation as submitted by the resident, before validation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationPayload {
    /// Overall rating (required, 1..=5)
    pub overall: u8,
    /// Cleanliness rating
    pub cleanliness: Option<u8>,
    /// Upkeep rating
    pub upkeep: Option<u8>,
    /// Service rating
    pub service: Option<u8>,
    /// Free-text comment
    pub comment: Option<String>,
    /// Would recommend the area
    pub recommend: bool,
    /// A problem was found during the visit
    pub problem_reported: bool,
    /// Description of the problem (required when one is reported)
    pub problem_description: Option<String>,
    /// Visible to other residents
    pub public: bool,
}

/// Administrator answer attached to an evaluation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerResponse {
    /// Response text
    pub text: String,
    /// Responding administrator
    pub responded_by: UserId,
    /// When it was written
    pub responded_at: DateTime<Utc>,
}

/// Post-visit review of a reservation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Evaluation identifier
    pub id: EvaluationId,
    /// Reviewed reservation (one evaluation per reservation)
    pub reservation_id: ReservationId,
    /// Resident who wrote it
    pub requester_id: UserId,
    /// Reviewed area
    pub area_id: AreaId,
    /// Overall rating
    pub overall: Rating,
    /// Cleanliness rating
    pub cleanliness: Option<Rating>,
    /// Upkeep rating
    pub upkeep: Option<Rating>,
    /// Service rating
    pub service: Option<Rating>,
    /// Free-text comment
    pub comment: Option<String>,
    /// Would recommend the area
    pub recommend: bool,
    /// A problem was found during the visit
    pub problem_reported: bool,
    /// Description of the problem
    pub problem_description: Option<String>,
    /// Visible to other residents
    pub public: bool,
    /// Administrator answer
    pub response: Option<ManagerResponse>,
    /// When it was submitted
    pub created_at: DateTime<Utc>,
}

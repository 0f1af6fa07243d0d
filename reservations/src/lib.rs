//! # Condo Reservations
//!
//! Amenity reservation engine for condominiums: admission of bookings
//! without overlaps, the reservation lifecycle (pendente, confirmada,
//! cancelada, utilizada), key custody for the areas that have physical keys,
//! and post-use evaluations.
//!
//! ## Architecture
//!
//! - **Reducers** (`aggregates`): pure business rules, tested without I/O
//! - **Manager** (`manager`): locks, loads, reduces, persists and notifies
//! - **Storage** (`storage`): traits with in-memory and Postgres backends,
//!   each enforcing the no-overlap and version guards on write
//! - **Reports** (`reports`): listings, usage reports and rating summaries
//!
//! ## Example
//!
//! ```ignore
//! use condo_reservations::{InMemoryStorage, ReservationManager, ServiceConfig};
//!
//! let storage = Arc::new(InMemoryStorage::new());
//! let manager = ReservationManager::new(storage, ServiceConfig::default())?;
//! let reservation = manager.admit(request).await?;
//! println!("protocol {}", reservation.protocol);
//! ```

pub mod aggregates;
pub mod config;
pub mod error;
pub mod manager;
pub mod notifications;
pub mod protocol;
pub mod reports;
pub mod storage;
pub mod types;

pub use config::{Config, ConfigError, ServiceConfig};
pub use error::{Entity, Rejection, RejectionKind, ServiceError, StorageError};
pub use manager::{ManagerBuilder, ReservationManager};
pub use notifications::{LogNotifier, Notification, Notifier, Recipient, RecordingNotifier};
pub use protocol::{Protocol, ProtocolGenerator, RandomProtocols, ScriptedProtocols};
pub use reports::{AreaReport, Period, PublicEvaluations, RatingSummary, ReservationFilter};
pub use storage::{InMemoryStorage, KeyStorage, ReservationStorage};
pub use types::{
    Actor, AdmissionRequest, Area, AreaId, CondominiumId, Evaluation, EvaluationPayload, KeyAsset,
    KeyHold, KeyId, KeyMovement, KeyStatus, Money, MovementKind, Reservation, ReservationId,
    ReservationStatus, Role, TimeWindow, TransitionAction, UserId,
};

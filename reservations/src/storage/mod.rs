//! Storage traits.
//!
//! Backends hold the last line of defence for the rules that must survive
//! concurrent writers, even ones that bypass the manager's locks:
//!
//! - `insert_reservation` refuses an interval overlapping a non-cancelled
//!   reservation of the same area and day, and a duplicate protocol
//! - `update_reservation` only writes when the stored status is still the
//!   one the caller read
//! - `insert_evaluation` refuses a second evaluation for a reservation
//! - `commit_key` only writes when the key version is still the one read
//!
//! These traits use explicit `Pin<Box<dyn Future>>` returns so that the
//! manager can hold them as `Arc<dyn ReservationStorage>`.

use crate::error::StorageError;
use crate::protocol::Protocol;
use crate::reports::ReservationFilter;
use crate::types::{
    Area, AreaId, Evaluation, KeyAsset, KeyId, KeyMovement, Reservation, ReservationId,
    ReservationStatus,
};
use chrono::NaiveDate;
use std::future::Future;
use std::pin::Pin;

pub mod memory;

pub use memory::InMemoryStorage;

/// Boxed future returned by storage operations
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Areas, reservations and evaluations
pub trait ReservationStorage: Send + Sync {
    /// Area by ID
    fn area(&self, area_id: AreaId) -> StorageFuture<'_, Option<Area>>;

    /// Every area, by name
    fn areas(&self) -> StorageFuture<'_, Vec<Area>>;

    /// Every reservation of an area on a day, in any status
    fn reservations_on(&self, area_id: AreaId, date: NaiveDate) -> StorageFuture<'_, Vec<Reservation>>;

    /// Reservation by ID
    fn reservation(&self, id: ReservationId) -> StorageFuture<'_, Option<Reservation>>;

    /// Reservation by protocol
    fn reservation_by_protocol<'a>(
        &'a self,
        protocol: &'a Protocol,
    ) -> StorageFuture<'a, Option<Reservation>>;

    /// Whether any reservation carries `protocol`
    fn protocol_exists<'a>(&'a self, protocol: &'a Protocol) -> StorageFuture<'a, bool>;

    /// Reservations matching `filter`, ordered by date then start time
    fn query_reservations<'a>(
        &'a self,
        filter: &'a ReservationFilter,
    ) -> StorageFuture<'a, Vec<Reservation>>;

    /// Store a new reservation.
    ///
    /// Fails with [`StorageError::SlotTaken`] when a non-cancelled
    /// reservation of the same area and day overlaps it, and with
    /// [`StorageError::DuplicateProtocol`] when its protocol is in use.
    fn insert_reservation<'a>(&'a self, reservation: &'a Reservation) -> StorageFuture<'a, ()>;

    /// Overwrite the lifecycle fields (status and stamps) of a reservation.
    ///
    /// Fails with [`StorageError::StaleReservation`] unless the stored status
    /// equals `expected`.
    fn update_reservation<'a>(
        &'a self,
        reservation: &'a Reservation,
        expected: ReservationStatus,
    ) -> StorageFuture<'a, ()>;

    /// Evaluations of the given reservations
    fn evaluations_for<'a>(&'a self, ids: &'a [ReservationId]) -> StorageFuture<'a, Vec<Evaluation>>;

    /// Evaluations of an area, newest first; public ones only when `public_only`
    fn area_evaluations(&self, area_id: AreaId, public_only: bool) -> StorageFuture<'_, Vec<Evaluation>>;

    /// Store a new evaluation.
    ///
    /// Fails with [`StorageError::DuplicateEvaluation`] when the reservation
    /// already has one.
    fn insert_evaluation<'a>(&'a self, evaluation: &'a Evaluation) -> StorageFuture<'a, ()>;

    /// Overwrite the manager response of an evaluation
    fn update_evaluation<'a>(&'a self, evaluation: &'a Evaluation) -> StorageFuture<'a, ()>;
}

/// Keys and their movement logs
pub trait KeyStorage: Send + Sync {
    /// Key by ID
    fn key(&self, key_id: KeyId) -> StorageFuture<'_, Option<KeyAsset>>;

    /// Keys of an area
    fn keys_of(&self, area_id: AreaId) -> StorageFuture<'_, Vec<KeyAsset>>;

    /// Movements of a key, oldest first
    fn movements(&self, key_id: KeyId) -> StorageFuture<'_, Vec<KeyMovement>>;

    /// Append `movements` and write the key's hold in one step.
    ///
    /// Fails with [`StorageError::VersionConflict`] unless the stored version
    /// equals `key.version`. Returns the new version.
    fn commit_key<'a>(
        &'a self,
        key: &'a KeyAsset,
        movements: &'a [KeyMovement],
    ) -> StorageFuture<'a, u64>;
}

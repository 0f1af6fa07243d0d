//! In-memory storage.
//!
//! Every operation runs under one lock, so each storage guard is checked and
//! applied atomically. Used by tests and the demo binary.

use super::{KeyStorage, ReservationStorage, StorageFuture};
use crate::error::{Entity, StorageError};
use crate::protocol::Protocol;
use crate::reports::{ReservationFilter, sort_for_listing};
use crate::types::{
    Area, AreaId, Evaluation, KeyAsset, KeyId, KeyMovement, Reservation, ReservationId,
    ReservationStatus,
};
use chrono::NaiveDate;
use futures::future::ready;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Inner {
    areas: HashMap<AreaId, Area>,
    reservations: HashMap<ReservationId, Reservation>,
    evaluations: HashMap<ReservationId, Evaluation>,
    keys: HashMap<KeyId, KeyAsset>,
    movements: HashMap<KeyId, Vec<KeyMovement>>,
}

/// Storage backed by hash maps
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    /// Empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an area
    pub fn add_area(&self, area: Area) {
        self.write().areas.insert(area.id, area);
    }

    /// Register or replace a key
    pub fn add_key(&self, key: KeyAsset) {
        self.write().keys.insert(key.id, key);
    }

    /// Number of stored reservations, in any status
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.read().reservations.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), StorageError> {
        if let Some(existing) = self.reservations.values().find(|r| {
            r.id != reservation.id
                && r.area_id == reservation.area_id
                && r.date == reservation.date
                && reservation.status.blocks_slot()
                && r.conflicts_with(&reservation.window)
        }) {
            return Err(StorageError::SlotTaken {
                protocol: existing.protocol.clone(),
            });
        }
        if self
            .reservations
            .values()
            .any(|r| r.protocol == reservation.protocol)
        {
            return Err(StorageError::DuplicateProtocol(reservation.protocol.clone()));
        }
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    fn update_reservation(
        &mut self,
        reservation: &Reservation,
        expected: ReservationStatus,
    ) -> Result<(), StorageError> {
        let stored = self
            .reservations
            .get_mut(&reservation.id)
            .ok_or_else(|| StorageError::Missing {
                entity: Entity::Reservation,
                id: reservation.id.to_string(),
            })?;
        if stored.status != expected {
            return Err(StorageError::StaleReservation {
                reservation_id: reservation.id,
                expected,
            });
        }
        stored.status = reservation.status;
        stored.approved.clone_from(&reservation.approved);
        stored.cancelled.clone_from(&reservation.cancelled);
        stored.checked_in.clone_from(&reservation.checked_in);
        Ok(())
    }

    fn commit_key(&mut self, key: &KeyAsset, movements: &[KeyMovement]) -> Result<u64, StorageError> {
        let stored = self.keys.get_mut(&key.id).ok_or_else(|| StorageError::Missing {
            entity: Entity::Key,
            id: key.id.to_string(),
        })?;
        if stored.version != key.version {
            return Err(StorageError::VersionConflict {
                key_id: key.id,
                expected: key.version,
                actual: stored.version,
            });
        }
        stored.hold = key.hold;
        stored.version += 1;
        let version = stored.version;
        self.movements
            .entry(key.id)
            .or_default()
            .extend_from_slice(movements);
        Ok(version)
    }
}

impl ReservationStorage for InMemoryStorage {
    fn area(&self, area_id: AreaId) -> StorageFuture<'_, Option<Area>> {
        let area = self.read().areas.get(&area_id).cloned();
        Box::pin(ready(Ok(area)))
    }

    fn areas(&self) -> StorageFuture<'_, Vec<Area>> {
        let mut areas: Vec<_> = self.read().areas.values().cloned().collect();
        areas.sort_by(|a, b| a.name.cmp(&b.name));
        Box::pin(ready(Ok(areas)))
    }

    fn reservations_on(&self, area_id: AreaId, date: NaiveDate) -> StorageFuture<'_, Vec<Reservation>> {
        let filter = ReservationFilter::new().area(area_id).between(date, date);
        self.query_owned(&filter)
    }

    fn reservation(&self, id: ReservationId) -> StorageFuture<'_, Option<Reservation>> {
        let reservation = self.read().reservations.get(&id).cloned();
        Box::pin(ready(Ok(reservation)))
    }

    fn reservation_by_protocol<'a>(
        &'a self,
        protocol: &'a Protocol,
    ) -> StorageFuture<'a, Option<Reservation>> {
        let reservation = self
            .read()
            .reservations
            .values()
            .find(|r| r.protocol == *protocol)
            .cloned();
        Box::pin(ready(Ok(reservation)))
    }

    fn protocol_exists<'a>(&'a self, protocol: &'a Protocol) -> StorageFuture<'a, bool> {
        let exists = self
            .read()
            .reservations
            .values()
            .any(|r| r.protocol == *protocol);
        Box::pin(ready(Ok(exists)))
    }

    fn query_reservations<'a>(
        &'a self,
        filter: &'a ReservationFilter,
    ) -> StorageFuture<'a, Vec<Reservation>> {
        self.query_owned(filter)
    }

    fn insert_reservation<'a>(&'a self, reservation: &'a Reservation) -> StorageFuture<'a, ()> {
        let result = self.write().insert_reservation(reservation);
        Box::pin(ready(result))
    }

    fn update_reservation<'a>(
        &'a self,
        reservation: &'a Reservation,
        expected: ReservationStatus,
    ) -> StorageFuture<'a, ()> {
        let result = self.write().update_reservation(reservation, expected);
        Box::pin(ready(result))
    }

    fn evaluations_for<'a>(&'a self, ids: &'a [ReservationId]) -> StorageFuture<'a, Vec<Evaluation>> {
        let inner = self.read();
        let evaluations: Vec<_> = ids
            .iter()
            .filter_map(|id| inner.evaluations.get(id).cloned())
            .collect();
        drop(inner);
        Box::pin(ready(Ok(evaluations)))
    }

    fn area_evaluations(&self, area_id: AreaId, public_only: bool) -> StorageFuture<'_, Vec<Evaluation>> {
        let mut evaluations: Vec<_> = self
            .read()
            .evaluations
            .values()
            .filter(|e| e.area_id == area_id && (e.public || !public_only))
            .cloned()
            .collect();
        evaluations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Box::pin(ready(Ok(evaluations)))
    }

    fn insert_evaluation<'a>(&'a self, evaluation: &'a Evaluation) -> StorageFuture<'a, ()> {
        let mut inner = self.write();
        let result = if inner.evaluations.contains_key(&evaluation.reservation_id) {
            Err(StorageError::DuplicateEvaluation(evaluation.reservation_id))
        } else {
            inner
                .evaluations
                .insert(evaluation.reservation_id, evaluation.clone());
            Ok(())
        };
        drop(inner);
        Box::pin(ready(result))
    }

    fn update_evaluation<'a>(&'a self, evaluation: &'a Evaluation) -> StorageFuture<'a, ()> {
        let result = match self.write().evaluations.get_mut(&evaluation.reservation_id) {
            Some(stored) => {
                stored.response.clone_from(&evaluation.response);
                Ok(())
            },
            None => Err(StorageError::Missing {
                entity: Entity::Evaluation,
                id: evaluation.reservation_id.to_string(),
            }),
        };
        Box::pin(ready(result))
    }
}

impl InMemoryStorage {
    fn query_owned(&self, filter: &ReservationFilter) -> StorageFuture<'_, Vec<Reservation>> {
        let mut reservations: Vec<_> = self
            .read()
            .reservations
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_for_listing(&mut reservations);
        Box::pin(ready(Ok(reservations)))
    }
}

impl KeyStorage for InMemoryStorage {
    fn key(&self, key_id: KeyId) -> StorageFuture<'_, Option<KeyAsset>> {
        let key = self.read().keys.get(&key_id).cloned();
        Box::pin(ready(Ok(key)))
    }

    fn keys_of(&self, area_id: AreaId) -> StorageFuture<'_, Vec<KeyAsset>> {
        let mut keys: Vec<_> = self
            .read()
            .keys
            .values()
            .filter(|k| k.area_id == area_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.label.cmp(&b.label));
        Box::pin(ready(Ok(keys)))
    }

    fn movements(&self, key_id: KeyId) -> StorageFuture<'_, Vec<KeyMovement>> {
        let movements = self.read().movements.get(&key_id).cloned().unwrap_or_default();
        Box::pin(ready(Ok(movements)))
    }

    fn commit_key<'a>(
        &'a self,
        key: &'a KeyAsset,
        movements: &'a [KeyMovement],
    ) -> StorageFuture<'a, u64> {
        let result = self.write().commit_key(key, movements);
        Box::pin(ready(result))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CondominiumId, Money, TimeWindow, UserId};
    use chrono::{NaiveTime, Utc};

    fn at(hour: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap()
    }

    fn reservation(area: &Area, code: &str, start: u32, end: u32) -> Reservation {
        Reservation {
            id: ReservationId::new(),
            protocol: Protocol::parse(code).unwrap(),
            area_id: area.id,
            requester_id: UserId::new(),
            condominium_id: area.condominium_id,
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            window: TimeWindow::new(at(start), at(end)).unwrap(),
            status: ReservationStatus::Pending,
            price: area.price,
            created_at: Utc::now(),
            approved: None,
            cancelled: None,
            checked_in: None,
        }
    }

    fn pool() -> Area {
        Area::new(CondominiumId::new(), "Piscina", 20, Money::ZERO, false)
    }

    #[tokio::test]
    async fn insert_guards_overlap_and_protocol() {
        let storage = InMemoryStorage::new();
        let area = pool();
        storage.add_area(area.clone());

        let first = reservation(&area, "AAAAAA", 10, 12);
        storage.insert_reservation(&first).await.unwrap();

        let overlapping = reservation(&area, "BBBBBB", 11, 13);
        assert!(matches!(
            storage.insert_reservation(&overlapping).await,
            Err(StorageError::SlotTaken { protocol }) if protocol.as_str() == "AAAAAA"
        ));

        let same_protocol = reservation(&area, "AAAAAA", 14, 15);
        assert!(matches!(
            storage.insert_reservation(&same_protocol).await,
            Err(StorageError::DuplicateProtocol(_))
        ));

        let adjacent = reservation(&area, "CCCCCC", 12, 14);
        storage.insert_reservation(&adjacent).await.unwrap();
        assert_eq!(storage.reservation_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_reservations_do_not_block() {
        let storage = InMemoryStorage::new();
        let area = pool();
        let mut first = reservation(&area, "AAAAAA", 10, 12);
        storage.insert_reservation(&first).await.unwrap();

        first.status = ReservationStatus::Cancelled;
        storage
            .update_reservation(&first, ReservationStatus::Pending)
            .await
            .unwrap();

        let again = reservation(&area, "BBBBBB", 10, 12);
        storage.insert_reservation(&again).await.unwrap();
    }

    #[tokio::test]
    async fn stale_update_rejected() {
        let storage = InMemoryStorage::new();
        let area = pool();
        let mut r = reservation(&area, "AAAAAA", 10, 12);
        storage.insert_reservation(&r).await.unwrap();

        r.status = ReservationStatus::Confirmed;
        storage
            .update_reservation(&r, ReservationStatus::Pending)
            .await
            .unwrap();

        r.status = ReservationStatus::Cancelled;
        assert!(matches!(
            storage.update_reservation(&r, ReservationStatus::Pending).await,
            Err(StorageError::StaleReservation { .. })
        ));
        let stored = storage.reservation(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Confirmed);
    }

    #[tokio::test]
    async fn key_commit_checks_version() {
        let storage = InMemoryStorage::new();
        let key = KeyAsset::new(AreaId::new(), "K1");
        storage.add_key(key.clone());

        assert_eq!(storage.commit_key(&key, &[]).await.unwrap(), 1);
        assert!(matches!(
            storage.commit_key(&key, &[]).await,
            Err(StorageError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));
    }
}

//! `PostgreSQL` storage for the condominium reservation engine.
//!
//! Implements [`ReservationStorage`] and [`KeyStorage`] on top of sqlx. The
//! storage guards are database constraints rather than application checks:
//!
//! - `reservations_no_overlap`: exclusion constraint over
//!   `(area_id, date, [start, end))` for non-cancelled rows
//! - `reservations_protocol_key`, `evaluations_reservation_key`: uniqueness
//! - conditional `UPDATE ... WHERE status = $expected` for transitions
//! - `keys.version` compare-and-set for key custody commits
//!
//! # Example
//!
//! ```ignore
//! use condo_postgres::{PostgresConfig, PostgresStorage};
//!
//! let storage = PostgresStorage::connect(&PostgresConfig::from_env()).await?;
//! storage.migrate().await?;
//! let manager = ReservationManager::new(Arc::new(storage), ServiceConfig::default())?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod rows;

pub use config::PostgresConfig;

use chrono::NaiveDate;
use condo_reservations::reports::ReservationFilter;
use condo_reservations::storage::{KeyStorage, ReservationStorage, StorageFuture};
use condo_reservations::{
    Area, AreaId, Entity, Evaluation, KeyAsset, KeyId, KeyMovement, Protocol, Reservation,
    ReservationId, ReservationStatus, StorageError,
};
use rows::{
    EVALUATION_COLUMNS, RESERVATION_COLUMNS, area_from_row, backend, cents, evaluation_from_row,
    key_from_row, movement_from_row, rating_value, reservation_from_row, version,
    violated_constraint,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

const NO_OVERLAP: &str = "reservations_no_overlap";
const PROTOCOL_KEY: &str = "reservations_protocol_key";
const EVALUATION_KEY: &str = "evaluations_reservation_key";

/// `PostgreSQL`-backed storage.
#[derive(Clone, Debug)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect using `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the pool cannot be created.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await
            .map_err(backend)?;
        tracing::info!(max_connections = config.max_connections, "postgres pool ready");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("migration failed: {e}")))
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register an area.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the insert fails.
    pub async fn insert_area(&self, area: &Area) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO areas (id, condominium_id, name, capacity, price_cents, auto_confirm, opens_at, closes_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(*area.id.as_uuid())
        .bind(*area.condominium_id.as_uuid())
        .bind(&area.name)
        .bind(i32::try_from(area.capacity).map_err(rows::corrupt)?)
        .bind(cents(area.price)?)
        .bind(area.auto_confirm)
        .bind(area.operating_hours.map(|h| h.start()))
        .bind(area.operating_hours.map(|h| h.end()))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Register a key, on the hook.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the insert fails.
    pub async fn insert_key(&self, key: &KeyAsset) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO keys (id, area_id, label, hold, version) VALUES ($1, $2, $3, $4, $5)")
            .bind(*key.id.as_uuid())
            .bind(*key.area_id.as_uuid())
            .bind(&key.label)
            .bind(key.hold.map(|h| h.as_str()))
            .bind(version(key.version)?)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn fetch_reservations(
        &self,
        clause: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Reservation>, StorageError> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations {clause}");
        bind(sqlx::query(&sql))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(reservation_from_row)
            .collect()
    }

    /// Protocol of a non-cancelled reservation overlapping `reservation`
    async fn blocking_protocol(&self, reservation: &Reservation) -> Result<Option<Protocol>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            r"
            SELECT protocol FROM reservations
            WHERE area_id = $1 AND date = $2 AND status <> 'cancelada'
              AND start_time < $4 AND $3 < end_time
            ORDER BY start_time
            LIMIT 1
            ",
        )
        .bind(*reservation.area_id.as_uuid())
        .bind(reservation.date)
        .bind(reservation.window.start())
        .bind(reservation.window.end())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|(protocol,)| Protocol::parse(&protocol).map_err(rows::corrupt))
            .transpose()
    }

    #[tracing::instrument(skip(self, reservation), fields(protocol = %reservation.protocol))]
    async fn insert_reservation_row(&self, reservation: &Reservation) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            INSERT INTO reservations (
                id, protocol, area_id, requester_id, condominium_id, date, start_time, end_time,
                status, price_cents, created_at, approved_by, approved_at, cancelled_by,
                cancelled_at, cancellation_reason, checked_in_by, checked_in_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ",
        )
        .bind(*reservation.id.as_uuid())
        .bind(reservation.protocol.as_str())
        .bind(*reservation.area_id.as_uuid())
        .bind(*reservation.requester_id.as_uuid())
        .bind(*reservation.condominium_id.as_uuid())
        .bind(reservation.date)
        .bind(reservation.window.start())
        .bind(reservation.window.end())
        .bind(reservation.status.as_str())
        .bind(cents(reservation.price)?)
        .bind(reservation.created_at)
        .bind(reservation.approved.as_ref().map(|s| *s.by.as_uuid()))
        .bind(reservation.approved.as_ref().map(|s| s.at))
        .bind(reservation.cancelled.as_ref().map(|c| *c.by.as_uuid()))
        .bind(reservation.cancelled.as_ref().map(|c| c.at))
        .bind(reservation.cancelled.as_ref().and_then(|c| c.reason.clone()))
        .bind(reservation.checked_in.as_ref().map(|s| *s.by.as_uuid()))
        .bind(reservation.checked_in.as_ref().map(|s| s.at))
        .execute(&self.pool)
        .await;

        let Err(error) = result else {
            return Ok(());
        };
        match violated_constraint(&error).as_deref() {
            Some(NO_OVERLAP) => {
                tracing::warn!("exclusion constraint refused overlapping reservation");
                let protocol = self
                    .blocking_protocol(reservation)
                    .await?
                    .unwrap_or_else(|| reservation.protocol.clone());
                Err(StorageError::SlotTaken { protocol })
            },
            Some(PROTOCOL_KEY) => Err(StorageError::DuplicateProtocol(reservation.protocol.clone())),
            _ => Err(backend(error)),
        }
    }

    #[tracing::instrument(skip(self, reservation), fields(protocol = %reservation.protocol, status = %reservation.status))]
    async fn update_reservation_row(
        &self,
        reservation: &Reservation,
        expected: ReservationStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE reservations SET
                status = $2,
                approved_by = $3, approved_at = $4,
                cancelled_by = $5, cancelled_at = $6, cancellation_reason = $7,
                checked_in_by = $8, checked_in_at = $9
            WHERE id = $1 AND status = $10
            ",
        )
        .bind(*reservation.id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(reservation.approved.as_ref().map(|s| *s.by.as_uuid()))
        .bind(reservation.approved.as_ref().map(|s| s.at))
        .bind(reservation.cancelled.as_ref().map(|c| *c.by.as_uuid()))
        .bind(reservation.cancelled.as_ref().map(|c| c.at))
        .bind(reservation.cancelled.as_ref().and_then(|c| c.reason.clone()))
        .bind(reservation.checked_in.as_ref().map(|s| *s.by.as_uuid()))
        .bind(reservation.checked_in.as_ref().map(|s| s.at))
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM reservations WHERE id = $1)")
            .bind(*reservation.id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        if exists {
            Err(StorageError::StaleReservation {
                reservation_id: reservation.id,
                expected,
            })
        } else {
            Err(StorageError::Missing {
                entity: Entity::Reservation,
                id: reservation.id.to_string(),
            })
        }
    }

    async fn fetch_evaluations(
        &self,
        clause: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Evaluation>, StorageError> {
        let sql = format!("SELECT {EVALUATION_COLUMNS} FROM evaluations {clause}");
        bind(sqlx::query(&sql))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(evaluation_from_row)
            .collect()
    }

    #[tracing::instrument(skip(self, evaluation), fields(reservation_id = %evaluation.reservation_id))]
    async fn insert_evaluation_row(&self, evaluation: &Evaluation) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            INSERT INTO evaluations (
                id, reservation_id, requester_id, area_id, overall, cleanliness, upkeep, service,
                comment, recommend, problem_reported, problem_description, public,
                response_text, responded_by, responded_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(*evaluation.id.as_uuid())
        .bind(*evaluation.reservation_id.as_uuid())
        .bind(*evaluation.requester_id.as_uuid())
        .bind(*evaluation.area_id.as_uuid())
        .bind(i16::from(evaluation.overall.value()))
        .bind(rating_value(evaluation.cleanliness))
        .bind(rating_value(evaluation.upkeep))
        .bind(rating_value(evaluation.service))
        .bind(evaluation.comment.as_deref())
        .bind(evaluation.recommend)
        .bind(evaluation.problem_reported)
        .bind(evaluation.problem_description.as_deref())
        .bind(evaluation.public)
        .bind(evaluation.response.as_ref().map(|r| r.text.clone()))
        .bind(evaluation.response.as_ref().map(|r| *r.responded_by.as_uuid()))
        .bind(evaluation.response.as_ref().map(|r| r.responded_at))
        .bind(evaluation.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if violated_constraint(&error).as_deref() == Some(EVALUATION_KEY) => {
                Err(StorageError::DuplicateEvaluation(evaluation.reservation_id))
            },
            Err(error) => Err(backend(error)),
        }
    }

    async fn update_evaluation_row(&self, evaluation: &Evaluation) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE evaluations SET response_text = $2, responded_by = $3, responded_at = $4 WHERE id = $1",
        )
        .bind(*evaluation.id.as_uuid())
        .bind(evaluation.response.as_ref().map(|r| r.text.clone()))
        .bind(evaluation.response.as_ref().map(|r| *r.responded_by.as_uuid()))
        .bind(evaluation.response.as_ref().map(|r| r.responded_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Missing {
                entity: Entity::Evaluation,
                id: evaluation.id.to_string(),
            });
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, key, movements), fields(key = %key.label, version = key.version, movements = movements.len()))]
    async fn commit_key_rows(&self, key: &KeyAsset, movements: &[KeyMovement]) -> Result<u64, StorageError> {
        let expected = version(key.version)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let committed: Option<i64> = sqlx::query_scalar(
            "UPDATE keys SET hold = $2, version = version + 1 WHERE id = $1 AND version = $3 RETURNING version",
        )
        .bind(*key.id.as_uuid())
        .bind(key.hold.map(|h| h.as_str()))
        .bind(expected)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(committed) = committed else {
            drop(tx);
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM keys WHERE id = $1")
                .bind(*key.id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            return Err(match actual {
                Some(actual) => StorageError::VersionConflict {
                    key_id: key.id,
                    expected: key.version,
                    actual: u64::try_from(actual).map_err(rows::corrupt)?,
                },
                None => StorageError::Missing {
                    entity: Entity::Key,
                    id: key.id.to_string(),
                },
            });
        };

        for movement in movements {
            sqlx::query(
                r"
                INSERT INTO key_movements (id, key_id, kind, reservation_id, actor_id, recorded_at, notes)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(*movement.id.as_uuid())
            .bind(*movement.key_id.as_uuid())
            .bind(movement.kind.as_str())
            .bind(movement.reservation_id.map(|id| *id.as_uuid()))
            .bind(*movement.actor_id.as_uuid())
            .bind(movement.recorded_at)
            .bind(movement.notes.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;
        u64::try_from(committed).map_err(rows::corrupt)
    }
}

impl ReservationStorage for PostgresStorage {
    fn area(&self, area_id: AreaId) -> StorageFuture<'_, Option<Area>> {
        Box::pin(async move {
            sqlx::query("SELECT * FROM areas WHERE id = $1")
                .bind(*area_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?
                .as_ref()
                .map(area_from_row)
                .transpose()
        })
    }

    fn areas(&self) -> StorageFuture<'_, Vec<Area>> {
        Box::pin(async move {
            sqlx::query("SELECT * FROM areas ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?
                .iter()
                .map(area_from_row)
                .collect()
        })
    }

    fn reservations_on(&self, area_id: AreaId, date: NaiveDate) -> StorageFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            self.fetch_reservations("WHERE area_id = $1 AND date = $2 ORDER BY start_time", |q| {
                q.bind(*area_id.as_uuid()).bind(date)
            })
            .await
        })
    }

    fn reservation(&self, id: ReservationId) -> StorageFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            let found = self
                .fetch_reservations("WHERE id = $1", |q| q.bind(*id.as_uuid()))
                .await?;
            Ok(found.into_iter().next())
        })
    }

    fn reservation_by_protocol<'a>(
        &'a self,
        protocol: &'a Protocol,
    ) -> StorageFuture<'a, Option<Reservation>> {
        Box::pin(async move {
            let found = self
                .fetch_reservations("WHERE protocol = $1", |q| q.bind(protocol.as_str().to_string()))
                .await?;
            Ok(found.into_iter().next())
        })
    }

    fn protocol_exists<'a>(&'a self, protocol: &'a Protocol) -> StorageFuture<'a, bool> {
        Box::pin(async move {
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM reservations WHERE protocol = $1)")
                .bind(protocol.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(backend)
        })
    }

    fn query_reservations<'a>(
        &'a self,
        filter: &'a ReservationFilter,
    ) -> StorageFuture<'a, Vec<Reservation>> {
        Box::pin(async move {
            self.fetch_reservations(
                r"
                WHERE ($1::date IS NULL OR date >= $1)
                  AND ($2::date IS NULL OR date <= $2)
                  AND ($3::uuid IS NULL OR area_id = $3)
                  AND ($4::text IS NULL OR status = $4)
                  AND ($5::uuid IS NULL OR requester_id = $5)
                ORDER BY date, start_time, protocol
                ",
                |q| {
                    q.bind(filter.from)
                        .bind(filter.to)
                        .bind(filter.area_id.map(|id| *id.as_uuid()))
                        .bind(filter.status.map(|s| s.as_str()))
                        .bind(filter.requester_id.map(|id| *id.as_uuid()))
                },
            )
            .await
        })
    }

    fn insert_reservation<'a>(&'a self, reservation: &'a Reservation) -> StorageFuture<'a, ()> {
        Box::pin(self.insert_reservation_row(reservation))
    }

    fn update_reservation<'a>(
        &'a self,
        reservation: &'a Reservation,
        expected: ReservationStatus,
    ) -> StorageFuture<'a, ()> {
        Box::pin(self.update_reservation_row(reservation, expected))
    }

    fn evaluations_for<'a>(&'a self, ids: &'a [ReservationId]) -> StorageFuture<'a, Vec<Evaluation>> {
        Box::pin(async move {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
            self.fetch_evaluations("WHERE reservation_id = ANY($1)", |q| q.bind(ids))
                .await
        })
    }

    fn area_evaluations(&self, area_id: AreaId, public_only: bool) -> StorageFuture<'_, Vec<Evaluation>> {
        Box::pin(async move {
            self.fetch_evaluations(
                "WHERE area_id = $1 AND (NOT $2 OR public) ORDER BY created_at DESC",
                |q| q.bind(*area_id.as_uuid()).bind(public_only),
            )
            .await
        })
    }

    fn insert_evaluation<'a>(&'a self, evaluation: &'a Evaluation) -> StorageFuture<'a, ()> {
        Box::pin(self.insert_evaluation_row(evaluation))
    }

    fn update_evaluation<'a>(&'a self, evaluation: &'a Evaluation) -> StorageFuture<'a, ()> {
        Box::pin(self.update_evaluation_row(evaluation))
    }
}

impl KeyStorage for PostgresStorage {
    fn key(&self, key_id: KeyId) -> StorageFuture<'_, Option<KeyAsset>> {
        Box::pin(async move {
            sqlx::query("SELECT id, area_id, label, hold, version FROM keys WHERE id = $1")
                .bind(*key_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?
                .as_ref()
                .map(key_from_row)
                .transpose()
        })
    }

    fn keys_of(&self, area_id: AreaId) -> StorageFuture<'_, Vec<KeyAsset>> {
        Box::pin(async move {
            sqlx::query("SELECT id, area_id, label, hold, version FROM keys WHERE area_id = $1 ORDER BY label")
                .bind(*area_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?
                .iter()
                .map(key_from_row)
                .collect()
        })
    }

    fn movements(&self, key_id: KeyId) -> StorageFuture<'_, Vec<KeyMovement>> {
        Box::pin(async move {
            sqlx::query(
                r"
                SELECT id, key_id, kind, reservation_id, actor_id, recorded_at, notes
                FROM key_movements WHERE key_id = $1 ORDER BY seq
                ",
            )
            .bind(*key_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(movement_from_row)
            .collect()
        })
    }

    fn commit_key<'a>(
        &'a self,
        key: &'a KeyAsset,
        movements: &'a [KeyMovement],
    ) -> StorageFuture<'a, u64> {
        Box::pin(self.commit_key_rows(key, movements))
    }
}

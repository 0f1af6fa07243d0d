//! Row decoding and value conversions.

use chrono::{DateTime, Utc};
use condo_reservations::types::{
    Cancellation, EvaluationId, ManagerResponse, MovementId, Rating, Stamp,
};
use condo_reservations::{
    Area, AreaId, CondominiumId, Evaluation, KeyAsset, KeyId, KeyMovement, Money, Protocol,
    Reservation, ReservationId, StorageError, TimeWindow, UserId,
};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

pub(crate) const RESERVATION_COLUMNS: &str = "id, protocol, area_id, requester_id, condominium_id, date, \
     start_time, end_time, status, price_cents, created_at, approved_by, approved_at, \
     cancelled_by, cancelled_at, cancellation_reason, checked_in_by, checked_in_at";

pub(crate) const EVALUATION_COLUMNS: &str = "id, reservation_id, requester_id, area_id, overall, \
     cleanliness, upkeep, service, comment, recommend, problem_reported, problem_description, \
     public, response_text, responded_by, responded_at, created_at";

pub(crate) fn corrupt(error: impl ToString) -> StorageError {
    StorageError::Corrupt(error.to_string())
}

pub(crate) fn backend(error: sqlx::Error) -> StorageError {
    StorageError::Backend(error.to_string())
}

/// Name of the constraint a database error violated, if any
pub(crate) fn violated_constraint(error: &sqlx::Error) -> Option<String> {
    error
        .as_database_error()
        .and_then(|e| e.constraint())
        .map(str::to_string)
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(corrupt)
}

pub(crate) fn cents(money: Money) -> Result<i64, StorageError> {
    i64::try_from(money.cents()).map_err(corrupt)
}

pub(crate) fn version(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(corrupt)
}

fn stamp(by: Option<Uuid>, at: Option<DateTime<Utc>>) -> Option<Stamp> {
    by.zip(at).map(|(by, at)| Stamp {
        by: UserId::from_uuid(by),
        at,
    })
}

fn rating(field: &str, value: Option<i16>) -> Result<Option<Rating>, StorageError> {
    value
        .map(|v| {
            let v = u8::try_from(v).map_err(corrupt)?;
            Rating::new(field, v).map_err(corrupt)
        })
        .transpose()
}

pub(crate) fn rating_value(rating: Option<Rating>) -> Option<i16> {
    rating.map(|r| i16::from(r.value()))
}

pub(crate) fn area_from_row(row: &PgRow) -> Result<Area, StorageError> {
    let opens_at = get(row, "opens_at")?;
    let closes_at = get(row, "closes_at")?;
    let operating_hours = match (opens_at, closes_at) {
        (Some(open), Some(close)) => Some(TimeWindow::new(open, close).map_err(corrupt)?),
        _ => None,
    };
    let capacity: i32 = get(row, "capacity")?;
    let price: i64 = get(row, "price_cents")?;

    Ok(Area {
        id: AreaId::from_uuid(get(row, "id")?),
        condominium_id: CondominiumId::from_uuid(get(row, "condominium_id")?),
        name: get(row, "name")?,
        capacity: u32::try_from(capacity).map_err(corrupt)?,
        price: Money::from_cents(u64::try_from(price).map_err(corrupt)?),
        auto_confirm: get(row, "auto_confirm")?,
        operating_hours,
    })
}

pub(crate) fn reservation_from_row(row: &PgRow) -> Result<Reservation, StorageError> {
    let protocol: String = get(row, "protocol")?;
    let status: String = get(row, "status")?;
    let price: i64 = get(row, "price_cents")?;
    let cancelled_by: Option<Uuid> = get(row, "cancelled_by")?;
    let cancelled_at: Option<DateTime<Utc>> = get(row, "cancelled_at")?;
    let cancellation_reason: Option<String> = get(row, "cancellation_reason")?;

    Ok(Reservation {
        id: ReservationId::from_uuid(get(row, "id")?),
        protocol: Protocol::parse(&protocol).map_err(corrupt)?,
        area_id: AreaId::from_uuid(get(row, "area_id")?),
        requester_id: UserId::from_uuid(get(row, "requester_id")?),
        condominium_id: CondominiumId::from_uuid(get(row, "condominium_id")?),
        date: get(row, "date")?,
        window: TimeWindow::new(get(row, "start_time")?, get(row, "end_time")?).map_err(corrupt)?,
        status: status.parse().map_err(corrupt)?,
        price: Money::from_cents(u64::try_from(price).map_err(corrupt)?),
        created_at: get(row, "created_at")?,
        approved: stamp(get(row, "approved_by")?, get(row, "approved_at")?),
        cancelled: cancelled_by.zip(cancelled_at).map(|(by, at)| Cancellation {
            by: UserId::from_uuid(by),
            at,
            reason: cancellation_reason,
        }),
        checked_in: stamp(get(row, "checked_in_by")?, get(row, "checked_in_at")?),
    })
}

pub(crate) fn evaluation_from_row(row: &PgRow) -> Result<Evaluation, StorageError> {
    let overall: i16 = get(row, "overall")?;
    let response_text: Option<String> = get(row, "response_text")?;
    let responded_by: Option<Uuid> = get(row, "responded_by")?;
    let responded_at: Option<DateTime<Utc>> = get(row, "responded_at")?;
    let response = match (response_text, responded_by, responded_at) {
        (Some(text), Some(by), Some(at)) => Some(ManagerResponse {
            text,
            responded_by: UserId::from_uuid(by),
            responded_at: at,
        }),
        _ => None,
    };

    Ok(Evaluation {
        id: EvaluationId::from_uuid(get(row, "id")?),
        reservation_id: ReservationId::from_uuid(get(row, "reservation_id")?),
        requester_id: UserId::from_uuid(get(row, "requester_id")?),
        area_id: AreaId::from_uuid(get(row, "area_id")?),
        overall: rating("overall", Some(overall))?.ok_or_else(|| corrupt("missing overall"))?,
        cleanliness: rating("cleanliness", get(row, "cleanliness")?)?,
        upkeep: rating("upkeep", get(row, "upkeep")?)?,
        service: rating("service", get(row, "service")?)?,
        comment: get(row, "comment")?,
        recommend: get(row, "recommend")?,
        problem_reported: get(row, "problem_reported")?,
        problem_description: get(row, "problem_description")?,
        public: get(row, "public")?,
        response,
        created_at: get(row, "created_at")?,
    })
}

pub(crate) fn key_from_row(row: &PgRow) -> Result<KeyAsset, StorageError> {
    let hold: Option<String> = get(row, "hold")?;
    let version: i64 = get(row, "version")?;

    Ok(KeyAsset {
        id: KeyId::from_uuid(get(row, "id")?),
        area_id: AreaId::from_uuid(get(row, "area_id")?),
        label: get(row, "label")?,
        hold: hold.map(|h| h.parse()).transpose().map_err(corrupt)?,
        version: u64::try_from(version).map_err(corrupt)?,
    })
}

pub(crate) fn movement_from_row(row: &PgRow) -> Result<KeyMovement, StorageError> {
    let kind: String = get(row, "kind")?;
    let reservation_id: Option<Uuid> = get(row, "reservation_id")?;

    Ok(KeyMovement {
        id: MovementId::from_uuid(get(row, "id")?),
        key_id: KeyId::from_uuid(get(row, "key_id")?),
        kind: kind.parse().map_err(corrupt)?,
        reservation_id: reservation_id.map(ReservationId::from_uuid),
        actor_id: UserId::from_uuid(get(row, "actor_id")?),
        recorded_at: get(row, "recorded_at")?,
        notes: get(row, "notes")?,
    })
}

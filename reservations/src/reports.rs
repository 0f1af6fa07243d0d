//! Lookups and reports over stored reservations.
//!
//! Everything here is a pure function of the records passed in; the manager
//! fetches them from storage.

use crate::types::{Area, AreaId, Evaluation, Money, Reservation, ReservationId, ReservationStatus, UserId};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Criteria for listing reservations. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFilter {
    /// First day, inclusive
    pub from: Option<NaiveDate>,
    /// Last day, inclusive
    pub to: Option<NaiveDate>,
    /// Only this area
    pub area_id: Option<AreaId>,
    /// Only this status
    pub status: Option<ReservationStatus>,
    /// Only this requester
    pub requester_id: Option<UserId>,
}

impl ReservationFilter {
    /// Match every reservation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to `[from, to]`
    #[must_use]
    pub const fn between(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Restrict to one area
    #[must_use]
    pub const fn area(mut self, area_id: AreaId) -> Self {
        self.area_id = Some(area_id);
        self
    }

    /// Restrict to one status
    #[must_use]
    pub const fn status(mut self, status: ReservationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to one requester
    #[must_use]
    pub const fn requester(mut self, requester_id: UserId) -> Self {
        self.requester_id = Some(requester_id);
        self
    }

    /// Whether `reservation` satisfies every set criterion
    #[must_use]
    pub fn matches(&self, reservation: &Reservation) -> bool {
        self.from.is_none_or(|from| reservation.date >= from)
            && self.to.is_none_or(|to| reservation.date <= to)
            && self.area_id.is_none_or(|id| reservation.area_id == id)
            && self.status.is_none_or(|status| reservation.status == status)
            && self
                .requester_id
                .is_none_or(|id| reservation.requester_id == id)
    }
}

/// Sort order of listings: by date, then start time
pub fn sort_for_listing(reservations: &mut [Reservation]) {
    reservations.sort_by(|a, b| {
        (a.date, a.window.start(), a.protocol.as_str()).cmp(&(b.date, b.window.start(), b.protocol.as_str()))
    });
}

/// Used reservations that have no evaluation yet, oldest first
#[must_use]
pub fn pending_evaluations(
    reservations: Vec<Reservation>,
    evaluated: &HashSet<ReservationId>,
) -> Vec<Reservation> {
    let mut pending: Vec<_> = reservations
        .into_iter()
        .filter(|r| r.status == ReservationStatus::Used && !evaluated.contains(&r.id))
        .collect();
    sort_for_listing(&mut pending);
    pending
}

/// Inclusive range of days
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    /// First day
    pub from: NaiveDate,
    /// Last day
    pub to: NaiveDate,
}

impl Period {
    /// Period from `from` to `to`, swapped if given backwards
    #[must_use]
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        if from <= to {
            Self { from, to }
        } else {
            Self { from: to, to: from }
        }
    }

    /// Number of days covered
    #[must_use]
    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    /// Filter selecting this period
    #[must_use]
    pub const fn filter(&self) -> ReservationFilter {
        ReservationFilter {
            from: Some(self.from),
            to: Some(self.to),
            area_id: None,
            status: None,
            requester_id: None,
        }
    }
}

/// Reservation counts by status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// pendente
    pub pending: u64,
    /// confirmada
    pub confirmed: u64,
    /// cancelada
    pub cancelled: u64,
    /// utilizada
    pub used: u64,
}

impl StatusCounts {
    /// Count one reservation in `status`
    pub const fn record(&mut self, status: ReservationStatus) {
        match status {
            ReservationStatus::Pending => self.pending += 1,
            ReservationStatus::Confirmed => self.confirmed += 1,
            ReservationStatus::Cancelled => self.cancelled += 1,
            ReservationStatus::Used => self.used += 1,
        }
    }

    /// Count for `status`
    #[must_use]
    pub const fn get(&self, status: ReservationStatus) -> u64 {
        match status {
            ReservationStatus::Pending => self.pending,
            ReservationStatus::Confirmed => self.confirmed,
            ReservationStatus::Cancelled => self.cancelled,
            ReservationStatus::Used => self.used,
        }
    }

    /// All reservations counted
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.confirmed + self.cancelled + self.used
    }
}

/// Usage report of one area over a period
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AreaReport {
    /// Area
    pub area_id: AreaId,
    /// Area name
    pub area_name: String,
    /// Covered days
    pub period: Period,
    /// Reservations by status
    pub counts: StatusCounts,
    /// Sum of prices of confirmed and used reservations
    pub revenue: Money,
    /// Minutes held by non-cancelled reservations
    pub booked_minutes: i64,
    /// Bookable minutes in the period
    pub available_minutes: i64,
}

impl AreaReport {
    /// Share of bookable time held by non-cancelled reservations, 0.0 to 1.0
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // minute counts are far below 2^52
    pub fn occupancy_rate(&self) -> f64 {
        if self.available_minutes <= 0 {
            0.0
        } else {
            self.booked_minutes as f64 / self.available_minutes as f64
        }
    }

    /// Booked time in hours
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn booked_hours(&self) -> f64 {
        self.booked_minutes as f64 / 60.0
    }
}

/// Build the report of `area` from the reservations it had in `period`.
///
/// Reservations of other areas or outside the period are ignored.
#[must_use]
pub fn area_report(area: &Area, period: &Period, reservations: &[Reservation]) -> AreaReport {
    let mut counts = StatusCounts::default();
    let mut revenue = Money::ZERO;
    let mut booked = Duration::zero();

    for reservation in reservations
        .iter()
        .filter(|r| r.area_id == area.id && r.date >= period.from && r.date <= period.to)
    {
        counts.record(reservation.status);
        if matches!(
            reservation.status,
            ReservationStatus::Confirmed | ReservationStatus::Used
        ) {
            revenue = revenue + reservation.price;
        }
        if reservation.status.blocks_slot() {
            booked += reservation.window.duration();
        }
    }

    AreaReport {
        area_id: area.id,
        area_name: area.name.clone(),
        period: *period,
        counts,
        revenue,
        booked_minutes: booked.num_minutes(),
        available_minutes: area.bookable_per_day().num_minutes() * period.days(),
    }
}

/// Aggregate of the evaluations of one area
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    /// Number of evaluations
    pub count: u64,
    /// Mean overall rating, if any evaluation exists
    pub average_overall: Option<f64>,
    /// Share of evaluations that recommend the area
    pub recommend_rate: Option<f64>,
    /// Evaluations that reported a problem
    pub problems_reported: u64,
}

/// Public evaluations of an area as shown to residents
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicEvaluations {
    /// Area evaluated
    pub area_id: AreaId,
    /// Area name
    pub area_name: String,
    /// Aggregate over `evaluations`
    pub summary: RatingSummary,
    /// Newest first
    pub evaluations: Vec<Evaluation>,
}

/// Summarise `evaluations`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rating_summary(evaluations: &[Evaluation]) -> RatingSummary {
    if evaluations.is_empty() {
        return RatingSummary::default();
    }
    let count = evaluations.len() as u64;
    let total: u64 = evaluations
        .iter()
        .map(|e| u64::from(e.overall.value()))
        .sum();
    let recommending = evaluations.iter().filter(|e| e.recommend).count() as u64;

    RatingSummary {
        count,
        average_overall: Some(total as f64 / count as f64),
        recommend_rate: Some(recommending as f64 / count as f64),
        problems_reported: evaluations.iter().filter(|e| e.problem_reported).count() as u64,
    }
}

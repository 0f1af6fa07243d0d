//! Reservation lifecycle for one area on one day.
//!
//! The state is the area's booking sheet for a date: every reservation on
//! it plus their evaluations. Admission checks a request against the sheet
//! in a fixed order:
//! 1. time range is valid
//! 2. the window fits the area's operating hours
//! 3. no non-cancelled reservation overlaps the window
//! 4. the requester has no other active booking on the sheet
//!
//! Transitions (approve, cancel, check-in) and evaluations are checked as
//! record exists, transition legal from the current status, actor
//! authorised, then any date rule.

use crate::error::{Entity, Rejection};
use crate::notifications::{Notification, Notifier, Recipient};
use crate::protocol::Protocol;
use crate::types::{
    Actor, AdmissionRequest, Area, Cancellation, Evaluation, EvaluationId, EvaluationPayload,
    ManagerResponse, Rating, Reservation, ReservationId, ReservationStatus, Stamp, TimeWindow,
    Transition, UserId,
};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use condo_core::{Effects, SmallVec, effect::Effect, environment::Clock, reducer::Reducer, smallvec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the reservation sheet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationAction {
    // Commands
    /// Admit a new booking
    Admit {
        /// Identifier for the new reservation
        reservation_id: ReservationId,
        /// Unused protocol for the new reservation
        protocol: Protocol,
        /// What is being booked
        request: AdmissionRequest,
    },

    /// Approve a pending booking
    Approve {
        /// Reservation to approve
        reservation_id: ReservationId,
        /// Caller
        actor: Actor,
    },

    /// Cancel a pending or confirmed booking
    Cancel {
        /// Reservation to cancel
        reservation_id: ReservationId,
        /// Caller
        actor: Actor,
        /// Optional motive
        reason: Option<String>,
    },

    /// Register arrival on site
    CheckIn {
        /// Reservation checked in
        reservation_id: ReservationId,
        /// Caller (doorkeeper, requester, administrator)
        actor: Actor,
    },

    /// Review a used booking
    SubmitEvaluation {
        /// Identifier for the new evaluation
        evaluation_id: EvaluationId,
        /// Reviewed reservation
        reservation_id: ReservationId,
        /// Caller (must be the requester)
        actor: Actor,
        /// Ratings and comments
        payload: EvaluationPayload,
    },

    /// Answer an evaluation
    RespondToEvaluation {
        /// Reservation whose evaluation is answered
        reservation_id: ReservationId,
        /// Caller (must be an administrator)
        actor: Actor,
        /// Response text
        text: String,
    },

    // Events
    /// A booking was admitted
    ReservationAdmitted {
        /// The new reservation
        reservation: Reservation,
    },

    /// A pending booking was approved
    ReservationApproved {
        /// Reservation ID
        reservation_id: ReservationId,
        /// Approving administrator
        approved_by: UserId,
        /// When
        approved_at: DateTime<Utc>,
    },

    /// A booking was cancelled
    ReservationCancelled {
        /// Reservation ID
        reservation_id: ReservationId,
        /// Status before the cancellation
        previous_status: ReservationStatus,
        /// Who cancelled
        cancelled_by: UserId,
        /// Why
        reason: Option<String>,
        /// When
        cancelled_at: DateTime<Utc>,
    },

    /// A booking was checked in
    ReservationCheckedIn {
        /// Reservation ID
        reservation_id: ReservationId,
        /// Who registered the arrival
        checked_in_by: UserId,
        /// When
        checked_in_at: DateTime<Utc>,
    },

    /// An evaluation was recorded
    EvaluationSubmitted {
        /// The evaluation
        evaluation: Evaluation,
    },

    /// An administrator answered an evaluation
    EvaluationResponded {
        /// Reservation ID
        reservation_id: ReservationId,
        /// The answer
        response: ManagerResponse,
    },

    /// A command was refused
    Rejected {
        /// Why
        rejection: Rejection,
    },
}

// ============================================================================
// State
// ============================================================================

/// Booking sheet of one area for one day
#[derive(Clone, Debug)]
pub struct ReservationState {
    /// Area being booked
    pub area: Area,
    /// Day of the sheet
    pub date: NaiveDate,
    /// Every reservation on the sheet, in any status
    pub reservations: Vec<Reservation>,
    /// Evaluations keyed by reservation
    pub evaluations: HashMap<ReservationId, Evaluation>,
    /// Rejection of the last command, if it was refused
    pub last_error: Option<Rejection>,
    changes: Vec<ReservationAction>,
}

impl ReservationState {
    /// Empty sheet
    #[must_use]
    pub fn new(area: Area, date: NaiveDate) -> Self {
        Self {
            area,
            date,
            reservations: Vec::new(),
            evaluations: HashMap::new(),
            last_error: None,
            changes: Vec::new(),
        }
    }

    /// Sheet pre-filled with stored reservations
    #[must_use]
    pub fn with_reservations(mut self, reservations: impl IntoIterator<Item = Reservation>) -> Self {
        self.reservations.extend(reservations);
        self
    }

    /// Sheet pre-filled with stored evaluations
    #[must_use]
    pub fn with_evaluations(mut self, evaluations: impl IntoIterator<Item = Evaluation>) -> Self {
        self.evaluations
            .extend(evaluations.into_iter().map(|e| (e.reservation_id, e)));
        self
    }

    /// Reservation by ID
    #[must_use]
    pub fn get(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    fn get_mut(&mut self, id: &ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Number of reservations on the sheet
    #[must_use]
    pub fn count(&self) -> usize {
        self.reservations.len()
    }

    /// First non-cancelled reservation overlapping `window`
    #[must_use]
    pub fn conflicting(&self, window: &TimeWindow) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.conflicts_with(window))
    }

    /// Pending or confirmed booking held by `requester`
    #[must_use]
    pub fn active_booking_of(&self, requester: UserId) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.requester_id == requester && r.status.is_active())
    }

    /// Evaluation of a reservation
    #[must_use]
    pub fn evaluation(&self, id: &ReservationId) -> Option<&Evaluation> {
        self.evaluations.get(id)
    }

    /// Drain the events applied since the last call, oldest first
    pub fn take_changes(&mut self) -> Vec<ReservationAction> {
        std::mem::take(&mut self.changes)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Dependencies of the reservation reducer
#[derive(Clone)]
pub struct ReservationEnvironment {
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Notification delivery
    pub notifier: Arc<dyn Notifier>,
    /// Offset of the condominium's local time
    pub utc_offset: FixedOffset,
}

impl ReservationEnvironment {
    /// Creates a new `ReservationEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>, utc_offset: FixedOffset) -> Self {
        Self {
            clock,
            notifier,
            utc_offset,
        }
    }

    /// Local calendar day
    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.clock.today(self.utc_offset)
    }

    fn notify(&self, notification: Notification) -> Effect<ReservationAction> {
        let notifier = Arc::clone(&self.notifier);
        Effect::fire_and_forget(async move { notifier.notify(notification).await })
    }
}

impl std::fmt::Debug for ReservationEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationEnvironment")
            .field("utc_offset", &self.utc_offset)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the reservation sheet
#[derive(Clone, Debug, Default)]
pub struct ReservationReducer;

impl ReservationReducer {
    /// Creates a new `ReservationReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Admission checks, in order. Returns the validated window.
    fn validate_admission(
        state: &ReservationState,
        request: &AdmissionRequest,
        protocol: &Protocol,
    ) -> Result<TimeWindow, Rejection> {
        if request.condominium_id != state.area.condominium_id {
            return Err(Rejection::ForeignCondominium {
                area_id: state.area.id,
                condominium_id: request.condominium_id,
            });
        }

        let window = TimeWindow::new(request.start, request.end)?;

        if let Some(hours) = state.area.operating_hours {
            if !hours.contains(&window) {
                return Err(Rejection::OutsideOperatingHours {
                    start: window.start(),
                    end: window.end(),
                    open: hours.start(),
                    close: hours.end(),
                });
            }
        }

        if let Some(existing) = state.conflicting(&window) {
            return Err(Rejection::SlotConflict {
                protocol: existing.protocol.clone(),
            });
        }

        if let Some(existing) = state.active_booking_of(request.requester_id) {
            return Err(Rejection::DuplicateActiveBooking {
                protocol: existing.protocol.clone(),
            });
        }

        if state.reservations.iter().any(|r| r.protocol == *protocol) {
            return Err(Rejection::ProtocolTaken {
                protocol: protocol.clone(),
            });
        }

        Ok(window)
    }

    /// Looks up the reservation and checks `transition` is legal from its status
    fn validate_transition<'a>(
        state: &'a ReservationState,
        reservation_id: &ReservationId,
        transition: Transition,
    ) -> Result<&'a Reservation, Rejection> {
        let reservation = state
            .get(reservation_id)
            .ok_or_else(|| Rejection::not_found(Entity::Reservation, reservation_id))?;

        let legal = match transition {
            Transition::Approve => reservation.status == ReservationStatus::Pending,
            Transition::Cancel => reservation.status.is_active(),
            Transition::CheckIn => reservation.status == ReservationStatus::Confirmed,
            Transition::Evaluate | Transition::Respond => {
                reservation.status == ReservationStatus::Used
            },
        };

        if legal {
            Ok(reservation)
        } else {
            Err(Rejection::InvalidTransition {
                from: reservation.status,
                requested: transition,
            })
        }
    }

    fn build_evaluation(
        evaluation_id: EvaluationId,
        reservation: &Reservation,
        payload: EvaluationPayload,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, Rejection> {
        let overall = Rating::new("overall", payload.overall)?;
        let optional = |field: &str, value: Option<u8>| {
            value.map(|v| Rating::new(field, v)).transpose()
        };
        let cleanliness = optional("cleanliness", payload.cleanliness)?;
        let upkeep = optional("upkeep", payload.upkeep)?;
        let service = optional("service", payload.service)?;

        let problem_description = non_blank(payload.problem_description);
        if payload.problem_reported && problem_description.is_none() {
            return Err(Rejection::missing("problem_description"));
        }

        Ok(Evaluation {
            id: evaluation_id,
            reservation_id: reservation.id,
            requester_id: reservation.requester_id,
            area_id: reservation.area_id,
            overall,
            cleanliness,
            upkeep,
            service,
            comment: non_blank(payload.comment),
            recommend: payload.recommend,
            problem_reported: payload.problem_reported,
            problem_description,
            public: payload.public,
            response: None,
            created_at: now,
        })
    }

    /// Applies an event to state
    fn apply_event(state: &mut ReservationState, action: &ReservationAction) {
        match action {
            ReservationAction::ReservationAdmitted { reservation } => {
                state.reservations.push(reservation.clone());
                state.last_error = None;
            },

            ReservationAction::ReservationApproved {
                reservation_id,
                approved_by,
                approved_at,
            } => {
                if let Some(reservation) = state.get_mut(reservation_id) {
                    reservation.status = ReservationStatus::Confirmed;
                    reservation.approved = Some(Stamp {
                        by: *approved_by,
                        at: *approved_at,
                    });
                }
                state.last_error = None;
            },

            ReservationAction::ReservationCancelled {
                reservation_id,
                cancelled_by,
                reason,
                cancelled_at,
                ..
            } => {
                if let Some(reservation) = state.get_mut(reservation_id) {
                    reservation.status = ReservationStatus::Cancelled;
                    reservation.cancelled = Some(Cancellation {
                        by: *cancelled_by,
                        at: *cancelled_at,
                        reason: reason.clone(),
                    });
                }
                state.last_error = None;
            },

            ReservationAction::ReservationCheckedIn {
                reservation_id,
                checked_in_by,
                checked_in_at,
            } => {
                if let Some(reservation) = state.get_mut(reservation_id) {
                    reservation.status = ReservationStatus::Used;
                    reservation.checked_in = Some(Stamp {
                        by: *checked_in_by,
                        at: *checked_in_at,
                    });
                }
                state.last_error = None;
            },

            ReservationAction::EvaluationSubmitted { evaluation } => {
                state
                    .evaluations
                    .insert(evaluation.reservation_id, evaluation.clone());
                state.last_error = None;
            },

            ReservationAction::EvaluationResponded {
                reservation_id,
                response,
            } => {
                if let Some(evaluation) = state.evaluations.get_mut(reservation_id) {
                    evaluation.response = Some(response.clone());
                }
                state.last_error = None;
            },

            ReservationAction::Rejected { rejection } => {
                state.last_error = Some(rejection.clone());
            },

            // Commands don't modify state
            ReservationAction::Admit { .. }
            | ReservationAction::Approve { .. }
            | ReservationAction::Cancel { .. }
            | ReservationAction::CheckIn { .. }
            | ReservationAction::SubmitEvaluation { .. }
            | ReservationAction::RespondToEvaluation { .. } => {},
        }
    }

    /// Applies an event produced by a command and records it for persistence
    fn commit(state: &mut ReservationState, event: ReservationAction) {
        Self::apply_event(state, &event);
        state.changes.push(event);
    }

    fn reject(state: &mut ReservationState, rejection: Rejection) -> Effects<ReservationAction> {
        tracing::debug!(%rejection, kind = %rejection.kind(), "reservation command rejected");
        Self::apply_event(state, &ReservationAction::Rejected { rejection });
        SmallVec::new()
    }
}

fn non_blank(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

impl Reducer for ReservationReducer {
    type State = ReservationState;
    type Action = ReservationAction;
    type Environment = ReservationEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per lifecycle command
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Effects<Self::Action> {
        match action {
            // ========== Admission ==========
            ReservationAction::Admit {
                reservation_id,
                protocol,
                request,
            } => {
                let window = match Self::validate_admission(state, &request, &protocol) {
                    Ok(window) => window,
                    Err(rejection) => return Self::reject(state, rejection),
                };

                let status = if state.area.auto_confirm {
                    ReservationStatus::Confirmed
                } else {
                    ReservationStatus::Pending
                };

                let reservation = Reservation {
                    id: reservation_id,
                    protocol: protocol.clone(),
                    area_id: state.area.id,
                    requester_id: request.requester_id,
                    condominium_id: request.condominium_id,
                    date: request.date,
                    window,
                    status,
                    price: state.area.price,
                    created_at: env.clock.now(),
                    approved: None,
                    cancelled: None,
                    checked_in: None,
                };
                Self::commit(state, ReservationAction::ReservationAdmitted { reservation });

                let area = state.area.name.clone();
                let notification = match status {
                    ReservationStatus::Confirmed => Notification::ReservationConfirmed {
                        requester_id: request.requester_id,
                        protocol,
                        area,
                        date: request.date,
                    },
                    _ => Notification::AwaitingApproval {
                        protocol,
                        area,
                        date: request.date,
                    },
                };
                smallvec![env.notify(notification)]
            },

            // ========== Approval ==========
            ReservationAction::Approve {
                reservation_id,
                actor,
            } => {
                let reservation =
                    match Self::validate_transition(state, &reservation_id, Transition::Approve) {
                        Ok(reservation) => reservation,
                        Err(rejection) => return Self::reject(state, rejection),
                    };
                if !actor.is_administrator() {
                    return Self::reject(
                        state,
                        Rejection::forbidden(actor.role, "approve reservations"),
                    );
                }

                let notification = Notification::ReservationConfirmed {
                    requester_id: reservation.requester_id,
                    protocol: reservation.protocol.clone(),
                    area: state.area.name.clone(),
                    date: reservation.date,
                };
                Self::commit(
                    state,
                    ReservationAction::ReservationApproved {
                        reservation_id,
                        approved_by: actor.id,
                        approved_at: env.clock.now(),
                    },
                );
                smallvec![env.notify(notification)]
            },

            // ========== Cancellation ==========
            ReservationAction::Cancel {
                reservation_id,
                actor,
                reason,
            } => {
                let reservation =
                    match Self::validate_transition(state, &reservation_id, Transition::Cancel) {
                        Ok(reservation) => reservation,
                        Err(rejection) => return Self::reject(state, rejection),
                    };
                let is_requester = reservation.requester_id == actor.id;
                if !is_requester && !actor.is_administrator() {
                    return Self::reject(
                        state,
                        Rejection::forbidden(actor.role, "cancel another resident's reservation"),
                    );
                }

                let reason = non_blank(reason);
                let recipient = if is_requester {
                    Recipient::Administrators
                } else {
                    Recipient::User(reservation.requester_id)
                };
                let notification = Notification::ReservationCancelled {
                    recipient,
                    protocol: reservation.protocol.clone(),
                    reason: reason.clone(),
                };
                let previous_status = reservation.status;
                Self::commit(
                    state,
                    ReservationAction::ReservationCancelled {
                        reservation_id,
                        previous_status,
                        cancelled_by: actor.id,
                        reason,
                        cancelled_at: env.clock.now(),
                    },
                );
                smallvec![env.notify(notification)]
            },

            // ========== Check-in ==========
            ReservationAction::CheckIn {
                reservation_id,
                actor,
            } => {
                // Repeated check-in is a no-op
                if state
                    .get(&reservation_id)
                    .is_some_and(|r| r.status == ReservationStatus::Used)
                {
                    state.last_error = None;
                    return SmallVec::new();
                }

                let reservation =
                    match Self::validate_transition(state, &reservation_id, Transition::CheckIn) {
                        Ok(reservation) => reservation,
                        Err(rejection) => return Self::reject(state, rejection),
                    };
                if env.today() < reservation.date {
                    let rejection = Rejection::CheckInNotOpen {
                        protocol: reservation.protocol.clone(),
                        date: reservation.date,
                    };
                    return Self::reject(state, rejection);
                }

                Self::commit(
                    state,
                    ReservationAction::ReservationCheckedIn {
                        reservation_id,
                        checked_in_by: actor.id,
                        checked_in_at: env.clock.now(),
                    },
                );
                SmallVec::new()
            },

            // ========== Evaluation ==========
            ReservationAction::SubmitEvaluation {
                evaluation_id,
                reservation_id,
                actor,
                payload,
            } => {
                let reservation =
                    match Self::validate_transition(state, &reservation_id, Transition::Evaluate) {
                        Ok(reservation) => reservation,
                        Err(rejection) => return Self::reject(state, rejection),
                    };
                if state.evaluations.contains_key(&reservation_id) {
                    let rejection = Rejection::EvaluationExists {
                        protocol: reservation.protocol.clone(),
                    };
                    return Self::reject(state, rejection);
                }
                if reservation.requester_id != actor.id {
                    return Self::reject(
                        state,
                        Rejection::forbidden(actor.role, "evaluate another resident's reservation"),
                    );
                }

                let evaluation =
                    match Self::build_evaluation(evaluation_id, reservation, payload, env.clock.now()) {
                        Ok(evaluation) => evaluation,
                        Err(rejection) => return Self::reject(state, rejection),
                    };

                let effects: Effects<ReservationAction> = match &evaluation.problem_description {
                    Some(description) if evaluation.problem_reported => {
                        smallvec![env.notify(Notification::ProblemReported {
                            protocol: reservation.protocol.clone(),
                            area: state.area.name.clone(),
                            description: description.clone(),
                        })]
                    },
                    _ => SmallVec::new(),
                };
                Self::commit(state, ReservationAction::EvaluationSubmitted { evaluation });
                effects
            },

            ReservationAction::RespondToEvaluation {
                reservation_id,
                actor,
                text,
            } => {
                let reservation =
                    match Self::validate_transition(state, &reservation_id, Transition::Respond) {
                        Ok(reservation) => reservation,
                        Err(rejection) => return Self::reject(state, rejection),
                    };
                if !state.evaluations.contains_key(&reservation_id) {
                    return Self::reject(
                        state,
                        Rejection::not_found(Entity::Evaluation, reservation.protocol.clone()),
                    );
                }
                if !actor.is_administrator() {
                    return Self::reject(
                        state,
                        Rejection::forbidden(actor.role, "respond to evaluations"),
                    );
                }
                let Some(text) = non_blank(Some(text)) else {
                    return Self::reject(state, Rejection::missing("response"));
                };

                let notification = Notification::EvaluationAnswered {
                    requester_id: reservation.requester_id,
                    protocol: reservation.protocol.clone(),
                };
                Self::commit(
                    state,
                    ReservationAction::EvaluationResponded {
                        reservation_id,
                        response: ManagerResponse {
                            text,
                            responded_by: actor.id,
                            responded_at: env.clock.now(),
                        },
                    },
                );
                smallvec![env.notify(notification)]
            },

            // ========== Events (replay) ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notifications::LogNotifier;
    use crate::types::{CondominiumId, Money};
    use chrono::{Duration, NaiveTime};
    use condo_testing::{FixedClock, ReducerTest, assertions, test_clock};

    fn brasilia() -> FixedOffset {
        FixedOffset::west_opt(3 * 3600).unwrap()
    }

    fn create_test_env() -> ReservationEnvironment {
        ReservationEnvironment::new(Arc::new(test_clock()), Arc::new(LogNotifier), brasilia())
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn at(hour: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap()
    }

    fn pool(auto_confirm: bool) -> Area {
        Area::new(CondominiumId::new(), "Piscina", 20, Money::from_reais(50), auto_confirm)
            .with_operating_hours(TimeWindow::new(at(8), at(22)).unwrap())
    }

    fn request(area: &Area, requester: UserId, start: u32, end: u32) -> AdmissionRequest {
        AdmissionRequest {
            area_id: area.id,
            date: today(),
            start: at(start),
            end: at(end),
            requester_id: requester,
            condominium_id: area.condominium_id,
        }
    }

    fn protocol(text: &str) -> Protocol {
        Protocol::parse(text).unwrap()
    }

    fn booked(area: &Area, requester: UserId, start: u32, end: u32, status: ReservationStatus) -> Reservation {
        Reservation {
            id: ReservationId::new(),
            protocol: crate::protocol::ProtocolGenerator::generate(&crate::protocol::RandomProtocols),
            area_id: area.id,
            requester_id: requester,
            condominium_id: area.condominium_id,
            date: today(),
            window: TimeWindow::new(at(start), at(end)).unwrap(),
            status,
            price: area.price,
            created_at: test_clock().now(),
            approved: None,
            cancelled: None,
            checked_in: None,
        }
    }

    fn admit(area: &Area, requester: UserId, start: u32, end: u32, code: &str) -> ReservationAction {
        ReservationAction::Admit {
            reservation_id: ReservationId::new(),
            protocol: protocol(code),
            request: request(area, requester, start, end),
        }
    }

    #[test]
    fn test_admit_pending_without_auto_confirm() {
        let area = pool(false);
        let requester = UserId::new();

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()))
            .when_action(admit(&area, requester, 10, 12, "AB12CD"))
            .then_state(move |state| {
                assert!(state.last_error.is_none());
                assert_eq!(state.count(), 1);
                let reservation = &state.reservations[0];
                assert_eq!(reservation.status, ReservationStatus::Pending);
                assert_eq!(reservation.protocol.as_str(), "AB12CD");
                assert_eq!(reservation.price, Money::from_reais(50));
                assert_eq!(reservation.requester_id, requester);
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn test_admit_confirmed_with_auto_confirm() {
        let area = pool(true);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()))
            .when_action(admit(&area, UserId::new(), 10, 12, "AB12CD"))
            .then_state(|state| {
                assert_eq!(state.reservations[0].status, ReservationStatus::Confirmed);
            })
            .run();
    }

    #[test]
    fn test_admit_rejects_inverted_range() {
        let area = pool(false);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()))
            .when_action(admit(&area, UserId::new(), 12, 10, "AB12CD"))
            .then_state(|state| {
                assert_eq!(state.count(), 0);
                assert!(matches!(state.last_error, Some(Rejection::InvalidTimeRange { .. })));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_admit_rejects_foreign_condominium() {
        let area = pool(false);
        let mut request = request(&area, UserId::new(), 10, 12);
        request.condominium_id = CondominiumId::new();
        let foreign = request.condominium_id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()))
            .when_action(ReservationAction::Admit {
                reservation_id: ReservationId::new(),
                protocol: protocol("AB12CD"),
                request,
            })
            .then_state(move |state| {
                assert_eq!(state.count(), 0);
                assert_eq!(
                    state.last_error,
                    Some(Rejection::ForeignCondominium {
                        area_id: area.id,
                        condominium_id: foreign,
                    })
                );
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_admit_rejects_outside_operating_hours() {
        let area = pool(false);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()))
            .when_action(admit(&area, UserId::new(), 21, 23, "AB12CD"))
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(Rejection::OutsideOperatingHours { .. })
                ));
            })
            .run();
    }

    #[test]
    fn test_overlap_rejected_and_adjacent_accepted() {
        let area = pool(false);
        let first = booked(&area, UserId::new(), 10, 12, ReservationStatus::Pending);
        let first_protocol = first.protocol.clone();

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()).with_reservations([first.clone()]))
            .when_action(admit(&area, UserId::new(), 11, 13, "ZZ99ZZ"))
            .then_state(move |state| {
                assert_eq!(
                    state.last_error,
                    Some(Rejection::SlotConflict {
                        protocol: first_protocol
                    })
                );
                assert_eq!(state.count(), 1);
            })
            .run();

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()).with_reservations([first]))
            .when_action(admit(&area, UserId::new(), 12, 14, "ZZ99ZZ"))
            .then_state(|state| {
                assert!(state.last_error.is_none());
                assert_eq!(state.count(), 2);
            })
            .run();
    }

    #[test]
    fn test_cancelled_reservation_frees_slot() {
        let area = pool(false);
        let cancelled = booked(&area, UserId::new(), 10, 12, ReservationStatus::Cancelled);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()).with_reservations([cancelled]))
            .when_action(admit(&area, UserId::new(), 10, 12, "AB12CD"))
            .then_state(|state| {
                assert!(state.last_error.is_none());
                assert_eq!(state.count(), 2);
            })
            .run();
    }

    #[test]
    fn test_second_active_booking_rejected() {
        let area = pool(false);
        let requester = UserId::new();
        let existing = booked(&area, requester, 8, 9, ReservationStatus::Confirmed);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()).with_reservations([existing]))
            .when_action(admit(&area, requester, 15, 17, "AB12CD"))
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(Rejection::DuplicateActiveBooking { .. })
                ));
            })
            .run();
    }

    #[test]
    fn test_conflict_checked_before_duplicate_booking() {
        let area = pool(false);
        let requester = UserId::new();
        let existing = booked(&area, requester, 10, 12, ReservationStatus::Pending);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()).with_reservations([existing]))
            .when_action(admit(&area, requester, 11, 12, "AB12CD"))
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(Rejection::SlotConflict { .. })));
            })
            .run();
    }

    #[test]
    fn test_resident_cannot_approve() {
        let area = pool(false);
        let pending = booked(&area, UserId::new(), 10, 12, ReservationStatus::Pending);
        let id = pending.id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([pending]))
            .when_action(ReservationAction::Approve {
                reservation_id: id,
                actor: Actor::resident(UserId::new()),
            })
            .then_state(move |state| {
                assert!(matches!(state.last_error, Some(Rejection::Forbidden { .. })));
                assert_eq!(state.get(&id).unwrap().status, ReservationStatus::Pending);
            })
            .run();
    }

    #[test]
    fn test_approve_records_stamp() {
        let area = pool(false);
        let pending = booked(&area, UserId::new(), 10, 12, ReservationStatus::Pending);
        let id = pending.id;
        let admin = UserId::new();

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([pending]))
            .when_action(ReservationAction::Approve {
                reservation_id: id,
                actor: Actor::administrator(admin),
            })
            .then_state(move |state| {
                let reservation = state.get(&id).unwrap();
                assert_eq!(reservation.status, ReservationStatus::Confirmed);
                assert_eq!(reservation.approved.as_ref().unwrap().by, admin);
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_illegal_transition_reported_before_authorization() {
        let area = pool(false);
        let used = booked(&area, UserId::new(), 10, 12, ReservationStatus::Used);
        let id = used.id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([used]))
            .when_action(ReservationAction::Cancel {
                reservation_id: id,
                actor: Actor::resident(UserId::new()),
                reason: None,
            })
            .then_state(|state| {
                assert_eq!(
                    state.last_error,
                    Some(Rejection::InvalidTransition {
                        from: ReservationStatus::Used,
                        requested: Transition::Cancel,
                    })
                );
            })
            .run();
    }

    #[test]
    fn test_requester_cancels_own_booking() {
        let area = pool(false);
        let requester = UserId::new();
        let confirmed = booked(&area, requester, 10, 12, ReservationStatus::Confirmed);
        let id = confirmed.id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([confirmed]))
            .when_action(ReservationAction::Cancel {
                reservation_id: id,
                actor: Actor::resident(requester),
                reason: Some("  rain  ".into()),
            })
            .then_state(move |state| {
                let reservation = state.get(&id).unwrap();
                assert_eq!(reservation.status, ReservationStatus::Cancelled);
                assert_eq!(
                    reservation.cancelled.as_ref().unwrap().reason.as_deref(),
                    Some("rain")
                );
            })
            .run();
    }

    #[test]
    fn test_check_in_before_date_not_open() {
        let area = pool(false);
        let mut confirmed = booked(&area, UserId::new(), 10, 12, ReservationStatus::Confirmed);
        confirmed.date = today() + Duration::days(1);
        let id = confirmed.id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(
                ReservationState::new(area, today() + Duration::days(1)).with_reservations([confirmed]),
            )
            .when_action(ReservationAction::CheckIn {
                reservation_id: id,
                actor: Actor::resident(UserId::new()),
            })
            .then_state(move |state| {
                assert!(matches!(state.last_error, Some(Rejection::CheckInNotOpen { .. })));
                assert_eq!(state.get(&id).unwrap().status, ReservationStatus::Confirmed);
            })
            .run();
    }

    #[test]
    fn test_check_in_uses_local_date() {
        // 01:30 UTC on June 2nd is still June 1st in Brasília
        let clock = FixedClock::new(
            DateTime::parse_from_rfc3339("2024-06-02T01:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        let env = ReservationEnvironment::new(Arc::new(clock), Arc::new(LogNotifier), brasilia());
        let area = pool(false);
        let mut confirmed = booked(&area, UserId::new(), 10, 12, ReservationStatus::Confirmed);
        confirmed.date = today() + Duration::days(1);
        let id = confirmed.id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(env)
            .given_state(
                ReservationState::new(area, today() + Duration::days(1)).with_reservations([confirmed]),
            )
            .when_action(ReservationAction::CheckIn {
                reservation_id: id,
                actor: Actor::resident(UserId::new()),
            })
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(Rejection::CheckInNotOpen { .. })));
            })
            .run();
    }

    #[test]
    fn test_repeated_check_in_is_noop() {
        let area = pool(false);
        let confirmed = booked(&area, UserId::new(), 10, 12, ReservationStatus::Confirmed);
        let id = confirmed.id;
        let doorkeeper = Actor::resident(UserId::new());

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([confirmed]))
            .given_action(ReservationAction::CheckIn {
                reservation_id: id,
                actor: doorkeeper.clone(),
            })
            .when_action(ReservationAction::CheckIn {
                reservation_id: id,
                actor: doorkeeper,
            })
            .then_state(move |state| {
                assert!(state.last_error.is_none());
                assert_eq!(state.get(&id).unwrap().status, ReservationStatus::Used);
                let mut state = state.clone();
                assert_eq!(state.take_changes().len(), 1);
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_evaluation_requires_used_reservation() {
        let area = pool(false);
        let requester = UserId::new();
        let confirmed = booked(&area, requester, 10, 12, ReservationStatus::Confirmed);
        let id = confirmed.id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([confirmed]))
            .when_action(ReservationAction::SubmitEvaluation {
                evaluation_id: EvaluationId::new(),
                reservation_id: id,
                actor: Actor::resident(requester),
                payload: EvaluationPayload {
                    overall: 5,
                    ..EvaluationPayload::default()
                },
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(Rejection::InvalidTransition {
                        from: ReservationStatus::Confirmed,
                        requested: Transition::Evaluate,
                    })
                ));
                assert!(state.evaluations.is_empty());
            })
            .run();
    }

    #[test]
    fn test_problem_report_requires_description_and_notifies() {
        let area = pool(false);
        let requester = UserId::new();
        let used = booked(&area, requester, 10, 12, ReservationStatus::Used);
        let id = used.id;
        let state = ReservationState::new(area, today()).with_reservations([used]);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(state.clone())
            .when_action(ReservationAction::SubmitEvaluation {
                evaluation_id: EvaluationId::new(),
                reservation_id: id,
                actor: Actor::resident(requester),
                payload: EvaluationPayload {
                    overall: 2,
                    problem_reported: true,
                    problem_description: Some("   ".into()),
                    ..EvaluationPayload::default()
                },
            })
            .then_state(|state| {
                assert_eq!(state.last_error, Some(Rejection::missing("problem_description")));
            })
            .run();

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(ReservationAction::SubmitEvaluation {
                evaluation_id: EvaluationId::new(),
                reservation_id: id,
                actor: Actor::resident(requester),
                payload: EvaluationPayload {
                    overall: 2,
                    cleanliness: Some(1),
                    problem_reported: true,
                    problem_description: Some("broken grill".into()),
                    ..EvaluationPayload::default()
                },
            })
            .then_state(move |state| {
                let evaluation = state.evaluation(&id).unwrap();
                assert_eq!(evaluation.overall.value(), 2);
                assert_eq!(evaluation.problem_description.as_deref(), Some("broken grill"));
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn test_only_requester_evaluates_once() {
        let area = pool(false);
        let requester = UserId::new();
        let used = booked(&area, requester, 10, 12, ReservationStatus::Used);
        let id = used.id;
        let submit = |actor: Actor| ReservationAction::SubmitEvaluation {
            evaluation_id: EvaluationId::new(),
            reservation_id: id,
            actor,
            payload: EvaluationPayload {
                overall: 4,
                ..EvaluationPayload::default()
            },
        };

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area.clone(), today()).with_reservations([used.clone()]))
            .when_action(submit(Actor::resident(UserId::new())))
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(Rejection::Forbidden { .. })));
            })
            .run();

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([used]))
            .given_action(submit(Actor::resident(requester)))
            .when_action(submit(Actor::resident(requester)))
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(Rejection::EvaluationExists { .. })));
                assert_eq!(state.evaluations.len(), 1);
            })
            .run();
    }

    #[test]
    fn test_rating_out_of_range_rejected() {
        let area = pool(false);
        let requester = UserId::new();
        let used = booked(&area, requester, 10, 12, ReservationStatus::Used);
        let id = used.id;

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([used]))
            .when_action(ReservationAction::SubmitEvaluation {
                evaluation_id: EvaluationId::new(),
                reservation_id: id,
                actor: Actor::resident(requester),
                payload: EvaluationPayload {
                    overall: 4,
                    service: Some(6),
                    ..EvaluationPayload::default()
                },
            })
            .then_state(|state| {
                assert_eq!(
                    state.last_error,
                    Some(Rejection::InvalidRating {
                        field: "service".into(),
                        value: 6
                    })
                );
            })
            .run();
    }

    #[test]
    fn test_administrator_responds_to_evaluation() {
        let area = pool(false);
        let requester = UserId::new();
        let used = booked(&area, requester, 10, 12, ReservationStatus::Used);
        let id = used.id;
        let admin = UserId::new();

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()).with_reservations([used]))
            .given_action(ReservationAction::SubmitEvaluation {
                evaluation_id: EvaluationId::new(),
                reservation_id: id,
                actor: Actor::resident(requester),
                payload: EvaluationPayload {
                    overall: 3,
                    ..EvaluationPayload::default()
                },
            })
            .when_action(ReservationAction::RespondToEvaluation {
                reservation_id: id,
                actor: Actor::administrator(admin),
                text: "Thanks, we will fix it".into(),
            })
            .then_state(move |state| {
                let response = state.evaluation(&id).unwrap().response.as_ref().unwrap();
                assert_eq!(response.responded_by, admin);
                assert_eq!(response.text, "Thanks, we will fix it");
            })
            .then_effects(|effects| assertions::assert_effects_count(effects, 1))
            .run();
    }

    #[test]
    fn test_unknown_reservation_not_found() {
        let area = pool(false);

        ReducerTest::new(ReservationReducer::new())
            .with_env(create_test_env())
            .given_state(ReservationState::new(area, today()))
            .when_action(ReservationAction::Approve {
                reservation_id: ReservationId::new(),
                actor: Actor::administrator(UserId::new()),
            })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(Rejection::NotFound {
                        entity: Entity::Reservation,
                        ..
                    })
                ));
            })
            .run();
    }
}

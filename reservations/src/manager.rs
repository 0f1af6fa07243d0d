//! Reservation manager - the imperative shell around the reducers.
//!
//! Every write follows the same steps:
//! 1. Lock the resource (an area's day, or a key)
//! 2. Load its current state from storage
//! 3. Run the reducer with the command
//! 4. Persist the resulting events through the storage guards
//! 5. Execute the effects (notifications)
//!
//! A rejected command stops at step 3 and nothing is written.

use crate::aggregates::{
    KeyAction, KeyCustodyReducer, KeyEnvironment, KeyState, ReservationAction,
    ReservationEnvironment, ReservationReducer, ReservationState,
};
use crate::config::{ConfigError, ServiceConfig};
use crate::error::{Entity, Rejection, ServiceError, StorageError};
use crate::notifications::{LogNotifier, Notifier};
use crate::protocol::{Protocol, ProtocolGenerator, RandomProtocols};
use crate::reports::{self, AreaReport, Period, PublicEvaluations, ReservationFilter};
use crate::storage::{KeyStorage, ReservationStorage};
use crate::types::{
    Actor, AdmissionRequest, Area, AreaId, Evaluation, EvaluationId, EvaluationPayload, KeyAsset, KeyHold,
    KeyId, KeyMovement, KeyStatus, MovementId, Reservation, ReservationId, ReservationStatus,
    TransitionAction, UserId,
};
use chrono::NaiveDate;
use condo_core::environment::{Clock, SystemClock};
use condo_core::reducer::Reducer;
use condo_runtime::metrics::{
    ADMISSIONS, EVALUATIONS, KEY_MOVEMENTS, OPERATION_DURATION, STORAGE_GUARDS, TRANSITIONS,
};
use condo_runtime::{EffectExecutor, LockRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Metric label for the outcome of an operation
fn outcome<T>(result: &Result<T, ServiceError>) -> &'static str {
    match result {
        Ok(_) => "accepted",
        Err(error) => error.label(),
    }
}

fn observe(operation: &'static str, started: Instant) {
    metrics::histogram!(OPERATION_DURATION, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

fn log_rejection(operation: &'static str, error: &ServiceError) {
    match error {
        ServiceError::Rejected(rejection) => {
            tracing::warn!(operation, kind = %rejection.kind(), %rejection, "request rejected");
        },
        ServiceError::Storage(error) => {
            tracing::error!(operation, %error, "storage failure");
        },
    }
}

/// Builder for [`ReservationManager`]
pub struct ManagerBuilder {
    reservations: Arc<dyn ReservationStorage>,
    keys: Arc<dyn KeyStorage>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    protocols: Arc<dyn ProtocolGenerator>,
    config: ServiceConfig,
}

impl ManagerBuilder {
    /// Start from one backend implementing both storage traits
    #[must_use]
    pub fn new<S>(storage: Arc<S>) -> Self
    where
        S: ReservationStorage + KeyStorage + 'static,
    {
        let reservations: Arc<dyn ReservationStorage> = storage.clone();
        let keys: Arc<dyn KeyStorage> = storage;
        Self::with_storages(reservations, keys)
    }

    /// Start from separate reservation and key backends
    #[must_use]
    pub fn with_storages(reservations: Arc<dyn ReservationStorage>, keys: Arc<dyn KeyStorage>) -> Self {
        Self {
            reservations,
            keys,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            protocols: Arc::new(RandomProtocols),
            config: ServiceConfig::default(),
        }
    }

    /// Time source (default: system clock)
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Notification delivery (default: log only)
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Protocol source (default: random)
    #[must_use]
    pub fn protocols(mut self, protocols: Arc<dyn ProtocolGenerator>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Business rules configuration
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configured UTC offset is invalid.
    pub fn build(self) -> Result<ReservationManager, ConfigError> {
        let utc_offset = self.config.utc_offset()?;
        Ok(ReservationManager {
            reservations: self.reservations,
            keys: self.keys,
            protocols: self.protocols,
            reducer: ReservationReducer::new(),
            key_reducer: KeyCustodyReducer::new(),
            env: ReservationEnvironment::new(Arc::clone(&self.clock), self.notifier, utc_offset),
            key_env: KeyEnvironment::new(self.clock),
            books: LockRegistry::new(),
            key_locks: LockRegistry::new(),
            protocol_attempts: self.config.protocol_max_attempts.max(1),
        })
    }
}

/// Entry point for every reservation, key and evaluation operation
pub struct ReservationManager {
    reservations: Arc<dyn ReservationStorage>,
    keys: Arc<dyn KeyStorage>,
    protocols: Arc<dyn ProtocolGenerator>,
    reducer: ReservationReducer,
    key_reducer: KeyCustodyReducer,
    env: ReservationEnvironment,
    key_env: KeyEnvironment,
    books: LockRegistry<(AreaId, NaiveDate)>,
    key_locks: LockRegistry<KeyId>,
    protocol_attempts: u32,
}

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager")
            .field("env", &self.env)
            .field("protocol_attempts", &self.protocol_attempts)
            .finish_non_exhaustive()
    }
}

impl ReservationManager {
    /// Manager with default collaborators over one storage backend
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configured UTC offset is invalid.
    pub fn new<S>(storage: Arc<S>, config: ServiceConfig) -> Result<Self, ConfigError>
    where
        S: ReservationStorage + KeyStorage + 'static,
    {
        ManagerBuilder::new(storage).config(config).build()
    }

    /// Builder for a manager over one storage backend
    #[must_use]
    pub fn builder<S>(storage: Arc<S>) -> ManagerBuilder
    where
        S: ReservationStorage + KeyStorage + 'static,
    {
        ManagerBuilder::new(storage)
    }

    // ========================================================================
    // Reservations
    // ========================================================================

    /// Admit a booking request.
    ///
    /// # Errors
    ///
    /// Rejected with a validation error (time range, operating hours), a
    /// conflict (slot taken, duplicate active booking) or not found (area);
    /// storage failures are passed through.
    #[tracing::instrument(skip(self, request), fields(area_id = %request.area_id, date = %request.date))]
    pub async fn admit(&self, request: AdmissionRequest) -> Result<Reservation, ServiceError> {
        let started = Instant::now();
        let result = self.admit_inner(request).await;

        metrics::counter!(ADMISSIONS, "outcome" => outcome(&result)).increment(1);
        observe("admit", started);
        match &result {
            Ok(reservation) => tracing::info!(
                protocol = %reservation.protocol,
                status = %reservation.status,
                window = %reservation.window,
                "reservation admitted"
            ),
            Err(error) => log_rejection("admit", error),
        }
        result
    }

    async fn admit_inner(&self, request: AdmissionRequest) -> Result<Reservation, ServiceError> {
        let area = self.area(request.area_id).await?;
        let protocol = self.fresh_protocol().await?;
        let reservation_id = ReservationId::new();
        let date = request.date;

        let state = self
            .run_on_book(
                area,
                date,
                ReservationAction::Admit {
                    reservation_id,
                    protocol,
                    request,
                },
            )
            .await?;
        Ok(Self::reservation_in(&state, reservation_id)?)
    }

    /// Apply an approve, cancel or check-in to a reservation.
    ///
    /// # Errors
    ///
    /// Checked in order: not found, state (transition illegal from the
    /// current status), authorization, then the check-in date (validation).
    #[tracing::instrument(skip(self, action, actor), fields(action = action.transition().as_str(), actor = %actor.id))]
    pub async fn transition(
        &self,
        reservation_id: ReservationId,
        action: TransitionAction,
        actor: &Actor,
    ) -> Result<Reservation, ServiceError> {
        let started = Instant::now();
        let transition = action.transition();
        let result = self.transition_inner(reservation_id, action, actor).await;

        metrics::counter!(
            TRANSITIONS,
            "action" => transition.as_str(),
            "outcome" => outcome(&result)
        )
        .increment(1);
        observe("transition", started);
        match &result {
            Ok(reservation) => tracing::info!(
                protocol = %reservation.protocol,
                status = %reservation.status,
                "reservation transitioned"
            ),
            Err(error) => log_rejection("transition", error),
        }
        result
    }

    async fn transition_inner(
        &self,
        reservation_id: ReservationId,
        action: TransitionAction,
        actor: &Actor,
    ) -> Result<Reservation, ServiceError> {
        let current = self.reservation(reservation_id).await?;
        let actor = actor.clone();
        let command = match action {
            TransitionAction::Approve => ReservationAction::Approve {
                reservation_id,
                actor,
            },
            TransitionAction::Cancel { reason } => ReservationAction::Cancel {
                reservation_id,
                actor,
                reason,
            },
            TransitionAction::CheckIn => ReservationAction::CheckIn {
                reservation_id,
                actor,
            },
        };

        let checking_in = matches!(command, ReservationAction::CheckIn { .. });
        let area = self.area(current.area_id).await?;
        match self.run_on_book(area, current.date, command).await {
            Ok(state) => Ok(Self::reservation_in(&state, reservation_id)?),
            // Another writer checked it in between our load and our update
            Err(
                error @ ServiceError::Rejected(Rejection::ConcurrentUpdate {
                    entity: Entity::Reservation,
                    ..
                }),
            ) if checking_in => {
                let stored = self.reservation(reservation_id).await?;
                if stored.status == ReservationStatus::Used {
                    tracing::debug!(protocol = %stored.protocol, "check-in already recorded by another writer");
                    Ok(stored)
                } else {
                    Err(error)
                }
            },
            Err(error) => Err(error),
        }
    }

    /// Check in the reservation carrying `protocol` (as typed at the gate).
    ///
    /// # Errors
    ///
    /// Validation error for a malformed protocol, not found for an unknown
    /// one, otherwise as [`Self::transition`].
    pub async fn check_in_by_protocol(
        &self,
        protocol: &str,
        actor: &Actor,
    ) -> Result<Reservation, ServiceError> {
        let reservation = self.find_by_protocol(protocol).await?;
        self.transition(reservation.id, TransitionAction::CheckIn, actor)
            .await
    }

    /// Reservation by ID.
    ///
    /// # Errors
    ///
    /// Not found when no reservation has that ID.
    pub async fn reservation(&self, id: ReservationId) -> Result<Reservation, ServiceError> {
        self.reservations
            .reservation(id)
            .await?
            .ok_or_else(|| Rejection::not_found(Entity::Reservation, id).into())
    }

    /// Reservation by protocol; input is trimmed and upper-cased.
    ///
    /// # Errors
    ///
    /// Validation error for a malformed protocol, not found for an unknown one.
    pub async fn find_by_protocol(&self, input: &str) -> Result<Reservation, ServiceError> {
        let protocol = Protocol::parse(input)?;
        self.reservations
            .reservation_by_protocol(&protocol)
            .await?
            .ok_or_else(|| Rejection::not_found(Entity::Reservation, &protocol).into())
    }

    /// Reservations matching `filter`, by date then start time.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, ServiceError> {
        Ok(self.reservations.query_reservations(filter).await?)
    }

    // ========================================================================
    // Evaluations
    // ========================================================================

    /// Evaluate a used reservation.
    ///
    /// # Errors
    ///
    /// Not found, state (reservation not utilizada), conflict (already
    /// evaluated), authorization (not the requester), then validation of the
    /// payload.
    #[tracing::instrument(skip(self, actor, payload), fields(actor = %actor.id))]
    pub async fn submit_evaluation(
        &self,
        reservation_id: ReservationId,
        actor: &Actor,
        payload: EvaluationPayload,
    ) -> Result<Evaluation, ServiceError> {
        let started = Instant::now();
        let result = async {
            let current = self.reservation(reservation_id).await?;
            let area = self.area(current.area_id).await?;
            let command = ReservationAction::SubmitEvaluation {
                evaluation_id: EvaluationId::new(),
                reservation_id,
                actor: actor.clone(),
                payload,
            };
            let state = self.run_on_book(area, current.date, command).await?;
            Self::evaluation_in(&state, reservation_id).map_err(ServiceError::from)
        }
        .await;

        metrics::counter!(EVALUATIONS, "action" => "submit", "outcome" => outcome(&result))
            .increment(1);
        observe("submit_evaluation", started);
        match &result {
            Ok(evaluation) => tracing::info!(
                overall = evaluation.overall.value(),
                problem_reported = evaluation.problem_reported,
                "evaluation submitted"
            ),
            Err(error) => log_rejection("submit_evaluation", error),
        }
        result
    }

    /// Attach (or replace) an administrator's answer to an evaluation.
    ///
    /// # Errors
    ///
    /// Not found (reservation or evaluation), authorization (not an
    /// administrator), validation (blank text).
    #[tracing::instrument(skip(self, actor, text), fields(actor = %actor.id))]
    pub async fn respond_to_evaluation(
        &self,
        reservation_id: ReservationId,
        actor: &Actor,
        text: String,
    ) -> Result<Evaluation, ServiceError> {
        let started = Instant::now();
        let result = async {
            let current = self.reservation(reservation_id).await?;
            let area = self.area(current.area_id).await?;
            let command = ReservationAction::RespondToEvaluation {
                reservation_id,
                actor: actor.clone(),
                text,
            };
            let state = self.run_on_book(area, current.date, command).await?;
            Self::evaluation_in(&state, reservation_id).map_err(ServiceError::from)
        }
        .await;

        metrics::counter!(EVALUATIONS, "action" => "respond", "outcome" => outcome(&result))
            .increment(1);
        observe("respond_to_evaluation", started);
        if let Err(error) = &result {
            log_rejection("respond_to_evaluation", error);
        }
        result
    }

    /// Evaluation of a reservation.
    ///
    /// # Errors
    ///
    /// Not found when the reservation has no evaluation.
    pub async fn evaluation(&self, reservation_id: ReservationId) -> Result<Evaluation, ServiceError> {
        self.reservations
            .evaluations_for(&[reservation_id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Rejection::not_found(Entity::Evaluation, reservation_id).into())
    }

    /// Used reservations of `requester` still waiting for an evaluation.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub async fn pending_evaluations(&self, requester: UserId) -> Result<Vec<Reservation>, ServiceError> {
        let filter = ReservationFilter::new()
            .requester(requester)
            .status(ReservationStatus::Used);
        let used = self.reservations.query_reservations(&filter).await?;
        let ids: Vec<_> = used.iter().map(|r| r.id).collect();
        let evaluated: HashSet<_> = self
            .reservations
            .evaluations_for(&ids)
            .await?
            .into_iter()
            .map(|e| e.reservation_id)
            .collect();
        Ok(reports::pending_evaluations(used, &evaluated))
    }

    /// Public evaluations of an area with their rating summary.
    ///
    /// # Errors
    ///
    /// Not found for an unknown area.
    pub async fn public_evaluations(&self, area_id: AreaId) -> Result<PublicEvaluations, ServiceError> {
        let area = self.area(area_id).await?;
        let evaluations = self.reservations.area_evaluations(area_id, true).await?;
        Ok(PublicEvaluations {
            area_id,
            area_name: area.name,
            summary: reports::rating_summary(&evaluations),
            evaluations,
        })
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Usage report of one area over a period.
    ///
    /// # Errors
    ///
    /// Not found for an unknown area.
    pub async fn area_report(&self, area_id: AreaId, period: Period) -> Result<AreaReport, ServiceError> {
        let area = self.area(area_id).await?;
        let filter = period.filter().area(area_id);
        let reservations = self.reservations.query_reservations(&filter).await?;
        Ok(reports::area_report(&area, &period, &reservations))
    }

    /// Usage report of every area over a period.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub async fn period_report(&self, period: Period) -> Result<Vec<AreaReport>, ServiceError> {
        let areas = self.reservations.areas().await?;
        let reservations = self.reservations.query_reservations(&period.filter()).await?;
        Ok(areas
            .iter()
            .map(|area| reports::area_report(area, &period, &reservations))
            .collect())
    }

    // ========================================================================
    // Keys
    // ========================================================================

    /// Record a retirada.
    ///
    /// # Errors
    ///
    /// Not found (key, or the given reservation), conflict when the key is
    /// not disponivel.
    #[tracing::instrument(skip(self, actor, notes), fields(actor = %actor.id))]
    pub async fn checkout(
        &self,
        key_id: KeyId,
        actor: &Actor,
        reservation_id: Option<ReservationId>,
        notes: Option<String>,
    ) -> Result<KeyMovement, ServiceError> {
        let started = Instant::now();
        let result = async {
            if let Some(id) = reservation_id {
                self.reservation(id).await?;
            }
            let action = KeyAction::CheckOut {
                movement_id: MovementId::new(),
                actor: actor.clone(),
                reservation_id,
                notes,
            };
            let state = self.run_on_key(key_id, action).await?;
            Self::last_movement(&state)
        }
        .await;
        self.record_key_outcome("retirada", started, &result);
        result
    }

    /// Record a devolução.
    ///
    /// # Errors
    ///
    /// Not found (key), conflict when the key is not em_uso.
    #[tracing::instrument(skip(self, actor, notes), fields(actor = %actor.id))]
    pub async fn checkin(
        &self,
        key_id: KeyId,
        actor: &Actor,
        notes: Option<String>,
    ) -> Result<KeyMovement, ServiceError> {
        let started = Instant::now();
        let result = async {
            let action = KeyAction::Return {
                movement_id: MovementId::new(),
                actor: actor.clone(),
                notes,
            };
            let state = self.run_on_key(key_id, action).await?;
            Self::last_movement(&state)
        }
        .await;
        self.record_key_outcome("devolucao", started, &result);
        result
    }

    /// Mark a key lost or under maintenance.
    ///
    /// # Errors
    ///
    /// Not found (key), authorization (not an administrator).
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn hold_key(&self, key_id: KeyId, actor: &Actor, hold: KeyHold) -> Result<KeyStatus, ServiceError> {
        let started = Instant::now();
        let result = self
            .run_on_key(
                key_id,
                KeyAction::PlaceHold {
                    actor: actor.clone(),
                    hold,
                },
            )
            .await
            .map(|state| state.status());
        self.record_key_outcome(hold.as_str(), started, &result);
        result
    }

    /// Clear a hold, closing any outstanding checkout.
    ///
    /// # Errors
    ///
    /// Not found (key), state (no hold to clear), authorization.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn reset_key(&self, key_id: KeyId, actor: &Actor) -> Result<KeyStatus, ServiceError> {
        let started = Instant::now();
        let result = self
            .run_on_key(
                key_id,
                KeyAction::Reset {
                    movement_id: MovementId::new(),
                    actor: actor.clone(),
                },
            )
            .await
            .map(|state| state.status());
        self.record_key_outcome("reset", started, &result);
        result
    }

    /// Current status of a key.
    ///
    /// # Errors
    ///
    /// Not found for an unknown key.
    pub async fn key_status(&self, key_id: KeyId) -> Result<KeyStatus, ServiceError> {
        Ok(self.load_key(key_id).await?.status())
    }

    /// Movement log of a key, oldest first.
    ///
    /// # Errors
    ///
    /// Not found for an unknown key.
    pub async fn key_history(&self, key_id: KeyId) -> Result<Vec<KeyMovement>, ServiceError> {
        Ok(self.load_key(key_id).await?.movements)
    }

    /// Keys of an area with their current status, by label.
    ///
    /// # Errors
    ///
    /// Not found for an unknown area.
    pub async fn area_keys(&self, area_id: AreaId) -> Result<Vec<(KeyAsset, KeyStatus)>, ServiceError> {
        self.area(area_id).await?;
        let mut keys = Vec::new();
        for key in self.keys.keys_of(area_id).await? {
            let movements = self.keys.movements(key.id).await?;
            let status = KeyState::new(key.clone()).with_movements(movements).status();
            keys.push((key, status));
        }
        Ok(keys)
    }

    // ========================================================================
    // Shell plumbing
    // ========================================================================

    async fn area(&self, area_id: AreaId) -> Result<Area, ServiceError> {
        self.reservations
            .area(area_id)
            .await?
            .ok_or_else(|| Rejection::not_found(Entity::Area, area_id).into())
    }

    /// Draw protocols until one is unused
    async fn fresh_protocol(&self) -> Result<Protocol, ServiceError> {
        let mut candidate = self.protocols.generate();
        for _ in 1..self.protocol_attempts {
            if !self.reservations.protocol_exists(&candidate).await? {
                return Ok(candidate);
            }
            tracing::debug!(protocol = %candidate, "protocol collision, drawing again");
            candidate = self.protocols.generate();
        }
        if self.reservations.protocol_exists(&candidate).await? {
            return Err(Rejection::ProtocolTaken {
                protocol: candidate,
            }
            .into());
        }
        Ok(candidate)
    }

    async fn load_book(&self, area: Area, date: NaiveDate) -> Result<ReservationState, ServiceError> {
        let reservations = self.reservations.reservations_on(area.id, date).await?;
        let used: Vec<_> = reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Used)
            .map(|r| r.id)
            .collect();
        let evaluations = if used.is_empty() {
            Vec::new()
        } else {
            self.reservations.evaluations_for(&used).await?
        };
        Ok(ReservationState::new(area, date)
            .with_reservations(reservations)
            .with_evaluations(evaluations))
    }

    /// Run one command against an area's day under its lock
    async fn run_on_book(
        &self,
        area: Area,
        date: NaiveDate,
        command: ReservationAction,
    ) -> Result<ReservationState, ServiceError> {
        let guard = self.books.lock((area.id, date)).await;
        let mut state = self.load_book(area, date).await?;
        let effects = self.reducer.reduce(&mut state, command, &self.env);
        self.persist_book(&mut state).await?;
        drop(guard);

        // Notification effects produce no feedback actions
        let _ = EffectExecutor::run(effects).await;
        Ok(state)
    }

    async fn persist_book(&self, state: &mut ReservationState) -> Result<(), ServiceError> {
        if let Some(rejection) = state.last_error.take() {
            return Err(rejection.into());
        }

        for change in state.take_changes() {
            let written = match change {
                ReservationAction::ReservationAdmitted { reservation } => {
                    self.reservations.insert_reservation(&reservation).await
                },
                ReservationAction::ReservationApproved { reservation_id, .. } => {
                    let reservation = Self::reservation_in(state, reservation_id)?;
                    self.reservations
                        .update_reservation(&reservation, ReservationStatus::Pending)
                        .await
                },
                ReservationAction::ReservationCancelled {
                    reservation_id,
                    previous_status,
                    ..
                } => {
                    let reservation = Self::reservation_in(state, reservation_id)?;
                    self.reservations
                        .update_reservation(&reservation, previous_status)
                        .await
                },
                ReservationAction::ReservationCheckedIn { reservation_id, .. } => {
                    let reservation = Self::reservation_in(state, reservation_id)?;
                    self.reservations
                        .update_reservation(&reservation, ReservationStatus::Confirmed)
                        .await
                },
                ReservationAction::EvaluationSubmitted { evaluation } => {
                    self.reservations.insert_evaluation(&evaluation).await
                },
                ReservationAction::EvaluationResponded { reservation_id, .. } => {
                    let evaluation = Self::evaluation_in(state, reservation_id)?;
                    self.reservations.update_evaluation(&evaluation).await
                },
                _ => Ok(()),
            };

            if let Err(error) = written {
                Self::record_guard(&error);
                return Err(error.into());
            }
        }
        Ok(())
    }

    async fn load_key(&self, key_id: KeyId) -> Result<KeyState, ServiceError> {
        let key = self
            .keys
            .key(key_id)
            .await?
            .ok_or_else(|| Rejection::not_found(Entity::Key, key_id))?;
        let movements = self.keys.movements(key_id).await?;
        Ok(KeyState::new(key).with_movements(movements))
    }

    /// Run one command against a key under its lock
    async fn run_on_key(&self, key_id: KeyId, action: KeyAction) -> Result<KeyState, ServiceError> {
        let guard = self.key_locks.lock(key_id).await;
        let mut state = self.load_key(key_id).await?;
        let effects = self.key_reducer.reduce(&mut state, action, &self.key_env);

        if let Some(rejection) = state.last_error.take() {
            return Err(rejection.into());
        }
        let movements: Vec<KeyMovement> = state
            .take_changes()
            .into_iter()
            .filter_map(|change| match change {
                KeyAction::KeyCheckedOut { movement } | KeyAction::KeyReturned { movement } => {
                    Some(movement)
                },
                _ => None,
            })
            .collect();

        match self.keys.commit_key(&state.key, &movements).await {
            Ok(version) => state.key.version = version,
            Err(error) => {
                Self::record_guard(&error);
                return Err(error.into());
            },
        }
        drop(guard);

        // Notification effects produce no feedback actions
        let _ = EffectExecutor::run(effects).await;
        Ok(state)
    }

    fn record_key_outcome<T>(&self, kind: &'static str, started: Instant, result: &Result<T, ServiceError>) {
        metrics::counter!(KEY_MOVEMENTS, "kind" => kind, "outcome" => outcome(result)).increment(1);
        observe("key", started);
        match result {
            Ok(_) => tracing::info!(kind, "key custody updated"),
            Err(error) => log_rejection("key", error),
        }
        tracing::trace!(locks = self.key_locks.len(), "key lock registry size");
    }

    fn record_guard(error: &StorageError) {
        if let Some(guard) = error.guard() {
            metrics::counter!(STORAGE_GUARDS, "guard" => guard).increment(1);
            tracing::warn!(guard, %error, "write refused by storage guard");
        }
    }

    fn reservation_in(state: &ReservationState, id: ReservationId) -> Result<Reservation, Rejection> {
        state
            .get(&id)
            .cloned()
            .ok_or_else(|| Rejection::not_found(Entity::Reservation, id))
    }

    fn evaluation_in(state: &ReservationState, id: ReservationId) -> Result<Evaluation, Rejection> {
        state
            .evaluation(&id)
            .cloned()
            .ok_or_else(|| Rejection::not_found(Entity::Evaluation, id))
    }

    fn last_movement(state: &KeyState) -> Result<KeyMovement, ServiceError> {
        state
            .movements
            .last()
            .cloned()
            .ok_or_else(|| Rejection::not_found(Entity::Key, state.key.id).into())
    }
}

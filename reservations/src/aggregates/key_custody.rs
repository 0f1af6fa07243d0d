//! Key custody.
//!
//! Who holds a key is derived from its movement log: the key is `em_uso`
//! while the latest movement is a retirada, `disponivel` otherwise. An
//! administrative hold (`perdida`, `manutencao`) overrides that until it is
//! reset.

use crate::error::Rejection;
use crate::types::{
    Actor, KeyAsset, KeyHold, KeyMovement, KeyStatus, KeyTransition, MovementId, MovementKind,
    ReservationId, UserId,
};
use chrono::{DateTime, Utc};
use condo_core::{Effects, SmallVec, environment::Clock, reducer::Reducer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Note attached to the return recorded by an administrative reset
pub const RESET_RETURN_NOTE: &str = "returned by administrative reset";

/// Actions for one key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAction {
    // Commands
    /// Hand the key out
    CheckOut {
        /// Identifier for the movement
        movement_id: MovementId,
        /// Who records the checkout
        actor: Actor,
        /// Booking the checkout serves
        reservation_id: Option<ReservationId>,
        /// Free-text notes
        notes: Option<String>,
    },
    /// Take the key back
    Return {
        /// Identifier for the movement
        movement_id: MovementId,
        /// Who records the return
        actor: Actor,
        /// Free-text notes
        notes: Option<String>,
    },
    /// Mark the key lost or under maintenance
    PlaceHold {
        /// Administrator
        actor: Actor,
        /// Kind of hold
        hold: KeyHold,
    },
    /// Clear a hold, closing any outstanding checkout
    Reset {
        /// Identifier for the closing return, if one is needed
        movement_id: MovementId,
        /// Administrator
        actor: Actor,
    },

    // Events
    /// Key handed out
    KeyCheckedOut {
        /// The movement
        movement: KeyMovement,
    },
    /// Key handed back
    KeyReturned {
        /// The movement
        movement: KeyMovement,
    },
    /// Hold placed
    HoldPlaced {
        /// Kind of hold
        hold: KeyHold,
        /// Administrator
        placed_by: UserId,
        /// When
        placed_at: DateTime<Utc>,
    },
    /// Hold cleared
    HoldReleased {
        /// Administrator
        released_by: UserId,
        /// When
        released_at: DateTime<Utc>,
    },
    /// A command was refused
    Rejected {
        /// Why
        rejection: Rejection,
    },
}

/// A key and its movement log
#[derive(Clone, Debug)]
pub struct KeyState {
    /// The key
    pub key: KeyAsset,
    /// Movements, oldest first
    pub movements: Vec<KeyMovement>,
    /// Rejection of the last command, if it was refused
    pub last_error: Option<Rejection>,
    changes: Vec<KeyAction>,
}

impl KeyState {
    /// Key with no movements
    #[must_use]
    pub const fn new(key: KeyAsset) -> Self {
        Self {
            key,
            movements: Vec::new(),
            last_error: None,
            changes: Vec::new(),
        }
    }

    /// Key with its stored movements
    #[must_use]
    pub fn with_movements(mut self, movements: impl IntoIterator<Item = KeyMovement>) -> Self {
        self.movements.extend(movements);
        self
    }

    /// Status as observed by callers
    #[must_use]
    pub fn status(&self) -> KeyStatus {
        self.key.hold.map_or_else(|| self.custody(), KeyStatus::from)
    }

    /// Status implied by the movement log alone
    #[must_use]
    pub fn custody(&self) -> KeyStatus {
        if self.outstanding_checkout().is_some() {
            KeyStatus::InUse
        } else {
            KeyStatus::Available
        }
    }

    /// The retirada not yet followed by a devolução
    #[must_use]
    pub fn outstanding_checkout(&self) -> Option<&KeyMovement> {
        self.movements
            .last()
            .filter(|m| m.kind == MovementKind::CheckOut)
    }

    /// Drain the events applied since the last call, oldest first
    pub fn take_changes(&mut self) -> Vec<KeyAction> {
        std::mem::take(&mut self.changes)
    }
}

/// Dependencies of the key reducer
#[derive(Clone)]
pub struct KeyEnvironment {
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl KeyEnvironment {
    /// Creates a new `KeyEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl std::fmt::Debug for KeyEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEnvironment").finish_non_exhaustive()
    }
}

/// Reducer for key custody
#[derive(Clone, Debug, Default)]
pub struct KeyCustodyReducer;

impl KeyCustodyReducer {
    /// Creates a new `KeyCustodyReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply_event(state: &mut KeyState, action: &KeyAction) {
        match action {
            KeyAction::KeyCheckedOut { movement } | KeyAction::KeyReturned { movement } => {
                state.movements.push(movement.clone());
                state.last_error = None;
            },
            KeyAction::HoldPlaced { hold, .. } => {
                state.key.hold = Some(*hold);
                state.last_error = None;
            },
            KeyAction::HoldReleased { .. } => {
                state.key.hold = None;
                state.last_error = None;
            },
            KeyAction::Rejected { rejection } => {
                state.last_error = Some(rejection.clone());
            },
            KeyAction::CheckOut { .. }
            | KeyAction::Return { .. }
            | KeyAction::PlaceHold { .. }
            | KeyAction::Reset { .. } => {},
        }
    }

    fn commit(state: &mut KeyState, event: KeyAction) {
        Self::apply_event(state, &event);
        state.changes.push(event);
    }

    fn reject(state: &mut KeyState, rejection: Rejection) -> Effects<KeyAction> {
        tracing::debug!(key = %state.key.label, %rejection, "key command rejected");
        Self::apply_event(state, &KeyAction::Rejected { rejection });
        SmallVec::new()
    }

    fn movement(
        state: &KeyState,
        id: MovementId,
        kind: MovementKind,
        actor: &Actor,
        reservation_id: Option<ReservationId>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> KeyMovement {
        KeyMovement {
            id,
            key_id: state.key.id,
            kind,
            reservation_id,
            actor_id: actor.id,
            recorded_at: now,
            notes: notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        }
    }
}

impl Reducer for KeyCustodyReducer {
    type State = KeyState;
    type Action = KeyAction;
    type Environment = KeyEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Effects<Self::Action> {
        match action {
            KeyAction::CheckOut {
                movement_id,
                actor,
                reservation_id,
                notes,
            } => {
                let status = state.status();
                if status != KeyStatus::Available {
                    let rejection = Rejection::KeyNotAvailable {
                        label: state.key.label.clone(),
                        status,
                    };
                    return Self::reject(state, rejection);
                }
                let movement = Self::movement(
                    state,
                    movement_id,
                    MovementKind::CheckOut,
                    &actor,
                    reservation_id,
                    notes,
                    env.clock.now(),
                );
                Self::commit(state, KeyAction::KeyCheckedOut { movement });
                SmallVec::new()
            },

            KeyAction::Return {
                movement_id,
                actor,
                notes,
            } => {
                let status = state.status();
                if status != KeyStatus::InUse {
                    let rejection = Rejection::KeyNotCheckedOut {
                        label: state.key.label.clone(),
                        status,
                    };
                    return Self::reject(state, rejection);
                }
                let reservation_id = state.outstanding_checkout().and_then(|m| m.reservation_id);
                let movement = Self::movement(
                    state,
                    movement_id,
                    MovementKind::Return,
                    &actor,
                    reservation_id,
                    notes,
                    env.clock.now(),
                );
                Self::commit(state, KeyAction::KeyReturned { movement });
                SmallVec::new()
            },

            KeyAction::PlaceHold { actor, hold } => {
                if !actor.is_administrator() {
                    return Self::reject(
                        state,
                        Rejection::forbidden(actor.role, format!("mark keys as {}", hold.as_str())),
                    );
                }
                Self::commit(
                    state,
                    KeyAction::HoldPlaced {
                        hold,
                        placed_by: actor.id,
                        placed_at: env.clock.now(),
                    },
                );
                SmallVec::new()
            },

            KeyAction::Reset { movement_id, actor } => {
                let status = state.status();
                if state.key.hold.is_none() {
                    let rejection = Rejection::InvalidKeyTransition {
                        label: state.key.label.clone(),
                        from: status,
                        requested: KeyTransition::Reset,
                    };
                    return Self::reject(state, rejection);
                }
                if !actor.is_administrator() {
                    return Self::reject(state, Rejection::forbidden(actor.role, "reset keys"));
                }

                let now = env.clock.now();
                if let Some(checkout) = state.outstanding_checkout() {
                    let reservation_id = checkout.reservation_id;
                    let movement = Self::movement(
                        state,
                        movement_id,
                        MovementKind::Return,
                        &actor,
                        reservation_id,
                        Some(RESET_RETURN_NOTE.to_string()),
                        now,
                    );
                    Self::commit(state, KeyAction::KeyReturned { movement });
                }
                Self::commit(
                    state,
                    KeyAction::HoldReleased {
                        released_by: actor.id,
                        released_at: now,
                    },
                );
                SmallVec::new()
            },

            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

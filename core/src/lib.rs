//! # Condo Core
//!
//! Core traits and types for the condominium reservation engine.
//!
//! Every business rule lives in a reducer: a pure function that validates an
//! action against the current state, mutates the state in place, and returns a
//! description of the side effects to run afterwards. The imperative shell
//! (storage, locking, notification delivery) lives elsewhere.
//!
//! ## Core Concepts
//!
//! - **State**: snapshot of the resource being modified (a day's bookings for
//!   one area, or one key and its movement log)
//! - **Action**: commands (requests to change state) and events (facts)
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: side effect descriptions, executed by the runtime
//! - **Environment**: injected dependencies (clock, notifier)
//!
//! ## Example
//!
//! ```ignore
//! use condo_core::{effect::Effect, reducer::Reducer, SmallVec};
//!
//! impl Reducer for KeyCustodyReducer {
//!     type State = KeyState;
//!     type Action = KeyAction;
//!     type Environment = KeyEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut KeyState,
//!         action: KeyAction,
//!         env: &KeyEnvironment,
//!     ) -> SmallVec<[Effect<KeyAction>; 4]> {
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Effects returned by a single reducer call.
pub type Effects<Action> = SmallVec<[effect::Effect<Action>; 4]>;

/// Reducer module - the core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They are deterministic given the environment, so they are tested without
/// any I/O.
pub mod reducer {
    use super::Effects;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for ReservationReducer {
    ///     type State = ReservationState;
    ///     type Action = ReservationAction;
    ///     type Environment = ReservationEnvironment;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut ReservationState,
    ///         action: ReservationAction,
    ///         env: &ReservationEnvironment,
    ///     ) -> SmallVec<[Effect<ReservationAction>; 4]> {
    ///         match action {
    ///             ReservationAction::Approve { reservation_id, actor } => {
    ///                 // Validate, apply the event, describe notifications
    ///                 SmallVec::new()
    ///             }
    ///             _ => SmallVec::new(),
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> Effects<Self::Action>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are values returned by reducers. Nothing happens until the runtime
/// executes them, which the manager only does after the state change they
/// belong to has been persisted.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can produce (feedback loop)
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is handed back to the caller
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Wrap a future that produces no feedback action
        #[must_use]
        pub fn fire_and_forget<F>(future: F) -> Effect<Action>
        where
            F: Future<Output = ()> + Send + 'static,
        {
            Effect::Future(Box::pin(async move {
                future.await;
                None
            }))
        }

        /// Whether this effect does nothing when executed
        #[must_use]
        pub const fn is_noop(&self) -> bool {
            matches!(self, Effect::None)
        }
    }
}

/// Environment module - Dependency injection traits
pub mod environment {
    use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use condo_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;

        /// Current calendar day at the given UTC offset
        fn today(&self, offset: FixedOffset) -> NaiveDate {
            self.now().with_timezone(&offset).date_naive()
        }
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

//! Reducers holding the business rules.
//!
//! - Reservation: admission, approval, cancellation, check-in and evaluations
//!   for one area on one day
//! - Key custody: checkouts, returns and administrative holds of one key

pub mod key_custody;
pub mod reservation;

pub use key_custody::{KeyAction, KeyCustodyReducer, KeyEnvironment, KeyState};
pub use reservation::{
    ReservationAction, ReservationEnvironment, ReservationReducer, ReservationState,
};

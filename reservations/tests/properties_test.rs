//! Property tests for admission.
//!
//! Random request sequences against one area's day: whatever is admitted
//! stays pairwise disjoint, and a request is refused for a slot conflict
//! exactly when it overlaps a non-cancelled booking.
//!
//! Run with: `cargo test --test properties_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use chrono::{FixedOffset, NaiveDate, NaiveTime};
use condo_core::reducer::Reducer;
use condo_reservations::aggregates::{ReservationAction, ReservationEnvironment, ReservationReducer, ReservationState};
use condo_reservations::{
    Actor, AdmissionRequest, Area, CondominiumId, LogNotifier, Money, Protocol, Rejection,
    ReservationId, TimeWindow, UserId,
};
use condo_testing::test_clock;
use proptest::prelude::*;
use proptest::test_runner::Config;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Step {
    /// Book `[start, start + length)` in quarter hours
    Book { start: u32, length: u32 },
    /// Cancel the n-th admitted booking, if any
    Cancel(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0_u32..92, 1_u32..12).prop_map(|(start, length)| Step::Book { start, length }),
        1 => any::<usize>().prop_map(Step::Cancel),
    ]
}

fn quarter(n: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(n / 4, (n % 4) * 15, 0).unwrap()
}

fn window(start: u32, length: u32) -> Option<(NaiveTime, NaiveTime)> {
    let end = start + length;
    (end < 96).then(|| (quarter(start), quarter(end)))
}

fn protocol(n: usize) -> Protocol {
    Protocol::parse(&format!("P{n:05}")).unwrap()
}

fn env() -> ReservationEnvironment {
    ReservationEnvironment::new(
        Arc::new(test_clock()),
        Arc::new(LogNotifier),
        FixedOffset::west_opt(3 * 3600).unwrap(),
    )
}

proptest! {
    #![proptest_config(Config::with_cases(128))]
    #[test]
    fn admitted_bookings_never_overlap(steps in prop::collection::vec(step(), 1..40)) {
        let condominium = CondominiumId::new();
        let area = Area::new(condominium, "Quadra", 10, Money::ZERO, true);
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let admin = Actor::administrator(UserId::new());
        let reducer = ReservationReducer::new();
        let env = env();
        let mut state = ReservationState::new(area.clone(), date);
        let mut admitted: Vec<ReservationId> = Vec::new();

        for (n, step) in steps.into_iter().enumerate() {
            match step {
                Step::Book { start, length } => {
                    let Some((start, end)) = window(start, length) else { continue };
                    let requested = TimeWindow::new(start, end).unwrap();
                    let expected_conflict = state
                        .reservations
                        .iter()
                        .any(|r| r.conflicts_with(&requested));

                    let reservation_id = ReservationId::new();
                    let _ = reducer.reduce(
                        &mut state,
                        ReservationAction::Admit {
                            reservation_id,
                            protocol: protocol(n),
                            request: AdmissionRequest {
                                area_id: area.id,
                                date,
                                start,
                                end,
                                requester_id: UserId::new(),
                                condominium_id: condominium,
                            },
                        },
                        &env,
                    );

                    let conflicted = matches!(state.last_error, Some(Rejection::SlotConflict { .. }));
                    prop_assert_eq!(conflicted, expected_conflict);
                    if state.last_error.is_none() {
                        admitted.push(reservation_id);
                    }
                },
                Step::Cancel(index) => {
                    if admitted.is_empty() {
                        continue;
                    }
                    let reservation_id = admitted[index % admitted.len()];
                    let action = ReservationAction::Cancel {
                        reservation_id,
                        actor: admin.clone(),
                        reason: None,
                    };
                    let _ = reducer.reduce(&mut state, action, &env);
                },
            }

            let blocking: Vec<_> = state
                .reservations
                .iter()
                .filter(|r| r.status.blocks_slot())
                .collect();
            for (i, a) in blocking.iter().enumerate() {
                for b in &blocking[i + 1..] {
                    prop_assert!(!a.window.overlaps(&b.window), "{} overlaps {}", a.window, b.window);
                }
            }
        }
    }
}

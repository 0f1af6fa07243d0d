//! Walkthrough of the reservation engine against in-memory storage.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info,condo_reservations=debug cargo run --bin condo-demo
//! ```
//!
//! Books the pool, approves and uses the booking, evaluates it, then passes
//! the party room key between two residents. Prints the Prometheus metrics
//! at the end.

use anyhow::Context;
use chrono::{Duration, NaiveTime};
use condo_core::environment::{Clock, SystemClock};
use condo_reservations::{
    Actor, AdmissionRequest, Area, CondominiumId, Config, EvaluationPayload, InMemoryStorage,
    KeyAsset, Money, Period, RecordingNotifier, ReservationManager, TimeWindow, TransitionAction,
    UserId,
};
use condo_runtime::metrics::MetricsRecorder;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn at(hour: u32) -> anyhow::Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, 0, 0).context("hour out of range")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let recorder = MetricsRecorder::install()?;

    tracing::info!("=== Condo Reservations Demo ===");

    // Setup
    let condominium = CondominiumId::new();
    let storage = Arc::new(InMemoryStorage::new());
    let pool = Area::new(condominium, "Piscina", 30, Money::ZERO, false)
        .with_operating_hours(TimeWindow::new(at(8)?, at(22)?)?);
    let party_room = Area::new(condominium, "Salão de Festas", 80, Money::from_reais(250), true);
    let key = KeyAsset::new(party_room.id, "K1");
    storage.add_area(pool.clone());
    storage.add_area(party_room.clone());
    storage.add_key(key.clone());

    let notifier = Arc::new(RecordingNotifier::new());
    let manager = ReservationManager::builder(Arc::clone(&storage))
        .config(config.service.clone())
        .notifier(notifier.clone())
        .build()?;

    let resident = Actor::resident(UserId::new());
    let neighbour = Actor::resident(UserId::new());
    let admin = Actor::administrator(UserId::new());
    let offset = config.service.utc_offset()?;
    let today = SystemClock.today(offset);

    // Pool: book, approve, use and evaluate
    let booking = manager
        .admit(AdmissionRequest {
            area_id: pool.id,
            date: today,
            start: at(10)?,
            end: at(12)?,
            requester_id: resident.id,
            condominium_id: condominium,
        })
        .await?;
    tracing::info!(protocol = %booking.protocol, status = %booking.status, "pool booked");

    let overlapping = manager
        .admit(AdmissionRequest {
            area_id: pool.id,
            date: today,
            start: at(11)?,
            end: at(13)?,
            requester_id: neighbour.id,
            condominium_id: condominium,
        })
        .await;
    if let Err(error) = overlapping {
        tracing::info!(%error, "overlapping booking refused");
    }

    manager
        .transition(booking.id, TransitionAction::Approve, &admin)
        .await?;
    let used = manager
        .check_in_by_protocol(&booking.protocol.as_str().to_lowercase(), &admin)
        .await?;
    tracing::info!(status = %used.status, "checked in");

    let evaluation = manager
        .submit_evaluation(
            booking.id,
            &resident,
            EvaluationPayload {
                overall: 4,
                cleanliness: Some(5),
                comment: Some("Água ótima".to_string()),
                recommend: true,
                public: true,
                ..EvaluationPayload::default()
            },
        )
        .await?;
    manager
        .respond_to_evaluation(booking.id, &admin, "Obrigado!".to_string())
        .await?;
    tracing::info!(overall = evaluation.overall.value(), "evaluation recorded");

    // Party room key: João takes it, Maria has to wait
    let tomorrow = today + Duration::days(1);
    let party = manager
        .admit(AdmissionRequest {
            area_id: party_room.id,
            date: tomorrow,
            start: at(18)?,
            end: at(23)?,
            requester_id: resident.id,
            condominium_id: condominium,
        })
        .await?;

    manager
        .checkout(key.id, &resident, Some(party.id), Some("João".to_string()))
        .await?;
    if let Err(error) = manager.checkout(key.id, &neighbour, None, None).await {
        tracing::info!(%error, "second checkout refused");
    }
    manager.checkin(key.id, &resident, None).await?;
    manager.checkout(key.id, &neighbour, None, Some("Maria".to_string())).await?;
    tracing::info!(
        status = %manager.key_status(key.id).await?,
        movements = manager.key_history(key.id).await?.len(),
        "key custody"
    );

    // Reports
    for report in manager.period_report(Period::new(today, tomorrow)).await? {
        tracing::info!(
            area = %report.area_name,
            total = report.counts.total(),
            revenue = %report.revenue,
            occupancy = report.occupancy_rate(),
            "area report"
        );
    }
    tracing::info!(sent = notifier.sent().len(), "notifications");

    println!("{}", recorder.render());
    Ok(())
}

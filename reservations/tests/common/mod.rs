//! Shared fixtures for the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use condo_reservations::{
    Actor, AdmissionRequest, Area, CondominiumId, InMemoryStorage, KeyAsset, Money, Protocol,
    RecordingNotifier, ReservationManager, ScriptedProtocols, ServiceConfig, TimeWindow, UserId,
};
use condo_testing::ManualClock;
use std::sync::Arc;

/// Noon in Brasília (15:00 UTC) on `date`
pub fn local_noon(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(15, 0, 0).unwrap())
}

pub fn day(year: i32, month: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, d).unwrap()
}

pub fn at(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
}

/// A condominium with a pool (approval required, 08:00-22:00), a barbecue
/// area (auto-confirmed, paid) and a party room key.
pub struct Condo {
    pub manager: Arc<ReservationManager>,
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub protocols: Arc<ScriptedProtocols>,
    pub condominium: CondominiumId,
    pub pool: Area,
    pub barbecue: Area,
    pub party_room: Area,
    pub key: KeyAsset,
    pub admin: Actor,
}

impl Condo {
    pub fn new(today: NaiveDate) -> Self {
        let condominium = CondominiumId::new();
        let pool = Area::new(condominium, "Piscina", 30, Money::ZERO, false)
            .with_operating_hours(TimeWindow::new(at(8, 0), at(22, 0)).unwrap());
        let barbecue = Area::new(condominium, "Churrasqueira", 20, Money::from_reais(80), true);
        let party_room = Area::new(condominium, "Salão de Festas", 80, Money::from_reais(250), true);
        let key = KeyAsset::new(party_room.id, "K1");

        let storage = Arc::new(InMemoryStorage::new());
        storage.add_area(pool.clone());
        storage.add_area(barbecue.clone());
        storage.add_area(party_room.clone());
        storage.add_key(key.clone());

        let clock = Arc::new(ManualClock::new(local_noon(today)));
        let notifier = Arc::new(RecordingNotifier::new());
        let protocols = Arc::new(ScriptedProtocols::new(Vec::new()));

        let manager = ReservationManager::builder(Arc::clone(&storage))
            .clock(clock.clone())
            .notifier(notifier.clone())
            .protocols(protocols.clone())
            .config(ServiceConfig::default())
            .build()
            .unwrap();

        Self {
            manager: Arc::new(manager),
            storage,
            clock,
            notifier,
            protocols,
            condominium,
            pool,
            barbecue,
            party_room,
            key,
            admin: Actor::administrator(UserId::new()),
        }
    }

    pub fn request(
        &self,
        area: &Area,
        requester: &Actor,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> AdmissionRequest {
        AdmissionRequest {
            area_id: area.id,
            date,
            start,
            end,
            requester_id: requester.id,
            condominium_id: self.condominium,
        }
    }

    /// Make the next admission use `protocol`
    pub fn next_protocol(&self, protocol: &str) {
        self.protocols.push(Protocol::parse(protocol).unwrap());
    }

    /// Move the clock to local noon of `date`
    pub fn travel_to(&self, date: NaiveDate) {
        self.clock.set(local_noon(date));
    }
}

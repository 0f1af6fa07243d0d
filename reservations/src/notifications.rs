//! Outbound notifications.
//!
//! Reducers describe notifications as effects; the manager runs those effects
//! only after the change they announce has been committed. Delivery itself
//! (push, e-mail, WhatsApp) belongs to whoever implements [`Notifier`].

use crate::protocol::Protocol;
use crate::types::UserId;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Who a notification is for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single user
    User(UserId),
    /// Every administrator of the condominium
    Administrators,
}

/// Something worth telling a person about
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A booking is waiting for approval
    AwaitingApproval {
        /// Booking reference
        protocol: Protocol,
        /// Area name
        area: String,
        /// Booking date
        date: NaiveDate,
    },
    /// A booking was confirmed
    ReservationConfirmed {
        /// Requester
        requester_id: UserId,
        /// Booking reference
        protocol: Protocol,
        /// Area name
        area: String,
        /// Booking date
        date: NaiveDate,
    },
    /// A booking was cancelled by someone other than the recipient
    ReservationCancelled {
        /// Who is told
        recipient: Recipient,
        /// Booking reference
        protocol: Protocol,
        /// Cancellation reason
        reason: Option<String>,
    },
    /// A resident reported a problem in their evaluation
    ProblemReported {
        /// Booking reference
        protocol: Protocol,
        /// Area name
        area: String,
        /// What went wrong
        description: String,
    },
    /// An administrator answered an evaluation
    EvaluationAnswered {
        /// Resident who wrote the evaluation
        requester_id: UserId,
        /// Booking reference
        protocol: Protocol,
    },
}

impl Notification {
    /// Who should receive the notification
    #[must_use]
    pub fn recipient(&self) -> Recipient {
        match self {
            Self::AwaitingApproval { .. } | Self::ProblemReported { .. } => {
                Recipient::Administrators
            },
            Self::ReservationConfirmed { requester_id, .. }
            | Self::EvaluationAnswered { requester_id, .. } => Recipient::User(*requester_id),
            Self::ReservationCancelled { recipient, .. } => recipient.clone(),
        }
    }

    /// Booking the notification refers to
    #[must_use]
    pub const fn protocol(&self) -> &Protocol {
        match self {
            Self::AwaitingApproval { protocol, .. }
            | Self::ReservationConfirmed { protocol, .. }
            | Self::ReservationCancelled { protocol, .. }
            | Self::ProblemReported { protocol, .. }
            | Self::EvaluationAnswered { protocol, .. } => protocol,
        }
    }
}

/// Delivers notifications
pub trait Notifier: Send + Sync {
    /// Deliver one notification. Failures are the notifier's to handle.
    fn notify(&self, notification: Notification) -> BoxFuture<'_, ()>;
}

/// Notifier that only writes a log line
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!(
                recipient = ?notification.recipient(),
                protocol = %notification.protocol(),
                ?notification,
                "notification"
            );
        })
    }
}

/// Notifier that keeps everything it is given, for inspection
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications delivered so far, oldest first
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, ()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
        Box::pin(async {})
    }
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn notify(&self, notification: Notification) -> BoxFuture<'_, ()> {
        (**self).notify(notification)
    }
}

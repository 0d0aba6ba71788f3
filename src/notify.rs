use std::sync::Arc;

use bson::oid::ObjectId;

use crate::api::v1::lifecycle::ParcelStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ParcelCreated {
        tracking_id: String,
        sender_id: ObjectId,
    },
    StatusUpdated {
        tracking_id: String,
        sender_id: ObjectId,
        status: ParcelStatus,
        delayed: bool,
    },
    DeliveryOtpIssued {
        tracking_id: String,
        sender_id: ObjectId,
        code: String,
    },
    TamperAlertRaised {
        tracking_id: String,
        alert_id: ObjectId,
    },
}

#[axum::async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: Notification);
}

pub type DynNotifier = Arc<dyn Notifier>;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[axum::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        match notification {
            Notification::ParcelCreated {
                tracking_id,
                sender_id,
            } => tracing::info!(%tracking_id, %sender_id, "parcel created"),
            Notification::StatusUpdated {
                tracking_id,
                sender_id,
                status,
                delayed,
            } => tracing::info!(%tracking_id, %sender_id, %status, delayed, "parcel status updated"),
            Notification::DeliveryOtpIssued {
                tracking_id,
                sender_id,
                code,
            } => {
                tracing::info!(%tracking_id, %sender_id, "delivery otp issued");
                tracing::debug!(%tracking_id, %code, "delivery otp code");
            }
            Notification::TamperAlertRaised {
                tracking_id,
                alert_id,
            } => tracing::warn!(%tracking_id, %alert_id, "tamper alert raised"),
        }
    }
}

#[cfg(test)]
pub use recording::RecordingNotifier;

#[cfg(test)]
mod recording {
    use tokio::sync::Mutex;

    use super::{Notification, Notifier};

    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub async fn sent(&self) -> Vec<Notification> {
            self.sent.lock().await.clone()
        }

        pub async fn otp_for(&self, tracking_id: &str) -> Option<String> {
            self.sent
                .lock()
                .await
                .iter()
                .rev()
                .find_map(|it| match it {
                    Notification::DeliveryOtpIssued {
                        tracking_id: sent_to,
                        code,
                        ..
                    } if sent_to == tracking_id => Some(code.clone()),
                    _ => None,
                })
        }
    }

    #[axum::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) {
            self.sent.lock().await.push(notification);
        }
    }
}

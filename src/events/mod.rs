use crate::entities::alert::{AlertPriority, AlertType};
use crate::entities::deposit::DepositState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event after a committed write. The write already happened,
    /// so a closed channel is only worth a warning.
    pub async fn publish(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Domain events emitted by the deposit and alert services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    DepositCreated {
        deposit_id: Uuid,
        code: String,
        state: DepositState,
    },
    DepositUpdated {
        deposit_id: Uuid,
        changes: Vec<String>,
    },
    DepositExpirationExtended {
        deposit_id: Uuid,
        previous: Option<DateTime<Utc>>,
        extended_to: DateTime<Utc>,
    },
    DepositInvoiced {
        deposit_id: Uuid,
        invoice_ref: String,
    },
    DepositRetired {
        deposit_id: Uuid,
        alerts_resolved: u64,
    },
    AlertRaised {
        alert_id: Uuid,
        alert_type: AlertType,
        priority: AlertPriority,
        deposit_id: Option<Uuid>,
    },
    AlertsResolved {
        count: u64,
        note: String,
    },
    SweepCompleted {
        expiration_alerts_created: u64,
        high_value_alerts_created: u64,
        errors: usize,
        cancelled: bool,
    },
}

/// Drains the event channel, logging every event until all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::AlertRaised {
                alert_id,
                alert_type,
                priority,
                deposit_id,
            } => {
                info!(%alert_id, ?alert_type, ?priority, ?deposit_id, "alert raised");
            }
            Event::SweepCompleted {
                expiration_alerts_created,
                high_value_alerts_created,
                errors,
                cancelled,
            } => {
                info!(
                    expiration_alerts_created,
                    high_value_alerts_created, errors, cancelled, "sweep completed"
                );
            }
            other => debug!("Received event: {:?}", other),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender
            .send(Event::AlertsResolved {
                count: 1,
                note: "x".into()
            })
            .await
            .is_err());
        sender
            .publish(Event::AlertsResolved {
                count: 1,
                note: "x".into(),
            })
            .await;
    }
}

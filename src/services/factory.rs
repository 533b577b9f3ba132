use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        alerts::AlertEngine,
        deposits::DepositService,
        directory::DirectoryService,
        movements::MovementLedger,
        sequence::SequenceAllocator,
        sweep::{ReconciliationSweep, SweepSettings},
    },
};

/// Every service the binaries need, sharing one pool and one event channel.
#[derive(Clone)]
pub struct AppServices {
    pub sequences: Arc<SequenceAllocator>,
    pub directory: Arc<DirectoryService>,
    pub movements: Arc<MovementLedger>,
    pub alerts: Arc<AlertEngine>,
    pub deposits: Arc<DepositService>,
    pub sweep: Arc<ReconciliationSweep>,
}

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    expiry_window_days: i64,
    sweep_settings: SweepSettings,
}

impl ServiceFactory {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, config: &AppConfig) -> Self {
        Self {
            db_pool,
            event_sender,
            expiry_window_days: config.expiry_window_days,
            sweep_settings: SweepSettings::from(config),
        }
    }

    pub fn alert_engine(&self) -> AlertEngine {
        AlertEngine::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.expiry_window_days,
        )
    }

    pub fn deposit_service(&self, alerts: Arc<AlertEngine>) -> DepositService {
        DepositService::new(self.db_pool.clone(), self.event_sender.clone(), alerts)
    }

    /// Wires the full service graph.
    pub fn build(&self) -> AppServices {
        let alerts = Arc::new(self.alert_engine());
        let deposits = Arc::new(self.deposit_service(alerts.clone()));
        let sweep = Arc::new(ReconciliationSweep::new(
            self.db_pool.clone(),
            deposits.clone(),
            alerts.clone(),
            self.event_sender.clone(),
            self.sweep_settings.clone(),
        ));

        AppServices {
            sequences: Arc::new(SequenceAllocator::new(self.db_pool.clone())),
            directory: Arc::new(DirectoryService::new(self.db_pool.clone())),
            movements: Arc::new(MovementLedger::new(self.db_pool.clone())),
            alerts,
            deposits,
            sweep,
        }
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }
}

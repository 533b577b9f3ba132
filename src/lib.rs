//! Deposit lifecycle and alerting engine.
//!
//! Tracks third-party-held inventory across client sites, derives each
//! deposit's operational state from its dates, and keeps a deduplicated set
//! of alerts in step with that state through a reconciliation sweep.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use crate::{config::AppConfig, db::DbPool, events::EventSender, services::AppServices};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: AppConfig,
    pub event_sender: Arc<EventSender>,
    pub services: AppServices,
}

impl AppState {
    pub fn new(db: Arc<DbPool>, config: AppConfig, event_sender: Arc<EventSender>) -> Self {
        let services =
            services::ServiceFactory::new(db.clone(), event_sender.clone(), &config).build();
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }
}

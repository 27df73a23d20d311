pub mod rest;
pub mod routes;

use std::sync::Arc;

use civicscan_orchestrator::{Orchestrator, ScheduleEngine};

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub schedules: Arc<ScheduleEngine>,
}

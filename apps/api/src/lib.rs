//! CV Improver backend: a paginated REST API, a task worker and a recurring-task
//! scheduler, deployed as three processes sharing one Redis queue.

pub mod config;
pub mod cv;
pub mod db;
pub mod errors;
pub mod jobs;
pub mod llm_client;
pub mod models;
pub mod pagination;
pub mod ratelimit;
pub mod routes;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod topology;

//! Background job subsystem for the CRM and site-generation backend
//!
//! Application code enqueues jobs into a shared Postgres table; independent
//! worker processes claim them under a lease, dispatch to the registered
//! handler and record the outcome. Delivery is at-least-once: handlers must
//! tolerate running more than once for the same job id.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod services;
pub mod worker;

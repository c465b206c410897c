//! Incremental CRM sync: pages through contacts, companies and meetings
//! modified since the last run and turns each record into an action.
pub mod config;
pub mod crm;
pub mod db;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod model;
pub mod normalize;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod sweep;
pub mod token;

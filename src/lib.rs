// Library exports for festdesk
// The binary and the integration tests build on these modules

pub mod backup;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod feedback;
pub mod gateway;
pub mod health;
pub mod ids;
pub mod mail;
pub mod notify;
pub mod ratelimit;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod support;

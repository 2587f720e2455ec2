pub mod control;
pub mod health;
pub mod metrics;
pub mod status;

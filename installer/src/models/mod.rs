// Domain models shared by the reconciliation engine.

pub mod health;
pub mod ports;
pub mod secrets;
pub mod state;
pub mod volumes;

pub mod compensator;
pub mod config;
pub mod demod;
pub mod devices;
pub mod error;
pub mod events;
pub mod lock;
pub mod scan;
pub mod scheduler;
pub mod servo;
pub mod sim;
pub mod status;
pub mod telemetry;
pub mod traits;

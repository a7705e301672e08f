pub mod amount;
pub mod auth;
pub mod bank;
pub mod clock;
pub mod config;
pub mod credential;
pub mod csv;
pub mod engine;
pub mod identity;
pub mod model;
pub mod notify;
pub mod report;
pub mod service;
pub mod store;

pub use amount::Amount;
pub use bank::{Bank, BankError, Command, Outcome};
pub use config::BankConfig;
pub use engine::{EngineError, TransferEngine, TransferRequest};

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub mod checkout;
pub mod config;
pub mod decomposition;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod payment;
pub mod retry;
pub mod schema;
pub mod state_machine;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{OrchestrationError, Result};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

//! Session registry: models and persistence.

mod models;
mod repository;

pub use models::{Session, SessionStatus};
pub use repository::SessionRegistry;

//! Messaging sync core for a Strapi-backed intranet: conversation polling,
//! read-state reconciliation, push-token registration and push
//! notification dedup.

pub mod backend;
pub mod error;
pub mod model;
pub mod notify;
pub mod session;
pub mod settings;
pub mod strapi;
pub mod sync;

pub use backend::{MessagingBackend, ReadPass};
pub use error::{ApiError, Result};
pub use session::{MessagingSession, SessionConfig};
pub use settings::Settings;

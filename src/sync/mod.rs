pub mod feed;
pub mod poller;
pub mod reconciler;
pub mod registration;

pub use feed::ConversationFeed;
pub use poller::{FeedEvent, PollOutcome, Poller, PollerConfig};
pub use reconciler::{ReadReconciler, Reconciliation};
pub use registration::{Registration, TokenRegistrar};

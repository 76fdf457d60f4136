//! Push notification handling: payload contract, dedup and dispatch.

pub mod dispatcher;
pub mod local;
pub mod payload;
pub mod seen;

pub use dispatcher::{
    Channel, ClickTarget, ClientChannel, Dispatch, Navigator, NotificationDispatcher,
    NotificationTray,
};
pub use local::{BroadcastClients, MemoryTray};
pub use payload::{ClientEnvelope, NotificationOptions, PushNotification, PushPayload};
pub use seen::SeenKeys;

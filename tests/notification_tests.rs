//! Push notification dedup across the foreground and background channels,
//! and click routing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use intranet_messaging::error::{ApiError, Result};
use intranet_messaging::model::ConversationId;
use intranet_messaging::notify::{
    BroadcastClients, Channel, ClickTarget, ClientEnvelope, Dispatch, MemoryTray, Navigator,
    NotificationDispatcher, NotificationOptions, NotificationTray, PushPayload,
};

fn payload(value: serde_json::Value) -> PushPayload {
    serde_json::from_value(value).unwrap()
}

fn tagged(tag: &str) -> PushPayload {
    payload(json!({
        "notification": { "title": "Ana", "body": "Lunch?", "tag": tag },
        "data": { "conversationId": "10" }
    }))
}

fn dispatcher(tray: Arc<MemoryTray>) -> (NotificationDispatcher, Arc<BroadcastClients>) {
    let clients = Arc::new(BroadcastClients::new(16));
    (NotificationDispatcher::new(50, tray, clients.clone()), clients)
}

#[derive(Default)]
struct RecordingNavigator {
    visits: Mutex<Vec<ClickTarget>>,
}

#[async_trait]
impl Navigator for RecordingNavigator {
    async fn open_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.visits
            .lock()
            .unwrap()
            .push(ClickTarget::Conversation(conversation));
        Ok(())
    }

    async fn open_route(&self, route: &str) -> Result<()> {
        self.visits
            .lock()
            .unwrap()
            .push(ClickTarget::Route(route.to_string()));
        Ok(())
    }

    async fn open_home(&self) -> Result<()> {
        self.visits.lock().unwrap().push(ClickTarget::Home);
        Ok(())
    }
}

/// A tray whose `show` always fails with a server-style error.
struct BrokenTray;

#[async_trait]
impl NotificationTray for BrokenTray {
    async fn has_tag(&self, _tag: &str) -> Result<bool> {
        Ok(false)
    }

    async fn show(&self, _options: &NotificationOptions) -> Result<()> {
        Err(ApiError::status(StatusCode::SERVICE_UNAVAILABLE, "tray busy"))
    }
}

#[tokio::test]
async fn same_tag_is_shown_once() {
    let tray = Arc::new(MemoryTray::new(50));
    let (dispatcher, _clients) = dispatcher(tray.clone());

    let first = dispatcher.dispatch(&tagged("conv-10"), Channel::Background).await.unwrap();
    let second = dispatcher.dispatch(&tagged("conv-10"), Channel::Background).await.unwrap();

    assert_eq!(first, Dispatch::Shown { tag: "conv-10".into() });
    assert_eq!(second, Dispatch::Duplicate { tag: "conv-10".into() });
    assert_eq!(tray.shown().len(), 1);
}

#[tokio::test]
async fn foreground_and_background_delivery_share_one_cache() {
    let tray = Arc::new(MemoryTray::new(50));
    let (dispatcher, clients) = dispatcher(tray.clone());
    let mut page = clients.subscribe();

    let push = tagged("conv-10");
    let foreground = dispatcher.dispatch(&push, Channel::Foreground).await.unwrap();
    let background = dispatcher.dispatch(&push, Channel::Background).await.unwrap();

    assert!(matches!(foreground, Dispatch::Shown { .. }));
    assert!(matches!(background, Dispatch::Duplicate { .. }));
    assert_eq!(tray.shown().len(), 1);

    match page.recv().await.unwrap() {
        ClientEnvelope::ForegroundNotification { payload } => assert_eq!(payload, push),
        other => panic!("unexpected envelope {other:?}"),
    }
    assert!(page.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_deliveries_show_one_notification() {
    let tray = Arc::new(MemoryTray::new(50));
    let (dispatcher, _clients) = dispatcher(tray.clone());
    let dispatcher = Arc::new(dispatcher);

    let push = tagged("race");
    let handles: Vec<_> = [Channel::Foreground, Channel::Background]
        .into_iter()
        .map(|channel| {
            let dispatcher = Arc::clone(&dispatcher);
            let push = push.clone();
            tokio::spawn(async move { dispatcher.dispatch(&push, channel).await.unwrap() })
        })
        .collect();

    let mut shown = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), Dispatch::Shown { .. }) {
            shown += 1;
        }
    }
    assert_eq!(shown, 1);
    assert_eq!(tray.shown().len(), 1);
}

#[tokio::test]
async fn untagged_pushes_are_keyed_by_content() {
    let tray = Arc::new(MemoryTray::new(50));
    let (dispatcher, _clients) = dispatcher(tray.clone());

    let push = payload(json!({
        "notification": { "title": "HR", "body": "Payslip ready" },
        "data": { "timestamp": "2024-05-01T08:00:00Z" }
    }));
    let later = payload(json!({
        "notification": { "title": "HR", "body": "Payslip ready" },
        "data": { "timestamp": "2024-06-01T08:00:00Z" }
    }));

    assert!(matches!(
        dispatcher.dispatch(&push, Channel::Background).await.unwrap(),
        Dispatch::Shown { .. }
    ));
    assert!(matches!(
        dispatcher.dispatch(&push.clone(), Channel::Foreground).await.unwrap(),
        Dispatch::Duplicate { .. }
    ));
    assert!(matches!(
        dispatcher.dispatch(&later, Channel::Background).await.unwrap(),
        Dispatch::Shown { .. }
    ));
}

#[tokio::test]
async fn tag_already_in_tray_is_not_shown_again() {
    let tray = Arc::new(MemoryTray::new(50));
    tray.show(&tagged("conv-10").to_options()).await.unwrap();
    let (dispatcher, _clients) = dispatcher(tray.clone());

    let outcome = dispatcher.dispatch(&tagged("conv-10"), Channel::Background).await.unwrap();
    assert_eq!(outcome, Dispatch::AlreadyDisplayed { tag: "conv-10".into() });
    assert_eq!(tray.shown().len(), 1);
}

#[tokio::test]
async fn permission_refusal_disables_notifications() {
    let tray = Arc::new(MemoryTray::denied());
    let (dispatcher, _clients) = dispatcher(tray.clone());

    let first = dispatcher.dispatch(&tagged("a"), Channel::Background).await.unwrap();
    let second = dispatcher.dispatch(&tagged("b"), Channel::Background).await.unwrap();

    assert_eq!(first, Dispatch::Suppressed);
    assert_eq!(second, Dispatch::Suppressed);
    assert!(dispatcher.is_disabled());
    assert!(tray.shown().is_empty());
}

#[tokio::test]
async fn failed_show_can_be_retried() {
    let clients = Arc::new(BroadcastClients::new(4));
    let dispatcher = NotificationDispatcher::new(50, Arc::new(BrokenTray), clients);

    let err = dispatcher
        .dispatch(&tagged("conv-10"), Channel::Background)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "backend returned 503 Service Unavailable: tray busy");
    assert_eq!(dispatcher.seen_len().await, 0);
}

#[tokio::test]
async fn dedup_cache_is_bounded() {
    let tray = Arc::new(MemoryTray::new(500));
    let (dispatcher, _clients) = dispatcher(tray.clone());

    for n in 0..200 {
        dispatcher
            .dispatch(&tagged(&format!("tag-{n}")), Channel::Background)
            .await
            .unwrap();
        assert!(dispatcher.seen_len().await <= 50);
    }

    // The oldest key has been evicted, so once the tray no longer holds it
    // the notification is shown again.
    tray.dismiss("tag-0");
    let replay = dispatcher.dispatch(&tagged("tag-0"), Channel::Background).await.unwrap();
    assert!(matches!(replay, Dispatch::Shown { .. }));
}

#[tokio::test]
async fn click_opens_the_referenced_conversation() {
    let tray = Arc::new(MemoryTray::new(50));
    let (dispatcher, clients) = dispatcher(tray);
    let mut page = clients.subscribe();
    let navigator = RecordingNavigator::default();

    let options = tagged("conv-10").to_options();
    let target = dispatcher.handle_click(&options, &navigator).await.unwrap();

    assert_eq!(target, ClickTarget::Conversation(ConversationId(10)));
    assert_eq!(*navigator.visits.lock().unwrap(), vec![target]);
    match page.recv().await.unwrap() {
        ClientEnvelope::NotificationClick { notification } => assert_eq!(notification, options),
        other => panic!("unexpected envelope {other:?}"),
    }
}

#[tokio::test]
async fn click_without_conversation_falls_back_to_screen_then_home() {
    let tray = Arc::new(MemoryTray::new(50));
    let (dispatcher, _clients) = dispatcher(tray);
    let navigator = RecordingNavigator::default();

    let routed = payload(json!({
        "notification": { "title": "Leave", "tag": "leave-1" },
        "data": { "screen": "LeaveRequests" }
    }))
    .to_options();
    let bare = payload(json!({ "notification": { "title": "Hello", "tag": "hello" } })).to_options();

    dispatcher.handle_click(&routed, &navigator).await.unwrap();
    dispatcher.handle_click(&bare, &navigator).await.unwrap();

    assert_eq!(
        *navigator.visits.lock().unwrap(),
        vec![ClickTarget::Route("LeaveRequests".into()), ClickTarget::Home]
    );
}

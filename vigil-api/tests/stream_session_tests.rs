//! Notification stream session tests.
//!
//! Each test drives a full session through the in-process channel
//! transport against mock stores and the in-memory bus.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vigil_api::{
    channel_transport, ApiResult, AuthConfig, ErrorCode, NotificationStreamer, RequestContext,
    SessionEnd, StreamConfig, UserInfoConfig, UserInfoRetriever,
};
use vigil_api::stream::transport::ClientHandle;
use vigil_cache::CacheConfig;
use vigil_core::subject::{job_grade_subject, user_info_subject, user_subject, SYSTEM_SUBJECT};
use vigil_core::{EnvelopeData, StreamRequest, StreamResponse, Topic, UserAccountKey};
use vigil_events::{EventBus, InMemoryEventBus};
use vigil_test_utils::assertions::{assert_auth_failure, assert_error_code};
use vigil_test_utils::fixtures::{
    auth_config, notification_payload, read_count_payload, session_token, user_row,
};
use vigil_test_utils::{MockNotificationStore, MockUserStore};

const WAIT: Duration = Duration::from_secs(2);
const ACCOUNT: u64 = 1;
const USER: i32 = 5;

struct Harness {
    store: Arc<MockUserStore>,
    notifications: Arc<MockNotificationStore>,
    bus: Arc<InMemoryEventBus>,
    retriever: Arc<UserInfoRetriever>,
    auth: AuthConfig,
    streamer: NotificationStreamer,
}

impl Harness {
    fn new(stream: StreamConfig) -> ApiResult<Self> {
        Self::with_auth(stream, auth_config())
    }

    fn with_auth(stream: StreamConfig, auth: AuthConfig) -> ApiResult<Self> {
        let store = Arc::new(MockUserStore::new().with_user(user_row(ACCOUNT, USER, "police", 2)));
        let notifications = Arc::new(MockNotificationStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let retriever = Arc::new(UserInfoRetriever::new(
            store.clone(),
            &UserInfoConfig::default(),
            &CacheConfig::default(),
        )?);
        let streamer = NotificationStreamer::new(
            retriever.clone(),
            notifications.clone(),
            bus.clone(),
            auth.clone(),
            stream,
        );
        Ok(Self {
            store,
            notifications,
            bus,
            retriever,
            auth,
            streamer,
        })
    }

    fn token(&self) -> ApiResult<String> {
        Ok(format!("Bearer {}", session_token(&self.auth, ACCOUNT, USER)?))
    }

    /// Start a session and return the client side plus the session task.
    fn open(&self, ctx: RequestContext) -> (ClientHandle, JoinHandle<ApiResult<SessionEnd>>) {
        let (source, sink, client) = channel_transport(16);
        let streamer = self.streamer.clone();
        let task = tokio::spawn(async move {
            streamer.stream(ctx, Box::new(source), Box::new(sink)).await
        });
        (client, task)
    }

    /// Wait until the session's consumer is registered on the bus.
    async fn wait_for_consumers(&self, count: usize) {
        for _ in 0..200 {
            if self.bus.consumer_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Expected {} consumer(s), found {}", count, self.bus.consumer_count());
    }

    fn forget_cached_user(&self) {
        self.retriever.cache().delete(&UserAccountKey::new(USER, ACCOUNT));
    }
}

fn fast_revalidation() -> StreamConfig {
    StreamConfig::default()
        .with_revalidate_interval(Duration::from_millis(40))
        .with_fetch_wait(Duration::from_millis(20))
}

async fn finish(task: JoinHandle<ApiResult<SessionEnd>>) -> ApiResult<SessionEnd> {
    match tokio::time::timeout(WAIT, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => panic!("Session task panicked: {}", e),
        Err(_) => panic!("Session did not finish in time"),
    }
}

// ============================================================================
// INIT PHASE
// ============================================================================

#[tokio::test]
async fn test_session_sends_initial_unread_count() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    harness.notifications.set_unread(USER, 3);

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    assert_eq!(client.recv_timeout(WAIT).await, Some(StreamResponse::count(3)));

    client.close();
    assert_eq!(finish(task).await?, SessionEnd::ClientClosed);
    Ok(())
}

#[tokio::test]
async fn test_missing_token_rejected() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    let (mut client, task) = harness.open(RequestContext::new(""));

    let result = finish(task).await;
    assert_auth_failure(&result);
    assert_eq!(client.recv_timeout(Duration::from_millis(50)).await, None);
    Ok(())
}

#[tokio::test]
async fn test_unknown_user_rejected() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    let token = format!("Bearer {}", session_token(&harness.auth, ACCOUNT, 99)?);

    let (_client, task) = harness.open(RequestContext::new(token));
    assert_error_code(&finish(task).await, ErrorCode::Unauthorized);
    Ok(())
}

#[tokio::test]
async fn test_disabled_user_rejected() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    harness.store.update_user(ACCOUNT, USER, |row| row.enabled = false);

    let (_client, task) = harness.open(RequestContext::new(harness.token()?));
    assert_error_code(&finish(task).await, ErrorCode::Unauthorized);
    assert_eq!(harness.bus.consumer_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_token_near_expiry_gets_refresh_directive() -> ApiResult<()> {
    let mut auth = auth_config();
    auth.jwt_expiration_secs = 120;
    let harness = Harness::with_auth(StreamConfig::default(), auth)?;
    harness.notifications.set_unread(USER, 2);

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    assert_eq!(client.recv_timeout(WAIT).await, Some(StreamResponse::refresh(2)));
    assert_eq!(finish(task).await?, SessionEnd::Restart);
    assert_eq!(harness.bus.consumer_count(), 0);
    Ok(())
}

// ============================================================================
// ACTIVE PHASE
// ============================================================================

#[tokio::test]
async fn test_notifications_update_counter() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    harness.notifications.set_unread(USER, 1);

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    assert_eq!(client.recv_timeout(WAIT).await, Some(StreamResponse::count(1)));
    harness.wait_for_consumers(1).await;

    harness
        .bus
        .publish(&user_subject(USER), notification_payload(10, "Fine issued"))
        .await?;
    let envelope = client.recv_timeout(WAIT).await;
    assert!(matches!(
        envelope,
        Some(StreamResponse {
            notification_count: 2,
            topic: Some(Topic::User),
            data: Some(EnvelopeData::Notification(ref n)),
            ..
        }) if n.id == 10
    ));

    harness
        .bus
        .publish(SYSTEM_SUBJECT, notification_payload(11, "Maintenance"))
        .await?;
    let envelope = client.recv_timeout(WAIT).await;
    assert_eq!(envelope.map(|e| (e.notification_count, e.topic)), Some((3, Some(Topic::System))));

    client.close();
    assert_eq!(finish(task).await?, SessionEnd::ClientClosed);
    Ok(())
}

#[tokio::test]
async fn test_read_count_never_goes_negative() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    harness.notifications.set_unread(USER, 2);

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;
    harness.wait_for_consumers(1).await;

    harness
        .bus
        .publish(&user_subject(USER), read_count_payload(10))
        .await?;
    let envelope = client.recv_timeout(WAIT).await;
    assert!(matches!(
        envelope,
        Some(StreamResponse {
            notification_count: 0,
            data: Some(EnvelopeData::NotificationsReadCount(10)),
            ..
        })
    ));

    client.close();
    finish(task).await?;
    Ok(())
}

#[tokio::test]
async fn test_events_outside_interest_set_ignored() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;
    harness.wait_for_consumers(1).await;

    // Another user and a grade above the user's own.
    harness
        .bus
        .publish(&user_subject(USER + 1), notification_payload(1, "Not yours"))
        .await?;
    harness
        .bus
        .publish(&job_grade_subject("police", 3), notification_payload(2, "Too senior"))
        .await?;
    harness
        .bus
        .publish(&job_grade_subject("police", 1), notification_payload(3, "Briefing"))
        .await?;

    let envelope = client.recv_timeout(WAIT).await;
    assert!(matches!(
        envelope,
        Some(StreamResponse {
            topic: Some(Topic::JobGrade),
            data: Some(EnvelopeData::Notification(ref n)),
            ..
        }) if n.id == 3
    ));

    client.close();
    finish(task).await?;
    Ok(())
}

#[tokio::test]
async fn test_user_info_change_forwarded() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;
    harness.wait_for_consumers(1).await;

    let change = serde_json::json!({
        "account_id": ACCOUNT,
        "user_id": USER,
        "old_job": "police",
        "new_job": "police",
        "old_job_grade": 2,
        "new_job_grade": 2,
        "changed_at": "2024-01-01T00:00:00Z",
    });
    harness
        .bus
        .publish(&user_info_subject(USER), serde_json::to_vec(&change)?)
        .await?;

    let envelope = client.recv_timeout(WAIT).await;
    assert!(matches!(
        envelope,
        Some(StreamResponse {
            topic: Some(Topic::UserInfo),
            data: Some(EnvelopeData::UserInfoChanged(_)),
            ..
        })
    ));

    client.close();
    finish(task).await?;
    Ok(())
}

#[tokio::test]
async fn test_client_control_messages_keep_session_open() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;

    assert!(client.send(StreamRequest::Ping).await);
    assert!(
        client
            .send(StreamRequest::Focus {
                page: "mailbox".to_string()
            })
            .await
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!task.is_finished());

    client.close();
    assert_eq!(finish(task).await?, SessionEnd::ClientClosed);
    Ok(())
}

#[tokio::test]
async fn test_client_close_removes_consumer() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;
    harness.wait_for_consumers(1).await;

    client.close();
    assert_eq!(finish(task).await?, SessionEnd::ClientClosed);
    assert_eq!(harness.bus.consumer_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_context_cancel_ends_session() -> ApiResult<()> {
    let harness = Harness::new(StreamConfig::default())?;
    let cancel = CancellationToken::new();
    let ctx = RequestContext::new(harness.token()?).with_cancel(cancel.clone());

    let (mut client, task) = harness.open(ctx);
    client.recv_timeout(WAIT).await;
    harness.wait_for_consumers(1).await;

    cancel.cancel();
    assert_eq!(finish(task).await?, SessionEnd::Cancelled);
    assert_eq!(harness.bus.consumer_count(), 0);
    Ok(())
}

// ============================================================================
// REVALIDATION
// ============================================================================

#[tokio::test]
async fn test_material_change_restarts_session() -> ApiResult<()> {
    let harness = Harness::new(fast_revalidation())?;
    harness.notifications.set_unread(USER, 4);

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    assert_eq!(client.recv_timeout(WAIT).await, Some(StreamResponse::count(4)));

    harness.store.set_job(ACCOUNT, USER, "ambulance", 1);
    harness.forget_cached_user();

    let mut saw_refresh = false;
    while let Some(response) = client.recv_timeout(WAIT).await {
        if response.restart {
            assert_eq!(response.data, Some(EnvelopeData::RefreshToken(true)));
            saw_refresh = true;
            break;
        }
    }
    assert!(saw_refresh);
    assert_eq!(finish(task).await?, SessionEnd::Restart);
    Ok(())
}

#[tokio::test]
async fn test_character_switch_ends_session() -> ApiResult<()> {
    let harness = Harness::new(fast_revalidation())?;
    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;

    harness
        .store
        .update_user(ACCOUNT, USER, |row| row.last_char_id = Some(USER + 1));
    harness.forget_cached_user();

    assert_error_code(&finish(task).await, ErrorCode::CharacterLockViolation);
    Ok(())
}

#[tokio::test]
async fn test_character_switch_allowed_without_lock() -> ApiResult<()> {
    let harness = Harness::new(fast_revalidation().with_character_lock(false))?;
    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;

    harness
        .store
        .update_user(ACCOUNT, USER, |row| row.last_char_id = Some(USER + 1));
    harness.forget_cached_user();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!task.is_finished());

    client.close();
    assert_eq!(finish(task).await?, SessionEnd::ClientClosed);
    Ok(())
}

#[tokio::test]
async fn test_disabled_during_session_is_unauthorized() -> ApiResult<()> {
    let harness = Harness::new(fast_revalidation())?;
    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;

    harness.store.update_user(ACCOUNT, USER, |row| row.enabled = false);
    harness.forget_cached_user();

    assert_error_code(&finish(task).await, ErrorCode::Unauthorized);
    assert_eq!(harness.bus.consumer_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_store_outage_does_not_end_session() -> ApiResult<()> {
    let harness = Harness::new(fast_revalidation())?;
    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    client.recv_timeout(WAIT).await;

    harness.store.set_unavailable(true);
    harness.forget_cached_user();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!task.is_finished());

    client.close();
    assert_eq!(finish(task).await?, SessionEnd::ClientClosed);
    Ok(())
}

#[tokio::test]
async fn test_periodic_resync_sends_store_count() -> ApiResult<()> {
    let harness = Harness::new(fast_revalidation().with_resync_every_ticks(1))?;
    harness.notifications.set_unread(USER, 1);

    let (mut client, task) = harness.open(RequestContext::new(harness.token()?));
    assert_eq!(client.recv_timeout(WAIT).await, Some(StreamResponse::count(1)));

    harness.notifications.set_unread(USER, 7);
    let mut resynced = false;
    while let Some(response) = client.recv_timeout(WAIT).await {
        if response == StreamResponse::count(7) {
            resynced = true;
            break;
        }
    }
    assert!(resynced);

    client.close();
    finish(task).await?;
    Ok(())
}

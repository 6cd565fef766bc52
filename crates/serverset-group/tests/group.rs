//! Group protocol tests against the in-memory ensemble.
//!
//! Covers registration, idempotent cancellation, interruption cleanup,
//! watch delivery, and re-registration across session expiry.

use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use serverset_coord::{
    ChildWatch, CoordError, CoordResult, Coordinator, CreatedNode, InMemoryEnsemble, MemoryClient,
    SessionEvent, SessionState,
};
use serverset_group::*;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const PATH: &str = "/services/api";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

fn fast_config() -> GroupConfig {
    GroupConfig {
        connect_timeout: "1s".to_string(),
        operation_timeout: "1s".to_string(),
        retry_backoff: "20ms".to_string(),
        reregister_attempts: 3,
    }
}

fn group_for(client: &Arc<MemoryClient>) -> Group {
    let client: Arc<dyn Coordinator> = client.clone();
    Group::new(client, PATH, fast_config()).unwrap()
}

async fn wait_for_state(group: &Group, target: GroupState) {
    let mut state = group.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == target))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

async fn wait_for_new_member_id(membership: &Membership, old: &str) -> String {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(id) = membership.member_id().await {
                if id != old {
                    return id;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("member was not re-registered in time")
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> GroupEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no group event in time")
        .expect("listener closed")
}

async fn next_members(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> Vec<GroupMember> {
    match next_event(rx).await {
        GroupEvent::Members(members) => members,
        GroupEvent::Indeterminate => panic!("unexpected indeterminate event"),
    }
}

fn payloads(members: &[GroupMember]) -> Vec<Vec<u8>> {
    members.iter().map(|m| m.data.to_vec()).collect()
}

#[tokio::test]
async fn join_creates_member_node() {
    init_tracing();
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);
    assert_eq!(group.state(), GroupState::Watching);

    let membership = group
        .join(b"payload".to_vec(), &CancellationToken::new())
        .await
        .unwrap();

    let id = membership.member_id().await.unwrap();
    assert!(id.starts_with(MEMBER_PREFIX));
    assert_eq!(ensemble.children(PATH), vec![id.clone()]);
    assert_eq!(
        ensemble.data(&format!("{PATH}/{id}")).unwrap(),
        b"payload".to_vec()
    );
    assert_eq!(group.state(), GroupState::Joined);
    assert_eq!(group.member_ids().await.unwrap(), vec![id]);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);

    let membership = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    membership.cancel().await.unwrap();
    membership.cancel().await.unwrap();

    assert!(ensemble.children(PATH).is_empty());
    assert!(membership.member_id().await.is_none());
    assert_eq!(group.state(), GroupState::Left);
}

#[tokio::test]
async fn cancel_treats_missing_node_as_success() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let admin = ensemble.connect();
    let group = group_for(&client);

    let membership = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    let path = membership.member_path().await.unwrap();
    admin.delete(&path).await.unwrap();

    membership.cancel().await.unwrap();
    assert_eq!(group.registrations().await, 0);
}

#[tokio::test]
async fn failed_cancel_is_an_update_error_and_can_be_retried() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);
    let membership = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();

    ensemble.reject_writes(Some("acl"));
    let err = membership.cancel().await.unwrap_err();
    assert!(matches!(
        err,
        MembershipError::Update {
            cause: FailureCause::Coordination(CoordError::Rejected(_)),
            ..
        }
    ));
    assert_eq!(group.registrations().await, 1);
    assert_eq!(ensemble.children(PATH).len(), 1);

    ensemble.reject_writes(None);
    membership.cancel().await.unwrap();
    assert!(ensemble.children(PATH).is_empty());
}

#[tokio::test]
async fn rejected_join_is_a_join_error() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    client.ensure_path(PATH).await.unwrap();
    let group = group_for(&client);

    ensemble.reject_writes(Some("quota exceeded"));
    let err = group
        .join(b"a".to_vec(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MembershipError::Join {
            cause: FailureCause::Coordination(CoordError::Rejected(_)),
            ..
        }
    ));
    assert!(ensemble.children(PATH).is_empty());
    assert_eq!(group.state(), GroupState::Watching);
}

#[tokio::test]
async fn join_without_connection_times_out() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let config = GroupConfig {
        connect_timeout: "100ms".to_string(),
        ..fast_config()
    };
    let group = Group::new(client.clone(), PATH, config).unwrap();

    client.disconnect();
    wait_for_state(&group, GroupState::Reconnecting).await;

    let err = group
        .join(b"a".to_vec(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MembershipError::Join {
            cause: FailureCause::NotConnected(_),
            ..
        }
    ));
}

#[tokio::test]
async fn join_waits_for_initial_connection() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    client.disconnect();

    let group = group_for(&client);
    assert_eq!(group.state(), GroupState::Connecting);

    let joiner = {
        let group = group.clone();
        tokio::spawn(async move { group.join(b"a".to_vec(), &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.reconnect();

    let membership = joiner.await.unwrap().unwrap();
    assert!(membership.member_id().await.is_some());
    assert_eq!(group.state(), GroupState::Joined);
}

#[tokio::test(start_paused = true)]
async fn interrupted_join_leaves_no_node_behind() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect_with_latency(Duration::from_millis(200));
    let config = GroupConfig {
        operation_timeout: "5s".to_string(),
        ..fast_config()
    };
    let group = Group::new(client, PATH, config).unwrap();

    let interrupt = CancellationToken::new();
    let canceller = {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            // Lands while the member node creation is in flight.
            tokio::time::sleep(Duration::from_millis(300)).await;
            interrupt.cancel();
        })
    };

    let err = group.join(b"a".to_vec(), &interrupt).await.unwrap_err();
    assert!(matches!(err, MembershipError::Interrupted));
    canceller.await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(ensemble.children(PATH).is_empty());
    assert_eq!(group.registrations().await, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_join_future_leaves_no_node_behind() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect_with_latency(Duration::from_millis(200));
    let config = GroupConfig {
        operation_timeout: "5s".to_string(),
        ..fast_config()
    };
    let group = Group::new(client, PATH, config).unwrap();

    let interrupt = CancellationToken::new();
    let result = tokio::time::timeout(
        Duration::from_millis(300),
        group.join(b"a".to_vec(), &interrupt),
    )
    .await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(ensemble.children(PATH).is_empty());
    assert_eq!(group.registrations().await, 0);
}

#[tokio::test]
async fn interrupt_after_registration_withdraws_the_node() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);

    let interrupt = CancellationToken::new();
    let mut join = Box::pin(group.join(b"a".to_vec(), &interrupt));
    let pending = std::future::poll_fn(|cx| Poll::Ready(join.as_mut().poll(cx).is_pending())).await;
    assert!(pending);

    // The registration task hands over the membership before the caller
    // is polled again.
    while group.registrations().await == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(ensemble.children(PATH).len(), 1);

    interrupt.cancel();
    let err = join.await.unwrap_err();
    assert!(matches!(err, MembershipError::Interrupted));
    assert!(ensemble.children(PATH).is_empty());
    assert_eq!(group.registrations().await, 0);
}

/// Drops the link right after a member node is created, so the
/// acknowledgement arrives once the session is already reconnecting.
struct LinkDropsAfterCreate {
    inner: Arc<MemoryClient>,
}

#[async_trait]
impl Coordinator for LinkDropsAfterCreate {
    fn session_state(&self) -> SessionState {
        self.inner.session_state()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session_events()
    }

    async fn ensure_path(&self, path: &str) -> CoordResult<()> {
        self.inner.ensure_path(path).await
    }

    async fn create_ephemeral_sequential(
        &self,
        prefix_path: &str,
        data: &[u8],
    ) -> CoordResult<CreatedNode> {
        let node = self.inner.create_ephemeral_sequential(prefix_path, data).await?;
        self.inner.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(node)
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        self.inner.delete(path).await
    }

    async fn get_children_with_watch(
        &self,
        path: &str,
    ) -> CoordResult<(Vec<String>, ChildWatch)> {
        self.inner.get_children_with_watch(path).await
    }

    async fn get_data(&self, path: &str) -> CoordResult<Vec<u8>> {
        self.inner.get_data(path).await
    }
}

#[tokio::test]
async fn join_acknowledged_while_disconnected_stays_reconnecting() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let flaky: Arc<dyn Coordinator> = Arc::new(LinkDropsAfterCreate {
        inner: client.clone(),
    });
    let group = Group::new(flaky, PATH, fast_config()).unwrap();

    let membership = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(group.state(), GroupState::Reconnecting);

    client.reconnect();
    wait_for_state(&group, GroupState::Joined).await;
    assert_eq!(
        membership.member_id().await,
        ensemble.children(PATH).first().cloned()
    );
}

#[tokio::test]
async fn watch_delivers_initial_listing_and_every_change() {
    init_tracing();
    let ensemble = InMemoryEnsemble::new();
    let a = ensemble.connect();
    let b = ensemble.connect();
    let group_a = group_for(&a);
    let group_b = group_for(&b);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = group_a.watch(tx);
    assert!(next_members(&mut rx).await.is_empty());

    let first = group_a.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    assert_eq!(payloads(&next_members(&mut rx).await), vec![b"a".to_vec()]);

    let _second = group_b.join(b"b".to_vec(), &CancellationToken::new()).await.unwrap();
    assert_eq!(
        payloads(&next_members(&mut rx).await),
        vec![b"a".to_vec(), b"b".to_vec()]
    );

    first.cancel().await.unwrap();
    assert_eq!(payloads(&next_members(&mut rx).await), vec![b"b".to_vec()]);
}

#[tokio::test]
async fn watch_ignores_non_member_children() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let other = ensemble.connect();
    let group = group_for(&client);
    other.ensure_path(PATH).await.unwrap();
    other
        .create_ephemeral_sequential(&format!("{PATH}/lock_"), b"lock")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = group.watch(tx);
    assert!(next_members(&mut rx).await.is_empty());
    assert!(group.member_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn stopped_watch_delivers_nothing_more() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watch = group.watch(tx);
    assert!(next_members(&mut rx).await.is_empty());
    watch.stop();

    group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn expiry_re_registers_without_an_empty_listing() {
    init_tracing();
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = group.watch(tx);
    assert!(next_members(&mut rx).await.is_empty());

    let membership = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    let before = next_members(&mut rx).await;
    assert_eq!(before.len(), 1);
    let old_id = membership.member_id().await.unwrap();

    client.expire_session();
    wait_for_state(&group, GroupState::Joined).await;

    let after = next_members(&mut rx).await;
    assert_eq!(payloads(&after), vec![b"a".to_vec()]);
    assert_ne!(after[0].id, old_id);
    assert_eq!(membership.member_id().await, Some(after[0].id.clone()));
    assert_eq!(ensemble.children(PATH), vec![after[0].id.clone()]);
}

#[tokio::test]
async fn nothing_is_delivered_while_reconnecting() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = group.watch(tx);
    assert!(next_members(&mut rx).await.is_empty());
    group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    assert_eq!(next_members(&mut rx).await.len(), 1);

    client.hold_reconnect(true);
    client.expire_session();
    wait_for_state(&group, GroupState::Reconnecting).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    client.hold_reconnect(false);
    client.reconnect();
    let members = next_members(&mut rx).await;
    assert_eq!(payloads(&members), vec![b"a".to_vec()]);
}

#[tokio::test]
async fn failed_re_registration_is_indeterminate() {
    init_tracing();
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = group.watch(tx);
    assert!(next_members(&mut rx).await.is_empty());
    group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    assert_eq!(next_members(&mut rx).await.len(), 1);

    ensemble.reject_writes(Some("quota exceeded"));
    client.expire_session();
    wait_for_state(&group, GroupState::Failed).await;

    assert_eq!(next_event(&mut rx).await, GroupEvent::Indeterminate);

    ensemble.reject_writes(None);
    let err = group
        .join(b"b".to_vec(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MembershipError::Join {
            cause: FailureCause::GroupFailed,
            ..
        }
    ));
}

#[tokio::test]
async fn refused_re_registration_fails_without_exhausting_retries() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let config = GroupConfig {
        retry_backoff: "1s".to_string(),
        reregister_attempts: 10,
        ..fast_config()
    };
    let group = Group::new(client.clone(), PATH, config).unwrap();
    group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();

    ensemble.reject_writes(Some("quota exceeded"));
    client.expire_session();
    // Well inside the nine seconds of back-off that retrying would take.
    wait_for_state(&group, GroupState::Failed).await;
}

#[tokio::test(start_paused = true)]
async fn cancel_proceeds_while_members_are_re_registered() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect_with_latency(Duration::from_millis(200));
    let group = Group::new(client.clone(), PATH, fast_config()).unwrap();
    let kept = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    let dropped = group.join(b"b".to_vec(), &CancellationToken::new()).await.unwrap();

    client.expire_session();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_millis(50), dropped.cancel())
        .await
        .expect("cancel waited for re-registration")
        .unwrap();

    wait_for_state(&group, GroupState::Joined).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(group.registrations().await, 1);
    let id = kept.member_id().await.unwrap();
    assert_eq!(ensemble.children(PATH), vec![id.clone()]);
    assert_eq!(ensemble.data(&format!("{PATH}/{id}")), Some(b"a".to_vec()));
}

#[tokio::test]
async fn disconnect_without_expiry_keeps_the_member_node() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);
    let membership = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    let id = membership.member_id().await.unwrap();

    client.disconnect();
    wait_for_state(&group, GroupState::Reconnecting).await;
    client.reconnect();
    wait_for_state(&group, GroupState::Joined).await;

    assert_eq!(membership.member_id().await, Some(id.clone()));
    assert_eq!(ensemble.children(PATH), vec![id]);
}

#[tokio::test]
async fn cancel_after_expiry_skips_the_vanished_node() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);
    let membership = group.join(b"a".to_vec(), &CancellationToken::new()).await.unwrap();
    let old_id = membership.member_id().await.unwrap();

    client.expire_session();
    wait_for_new_member_id(&membership, &old_id).await;
    membership.cancel().await.unwrap();

    assert!(ensemble.children(PATH).is_empty());
    assert_eq!(group.state(), GroupState::Left);
}

#[tokio::test]
async fn closed_client_fails_the_group() {
    let ensemble = InMemoryEnsemble::new();
    let client = ensemble.connect();
    let group = group_for(&client);

    client.close();
    wait_for_state(&group, GroupState::Failed).await;
}

#[tokio::test]
async fn invalid_path_is_rejected() {
    let ensemble = InMemoryEnsemble::new();
    let client: Arc<dyn Coordinator> = ensemble.connect();
    let err = Group::new(client, "services/api/", fast_config()).unwrap_err();
    assert!(matches!(err, CoordError::InvalidPath(_)));
}

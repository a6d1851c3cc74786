use std::sync::Arc;

use futures_util::future::ready;
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::models::{Channel, GroupId};
use super::reconciler::{ResourceEvent, Snapshot, reconcile};
use super::snapshot::SnapshotState;
use crate::gateway::GatewayConnection;

/// Mirrors the voice channels of one group.
///
/// The snapshot holder outlives individual runs: a watcher can be stopped and
/// started again on a new connection while subscribers keep their receiver.
pub struct ChannelWatcher {
    group_id: GroupId,
    channels: SnapshotState<Channel>,
    /// Token of the running job. Publishing and stopping both happen under this
    /// lock, so nothing is published once `stop` returns.
    job: Mutex<Option<CancellationToken>>,
}

impl ChannelWatcher {
    pub fn new(group_id: impl Into<GroupId>) -> Self {
        Self {
            group_id: group_id.into(),
            channels: SnapshotState::new(),
            job: Mutex::new(None),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<Channel>> {
        self.channels.subscribe()
    }

    pub fn current(&self) -> Snapshot<Channel> {
        self.channels.current()
    }

    pub fn receiver_count(&self) -> usize {
        self.channels.receiver_count()
    }

    pub fn is_running(&self) -> bool {
        self.job
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Start mirroring against `conn`, replacing any previous run. The job
    /// runs under a child of `parent`.
    pub fn start(self: &Arc<Self>, conn: Arc<dyn GatewayConnection>, parent: &CancellationToken) {
        let token = parent.child_token();
        if let Some(previous) = self.job.lock().replace(token.clone()) {
            previous.cancel();
        }

        debug!(group_id = %self.group_id, "channel watcher started");
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.run(conn, token).await;
        });
    }

    /// Stop the running job and empty the snapshot.
    pub fn stop(&self) {
        let mut job = self.job.lock();
        if let Some(token) = job.take() {
            token.cancel();
            debug!(group_id = %self.group_id, "channel watcher stopped");
        }
        self.channels.clear();
    }

    async fn run(&self, conn: Arc<dyn GatewayConnection>, token: CancellationToken) {
        // Subscribe before fetching so nothing between the two is missed.
        let events = conn
            .channel_events(&self.group_id)
            .filter_map(|event| ready(voice_only(event)));

        let initial = tokio::select! {
            _ = token.cancelled() => return,
            fetched = conn.fetch_channels(&self.group_id) => match fetched {
                Ok(channels) => channels,
                Err(e) => {
                    warn!(group_id = %self.group_id, error = %e, "failed to fetch channels");
                    return;
                }
            },
        };
        let initial = initial.into_iter().filter(Channel::is_voice).collect();

        let mut snapshots = Box::pin(reconcile(initial, events));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = snapshots.next() => {
                    let Some(snapshot) = next else { break };
                    if !self.publish(&token, snapshot) {
                        break;
                    }
                }
            }
        }
    }

    fn publish(&self, token: &CancellationToken, snapshot: Snapshot<Channel>) -> bool {
        let _job = self.job.lock();
        if token.is_cancelled() {
            return false;
        }
        if self.channels.publish(snapshot) {
            debug!(group_id = %self.group_id, "channel snapshot updated");
        }
        true
    }
}

/// Restrict a channel event to voice channels. A channel that stops being a
/// voice channel leaves the set.
fn voice_only(event: ResourceEvent<Channel>) -> Option<ResourceEvent<Channel>> {
    match event {
        ResourceEvent::Create(c) if c.is_voice() => Some(ResourceEvent::Create(c)),
        ResourceEvent::Create(_) => None,
        ResourceEvent::Update(c) if c.is_voice() => Some(ResourceEvent::Update(c)),
        ResourceEvent::Update(c) => Some(ResourceEvent::Delete(c)),
        ResourceEvent::Delete(c) => Some(ResourceEvent::Delete(c)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::models::{ChannelKind, Group};
    use crate::gateway::GatewayClient;
    use crate::gateway::local::LocalGateway;

    fn names(snapshot: &Snapshot<Channel>) -> Vec<String> {
        snapshot.iter().map(|c| c.name.clone()).collect()
    }

    async fn wait_for(
        rx: &mut watch::Receiver<Snapshot<Channel>>,
        pred: impl Fn(&Snapshot<Channel>) -> bool,
    ) -> Snapshot<Channel> {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("watcher dropped")
            .clone()
    }

    fn gateway() -> LocalGateway {
        LocalGateway::new(
            vec![Group::new("g1", "Alpha")],
            vec![
                Channel::voice("v1", "Lounge", "g1"),
                Channel::text("t1", "general", "g1"),
            ],
        )
    }

    #[test]
    fn test_voice_only_filter() {
        let text = Channel::text("t1", "general", "g1");
        assert_eq!(voice_only(ResourceEvent::Create(text.clone())), None);
        assert_eq!(
            voice_only(ResourceEvent::Update(text.clone())),
            Some(ResourceEvent::Delete(text.clone()))
        );
        assert_eq!(
            voice_only(ResourceEvent::Delete(text.clone())),
            Some(ResourceEvent::Delete(text))
        );
    }

    #[tokio::test]
    async fn test_mirrors_voice_channels() {
        let gateway = gateway();
        let conn = gateway.login().await.unwrap();
        let watcher = Arc::new(ChannelWatcher::new("g1"));
        let mut rx = watcher.subscribe();

        watcher.start(conn, &CancellationToken::new());
        let snapshot = wait_for(&mut rx, |s| !s.is_empty()).await;
        assert_eq!(names(&snapshot), vec!["Lounge"]);

        gateway.upsert_channel(Channel::voice("v2", "Arcade", "g1"));
        let snapshot = wait_for(&mut rx, |s| s.len() == 2).await;
        assert_eq!(names(&snapshot), vec!["Arcade", "Lounge"]);
    }

    #[tokio::test]
    async fn test_channel_turned_text_leaves_snapshot() {
        let gateway = gateway();
        let conn = gateway.login().await.unwrap();
        let watcher = Arc::new(ChannelWatcher::new("g1"));
        let mut rx = watcher.subscribe();

        watcher.start(conn, &CancellationToken::new());
        wait_for(&mut rx, |s| s.len() == 1).await;

        gateway.upsert_channel(Channel {
            kind: ChannelKind::Text,
            ..Channel::voice("v1", "Lounge", "g1")
        });
        wait_for(&mut rx, |s| s.is_empty()).await;
    }

    #[tokio::test]
    async fn test_stop_clears_and_silences() {
        let gateway = gateway();
        let conn = gateway.login().await.unwrap();
        let watcher = Arc::new(ChannelWatcher::new("g1"));
        let mut rx = watcher.subscribe();

        watcher.start(conn, &CancellationToken::new());
        wait_for(&mut rx, |s| s.len() == 1).await;
        assert!(watcher.is_running());

        watcher.stop();
        assert!(!watcher.is_running());
        assert!(watcher.current().is_empty());

        gateway.upsert_channel(Channel::voice("v2", "Arcade", "g1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher.current().is_empty());
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_job() {
        let gateway = gateway();
        let conn = gateway.login().await.unwrap();
        let watcher = Arc::new(ChannelWatcher::new("g1"));
        let parent = CancellationToken::new();

        watcher.start(conn, &parent);
        parent.cancel();
        assert!(!watcher.is_running());
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::channel_watcher::ChannelWatcher;
use super::models::{Channel, Group, GroupId};
use super::reconciler::{Snapshot, reconcile};
use super::snapshot::SnapshotState;
use crate::gateway::GatewayConnection;

/// Mirrors the groups the bot belongs to and keeps one [`ChannelWatcher`]
/// running per known group.
///
/// Like the channel watchers, the group watcher is long-lived: the session
/// starts it on every new connection and resets it on teardown, so
/// subscribers never have to re-subscribe.
pub struct GroupWatcher {
    groups: SnapshotState<Group>,
    channel_watchers: DashMap<GroupId, Arc<ChannelWatcher>>,
    job: Mutex<Option<CancellationToken>>,
}

impl GroupWatcher {
    pub fn new() -> Self {
        Self {
            groups: SnapshotState::new(),
            channel_watchers: DashMap::new(),
            job: Mutex::new(None),
        }
    }

    pub fn subscribe_groups(&self) -> watch::Receiver<Snapshot<Group>> {
        self.groups.subscribe()
    }

    pub fn groups(&self) -> Snapshot<Group> {
        self.groups.current()
    }

    /// Subscribe to the channels of a group. A group not yet confirmed gets an
    /// idle placeholder watcher that starts once the group shows up.
    pub fn subscribe_channels(&self, group_id: &str) -> watch::Receiver<Snapshot<Channel>> {
        // Under the job lock so `apply` never sees a watcher vanish between
        // creating and starting it.
        let _job = self.job.lock();
        self.channel_watchers
            .retain(|_, watcher| watcher.is_running() || watcher.receiver_count() > 0);
        self.channel_watcher(group_id).subscribe()
    }

    pub fn channels(&self, group_id: &str) -> Snapshot<Channel> {
        self.channel_watchers
            .get(group_id)
            .map(|w| w.current())
            .unwrap_or_default()
    }

    /// Group ids whose channel watcher is currently running.
    pub fn running_channel_watchers(&self) -> Vec<GroupId> {
        let mut running: Vec<GroupId> = self
            .channel_watchers
            .iter()
            .filter(|w| w.is_running())
            .map(|w| w.key().clone())
            .collect();
        running.sort();
        running
    }

    /// Start mirroring against `conn` under a child of `parent`.
    pub fn start(self: &Arc<Self>, conn: Arc<dyn GatewayConnection>, parent: &CancellationToken) {
        let token = parent.child_token();
        if let Some(previous) = self.job.lock().replace(token.clone()) {
            previous.cancel();
        }

        info!("group watcher started");
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.run(conn, token).await;
        });
    }

    /// Stop the running job and every channel watcher, and empty all snapshots.
    pub fn reset(&self) {
        let mut job = self.job.lock();
        if let Some(token) = job.take() {
            token.cancel();
            info!("group watcher stopped");
        }
        for watcher in self.channel_watchers.iter() {
            watcher.stop();
        }
        self.groups.clear();
    }

    fn channel_watcher(&self, group_id: &str) -> Arc<ChannelWatcher> {
        self.channel_watchers
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(ChannelWatcher::new(group_id)))
            .clone()
    }

    async fn run(&self, conn: Arc<dyn GatewayConnection>, token: CancellationToken) {
        let events = conn.group_events();

        let initial = tokio::select! {
            _ = token.cancelled() => return,
            fetched = conn.fetch_groups() => match fetched {
                Ok(groups) => groups,
                Err(e) => {
                    warn!(error = %e, "failed to fetch groups");
                    return;
                }
            },
        };

        let mut known = HashSet::new();
        let mut snapshots = Box::pin(reconcile(initial, events));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = snapshots.next() => {
                    let Some(snapshot) = next else { break };
                    if !self.apply(&conn, &token, &mut known, snapshot) {
                        break;
                    }
                }
            }
        }
    }

    /// Publish a group snapshot and bring the channel watchers in line with
    /// it. Watchers of removed groups stop before the removal is published;
    /// watchers of new groups start after their group is published.
    fn apply(
        &self,
        conn: &Arc<dyn GatewayConnection>,
        token: &CancellationToken,
        known: &mut HashSet<GroupId>,
        snapshot: Snapshot<Group>,
    ) -> bool {
        let _job = self.job.lock();
        if token.is_cancelled() {
            return false;
        }

        let current: HashSet<GroupId> = snapshot.ids().map(str::to_string).collect();

        for group_id in known.difference(&current) {
            if let Some(watcher) = self.channel_watchers.get(group_id) {
                watcher.stop();
            }
            // Keep the entry while someone still listens for the group.
            self.channel_watchers
                .remove_if(group_id, |_, w| w.receiver_count() == 0);
            info!(%group_id, "group removed");
        }

        self.groups.publish(snapshot);

        for group_id in current.difference(known) {
            self.channel_watcher(group_id).start(conn.clone(), token);
            info!(%group_id, "group added");
        }

        *known = current;
        true
    }
}

impl Default for GroupWatcher {
    fn default() -> Self {
        Self::new()
    }
}

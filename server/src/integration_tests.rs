//! Integration tests for the soundboard: cross-module flows through the session,
//! the watchers, playback and the service façade, driven by the in-process
//! gateway.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;

    use crate::audio::local::LocalAudioEngine;
    use crate::engine::models::{BotState, Channel, ConnectionState, Group};
    use crate::engine::playback::PlaybackRegistry;
    use crate::engine::reconciler::{Resource, Snapshot};
    use crate::engine::service::BotService;
    use crate::engine::session::{Session, SessionConfig};
    use crate::engine::sounds::SoundLibrary;
    use crate::error::BotError;
    use crate::gateway::local::LocalGateway;

    // ── Helpers ──────────────────────────────────────────────────

    const IDLE: Duration = Duration::from_secs(60);

    fn gateway() -> LocalGateway {
        LocalGateway::new(
            vec![Group::new("a", "Alpha"), Group::new("b", "Bravo")],
            vec![
                Channel::voice("a1", "Lounge", "a"),
                Channel::voice("a2", "Stage", "a"),
                Channel::voice("b1", "Den", "b"),
            ],
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            inactivity_timeout: IDLE,
            ..SessionConfig::default()
        }
    }

    fn service(gateway: &LocalGateway, sounds: &Path) -> BotService {
        let library = Arc::new(SoundLibrary::new(
            sounds,
            &[".mp3".to_string()],
            HashMap::new(),
            Duration::from_secs(3),
        ));
        let playback = Arc::new(PlaybackRegistry::new(
            Arc::new(LocalAudioEngine::with_frame_size(4)),
            library.clone(),
        ));
        let session = Session::new(Arc::new(gateway.clone()), config());
        BotService::new(session, playback, library)
    }

    /// Poll until `pred` holds. Works with paused time, where sleeping
    /// advances the clock.
    async fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn names<T: Resource>(snapshot: &Snapshot<T>) -> Vec<String> {
        snapshot.iter().map(|item| item.name().to_string()).collect()
    }

    // ── Idle timeout ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_closes_exactly_once() {
        let gateway = gateway();
        let session = Session::new(Arc::new(gateway.clone()), config());
        session.ensure_connected().await.unwrap();
        wait_until(|| session.groups().len() == 2).await;

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        wait_until(|| !session.is_connected()).await;
        assert_eq!(gateway.logout_count(), 1);
        assert!(session.groups().is_empty());
        assert!(session.watched_groups().is_empty());

        tokio::time::sleep(IDLE * 5).await;
        assert_eq!(gateway.logout_count(), 1);
        assert_eq!(gateway.login_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_keeps_session_alive() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        service.join("a", "a1").await.unwrap();

        for _ in 0..10 {
            tokio::time::sleep(IDLE - Duration::from_secs(5)).await;
            service.session().reset_activity();
        }
        assert!(service.session().is_connected());
        assert_eq!(gateway.logout_count(), 0);

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        wait_until(|| !service.session().is_connected()).await;
        assert!(service.session().joined_channel("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_close_then_reconnect_on_demand() {
        let gateway = gateway();
        let session = Session::new(Arc::new(gateway.clone()), config());
        session.ensure_connected().await.unwrap();

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        wait_until(|| !session.is_connected()).await;

        session.ensure_connected().await.unwrap();
        assert_eq!(gateway.login_count(), 2);
        wait_until(|| session.groups().len() == 2).await;
    }

    // ── Remote disconnects ──────────────────────────────────────

    #[tokio::test]
    async fn test_external_disconnect_tears_down() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());

        service.join("a", "a1").await.unwrap();
        service.join("b", "b1").await.unwrap();
        let mut joined = service.session().subscribe_joined("a");
        assert!(joined.borrow_and_update().is_some());

        gateway.drop_connections();
        tokio::time::timeout(Duration::from_secs(5), joined.wait_for(Option::is_none))
            .await
            .unwrap()
            .unwrap();
        wait_until(|| !service.session().is_connected()).await;
        assert!(service.session().joined_channel("b").is_none());
        assert!(service.session().groups().is_empty());

        // No explicit close was needed; the next command logs in again.
        service.join("a", "a1").await.unwrap();
        assert_eq!(gateway.login_count(), 2);
    }

    #[tokio::test]
    async fn test_removed_from_group_clears_voice_state() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        service.join("a", "a1").await.unwrap();
        service.join("b", "b1").await.unwrap();

        gateway.remove_group("b");
        wait_until(|| service.session().joined_channel("b").is_none()).await;
        assert_eq!(service.session().joined_channel("a").unwrap().id, "a1");
        wait_until(|| gateway.active_voice_channels("b").is_empty()).await;
    }

    #[tokio::test]
    async fn test_voice_dropped_externally_clears_group() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        service.join("a", "a1").await.unwrap();

        gateway.drop_voice("a");
        wait_until(|| service.session().joined_channel("a").is_none()).await;
        assert!(service.session().is_connected());
        assert!(matches!(
            service.leave("a").await,
            Err(BotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_login_failure_then_retry() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());

        gateway.set_fail_logins(true);
        assert!(matches!(
            service.join("a", "a1").await,
            Err(BotError::Connection(_))
        ));
        assert_eq!(
            service.session_status().state,
            ConnectionState::Disconnected
        );

        gateway.set_fail_logins(false);
        service.join("a", "a1").await.unwrap();
        assert_eq!(service.session().joined_channel("a").unwrap().id, "a1");
    }

    // ── Join / leave ────────────────────────────────────────────

    #[tokio::test]
    async fn test_rejoin_moves_single_connection() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());

        service.join("a", "a1").await.unwrap();
        service.join("a", "a2").await.unwrap();
        // Let the disconnect ack of a1 reach the session.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(gateway.active_voice_channels("a"), vec!["a2".to_string()]);
        assert_eq!(service.session().joined_channel("a").unwrap().id, "a2");
    }

    #[tokio::test]
    async fn test_join_same_channel_twice_is_noop() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());

        service.join("a", "a1").await.unwrap();
        service.join("a", "a1").await.unwrap();
        assert_eq!(gateway.join_count(), 1);
        assert_eq!(gateway.active_voice_channels("a"), vec!["a1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_leave_and_rejoin_repeatedly_stays_joined() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());

        for _ in 0..20 {
            service.join("a", "a1").await.unwrap();
            service.leave("a").await.unwrap();
            service.join("a", "a1").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;

            assert_eq!(service.session().joined_channel("a").unwrap().id, "a1");
            assert_eq!(gateway.active_voice_channels("a"), vec!["a1".to_string()]);
            service.leave("a").await.unwrap();
        }
        assert_eq!(gateway.tracked_voice_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_ack_timeout_surfaces_as_error() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.mp3"), b"x").unwrap();
        let service = service(&gateway, dir.path());
        gateway.set_join_delay(Duration::from_secs(30));

        assert_eq!(
            service.join("a", "a1").await,
            Err(BotError::AckTimeout("join"))
        );
        assert!(service.session().joined_channel("a").is_none());
        // The player registered for the join is gone again.
        assert!(matches!(
            service.play("a", "x.mp3").await,
            Err(BotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_joins_on_different_groups() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(service(&gateway, dir.path()));

        let a = {
            let service = service.clone();
            tokio::spawn(async move { service.join("a", "a1").await })
        };
        let b = {
            let service = service.clone();
            tokio::spawn(async move { service.join("b", "b1").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(gateway.login_count(), 1);
        assert_eq!(service.session().joined_channel("a").unwrap().id, "a1");
        assert_eq!(service.session().joined_channel("b").unwrap().id, "b1");
    }

    // ── Watchers ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_group_events_reach_subscribers() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        let mut groups = service.watch_groups().await.unwrap();

        // Skip until the initial sync is visible.
        loop {
            let snapshot = groups.next().await.unwrap();
            if snapshot.len() == 2 {
                break;
            }
        }

        gateway.upsert_group(Group::new("c", "Charlie"));
        gateway.remove_group("a");
        gateway.upsert_group(Group::new("b", "Bravo2"));

        loop {
            let snapshot = groups.next().await.unwrap();
            if names(&snapshot) == vec!["Bravo2", "Charlie"] {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_channel_watchers_follow_group_membership() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        service.session().ensure_connected().await.unwrap();
        wait_until(|| service.session().watched_groups() == vec!["a", "b"]).await;

        gateway.upsert_group(Group::new("c", "Charlie"));
        wait_until(|| service.session().watched_groups() == vec!["a", "b", "c"]).await;

        gateway.remove_group("a");
        wait_until(|| service.session().watched_groups() == vec!["b", "c"]).await;
        assert!(service.session().channels("a").is_empty());
    }

    #[tokio::test]
    async fn test_streams_survive_reconnect() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        let mut channels = service.watch_channels("a").await.unwrap();

        loop {
            if channels.next().await.unwrap().len() == 2 {
                break;
            }
        }

        service.session().close().await;
        assert!(channels.next().await.unwrap().is_empty());

        // A different caller reconnects; the old stream picks the data up again.
        service.session().ensure_connected().await.unwrap();
        loop {
            let snapshot = channels.next().await.unwrap();
            if snapshot.len() == 2 {
                assert_eq!(names(&snapshot), vec!["Lounge", "Stage"]);
                break;
            }
        }
    }

    // ── Playback ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_status_reflects_join_and_playback() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("airhorn.mp3"), [7u8; 4096]).unwrap();
        let service = service(&gateway, dir.path());

        let mut status = service.watch_status("a").await.unwrap();
        assert_eq!(status.next().await.unwrap().state, BotState::Offline);

        service.join("a", "a1").await.unwrap();
        assert_eq!(status.next().await.unwrap().state, BotState::JoinedIdle);

        service.play("a", "airhorn.mp3").await.unwrap();
        let playing = status.next().await.unwrap();
        assert_eq!(playing.state, BotState::Playing);
        assert_eq!(playing.playing_track.unwrap().title, "airhorn");

        service.leave("a").await.unwrap();
        loop {
            if status.next().await.unwrap().state == BotState::Offline {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_play_rejects_escape_from_sound_folder() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        service.join("a", "a1").await.unwrap();

        assert!(matches!(
            service.play("a", "../../etc/passwd").await,
            Err(BotError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_logs_out() {
        let gateway = gateway();
        let dir = tempfile::tempdir().unwrap();
        let service = service(&gateway, dir.path());
        service.join("a", "a1").await.unwrap();

        service.shutdown().await;
        assert_eq!(gateway.logout_count(), 1);
        assert!(gateway.active_voice_channels("a").is_empty());
        assert_eq!(
            service.session_status().state,
            ConnectionState::Disconnected
        );
    }
}

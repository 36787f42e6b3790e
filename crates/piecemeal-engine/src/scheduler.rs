use crate::collaborators::{ChannelError, DropAnnouncement, DropChannel, MessageHandle};
use crate::registry::ActiveDrops;
use crate::session::DropSession;
use chrono::{DateTime, Utc};
use piecemeal_core::{
    ChannelId, ConfigError, DropChannelConfig, PieceId, PuzzleTarget, Trigger, TriggerMode,
};
use piecemeal_storage::{DocumentStore, StorageError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub claim_ttl: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            claim_ttl: chrono::Duration::minutes(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("announce failed: {0}")]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnedDrop {
    pub channel_id: ChannelId,
    pub session_id: Uuid,
    pub slug: String,
    pub piece_id: PieceId,
    pub claim_limit: u32,
    pub message: MessageHandle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub spawned: Vec<SpawnedDrop>,
    pub skipped: Vec<(ChannelId, String)>,
}

struct DropPlan {
    slug: String,
    puzzle_name: String,
    piece_id: PieceId,
    claim_limit: u32,
    image_ref: Option<String>,
}

/// Decides when and where pieces drop.
///
/// Channels are evaluated one at a time under `spawn_lock`, whether the evaluation
/// comes from a tick, a message or an admin. Trigger state only advances after the
/// channel confirms the announcement.
pub struct DropScheduler {
    config: SchedulerConfig,
    store: Arc<DocumentStore>,
    channel: Arc<dyn DropChannel>,
    drops: Arc<ActiveDrops>,
    rng: Mutex<StdRng>,
    spawn_lock: Mutex<()>,
}

impl DropScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<DocumentStore>,
        channel: Arc<dyn DropChannel>,
        drops: Arc<ActiveDrops>,
    ) -> Self {
        Self {
            config,
            store,
            channel,
            drops,
            rng: Mutex::new(StdRng::from_entropy()),
            spawn_lock: Mutex::new(()),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn active_drops(&self) -> &Arc<ActiveDrops> {
        &self.drops
    }

    /// Counts a message toward the channel's trigger. Returns true when the channel is
    /// now due to spawn. Unconfigured channels, timer channels and uncounted bot
    /// messages are ignored.
    pub fn record_message(
        &self,
        channel_id: &str,
        author_is_bot: bool,
    ) -> Result<bool, SchedulerError> {
        let due = self.store.mutate(|doc| {
            let Some(config) = doc.drop_channels.get_mut(channel_id) else {
                return Ok::<_, StorageError>(None);
            };
            if config.mode != TriggerMode::MessageCount
                || (author_is_bot && !config.count_bot_messages)
            {
                return Ok(None);
            }
            config.message_count = config.message_count.saturating_add(1);
            Ok(Some(
                config.next_trigger > 0 && config.message_count >= config.next_trigger,
            ))
        })?;
        match due {
            Some(due) => {
                debug!(event = "message_counted", channel_id, due);
                Ok(due)
            }
            None => Ok(false),
        }
    }

    /// Evaluates every configured channel once, in channel-id order.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _guard = self.lock_spawns();
        if let Err(err) = self.store.reload() {
            warn!(event = "store_reload_failed", error = %err);
        }
        let channel_ids: Vec<ChannelId> = self
            .store
            .get(|doc| doc.drop_channels.keys().cloned().collect());

        let mut report = TickReport::default();
        for channel_id in channel_ids {
            report.evaluated += 1;
            match self.evaluate(&channel_id, now, false) {
                Ok(Some(spawned)) => report.spawned.push(spawned),
                Ok(None) => {}
                Err(err) => {
                    warn!(event = "spawn_skipped", channel_id = %channel_id, error = %err);
                    report.skipped.push((channel_id, err.to_string()));
                }
            }
        }
        debug!(
            event = "tick_finished",
            evaluated = report.evaluated,
            spawned = report.spawned.len(),
            skipped = report.skipped.len()
        );
        report
    }

    /// Spawns on one channel if its trigger is due.
    pub fn spawn_if_due(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SpawnedDrop>, SchedulerError> {
        let _guard = self.lock_spawns();
        self.evaluate(channel_id, now, false)
    }

    /// Spawns on one channel regardless of its trigger, then advances the trigger as a
    /// normal spawn would.
    pub fn force_spawn(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SpawnedDrop, SchedulerError> {
        let _guard = self.lock_spawns();
        match self.evaluate(channel_id, now, true)? {
            Some(spawned) => Ok(spawned),
            None => Err(ConfigError::UnknownChannel(channel_id.to_string()).into()),
        }
    }

    // Caller holds spawn_lock.
    fn evaluate(
        &self,
        channel_id: &str,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Option<SpawnedDrop>, SchedulerError> {
        let mut config = self.store.get(|doc| doc.channel(channel_id).cloned())?;
        let trigger = config.validate(channel_id)?;

        if config.needs_arming() {
            config = self.arm(channel_id, &trigger)?;
            if !force {
                return Ok(None);
            }
        }
        if !force && !config.is_due(channel_id, &trigger, now)? {
            return Ok(None);
        }

        let plan = self.plan(channel_id, &config)?;
        let session = Arc::new(DropSession::new(
            channel_id,
            plan.slug.clone(),
            plan.puzzle_name.clone(),
            plan.piece_id,
            plan.claim_limit,
            now,
            self.config.claim_ttl,
        ));
        let announcement = DropAnnouncement {
            channel_id: channel_id.to_string(),
            session_id: session.id(),
            slug: plan.slug.clone(),
            puzzle_name: plan.puzzle_name.clone(),
            piece_id: plan.piece_id,
            claim_limit: plan.claim_limit,
            expires_at: session.deadline(),
            image_ref: plan.image_ref.clone(),
        };

        let message = match self.channel.announce(&announcement) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "announce_failed", channel_id, error = %err);
                return Err(err.into());
            }
        };
        session.attach_message(message.clone());
        self.drops.insert(session.clone());

        let delta = self.draw_delta(&trigger);
        let advanced = self.store.mutate(|doc| {
            if let Some(live) = doc.drop_channels.get_mut(channel_id) {
                live.record_spawn(&trigger, now, delta);
            }
            Ok::<_, StorageError>(())
        });
        if let Err(err) = advanced {
            warn!(event = "trigger_state_not_saved", channel_id, error = %err);
        }

        info!(
            event = "drop_spawned",
            channel_id,
            session_id = %session.id(),
            puzzle = %plan.slug,
            piece_id = plan.piece_id,
            claim_limit = plan.claim_limit,
            forced = force
        );
        Ok(Some(SpawnedDrop {
            channel_id: channel_id.to_string(),
            session_id: session.id(),
            slug: plan.slug,
            piece_id: plan.piece_id,
            claim_limit: plan.claim_limit,
            message,
        }))
    }

    fn arm(
        &self,
        channel_id: &str,
        trigger: &Trigger,
    ) -> Result<DropChannelConfig, SchedulerError> {
        let delta = self.draw_delta(trigger);
        let armed = self.store.mutate(|doc| {
            let config = doc
                .drop_channels
                .get_mut(channel_id)
                .ok_or_else(|| ConfigError::UnknownChannel(channel_id.to_string()))?;
            if config.next_trigger == 0 {
                config.next_trigger = config.message_count.saturating_add(delta);
            }
            Ok::<_, SchedulerError>(config.clone())
        })?;
        debug!(event = "channel_armed", channel_id, next_trigger = armed.next_trigger);
        Ok(armed)
    }

    fn plan(&self, channel_id: &str, config: &DropChannelConfig) -> Result<DropPlan, ConfigError> {
        let mut rng = self.lock_rng();
        self.store.get(|doc| {
            doc.check_droppable(&config.puzzle)?;
            let slug = match &config.puzzle {
                PuzzleTarget::Specific(slug) => slug.clone(),
                PuzzleTarget::Any => doc
                    .droppable_puzzles()
                    .choose(&mut *rng)
                    .map(|slug| slug.to_string())
                    .ok_or(ConfigError::NoEnabledPuzzles)?,
            };
            let puzzle = doc.puzzle(&slug)?;
            puzzle.validate(&slug)?;
            config.claims_range.check(channel_id)?;

            let piece_id = rng.gen_range(1..=puzzle.piece_count);
            let claim_limit = rng.gen_range(config.claims_range.min..=config.claims_range.max);
            Ok(DropPlan {
                image_ref: doc.piece_asset(&slug, piece_id).map(str::to_string),
                puzzle_name: puzzle.display_name.clone(),
                slug,
                piece_id,
                claim_limit,
            })
        })
    }

    fn draw_delta(&self, trigger: &Trigger) -> u64 {
        match trigger {
            Trigger::Timer { .. } => 0,
            Trigger::MessageCount { low, high } => {
                self.lock_rng().gen_range(*low..=*high).max(1)
            }
        }
    }

    fn lock_rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_spawns(&self) -> MutexGuard<'_, ()> {
        self.spawn_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::RecordingChannel;
    use chrono::TimeZone;
    use piecemeal_core::{ClaimRange, Puzzle};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn ts(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, min, sec)
            .single()
            .expect("valid timestamp")
    }

    fn puzzle(name: &str, enabled: bool) -> Puzzle {
        Puzzle {
            display_name: name.to_string(),
            piece_count: 4,
            rows: 2,
            cols: 2,
            base_image_ref: format!("{name}/base.png"),
            full_image_ref: format!("{name}/full.png"),
            reward_ref: None,
            enabled,
        }
    }

    fn store_with(channels: Vec<(&str, DropChannelConfig)>) -> Arc<DocumentStore> {
        let store = Arc::new(DocumentStore::in_memory());
        store
            .mutate(|doc| {
                for (slug, enabled) in [("demo", true), ("hidden", false)] {
                    doc.puzzles.insert(slug.to_string(), puzzle(slug, enabled));
                    doc.pieces.insert(
                        slug.to_string(),
                        (1..=4)
                            .map(|id| (id, format!("{slug}/{id}.png")))
                            .collect::<BTreeMap<_, _>>(),
                    );
                }
                for (id, config) in channels {
                    doc.drop_channels.insert(id.to_string(), config);
                }
                Ok::<_, StorageError>(())
            })
            .expect("seed");
        store
    }

    fn scheduler(store: Arc<DocumentStore>) -> (DropScheduler, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let scheduler = DropScheduler::new(
            SchedulerConfig::default(),
            store,
            channel.clone(),
            Arc::new(ActiveDrops::new()),
        )
        .with_seed(7);
        (scheduler, channel)
    }

    fn timer_channel(last: Option<DateTime<Utc>>) -> DropChannelConfig {
        let mut config = DropChannelConfig::timer(
            PuzzleTarget::Specific("demo".to_string()),
            60,
            ClaimRange { min: 1, max: 3 },
        );
        config.last_drop_time = last;
        config
    }

    #[test]
    fn timer_waits_for_full_interval() {
        let store = store_with(vec![("general", timer_channel(Some(ts(0, 0))))]);
        let (scheduler, channel) = scheduler(store.clone());

        let early = scheduler.tick(ts(0, 59));
        assert_eq!(early.evaluated, 1);
        assert!(early.spawned.is_empty());

        let due = scheduler.tick(ts(1, 1));
        assert_eq!(due.spawned.len(), 1);
        let spawned = &due.spawned[0];
        assert_eq!(spawned.slug, "demo");
        assert!((1..=4).contains(&spawned.piece_id));
        assert!((1..=3).contains(&spawned.claim_limit));
        assert_eq!(
            store.get(|doc| doc.drop_channels["general"].last_drop_time),
            Some(ts(1, 1))
        );
        assert_eq!(channel.announcements.lock().expect("announcements").len(), 1);
        assert!(scheduler.active_drops().get(&spawned.session_id).is_some());

        let again = scheduler.tick(ts(1, 30));
        assert!(again.spawned.is_empty());
    }

    #[test]
    fn unset_timer_is_due_immediately() {
        let store = store_with(vec![("general", timer_channel(None))]);
        let (scheduler, _channel) = scheduler(store);
        assert_eq!(scheduler.tick(ts(0, 0)).spawned.len(), 1);
    }

    #[test]
    fn fifth_message_spawns_once_and_redraws() {
        let mut config = DropChannelConfig::message_count(
            PuzzleTarget::Specific("demo".to_string()),
            3,
            8,
            ClaimRange::default(),
        );
        config.next_trigger = 5;
        let store = store_with(vec![("chat", config)]);
        let (scheduler, channel) = scheduler(store.clone());

        for _ in 0..4 {
            assert!(!scheduler.record_message("chat", false).expect("count"));
        }
        assert!(scheduler.tick(ts(0, 0)).spawned.is_empty());
        assert!(scheduler.record_message("chat", false).expect("fifth"));

        let spawned = scheduler.spawn_if_due("chat", ts(0, 1)).expect("spawn");
        assert!(spawned.is_some());
        let next = store.get(|doc| doc.drop_channels["chat"].next_trigger);
        assert!((8..=13).contains(&next), "next_trigger {next}");

        assert!(scheduler.tick(ts(0, 2)).spawned.is_empty());
        assert_eq!(channel.announcements.lock().expect("announcements").len(), 1);
    }

    #[test]
    fn bot_messages_only_count_when_enabled() {
        let mut config = DropChannelConfig::message_count(
            PuzzleTarget::Any,
            2,
            2,
            ClaimRange::default(),
        );
        config.next_trigger = 10;
        let store = store_with(vec![("chat", config)]);
        let (scheduler, _channel) = scheduler(store.clone());

        scheduler.record_message("chat", true).expect("bot");
        assert_eq!(store.get(|doc| doc.drop_channels["chat"].message_count), 0);

        store
            .mutate(|doc| {
                if let Some(config) = doc.drop_channels.get_mut("chat") {
                    config.count_bot_messages = true;
                }
                Ok::<_, StorageError>(())
            })
            .expect("enable bots");
        scheduler.record_message("chat", true).expect("bot");
        assert_eq!(store.get(|doc| doc.drop_channels["chat"].message_count), 1);

        assert!(!scheduler.record_message("unknown", false).expect("ignored"));
    }

    #[test]
    fn unarmed_channel_is_armed_without_spawning() {
        let config = DropChannelConfig::message_count(
            PuzzleTarget::Specific("demo".to_string()),
            4,
            4,
            ClaimRange::default(),
        );
        let store = store_with(vec![("chat", config)]);
        let (scheduler, _channel) = scheduler(store.clone());
        assert!(scheduler.tick(ts(0, 0)).spawned.is_empty());
        assert_eq!(store.get(|doc| doc.drop_channels["chat"].next_trigger), 4);
    }

    #[test]
    fn failed_announce_keeps_trigger_state() {
        let store = store_with(vec![("general", timer_channel(Some(ts(0, 0))))]);
        let (scheduler, channel) = scheduler(store.clone());
        channel.fail_announce.store(true, Ordering::SeqCst);

        let report = scheduler.tick(ts(5, 0));
        assert!(report.spawned.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            store.get(|doc| doc.drop_channels["general"].last_drop_time),
            Some(ts(0, 0))
        );
        assert!(scheduler.active_drops().is_empty());

        channel.fail_announce.store(false, Ordering::SeqCst);
        assert_eq!(scheduler.tick(ts(5, 30)).spawned.len(), 1);
    }

    #[test]
    fn bad_channel_does_not_block_others() {
        let mut broken = timer_channel(None);
        broken.puzzle = PuzzleTarget::Specific("missing".to_string());
        let store = store_with(vec![("a-broken", broken), ("b-good", timer_channel(None))]);
        let (scheduler, _channel) = scheduler(store);

        let report = scheduler.tick(ts(0, 0));
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.spawned.len(), 1);
        assert_eq!(report.spawned[0].channel_id, "b-good");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "a-broken");
    }

    #[test]
    fn overflowing_timer_is_skipped_and_later_channels_still_run() {
        let mut runaway = DropChannelConfig::timer(
            PuzzleTarget::Specific("demo".to_string()),
            10_000_000_000_000,
            ClaimRange::default(),
        );
        runaway.last_drop_time = Some(ts(0, 0));
        let store = store_with(vec![("a-bad", runaway), ("b-good", timer_channel(None))]);
        let (scheduler, channel) = scheduler(store.clone());

        let report = scheduler.tick(ts(0, 30));
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "a-bad");
        assert!(report.skipped[0].1.contains("interval_secs too large"));
        assert_eq!(report.spawned.len(), 1);
        assert_eq!(report.spawned[0].channel_id, "b-good");
        assert_eq!(channel.announcements.lock().expect("announcements").len(), 1);
        assert_eq!(
            store.get(|doc| doc.drop_channels["a-bad"].last_drop_time),
            Some(ts(0, 0))
        );
    }

    #[test]
    fn any_target_skips_disabled_puzzles() {
        let mut config = timer_channel(None);
        config.puzzle = PuzzleTarget::Any;
        let store = store_with(vec![("general", config)]);
        let (scheduler, _channel) = scheduler(store);
        for minute in 0..10 {
            let report = scheduler.tick(ts(minute * 2, 0));
            for spawned in report.spawned {
                assert_eq!(spawned.slug, "demo");
            }
        }
    }

    #[test]
    fn force_spawn_ignores_trigger() {
        let store = store_with(vec![("general", timer_channel(Some(ts(0, 0))))]);
        let (scheduler, _channel) = scheduler(store.clone());
        let spawned = scheduler.force_spawn("general", ts(0, 10)).expect("forced");
        assert_eq!(spawned.channel_id, "general");
        assert_eq!(
            store.get(|doc| doc.drop_channels["general"].last_drop_time),
            Some(ts(0, 10))
        );
        assert!(matches!(
            scheduler.force_spawn("nowhere", ts(0, 11)),
            Err(SchedulerError::Config(ConfigError::UnknownChannel(_)))
        ));
    }
}

//! Consolidation scheduling.
//!
//! Due-ness is derived from last-run stamps in `.consolidation_schedule.json`
//! with deliberately loose windows (20 hours, 6 days, 28 days) so a session
//! that starts at a slightly different hour each day still consolidates.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::consolidate::ConsolidationMode;
use crate::store::MemoryStore;

pub const SCHEDULE_FILE: &str = ".consolidation_schedule.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub last_daily: Option<DateTime<Utc>>,
    pub next_daily: Option<DateTime<Utc>>,
    pub last_weekly: Option<DateTime<Utc>>,
    pub next_weekly: Option<DateTime<Utc>>,
    pub last_monthly: Option<DateTime<Utc>>,
    pub next_monthly: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ConsolidationScheduler {
    store: MemoryStore,
    schedule: Schedule,
}

impl ConsolidationScheduler {
    pub fn load(store: MemoryStore) -> Result<Self> {
        let schedule = store.read_json_or_default(store.base().join(SCHEDULE_FILE))?;
        let mut scheduler = Self { store, schedule };
        // Seed the file on first open so other tools can read the contract.
        if scheduler.schedule.next_daily.is_none() {
            let now = Utc::now();
            scheduler.schedule.next_daily = Some(now);
            scheduler.schedule.next_weekly = Some(now);
            scheduler.schedule.next_monthly = Some(now);
            scheduler.save()?;
        }
        Ok(scheduler)
    }

    fn save(&self) -> Result<()> {
        self.store
            .write_json(self.store.base().join(SCHEDULE_FILE), &self.schedule)
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn should_run_daily(&self, now: DateTime<Utc>) -> bool {
        match self.schedule.last_daily {
            None => true,
            Some(last) => now - last > Duration::hours(20),
        }
    }

    pub fn should_run_weekly(&self, now: DateTime<Utc>) -> bool {
        match self.schedule.last_weekly {
            None => true,
            Some(last) => now - last > Duration::days(6),
        }
    }

    pub fn should_run_monthly(&self, now: DateTime<Utc>) -> bool {
        match self.schedule.last_monthly {
            None => true,
            Some(last) => now - last > Duration::days(28),
        }
    }

    /// Modes due right now, broadest first.  Monthly supersedes weekly
    /// supersedes daily — they share the note window, so only the broadest
    /// due mode needs to run.
    pub fn due_modes(&self, now: DateTime<Utc>) -> Vec<ConsolidationMode> {
        if self.should_run_monthly(now) && self.schedule.last_monthly.is_some() {
            return vec![ConsolidationMode::Monthly];
        }
        if self.should_run_weekly(now) && self.schedule.last_weekly.is_some() {
            return vec![ConsolidationMode::Weekly];
        }
        if self.should_run_daily(now) {
            return vec![ConsolidationMode::Daily];
        }
        Vec::new()
    }

    /// Record a completed run and persist the new stamps.
    pub fn mark_ran(&mut self, mode: ConsolidationMode, now: DateTime<Utc>) -> Result<()> {
        match mode {
            ConsolidationMode::Daily => {
                self.schedule.last_daily = Some(now);
                self.schedule.next_daily = Some(now + Duration::hours(20));
            }
            ConsolidationMode::Weekly => {
                self.schedule.last_weekly = Some(now);
                self.schedule.next_weekly = Some(now + Duration::days(6));
                // A weekly run covers today's daily too.
                self.schedule.last_daily = Some(now);
                self.schedule.next_daily = Some(now + Duration::hours(20));
            }
            ConsolidationMode::Monthly => {
                self.schedule.last_monthly = Some(now);
                self.schedule.next_monthly = Some(now + Duration::days(28));
                self.schedule.last_weekly = Some(now);
                self.schedule.next_weekly = Some(now + Duration::days(6));
                self.schedule.last_daily = Some(now);
                self.schedule.next_daily = Some(now + Duration::hours(20));
            }
            ConsolidationMode::Manual => {}
        }
        info!(mode = mode.as_str(), "consolidation run recorded");
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::consolidate::ConsolidationMode;
    use crate::store::MemoryStore;

    use super::{ConsolidationScheduler, SCHEDULE_FILE, Schedule};

    fn temp_scheduler() -> (MemoryStore, ConsolidationScheduler) {
        let base = std::env::temp_dir().join(format!("anima-schedule-{}", Uuid::new_v4()));
        let store = MemoryStore::open(&base).unwrap();
        let scheduler = ConsolidationScheduler::load(store.clone()).unwrap();
        (store, scheduler)
    }

    #[test]
    fn fresh_store_is_due_for_everything_and_seeds_file() {
        let (store, scheduler) = temp_scheduler();
        let now = Utc::now();
        assert!(scheduler.should_run_daily(now));
        assert!(scheduler.should_run_weekly(now));
        assert!(scheduler.should_run_monthly(now));
        assert!(store.read_opt(store.base().join(SCHEDULE_FILE)).unwrap().is_some());
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn daily_window_is_twenty_hours() {
        let (store, mut scheduler) = temp_scheduler();
        let now = Utc::now();
        scheduler.mark_ran(ConsolidationMode::Daily, now).unwrap();
        assert!(!scheduler.should_run_daily(now + Duration::hours(19)));
        assert!(scheduler.should_run_daily(now + Duration::hours(21)));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn stamps_survive_reload() {
        let (store, mut scheduler) = temp_scheduler();
        let now = Utc::now();
        scheduler.mark_ran(ConsolidationMode::Weekly, now).unwrap();

        let reloaded = ConsolidationScheduler::load(store.clone()).unwrap();
        assert!(!reloaded.should_run_weekly(now + Duration::days(5)));
        assert!(reloaded.should_run_weekly(now + Duration::days(7)));
        // Weekly covered the daily window too.
        assert!(!reloaded.should_run_daily(now + Duration::hours(10)));
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn due_modes_prefers_broadest() {
        let (store, mut scheduler) = temp_scheduler();
        let now = Utc::now();
        // Establish history so every mode has a last-run stamp.
        scheduler.mark_ran(ConsolidationMode::Monthly, now).unwrap();

        assert!(scheduler.due_modes(now + Duration::hours(1)).is_empty());
        assert_eq!(
            scheduler.due_modes(now + Duration::days(1)),
            vec![ConsolidationMode::Daily]
        );
        assert_eq!(
            scheduler.due_modes(now + Duration::days(7)),
            vec![ConsolidationMode::Weekly]
        );
        assert_eq!(
            scheduler.due_modes(now + Duration::days(30)),
            vec![ConsolidationMode::Monthly]
        );
        let _ = std::fs::remove_dir_all(store.base());
    }

    #[test]
    fn schedule_serializes_with_nullable_stamps() {
        let schedule = Schedule::default();
        let rendered = serde_json::to_string(&schedule).unwrap();
        assert!(rendered.contains("\"last_daily\":null"));
    }
}

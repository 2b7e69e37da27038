//! Per-contact inbound activity and the silence-escalation sweep.

use crate::config::AgentConfig;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactActivity {
    pub contact_id: String,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: u64,
}

/// Inbound activity per contact. Entries are never removed.
#[derive(Debug, Default)]
pub struct ActivityTable {
    contacts: BTreeMap<String, ContactActivity>,
}

impl ActivityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, contact_id: &str, at: DateTime<Utc>) {
        let entry = self
            .contacts
            .entry(contact_id.to_string())
            .or_insert_with(|| ContactActivity {
                contact_id: contact_id.to_string(),
                last_activity_at: at,
                message_count: 0,
            });
        entry.message_count += 1;
        if at > entry.last_activity_at {
            entry.last_activity_at = at;
        }
    }

    pub fn get(&self, contact_id: &str) -> Option<&ContactActivity> {
        self.contacts.get(contact_id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContactActivity> {
        self.contacts.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilenceReport {
    pub silent: Vec<String>,
    pub to_transfer: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SilencePolicy {
    pub threshold: ChronoDuration,
    pub cutoff: NaiveTime,
    /// `None` uses the host's local time.
    pub timezone: Option<Tz>,
}

impl SilencePolicy {
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let hours = i64::try_from(config.silence_threshold_hours)?;
        Ok(Self {
            threshold: ChronoDuration::hours(hours),
            cutoff: config.transfer_cutoff_time()?,
            timezone: config.timezone()?,
        })
    }

    fn time_of_day(&self, now: DateTime<Utc>) -> NaiveTime {
        match self.timezone {
            Some(tz) => now.with_timezone(&tz).time(),
            None => now.with_timezone(&Local).time(),
        }
    }

    fn past_cutoff(&self, now: DateTime<Utc>) -> bool {
        self.time_of_day(now) >= self.cutoff
    }
}

/// Tracks activity and classifies contacts on each sweep.
#[derive(Debug)]
pub struct SilenceMonitor {
    policy: SilencePolicy,
    activity: ActivityTable,
    escalated: BTreeSet<String>,
}

impl SilenceMonitor {
    pub fn new(policy: SilencePolicy) -> Self {
        Self {
            policy,
            activity: ActivityTable::new(),
            escalated: BTreeSet::new(),
        }
    }

    pub fn record_inbound(&mut self, contact_id: &str, at: DateTime<Utc>) {
        self.activity.record(contact_id, at);
    }

    pub fn activity(&self) -> &ActivityTable {
        &self.activity
    }

    /// Every contact escalated to transfer so far.
    pub fn escalated(&self) -> &BTreeSet<String> {
        &self.escalated
    }

    /// Classify every tracked contact at `now`. A silent contact goes to
    /// `to_transfer` when the local time is at or past the cutoff, or when it
    /// was escalated by an earlier sweep. Returns `None` when nobody is silent.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Option<SilenceReport> {
        let past_cutoff = self.policy.past_cutoff(now);
        let mut report = SilenceReport {
            silent: Vec::new(),
            to_transfer: Vec::new(),
        };

        for contact in self.activity.iter() {
            if now - contact.last_activity_at <= self.policy.threshold {
                continue;
            }
            report.silent.push(contact.contact_id.clone());
            if past_cutoff {
                self.escalated.insert(contact.contact_id.clone());
            }
            if self.escalated.contains(&contact.contact_id) {
                report.to_transfer.push(contact.contact_id.clone());
            }
        }

        (!report.silent.is_empty()).then_some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn monitor() -> SilenceMonitor {
        SilenceMonitor::new(SilencePolicy {
            threshold: ChronoDuration::hours(8),
            cutoff: NaiveTime::from_hms_opt(18, 30, 0).unwrap(),
            timezone: Some(chrono_tz::UTC),
        })
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn nine_hours_silent_after_cutoff_is_transferred() {
        let mut monitor = monitor();
        monitor.record_inbound("79990000001", at(10, 10, 0));
        let report = monitor.sweep(at(10, 19, 0)).unwrap();
        assert_eq!(report.silent, ["79990000001"]);
        assert_eq!(report.to_transfer, ["79990000001"]);
    }

    #[test]
    fn nine_hours_silent_before_cutoff_is_only_silent() {
        let mut monitor = monitor();
        monitor.record_inbound("79990000001", at(10, 1, 0));
        let report = monitor.sweep(at(10, 10, 0)).unwrap();
        assert_eq!(report.silent, ["79990000001"]);
        assert!(report.to_transfer.is_empty());
    }

    #[test]
    fn recent_contact_is_in_neither_set() {
        let mut monitor = monitor();
        monitor.record_inbound("79990000001", at(10, 17, 0));
        assert_eq!(monitor.sweep(at(10, 19, 0)), None);
    }

    #[test]
    fn exactly_at_cutoff_counts() {
        let mut monitor = monitor();
        monitor.record_inbound("a", at(10, 9, 0));
        let report = monitor.sweep(at(10, 18, 30)).unwrap();
        assert_eq!(report.to_transfer, ["a"]);
    }

    #[test]
    fn transfer_survives_the_next_morning() {
        let mut monitor = monitor();
        monitor.record_inbound("a", at(10, 9, 0));
        monitor.sweep(at(10, 19, 0)).unwrap();

        let report = monitor.sweep(at(11, 8, 0)).unwrap();
        assert_eq!(report.silent, ["a"]);
        assert_eq!(report.to_transfer, ["a"]);
        assert!(monitor.escalated().contains("a"));
    }

    #[test]
    fn activity_is_counted_and_never_dropped() {
        let mut monitor = monitor();
        monitor.record_inbound("a", at(10, 9, 0));
        monitor.record_inbound("a", at(10, 12, 0));
        monitor.record_inbound("b", at(10, 12, 0));
        monitor.sweep(at(11, 12, 0));

        let a = monitor.activity().get("a").unwrap();
        assert_eq!(a.message_count, 2);
        assert_eq!(a.last_activity_at, at(10, 12, 0));
        assert_eq!(monitor.activity().len(), 2);
    }

    #[test]
    fn policy_honours_configured_timezone() {
        let mut config = AgentConfig::default();
        config.timezone = Some("Europe/Moscow".into());
        let policy = SilencePolicy::from_config(&config).unwrap();
        // 16:00 UTC is 19:00 in Moscow.
        assert!(policy.past_cutoff(at(10, 16, 0)));
        assert!(!policy.past_cutoff(at(10, 15, 0)));
    }
}

//! Per-caller daily quota ledger.
//!
//! Each caller has at most one [`UsageRecord`]. The record rolls over to a
//! zero count whenever its reset day differs from the current UTC day. The
//! admission path uses [`QuotaLedger::reserve_at`], which checks and
//! increments under the same map-entry guard so two concurrent submissions
//! from one caller cannot both take the last slot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::identity::CallerId;

/// `remaining` reported when no cap applies.
pub const UNLIMITED_REMAINING: u32 = 999_999;

/// How long a verified receipt keeps the caller on the pro plan.
pub const ENTITLEMENT_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Free => write!(f, "free"),
            Plan::Pro => write!(f, "pro"),
        }
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

/// Daily caps per plan. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub free: Option<u32>,
    pub pro: Option<u32>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free: Some(2),
            pro: None,
        }
    }
}

impl PlanLimits {
    pub fn limit_for(&self, plan: Plan) -> Option<u32> {
        match plan {
            Plan::Free => self.free,
            Plan::Pro => self.pro,
        }
    }
}

/// Why enforcement was skipped for a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    GlobalFlag,
    DeveloperIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassPolicy {
    /// Process-wide switch; wins over everything else.
    pub global: bool,
    /// Callers whose id starts with this prefix are trusted. Empty disables.
    pub developer_prefix: String,
}

impl Default for BypassPolicy {
    fn default() -> Self {
        Self {
            global: false,
            developer_prefix: "dev-".to_string(),
        }
    }
}

impl BypassPolicy {
    pub fn resolve(&self, caller: &CallerId) -> Option<BypassReason> {
        if self.global {
            Some(BypassReason::GlobalFlag)
        } else if caller.has_prefix(&self.developer_prefix) {
            Some(BypassReason::DeveloperIdentity)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub caller: CallerId,
    pub count: u32,
    pub reset_day: NaiveDate,
    /// Effective plan for today.
    pub plan: Plan,
    pub entitled_until: Option<DateTime<Utc>>,
}

impl UsageRecord {
    fn fresh(caller: CallerId, plan: Plan, today: NaiveDate) -> Self {
        Self {
            caller,
            count: 0,
            reset_day: today,
            plan,
            entitled_until: None,
        }
    }

    fn effective_plan(&self, requested: Plan, now: DateTime<Utc>) -> Plan {
        match self.entitled_until {
            Some(until) if until > now => Plan::Pro,
            _ => requested,
        }
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.reset_day != today {
            self.count = 0;
            self.reset_day = today;
        }
    }

    /// Roll the day over if needed and refresh the plan.
    fn refresh(&mut self, requested: Plan, now: DateTime<Utc>) {
        self.roll_day(now);
        self.plan = self.effective_plan(requested, now);
    }

    /// Count one accepted job against the day containing `now`.
    pub fn increment(&mut self, now: DateTime<Utc>) {
        self.roll_day(now);
        self.count = self.count.saturating_add(1);
    }
}

/// Quota snapshot for a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaView {
    pub remaining: u32,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct QuotaLedger {
    limits: PlanLimits,
    bypass: BypassPolicy,
    records: DashMap<CallerId, UsageRecord>,
}

impl QuotaLedger {
    pub fn new(limits: PlanLimits, bypass: BypassPolicy) -> Self {
        Self {
            limits,
            bypass,
            records: DashMap::new(),
        }
    }

    pub fn limits(&self) -> &PlanLimits {
        &self.limits
    }

    pub fn bypass_for(&self, caller: &CallerId) -> Option<BypassReason> {
        self.bypass.resolve(caller)
    }

    pub fn touch(&self, caller: &CallerId, plan: Plan) -> UsageRecord {
        self.touch_at(caller, plan, Utc::now())
    }

    /// Fetch the caller's record, creating or rolling it over as needed.
    pub fn touch_at(&self, caller: &CallerId, plan: Plan, now: DateTime<Utc>) -> UsageRecord {
        let mut record = self
            .records
            .entry(caller.clone())
            .or_insert_with(|| UsageRecord::fresh(caller.clone(), plan, now.date_naive()));
        record.refresh(plan, now);
        record.clone()
    }

    pub fn enforce(
        &self,
        record: &UsageRecord,
        bypass: Option<BypassReason>,
    ) -> Result<(), GatewayError> {
        if bypass.is_some() {
            return Ok(());
        }
        match self.limits.limit_for(record.plan) {
            Some(limit) if record.count >= limit => {
                Err(GatewayError::QuotaExceeded { plan: record.plan })
            }
            _ => Ok(()),
        }
    }

    /// Touch, enforce and increment as one step. Returns the record as it
    /// stood before the increment.
    pub fn reserve_at(
        &self,
        caller: &CallerId,
        plan: Plan,
        bypass: Option<BypassReason>,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, GatewayError> {
        let mut record = match self.records.entry(caller.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                entry.insert(UsageRecord::fresh(caller.clone(), plan, now.date_naive()))
            }
        };
        record.refresh(plan, now);
        self.enforce(&record, bypass)?;
        let before = record.clone();
        record.increment(now);
        Ok(before)
    }

    pub fn quota_at(&self, caller: &CallerId, plan: Plan, now: DateTime<Utc>) -> QuotaView {
        let record = self.touch_at(caller, plan, now);
        if self.bypass.resolve(caller).is_some() {
            return QuotaView {
                remaining: UNLIMITED_REMAINING,
                plan,
                limit: None,
                reset_at: None,
            };
        }
        let limit = self.limits.limit_for(record.plan);
        let remaining = match limit {
            Some(limit) => limit.saturating_sub(record.count),
            None => UNLIMITED_REMAINING,
        };
        QuotaView {
            remaining,
            plan: record.plan,
            limit,
            reset_at: Some(next_utc_midnight(now)),
        }
    }

    /// Put the caller on the pro plan for [`ENTITLEMENT_DAYS`] from `now`.
    pub fn grant_entitlement_at(&self, caller: &CallerId, now: DateTime<Utc>) -> DateTime<Utc> {
        let expires_at = now + Duration::days(ENTITLEMENT_DAYS);
        let mut record = self
            .records
            .entry(caller.clone())
            .or_insert_with(|| UsageRecord::fresh(caller.clone(), Plan::Pro, now.date_naive()));
        record.refresh(Plan::Pro, now);
        record.entitled_until = Some(expires_at);
        record.plan = Plan::Pro;
        expires_at
    }
}

pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn ledger() -> QuotaLedger {
        QuotaLedger::new(PlanLimits::default(), BypassPolicy::default())
    }

    #[test]
    fn plan_parses_case_insensitively() {
        assert_eq!("PRO".parse::<Plan>(), Ok(Plan::Pro));
        assert_eq!(" free ".parse::<Plan>(), Ok(Plan::Free));
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn bypass_precedence() {
        let mut policy = BypassPolicy::default();
        let dev = CallerId::new("dev-bob");
        let user = CallerId::new("bob");
        assert_eq!(policy.resolve(&dev), Some(BypassReason::DeveloperIdentity));
        assert_eq!(policy.resolve(&user), None);

        policy.global = true;
        assert_eq!(policy.resolve(&dev), Some(BypassReason::GlobalFlag));
        assert_eq!(policy.resolve(&user), Some(BypassReason::GlobalFlag));
    }

    #[test]
    fn touch_does_not_count() {
        let ledger = ledger();
        let caller = CallerId::new("u-1");
        ledger.touch_at(&caller, Plan::Free, at(1, 9));
        ledger.quota_at(&caller, Plan::Free, at(1, 9));
        assert_eq!(ledger.touch_at(&caller, Plan::Free, at(1, 10)).count, 0);
    }

    #[test]
    fn free_plan_is_capped() {
        let ledger = ledger();
        let caller = CallerId::new("u-1");
        ledger.reserve_at(&caller, Plan::Free, None, at(1, 9)).unwrap();
        ledger.reserve_at(&caller, Plan::Free, None, at(1, 9)).unwrap();

        let err = ledger.reserve_at(&caller, Plan::Free, None, at(1, 9)).unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExceeded { plan: Plan::Free }));
        assert_eq!(ledger.touch_at(&caller, Plan::Free, at(1, 9)).count, 2);
    }

    #[test]
    fn count_resets_on_new_day() {
        let ledger = ledger();
        let caller = CallerId::new("u-1");
        ledger.reserve_at(&caller, Plan::Free, None, at(1, 22)).unwrap();
        ledger.reserve_at(&caller, Plan::Free, None, at(1, 23)).unwrap();
        assert!(ledger.reserve_at(&caller, Plan::Free, None, at(2, 0)).is_ok());
        assert_eq!(ledger.touch_at(&caller, Plan::Free, at(2, 1)).count, 1);
    }

    #[test]
    fn pro_is_unlimited_by_default() {
        let ledger = ledger();
        let caller = CallerId::new("u-pro");
        for _ in 0..50 {
            ledger.reserve_at(&caller, Plan::Pro, None, at(1, 9)).unwrap();
        }
        let view = ledger.quota_at(&caller, Plan::Pro, at(1, 9));
        assert_eq!(view.remaining, UNLIMITED_REMAINING);
        assert_eq!(view.limit, None);
    }

    #[test]
    fn bypass_skips_enforcement_but_still_counts() {
        let ledger = ledger();
        let caller = CallerId::new("u-1");
        for _ in 0..5 {
            ledger
                .reserve_at(&caller, Plan::Free, Some(BypassReason::GlobalFlag), at(1, 9))
                .unwrap();
        }
        assert_eq!(ledger.touch_at(&caller, Plan::Free, at(1, 9)).count, 5);
    }

    #[test]
    fn increment_counts_once_per_day() {
        let ledger = ledger();
        let caller = CallerId::new("u-1");
        let mut record = ledger.touch_at(&caller, Plan::Free, at(1, 9));
        ledger.enforce(&record, None).unwrap();
        record.increment(at(1, 9));
        record.increment(at(1, 10));
        assert_eq!(record.count, 2);

        record.increment(at(2, 0));
        assert_eq!(record.count, 1);
        assert_eq!(record.reset_day, at(2, 0).date_naive());
    }

    #[test]
    fn quota_view_for_free_caller() {
        let ledger = ledger();
        let caller = CallerId::new("u-1");
        ledger.reserve_at(&caller, Plan::Free, None, at(1, 9)).unwrap();
        let view = ledger.quota_at(&caller, Plan::Free, at(1, 9));
        assert_eq!(view.remaining, 1);
        assert_eq!(view.limit, Some(2));
        assert_eq!(view.plan, Plan::Free);
        assert_eq!(view.reset_at, Some(at(2, 0)));
    }

    #[test]
    fn quota_view_under_bypass() {
        let ledger = ledger();
        let view = ledger.quota_at(&CallerId::new("dev-x"), Plan::Pro, at(1, 9));
        assert_eq!(view.remaining, UNLIMITED_REMAINING);
        assert_eq!(view.plan, Plan::Pro);
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("limit").is_none());
        assert!(json.get("resetAt").is_none());
    }

    #[test]
    fn entitlement_upgrades_until_expiry() {
        let ledger = ledger();
        let caller = CallerId::new("u-1");
        let expires = ledger.grant_entitlement_at(&caller, at(1, 9));
        assert_eq!(expires, at(1, 9) + Duration::days(30));

        assert_eq!(ledger.touch_at(&caller, Plan::Free, at(15, 9)).plan, Plan::Pro);
        let after = expires + Duration::hours(1);
        assert_eq!(ledger.touch_at(&caller, Plan::Free, after).plan, Plan::Free);
    }

    #[test]
    fn concurrent_reservations_never_exceed_cap() {
        let ledger = Arc::new(ledger());
        let caller = CallerId::new("u-race");
        let now = at(1, 9);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let caller = caller.clone();
                std::thread::spawn(move || ledger.reserve_at(&caller, Plan::Free, None, now).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 2);
        assert_eq!(ledger.touch_at(&caller, Plan::Free, now).count, 2);
    }
}

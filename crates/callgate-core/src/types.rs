//! Value types shared by every gate component.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Opaque result bytes returned by a generator and stored in the cache
pub type Payload = bytes::Bytes;

/// Pipeline stage a call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Linguistic analysis of a vocabulary item
    Analysis,
    /// Flashcard authoring from a completed analysis
    CardAuthoring,
}

impl Stage {
    /// Stable name used in keys, logs and storage
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::CardAuthoring => "card_authoring",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "card_authoring" => Ok(Self::CardAuthoring),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Content address of a call result.
///
/// Derived from the stage name and the canonical JSON form of the input, so
/// logically identical requests always share a key regardless of field order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash `stage` and the canonicalized `input`
    #[must_use]
    pub fn derive(stage: Stage, input: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stage.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(input).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Use a caller-chosen key verbatim
    #[must_use]
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a JSON value with object keys sorted at every depth
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Successful generator output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Result bytes
    pub content: Payload,
    /// Prompt tokens billed
    pub input_tokens: u64,
    /// Completion tokens billed
    pub output_tokens: u64,
}

impl RawResponse {
    /// Build a response from content and token counts
    pub fn new(content: impl Into<Payload>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            content: content.into(),
            input_tokens,
            output_tokens,
        }
    }
}

/// Persisted hard caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Tokens per UTC calendar day
    DailyTokens,
    /// Spend per UTC calendar month, in USD
    MonthlyBudget,
}

impl QuotaKind {
    /// Stable name used in storage and logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DailyTokens => "daily_tokens",
            Self::MonthlyBudget => "monthly_budget",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_tokens" => Ok(Self::DailyTokens),
            "monthly_budget" => Ok(Self::MonthlyBudget),
            other => Err(format!("unknown quota kind: {other}")),
        }
    }
}

/// Outcome of one recorded attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// Upstream returned a result
    Success,
    /// Terminal failure
    Error,
    /// Failed attempt that will be retried
    Retried,
    /// Served from cache without an upstream call
    CacheHit,
}

impl UsageStatus {
    /// Stable name used in storage
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Retried => "retried",
            Self::CacheHit => "cache_hit",
        }
    }
}

impl FromStr for UsageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "retried" => Ok(Self::Retried),
            "cache_hit" => Ok(Self::CacheHit),
            other => Err(format!("unknown usage status: {other}")),
        }
    }
}

/// Tokens and cost added to cumulative totals
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Charge {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Cost in USD
    pub cost: f64,
}

impl Charge {
    /// Prompt plus completion tokens
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Portion of `self` not already covered by `charged`
    #[must_use]
    pub fn excess_over(&self, charged: &Charge) -> Charge {
        Charge {
            input_tokens: self.input_tokens.saturating_sub(charged.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(charged.output_tokens),
            cost: (self.cost - charged.cost).max(0.0),
        }
    }

    /// Component-wise sum
    #[must_use]
    pub fn plus(&self, other: &Charge) -> Charge {
        Charge {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cost: self.cost + other.cost,
        }
    }
}

/// Append-only ledger row, one per attempt or cache hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Idempotency key shared by all attempts of one logical request
    pub request_id: String,
    /// Priced model
    pub model: String,
    /// Stage, when known
    pub stage: Option<Stage>,
    /// Outcome
    pub status: UsageStatus,
    /// 1-based physical attempt number (0 for cache hits)
    pub attempt: u32,
    /// Tokens and cost this attempt reported
    pub reported: Charge,
    /// Delta actually added to cumulative totals
    pub charged: Charge,
    /// When the attempt completed
    pub created_at: DateTime<Utc>,
}

/// Reporting window for usage queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePeriod {
    /// Since UTC midnight
    Today,
    /// Trailing seven days
    Week,
    /// Since the first day of the UTC month
    Month,
    /// Everything recorded
    All,
}

impl UsagePeriod {
    /// Lower bound of the period relative to `now`
    #[must_use]
    pub fn since(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Today => Some(start_of_day(now)),
            Self::Week => Some(now - chrono::Duration::days(7)),
            Self::Month => Some(start_of_month(now)),
            Self::All => None,
        }
    }
}

impl FromStr for UsagePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today" => Ok(Self::Today),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "all" => Ok(Self::All),
            other => Err(format!("unknown usage period: {other}")),
        }
    }
}

/// UTC midnight of the day containing `now`
#[must_use]
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    midnight(now.date_naive())
}

/// UTC midnight of the first day of the month containing `now`
#[must_use]
pub fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .map(midnight)
        .unwrap_or_else(|| start_of_day(now))
}

/// Next UTC midnight after `now`
#[must_use]
pub fn next_day(now: DateTime<Utc>) -> DateTime<Utc> {
    start_of_day(now) + chrono::Duration::days(1)
}

/// First instant of the month after the one containing `now`
#[must_use]
pub fn next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(midnight)
        .unwrap_or_else(|| next_day(now))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Aggregated usage over some window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Distinct request ids that reached upstream
    pub requests: u64,
    /// Requests answered from cache
    pub cache_hits: u64,
    /// Physical upstream attempts, including retries
    pub attempts: u64,
    /// Attempts that ended in failure
    pub failed_attempts: u64,
    /// Charged prompt tokens
    pub input_tokens: u64,
    /// Charged completion tokens
    pub output_tokens: u64,
    /// Charged cost in USD
    pub cost: f64,
}

impl UsageTotals {
    /// Prompt plus completion tokens
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Usage report for a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Requested period
    pub period: UsagePeriod,
    /// Lower bound used for the query
    pub since: Option<DateTime<Utc>>,
    /// Totals within the period
    #[serde(flatten)]
    pub totals: UsageTotals,
}

/// Per-model usage breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Model name
    pub model: String,
    /// Distinct request ids
    pub requests: u64,
    /// Charged prompt tokens
    pub input_tokens: u64,
    /// Charged completion tokens
    pub output_tokens: u64,
    /// Charged cost in USD
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_field_order() {
        let a = json!({"word": "Haus", "lang": "de", "meta": {"x": 1, "y": [1, 2]}});
        let b = json!({"meta": {"y": [1, 2], "x": 1}, "lang": "de", "word": "Haus"});
        assert_eq!(CacheKey::derive(Stage::Analysis, &a), CacheKey::derive(Stage::Analysis, &b));
    }

    #[test]
    fn test_key_separates_stages() {
        let input = json!({"word": "Haus"});
        assert_ne!(
            CacheKey::derive(Stage::Analysis, &input),
            CacheKey::derive(Stage::CardAuthoring, &input)
        );
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key = CacheKey::derive(Stage::Analysis, &json!("x"));
        assert_eq!(key.as_str().len(), 64);
        assert_eq!(key.short().len(), 12);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_array_order_matters() {
        let a = CacheKey::derive(Stage::Analysis, &json!([1, 2]));
        let b = CacheKey::derive(Stage::Analysis, &json!([2, 1]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_period_boundaries() {
        let now = Utc.with_ymd_and_hms(2024, 12, 15, 13, 30, 0).unwrap();
        assert_eq!(
            UsagePeriod::Today.since(now),
            Some(Utc.with_ymd_and_hms(2024, 12, 15, 0, 0, 0).unwrap())
        );
        assert_eq!(
            UsagePeriod::Month.since(now),
            Some(Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            UsagePeriod::Week.since(now),
            Some(Utc.with_ymd_and_hms(2024, 12, 8, 13, 30, 0).unwrap())
        );
        assert_eq!(UsagePeriod::All.since(now), None);
        assert_eq!(next_month(now), Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(next_day(now), Utc.with_ymd_and_hms(2024, 12, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_charge_excess() {
        let charged = Charge { input_tokens: 100, output_tokens: 50, cost: 0.001 };
        let smaller = Charge { input_tokens: 80, output_tokens: 10, cost: 0.0005 };
        assert_eq!(smaller.excess_over(&charged), Charge::default());

        let larger = Charge { input_tokens: 150, output_tokens: 50, cost: 0.002 };
        let excess = larger.excess_over(&charged);
        assert_eq!(excess.input_tokens, 50);
        assert_eq!(excess.output_tokens, 0);
        assert!((excess.cost - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_enum_names_round_trip() {
        for status in [UsageStatus::Success, UsageStatus::Error, UsageStatus::Retried, UsageStatus::CacheHit] {
            assert_eq!(status.as_str().parse::<UsageStatus>(), Ok(status));
        }
        assert_eq!("card_authoring".parse::<Stage>(), Ok(Stage::CardAuthoring));
        assert_eq!("monthly_budget".parse::<QuotaKind>(), Ok(QuotaKind::MonthlyBudget));
        assert!("weekly".parse::<QuotaKind>().is_err());
    }

    fn arb_json() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-z]{0,8}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..5)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_canonical_form_is_valid_equivalent_json(value in arb_json()) {
            let canonical = canonical_json(&value);
            let reparsed: serde_json::Value = serde_json::from_str(&canonical).unwrap();
            prop_assert_eq!(&reparsed, &value);
            prop_assert_eq!(canonical_json(&reparsed), canonical);
        }

        #[test]
        fn prop_key_stable_under_reserialization(value in arb_json()) {
            let reparsed: serde_json::Value =
                serde_json::from_str(&serde_json::to_string_pretty(&value).unwrap()).unwrap();
            prop_assert_eq!(
                CacheKey::derive(Stage::Analysis, &value),
                CacheKey::derive(Stage::Analysis, &reparsed)
            );
        }
    }
}

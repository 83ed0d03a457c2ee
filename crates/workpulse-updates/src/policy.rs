//! Maintenance window policy

use chrono::{DateTime, Datelike, Local, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A recurring span of local time during which installs may run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    /// Days the window opens on; empty means every day
    #[serde(default)]
    pub days: Vec<Weekday>,
    /// Local opening time (`HH:MM` or `HH:MM:SS`)
    #[serde(with = "local_time")]
    pub start: NaiveTime,
    /// Local closing time; earlier than `start` wraps past midnight
    #[serde(with = "local_time")]
    pub end: NaiveTime,
}

impl MaintenanceWindow {
    /// Create a window
    pub fn new(days: Vec<Weekday>, start: NaiveTime, end: NaiveTime) -> Self {
        Self { days, start, end }
    }

    fn opens_on(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    /// Whether `at` falls inside the window
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        let day = at.weekday();
        let time = at.time();

        if self.start == self.end {
            return self.opens_on(day);
        }
        if self.start < self.end {
            return self.opens_on(day) && self.start <= time && time < self.end;
        }
        // Wraps midnight: the evening part belongs to `day`, the morning part
        // to the window that opened the day before.
        (self.opens_on(day) && time >= self.start) || (self.opens_on(day.pred()) && time < self.end)
    }
}

/// Allowed install windows. No windows means no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindowSpec {
    #[serde(default)]
    pub windows: Vec<MaintenanceWindow>,
}

/// Decides whether an update may install now
#[derive(Debug, Clone, Default)]
pub struct MaintenanceWindowPolicy {
    spec: MaintenanceWindowSpec,
}

impl MaintenanceWindowPolicy {
    /// Create a policy from its window spec
    pub fn new(spec: MaintenanceWindowSpec) -> Self {
        Self { spec }
    }

    /// Window spec in force
    pub fn spec(&self) -> &MaintenanceWindowSpec {
        &self.spec
    }

    /// Required updates always pass; others only inside a window.
    pub fn is_permitted(&self, now_local: NaiveDateTime, required: bool) -> bool {
        if required || self.spec.windows.is_empty() {
            return true;
        }
        self.spec.windows.iter().any(|w| w.contains(now_local))
    }
}

/// Time source, replaceable in tests
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current wall-clock time in the endpoint's timezone
    fn now_local(&self) -> NaiveDateTime;
}

/// System time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    pub utc: DateTime<Utc>,
    pub local: NaiveDateTime,
}

impl FixedClock {
    /// Frozen clock whose local time equals UTC
    pub fn at(local: NaiveDateTime) -> Self {
        Self {
            utc: local.and_utc(),
            local,
        }
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.utc
    }

    fn now_local(&self) -> NaiveDateTime {
        self.local
    }
}

mod local_time {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M"))
            .map_err(|e| D::Error::custom(format!("invalid time '{raw}': {e}")))
    }
}

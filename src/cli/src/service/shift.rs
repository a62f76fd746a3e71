use std::{collections::BTreeMap, fmt::Debug};

use chrono::{DateTime, Datelike, NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::registry::RegisterAddress;

pub(crate) const DAY_START: u32 = 7;
pub(crate) const NIGHT_START: u32 = 19;
pub(crate) const HOURS_PER_SHIFT: i64 = 12;

#[derive(
  Clone,
  Copy,
  Debug,
  Hash,
  Eq,
  PartialEq,
  Ord,
  PartialOrd,
  Serialize,
  Deserialize,
  sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "shift", rename_all = "lowercase")]
pub(crate) enum Shift {
  Day,
  Night,
}

impl Shift {
  pub(crate) fn for_hour(hour: Hour) -> Self {
    if (DAY_START..NIGHT_START).contains(&hour.value()) {
      Self::Day
    } else {
      Self::Night
    }
  }

  pub(crate) fn other(self) -> Self {
    match self {
      Self::Day => Self::Night,
      Self::Night => Self::Day,
    }
  }

  pub(crate) fn start(self) -> Hour {
    match self {
      Self::Day => Hour(DAY_START),
      Self::Night => Hour(NIGHT_START),
    }
  }

  /// Hours of the shift in the order they are worked.
  pub(crate) fn hours(self) -> impl Iterator<Item = Hour> {
    let start = self.start().value();
    (0..HOURS_PER_SHIFT as u32).map(move |offset| Hour((start + offset) % 24))
  }

  /// Hours of the shift worked strictly before `hour`.
  pub(crate) fn hours_before(self, hour: Hour) -> impl Iterator<Item = Hour> {
    self.hours().take(self.position(hour).unwrap_or(0))
  }

  /// Hours of the shift worked up to and including `hour`.
  pub(crate) fn hours_through(self, hour: Hour) -> impl Iterator<Item = Hour> {
    self
      .hours()
      .take(self.position(hour).map_or(0, |position| position + 1))
  }

  fn position(self, hour: Hour) -> Option<usize> {
    self.hours().position(|candidate| candidate == hour)
  }

  pub(crate) fn as_str(self) -> &'static str {
    match self {
      Self::Day => "day",
      Self::Night => "night",
    }
  }
}

impl std::fmt::Display for Shift {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(
  Clone,
  Copy,
  Debug,
  Hash,
  Eq,
  PartialEq,
  Ord,
  PartialOrd,
  Serialize,
  Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub(crate) struct Hour(u32);

#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
#[error("Hour {0} is outside 0-23")]
pub(crate) struct HourError(pub(crate) u32);

impl Hour {
  pub(crate) fn new(value: u32) -> Result<Self, HourError> {
    if value > 23 {
      return Err(HourError(value));
    }

    Ok(Self(value))
  }

  pub(crate) fn of<TTimeLike: Timelike>(time: &TTimeLike) -> Self {
    Self(time.hour())
  }

  pub(crate) fn value(self) -> u32 {
    self.0
  }

  pub(crate) fn previous(self) -> Self {
    Self((self.0 + 23) % 24)
  }

  pub(crate) fn all() -> impl Iterator<Item = Self> {
    (0..24).map(Self)
  }
}

impl TryFrom<u32> for Hour {
  type Error = HourError;

  fn try_from(value: u32) -> Result<Self, Self::Error> {
    Self::new(value)
  }
}

impl From<Hour> for u32 {
  fn from(value: Hour) -> Self {
    value.0
  }
}

impl std::fmt::Display for Hour {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{:02}:00", self.0)
  }
}

pub(crate) trait Clock: Debug + Send + Sync {
  fn now(&self) -> DateTime<Tz>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemClock {
  timezone: Tz,
}

impl SystemClock {
  pub(crate) fn new(timezone: Tz) -> Self {
    Self { timezone }
  }
}

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Tz> {
    chrono::Utc::now().with_timezone(&self.timezone)
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DateSource {
  Device,
  Local,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct ShiftDates {
  pub(crate) day: NaiveDate,
  pub(crate) night: NaiveDate,
  pub(crate) source: DateSource,
}

impl ShiftDates {
  pub(crate) fn for_shift(&self, shift: Shift) -> NaiveDate {
    match shift {
      Shift::Day => self.day,
      Shift::Night => self.night,
    }
  }
}

/// Raw month/day words as the device reports them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CalendarReading {
  pub(crate) day_month: i64,
  pub(crate) day_date: i64,
  pub(crate) previous_month: i64,
  pub(crate) previous_date: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CalendarLayout {
  pub(crate) day_month: RegisterAddress,
  pub(crate) day_date: RegisterAddress,
  pub(crate) previous_month: RegisterAddress,
  pub(crate) previous_date: RegisterAddress,
}

impl CalendarLayout {
  pub(crate) fn read(
    &self,
    registers: &BTreeMap<RegisterAddress, i64>,
  ) -> Option<CalendarReading> {
    Some(CalendarReading {
      day_month: *registers.get(&self.day_month)?,
      day_date: *registers.get(&self.day_date)?,
      previous_month: *registers.get(&self.previous_month)?,
      previous_date: *registers.get(&self.previous_date)?,
    })
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ProductionLayout {
  pub(crate) current: RegisterAddress,
  pub(crate) previous: RegisterAddress,
}

pub(crate) fn resolve_shift(
  now: DateTime<Tz>,
  reading: Option<CalendarReading>,
) -> ShiftDates {
  let in_progress = Shift::for_hour(Hour::of(&now));
  let today = now.date_naive();

  let from_device = reading.and_then(|reading| {
    let day = infer_date(today, reading.day_month, reading.day_date)?;
    let previous =
      infer_date(today, reading.previous_month, reading.previous_date)?;
    Some((day, previous))
  });

  match from_device {
    Some((day, previous)) => ShiftDates {
      day,
      night: match in_progress {
        Shift::Night => day,
        Shift::Day => previous,
      },
      source: DateSource::Device,
    },
    None => ShiftDates {
      day: today,
      night: match in_progress {
        Shift::Night => today,
        Shift::Day => today.pred_opt().unwrap_or(today),
      },
      source: DateSource::Local,
    },
  }
}

// NOTE: devices report month and day only
fn infer_date(today: NaiveDate, month: i64, day: i64) -> Option<NaiveDate> {
  let month = u32::try_from(month).ok()?;
  let day = u32::try_from(day).ok()?;
  let year = if month > today.month() {
    today.year() - 1
  } else {
    today.year()
  };

  NaiveDate::from_ymd_opt(year, month, day)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct Slot {
  pub(crate) hour: Hour,
  pub(crate) shift: Shift,
  pub(crate) address: RegisterAddress,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct ActiveSlots {
  pub(crate) in_progress: Shift,
  pub(crate) elapsed: Vec<Slot>,
  pub(crate) live: Option<Slot>,
  pub(crate) prior: Vec<Slot>,
}

impl ActiveSlots {
  pub(crate) fn iter(&self) -> impl Iterator<Item = &Slot> {
    self
      .prior
      .iter()
      .chain(self.elapsed.iter())
      .chain(self.live.iter())
  }
}

pub(crate) fn resolve_active_ranges(
  hour: Hour,
  layout: &ProductionLayout,
) -> ActiveSlots {
  let in_progress = Shift::for_hour(hour);
  let prior_shift = in_progress.other();
  let prior_block = match prior_shift {
    Shift::Night => layout.previous,
    Shift::Day => layout.current,
  };

  let slot = |block: RegisterAddress, shift: Shift, hour: Hour| {
    block
      .offset(hour.value())
      .map(|address| Slot {
        hour,
        shift,
        address,
      })
  };

  ActiveSlots {
    in_progress,
    elapsed: in_progress
      .hours_before(hour)
      .filter_map(|hour| slot(layout.current, in_progress, hour))
      .collect(),
    live: slot(layout.current, in_progress, hour),
    prior: prior_shift
      .hours()
      .filter_map(|hour| slot(prior_block, prior_shift, hour))
      .collect(),
  }
}

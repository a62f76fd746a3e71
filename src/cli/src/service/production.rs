use std::collections::{BTreeMap, HashSet};

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;

use super::registry::RegisterAddress;
use super::shift::{ActiveSlots, Hour, Shift, HOURS_PER_SHIFT};

const SECONDS_PER_HOUR: Decimal = dec!(3600);
const SECONDS_PER_MINUTE: Decimal = dec!(60);

/// Idle minutes in an hour that produced `units` at `cycle_time` seconds each.
pub(crate) fn downtime_minutes(units: i64, cycle_time: Decimal) -> i64 {
  let busy = match Decimal::from(units.max(0)).checked_mul(cycle_time) {
    Some(busy) => busy,
    None => return 0,
  };
  let idle = (SECONDS_PER_HOUR - busy) / SECONDS_PER_MINUTE;

  idle
    .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
    .to_i64()
    .unwrap_or(0)
    .max(0)
}

pub(crate) fn achievement_rate(actual: i64, target: i64) -> Decimal {
  if target == 0 {
    return Decimal::ZERO;
  }

  let mut rate =
    (Decimal::from(actual) * dec!(100) / Decimal::from(target)).round_dp(1);
  rate.rescale(1);

  rate
}

pub(crate) fn shift_target(hourly_target: i64) -> i64 {
  hourly_target.saturating_mul(HOURS_PER_SHIFT)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct HourEntry {
  pub(crate) units: i64,
  pub(crate) downtime: i64,
}

/// Latest known production per wall-clock hour for one device.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct HourlyTable {
  hours: [Option<HourEntry>; 24],
}

impl HourlyTable {
  pub(crate) fn get(&self, hour: Hour) -> Option<HourEntry> {
    self.hours[hour.value() as usize]
  }

  pub(crate) fn apply(
    &mut self,
    slots: &ActiveSlots,
    registers: &BTreeMap<RegisterAddress, i64>,
    cycle_time: Decimal,
  ) {
    let active = slots.iter().map(|slot| slot.hour).collect::<HashSet<_>>();
    for hour in Hour::all().filter(|hour| !active.contains(hour)) {
      self.hours[hour.value() as usize] = None;
    }

    for slot in slots.iter() {
      if let Some(units) = registers.get(&slot.address) {
        self.hours[slot.hour.value() as usize] = Some(HourEntry {
          units: *units,
          downtime: downtime_minutes(*units, cycle_time),
        });
      }
    }
  }

  pub(crate) fn totals<TIntoIterator: IntoIterator<Item = Hour>>(
    &self,
    shift: Shift,
    hours: TIntoIterator,
    hourly_target: i64,
  ) -> ShiftTotals {
    let (actual, downtime) = hours
      .into_iter()
      .filter_map(|hour| self.get(hour))
      .fold((0i64, 0i64), |(actual, downtime), entry| {
        (actual + entry.units, downtime + entry.downtime)
      });
    let target = shift_target(hourly_target);

    ShiftTotals {
      shift,
      target,
      actual,
      downtime,
      achievement_rate: achievement_rate(actual, target),
    }
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct ShiftTotals {
  pub(crate) shift: Shift,
  pub(crate) target: i64,
  pub(crate) actual: i64,
  pub(crate) downtime: i64,
  pub(crate) achievement_rate: Decimal,
}

use std::{
  fmt::Display,
  str::FromStr,
  sync::{Arc, OnceLock},
};

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

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
#[serde(try_from = "String", into = "String")]
pub(crate) struct RegisterAddress(u32);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub(crate) enum AddressParseError {
  #[error("Register token {0:?} is not of the form D<number>")]
  Malformed(String),

  #[error("Register token {0:?} is out of range")]
  OutOfRange(String),
}

impl RegisterAddress {
  pub(crate) const MAX: u32 = u16::MAX as u32;

  pub(crate) fn new(index: u32) -> Option<Self> {
    if index > Self::MAX {
      return None;
    }

    Some(Self(index))
  }

  pub(crate) const fn from_u16(index: u16) -> Self {
    Self(index as u32)
  }

  pub(crate) fn index(self) -> u32 {
    self.0
  }

  pub(crate) fn offset(self, offset: u32) -> Option<Self> {
    self.0.checked_add(offset).and_then(Self::new)
  }
}

impl Display for RegisterAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "D{}", self.0)
  }
}

impl FromStr for RegisterAddress {
  type Err = AddressParseError;

  fn from_str(token: &str) -> Result<Self, Self::Err> {
    let captures = register_token()
      .captures(token.trim())
      .ok_or_else(|| AddressParseError::Malformed(token.to_owned()))?;
    let index = captures
      .get(1)
      .and_then(|index| index.as_str().parse::<u32>().ok())
      .ok_or_else(|| AddressParseError::OutOfRange(token.to_owned()))?;

    Self::new(index)
      .ok_or_else(|| AddressParseError::OutOfRange(token.to_owned()))
  }
}

impl TryFrom<String> for RegisterAddress {
  type Error = AddressParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<RegisterAddress> for String {
  fn from(value: RegisterAddress) -> Self {
    value.to_string()
  }
}

fn register_token() -> &'static Regex {
  static TOKEN: OnceLock<Regex> = OnceLock::new();
  TOKEN.get_or_init(|| {
    #[allow(clippy::unwrap_used)] // NOTE: valid regex
    Regex::new(r"^[Dd](\d{1,10})$").unwrap()
  })
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct RegisterRange {
  pub(crate) start: RegisterAddress,
  pub(crate) count: u16,
  pub(crate) description: String,
}

impl RegisterRange {
  pub(crate) fn addresses(&self) -> impl Iterator<Item = RegisterAddress> + '_ {
    (0..self.count as u32).filter_map(|offset| self.start.offset(offset))
  }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct Device {
  pub(crate) id: String,
  pub(crate) name: String,
  pub(crate) address: String,
  pub(crate) port: u16,
  pub(crate) enabled: bool,
  pub(crate) ranges: Vec<RegisterRange>,
  pub(crate) hourly_target: i64,
  pub(crate) cycle_time: Decimal,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub(crate) enum DeviceError {
  #[error("Device {0} has no address")]
  MissingAddress(String),

  #[error("Device {0} has no register ranges")]
  NoRanges(String),

  #[error("Device {device} range {index} has an invalid start")]
  InvalidStart {
    device: String,
    index: usize,
    #[source]
    error: AddressParseError,
  },

  #[error("Device {device} range {index} has a zero count")]
  EmptyRange { device: String, index: usize },

  #[error("Device {device} range {index} runs past the last register")]
  RangeOverflow { device: String, index: usize },

  #[error("Device {0} has a negative hourly target")]
  NegativeTarget(String),

  #[error("Device {0} has a non-positive cycle time")]
  InvalidCycleTime(String),
}

impl Device {
  pub(crate) fn validate(self) -> Result<Self, DeviceError> {
    if self.address.trim().is_empty() {
      return Err(DeviceError::MissingAddress(self.id));
    }
    if self.ranges.is_empty() {
      return Err(DeviceError::NoRanges(self.id));
    }
    for (index, range) in self.ranges.iter().enumerate() {
      if range.count == 0 {
        return Err(DeviceError::EmptyRange {
          device: self.id,
          index,
        });
      }
      if range.start.offset(range.count as u32 - 1).is_none() {
        return Err(DeviceError::RangeOverflow {
          device: self.id,
          index,
        });
      }
    }
    if self.hourly_target < 0 {
      return Err(DeviceError::NegativeTarget(self.id));
    }
    if self.cycle_time <= Decimal::ZERO {
      return Err(DeviceError::InvalidCycleTime(self.id));
    }

    Ok(self)
  }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Registry {
  devices: Arc<Vec<Arc<Device>>>,
}

impl Registry {
  pub(crate) fn new<TIntoIterator: IntoIterator<Item = Device>>(
    devices: TIntoIterator,
  ) -> Self {
    let mut devices = devices.into_iter().map(Arc::new).collect::<Vec<_>>();
    devices.sort_by(|x, y| x.id.cmp(&y.id));

    Self {
      devices: Arc::new(devices),
    }
  }

  pub(crate) fn all(&self) -> impl Iterator<Item = &Arc<Device>> {
    self.devices.iter()
  }

  pub(crate) fn enabled(&self) -> impl Iterator<Item = &Arc<Device>> {
    self.devices.iter().filter(|device| device.enabled)
  }

  pub(crate) fn get(&self, id: &str) -> Option<&Arc<Device>> {
    self.devices.iter().find(|device| device.id == id)
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
  use rust_decimal_macros::dec;

  use super::*;

  pub(crate) fn range(start: u32, count: u16, description: &str) -> RegisterRange {
    RegisterRange {
      start: RegisterAddress::new(start).unwrap(),
      count,
      description: description.to_owned(),
    }
  }

  pub(crate) fn device(id: &str, ranges: Vec<RegisterRange>) -> Device {
    Device {
      id: id.to_owned(),
      name: format!("LINE{id}"),
      address: "127.0.0.1".to_owned(),
      port: 5020,
      enabled: true,
      ranges,
      hourly_target: 20,
      cycle_time: dec!(60),
    }
  }

  #[test]
  fn parses_register_tokens() {
    assert_eq!("D800".parse::<RegisterAddress>().unwrap().index(), 800);
    assert_eq!(" d52 ".parse::<RegisterAddress>().unwrap().index(), 52);
    assert_eq!(
      "M800".parse::<RegisterAddress>(),
      Err(AddressParseError::Malformed("M800".to_owned()))
    );
    assert_eq!(
      "D".parse::<RegisterAddress>(),
      Err(AddressParseError::Malformed("D".to_owned()))
    );
    assert_eq!(
      "D70000".parse::<RegisterAddress>(),
      Err(AddressParseError::OutOfRange("D70000".to_owned()))
    );
  }

  #[test]
  fn displays_as_token() {
    let address = RegisterAddress::new(10100).unwrap();
    assert_eq!(address.to_string(), "D10100");
    assert_eq!(address.offset(5).unwrap().to_string(), "D10105");
  }

  #[test]
  fn expands_range_addresses() {
    let addresses = range(700, 3, "Date info")
      .addresses()
      .map(|address| address.to_string())
      .collect::<Vec<_>>();
    assert_eq!(addresses, vec!["D700", "D701", "D702"]);
  }

  #[test]
  fn rejects_invalid_devices() {
    assert_eq!(
      device("1A", vec![]).validate().unwrap_err(),
      DeviceError::NoRanges("1A".to_owned())
    );
    assert_eq!(
      device("1A", vec![range(800, 0, "Empty")])
        .validate()
        .unwrap_err(),
      DeviceError::EmptyRange {
        device: "1A".to_owned(),
        index: 0
      }
    );
    assert_eq!(
      device("1A", vec![range(65535, 2, "Overflow")])
        .validate()
        .unwrap_err(),
      DeviceError::RangeOverflow {
        device: "1A".to_owned(),
        index: 0
      }
    );
    assert!(device("1A", vec![range(800, 100, "Production")])
      .validate()
      .is_ok());
  }

  #[test]
  fn registry_filters_enabled_devices() {
    let mut disabled = device("1B", vec![range(800, 1, "Production")]);
    disabled.enabled = false;
    let registry =
      Registry::new(vec![disabled, device("1A", vec![range(800, 1, "P")])]);

    assert_eq!(registry.all().count(), 2);
    assert_eq!(
      registry
        .enabled()
        .map(|device| device.id.as_str())
        .collect::<Vec<_>>(),
      vec!["1A"]
    );
    assert!(registry.get("1B").is_some());
  }
}

use std::{collections::BTreeMap, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::service::registry::{self, DeviceError, RegisterAddress};

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Db {
  pub(crate) timeout: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Schedule {
  pub(crate) prune: Option<String>,
  pub(crate) timezone: Option<chrono_tz::Tz>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Calendar {
  pub(crate) day_month: Option<String>,
  pub(crate) day_date: Option<String>,
  pub(crate) previous_month: Option<String>,
  pub(crate) previous_date: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Blocks {
  pub(crate) current: Option<String>,
  pub(crate) previous: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Production {
  pub(crate) hourly_target: Option<i64>,
  pub(crate) cycle_time: Option<Decimal>,
  #[serde(default)]
  pub(crate) calendar: Calendar,
  #[serde(default)]
  pub(crate) blocks: Blocks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RegisterRange {
  pub(crate) start: String,
  pub(crate) count: u16,
  pub(crate) description: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Device {
  pub(crate) name: Option<String>,
  pub(crate) address: Option<String>,
  pub(crate) port: Option<u16>,
  pub(crate) enabled: Option<bool>,
  pub(crate) hourly_target: Option<i64>,
  pub(crate) cycle_time: Option<Decimal>,
  #[serde(default)]
  pub(crate) ranges: Vec<RegisterRange>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Values {
  pub(crate) log_level: Option<LogLevel>,
  pub(crate) poll_interval: Option<u32>,
  pub(crate) connection_timeout: Option<u32>,
  pub(crate) max_retries: Option<u32>,
  pub(crate) retry_delay: Option<u32>,
  pub(crate) termination_timeout: Option<u32>,
  pub(crate) history_retention_hours: Option<u32>,
  pub(crate) production_retention_days: Option<u32>,
  pub(crate) snapshot_file: Option<String>,
  pub(crate) snapshot_interval: Option<u32>,
  pub(crate) push_capacity: Option<usize>,
  pub(crate) history_queue_capacity: Option<usize>,
  #[serde(default)]
  pub(crate) db: Db,
  #[serde(default)]
  pub(crate) schedule: Schedule,
  #[serde(default)]
  pub(crate) production: Production,
  pub(crate) devices: Option<BTreeMap<String, Device>>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
  #[error("Failed creating project directories")]
  MissingProjectDirs,

  #[error("Failed reading config file")]
  Read(#[from] std::io::Error),

  #[error("Config file is missing an extension")]
  MissingExtension,

  #[error("Config file has invalid extension")]
  InvalidExtension,

  #[error("Failed deserializing config from yaml")]
  DeserializetionYaml(#[from] serde_yaml::Error),

  #[error("Failed deserializing config from toml")]
  DeserializetionToml(#[from] toml::de::Error),

  #[error("Failed deserializing config from json")]
  DeserializetionJson(#[from] serde_json::Error),
}

pub(crate) async fn parse_async(
  location: Option<&str>,
) -> Result<Values, ParseError> {
  let location = match location {
    Some(location) => std::path::PathBuf::from(location),
    None => {
      let location =
        match directories::ProjectDirs::from("com", "linepool", "linepool") {
          Some(project_dirs) => project_dirs.config_dir().join("config.yaml"),
          None => return Err(ParseError::MissingProjectDirs),
        };
      if !tokio::fs::try_exists(&location).await.unwrap_or(false) {
        tracing::warn!(
          "No config file at {}, running with defaults",
          location.display()
        );
        return Ok(Values::default());
      }
      location
    }
  };

  let raw = tokio::fs::read_to_string(location.clone()).await?;
  let extension = location.extension().and_then(|str| str.to_str());
  parse_str(raw.as_str(), extension)
}

pub(crate) fn parse_str(
  raw: &str,
  extension: Option<&str>,
) -> Result<Values, ParseError> {
  let values = match extension {
    None => return Err(ParseError::MissingExtension),
    Some("yaml" | "yml") => serde_yaml::from_str::<Values>(raw)?,
    Some("toml") => toml::from_str::<Values>(raw)?,
    Some("json") => serde_json::from_str::<Values>(raw)?,
    Some(_) => return Err(ParseError::InvalidExtension),
  };

  Ok(values)
}

pub(crate) fn to_device(
  id: String,
  device: Device,
  hourly_target: i64,
  cycle_time: Decimal,
) -> Result<registry::Device, DeviceError> {
  let mut ranges = Vec::with_capacity(device.ranges.len());
  for (index, range) in device.ranges.into_iter().enumerate() {
    let start = match range.start.parse::<RegisterAddress>() {
      Ok(start) => start,
      Err(error) => {
        return Err(DeviceError::InvalidStart {
          device: id,
          index,
          error,
        })
      }
    };
    ranges.push(registry::RegisterRange {
      start,
      count: range.count,
      description: range
        .description
        .unwrap_or_else(|| format!("{} x{}", start, range.count)),
    });
  }

  registry::Device {
    name: device.name.unwrap_or_else(|| id.clone()),
    address: device.address.unwrap_or_default(),
    port: device.port.unwrap_or(5020),
    enabled: device.enabled.unwrap_or(true),
    ranges,
    hourly_target: device.hourly_target.unwrap_or(hourly_target),
    cycle_time: device.cycle_time.unwrap_or(cycle_time),
    id,
  }
  .validate()
}

pub(crate) fn to_address(token: &Option<String>, default: u16) -> RegisterAddress {
  match token.as_deref().map(RegisterAddress::from_str) {
    None => RegisterAddress::from_u16(default),
    Some(Ok(address)) => address,
    Some(Err(error)) => {
      tracing::warn!("Invalid register {}, using D{}", error, default);
      RegisterAddress::from_u16(default)
    }
  }
}

pub(crate) fn default_devices() -> BTreeMap<String, Device> {
  [("1A", "SLAP1A", "192.168.150.22"), ("1B", "SLAP1B", "192.168.150.24")]
    .into_iter()
    .map(|(id, name, address)| {
      (
        id.to_owned(),
        Device {
          name: Some(name.to_owned()),
          address: Some(address.to_owned()),
          port: Some(5020),
          enabled: Some(true),
          hourly_target: None,
          cycle_time: None,
          ranges: default_ranges(),
        },
      )
    })
    .collect()
}

fn default_ranges() -> Vec<RegisterRange> {
  [
    ("D52", 1, "Date"),
    ("D700", 20, "Date info"),
    ("D800", 100, "Production current day"),
    ("D850", 100, "Production previous day"),
    ("D5000", 100, "Alarm data today"),
    ("D5100", 100, "Alarm data yesterday"),
    ("D10100", 100, "Time slot 7-11am"),
    ("D10200", 100, "Time slot 11am-3pm"),
    ("D10300", 100, "Time slot 3-7pm"),
    ("D10400", 100, "Time slot 7-11pm"),
    ("D10500", 100, "Time slot 11pm-3am"),
    ("D10600", 100, "Time slot 3-7am"),
  ]
  .into_iter()
  .map(|(start, count, description)| RegisterRange {
    start: start.to_owned(),
    count,
    description: Some(description.to_owned()),
  })
  .collect()
}

pub(crate) fn seconds_to_chrono(seconds: u32) -> chrono::Duration {
  chrono::Duration::seconds(seconds as i64)
}

pub(crate) fn string_to_cron(
  string: &Option<String>,
  default: &str,
) -> cron::Schedule {
  let string = {
    if let Some(string) = string {
      string.as_str()
    } else {
      default
    }
  };

  let result = cron::Schedule::from_str(string);
  if let Ok(result) = result {
    return result;
  }
  tracing::warn!("Invalid schedule {}, using {}", string, default);

  let result = cron::Schedule::from_str(default);
  match result {
    Ok(result) => return result,
    Err(error) => {
      tracing::warn! {
        %error,
        "Failed parsing default set schedule string"
      }
    }
  }

  #[allow(clippy::unwrap_used)] // NOTE: this is a valid cron expression
  cron::Schedule::from_str(
    // NOTE: every hour
    // NOTE: sec | min | hour | day of month | month | day of week | year
    "        0     0     *      *              *       *             *",
  )
  .unwrap()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
  use rust_decimal_macros::dec;

  use super::*;

  const YAML: &str = r#"
log_level: info
poll_interval: 3
max_retries: 5
schedule:
  timezone: America/Chicago
production:
  hourly_target: 45
  blocks:
    current: D900
devices:
  1A:
    name: SLAP1A
    address: 10.0.0.2
    ranges:
      - start: D700
        count: 20
        description: Date info
      - start: D800
        count: 100
  1C:
    address: 10.0.0.4
    cycle_time: 30
    ranges:
      - start: X800
        count: 1
"#;

  #[test]
  fn parses_yaml_file() {
    let values = parse_str(YAML, Some("yaml")).unwrap();

    assert_eq!(values.poll_interval, Some(3));
    assert_eq!(values.schedule.timezone, Some(chrono_tz::America::Chicago));
    assert_eq!(values.production.hourly_target, Some(45));
    assert_eq!(values.devices.as_ref().map(BTreeMap::len), Some(2));
    assert!(matches!(
      parse_str(YAML, Some("ini")),
      Err(ParseError::InvalidExtension)
    ));
  }

  #[test]
  fn converts_devices_with_defaults() {
    let mut values = parse_str(YAML, Some("yaml")).unwrap();
    let mut devices = values.devices.take().unwrap();

    let line = to_device(
      "1A".to_owned(),
      devices.remove("1A").unwrap(),
      45,
      dec!(60),
    )
    .unwrap();
    assert_eq!(line.port, 5020);
    assert!(line.enabled);
    assert_eq!(line.hourly_target, 45);
    assert_eq!(line.ranges[1].description, "D800 x100");

    let invalid = to_device(
      "1C".to_owned(),
      devices.remove("1C").unwrap(),
      45,
      dec!(60),
    );
    assert!(matches!(invalid, Err(DeviceError::InvalidStart { .. })));
  }

  #[test]
  fn falls_back_to_default_addresses() {
    assert_eq!(to_address(&None, 800).index(), 800);
    assert_eq!(to_address(&Some("D900".to_owned()), 800).index(), 900);
    assert_eq!(to_address(&Some("nope".to_owned()), 850).index(), 850);
  }

  #[test]
  fn default_devices_are_valid() {
    let devices = default_devices()
      .into_iter()
      .map(|(id, device)| to_device(id, device, 60, dec!(60)))
      .collect::<Result<Vec<_>, _>>()
      .unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].ranges.len(), 12);
    assert_eq!(devices[1].address, "192.168.150.24");
  }

  #[test]
  fn invalid_cron_falls_back() {
    let schedule = string_to_cron(&Some("whenever".to_owned()), "0 0 * * * * *");
    assert!(schedule.upcoming(chrono::Utc).next().is_some());
  }
}

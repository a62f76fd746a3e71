use std::collections::BTreeMap;

use futures_time::future::FutureExt;

use super::field::{ReadError, Session};
use super::registry::{RegisterAddress, RegisterRange};

#[derive(Debug, thiserror::Error)]
pub(crate) enum RangeError {
  #[error("Failed reading {description} at {start}")]
  Read {
    start: RegisterAddress,
    description: String,
    #[source]
    error: ReadError,
  },

  #[error("Timed out reading {description} at {start}")]
  Timeout {
    start: RegisterAddress,
    description: String,
  },

  #[error("Short read of {description} at {start}: {received}/{expected}")]
  Truncated {
    start: RegisterAddress,
    description: String,
    expected: u16,
    received: usize,
  },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PollError {
  #[error("All {} ranges failed", .0.len())]
  Total(Vec<RangeError>),
}

#[derive(Debug, Default)]
pub(crate) struct Outcome {
  pub(crate) registers: BTreeMap<RegisterAddress, i64>,
  pub(crate) errors: Vec<RangeError>,
}

/// Reads every range once, merging the ranges that succeed.
#[tracing::instrument(skip_all, fields(ranges = ranges.len()))]
pub(crate) async fn poll(
  session: &mut Box<dyn Session>,
  ranges: &[RegisterRange],
  timeout: futures_time::time::Duration,
) -> Result<Outcome, PollError> {
  let mut outcome = Outcome::default();

  for range in ranges {
    let read = session
      .read_words(range.start, range.count)
      .timeout(timeout)
      .await;
    let words = match read {
      Ok(Ok(words)) if words.len() >= range.count as usize => words,
      Ok(Ok(words)) => {
        outcome.errors.push(RangeError::Truncated {
          start: range.start,
          description: range.description.clone(),
          expected: range.count,
          received: words.len(),
        });
        continue;
      }
      Ok(Err(error)) => {
        outcome.errors.push(RangeError::Read {
          start: range.start,
          description: range.description.clone(),
          error,
        });
        continue;
      }
      Err(_) => {
        outcome.errors.push(RangeError::Timeout {
          start: range.start,
          description: range.description.clone(),
        });
        continue;
      }
    };

    outcome.registers.extend(
      range
        .addresses()
        .zip(words)
        .map(|(address, word)| (address, word as i64)),
    );
  }

  for error in &outcome.errors {
    tracing::warn!("{}", error);
  }

  if outcome.registers.is_empty() && !outcome.errors.is_empty() {
    return Err(PollError::Total(outcome.errors));
  }

  tracing::trace!("Read {} registers", outcome.registers.len());

  Ok(outcome)
}

use crate::error::DownloadError;
use std::{future::Future, time::Duration};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
  pub interval: Duration,
  pub max_attempts: u32,
}

/// How one poll response reads.
pub enum Tick<T> {
  Pending,
  Done(T),
  Failed(String),
}

/// Why a polling loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
  Completed(T),
  /// The server answered 404: the job expired or never existed.
  JobExpired,
  BackendError(String),
  TimedOut,
  Cancelled,
}

impl<T> PollOutcome<T> {
  pub fn into_result(self) -> Result<T, DownloadError> {
    match self {
      PollOutcome::Completed(value) => Ok(value),
      PollOutcome::JobExpired => Err(DownloadError::JobExpired),
      PollOutcome::BackendError(msg) => Err(DownloadError::BackendReported(msg)),
      PollOutcome::TimedOut => Err(DownloadError::Timeout),
      PollOutcome::Cancelled => Err(DownloadError::Cancelled),
    }
  }
}

#[derive(Debug)]
pub struct PollResult<T> {
  pub outcome: PollOutcome<T>,
  /// Polls that ended without a terminal answer (including transient failures).
  pub attempts: u32,
}

/// Polls sequentially at a fixed interval until `classify` reports a terminal answer, the
/// server returns 404, the attempt ceiling is reached, or `run` flips to false.
///
/// Transient remote failures consume an attempt and are retried; a 404 stops immediately
/// without consuming one.
pub async fn poll_until<T, R, P, Fut, C>(
  mut poll: P,
  mut classify: C,
  policy: PollPolicy,
  mut run: watch::Receiver<bool>,
) -> PollResult<T>
where
  P: FnMut() -> Fut,
  Fut: Future<Output = Result<R, DownloadError>>,
  C: FnMut(R) -> Tick<T>,
{
  let mut attempts = 0u32;
  loop {
    if !*run.borrow_and_update() {
      return PollResult {
        outcome: PollOutcome::Cancelled,
        attempts,
      };
    }

    match poll().await {
      Ok(report) => match classify(report) {
        Tick::Done(value) => {
          return PollResult {
            outcome: PollOutcome::Completed(value),
            attempts,
          }
        }
        Tick::Failed(message) => {
          return PollResult {
            outcome: PollOutcome::BackendError(message),
            attempts,
          }
        }
        Tick::Pending => {}
      },
      Err(DownloadError::JobExpired) => {
        return PollResult {
          outcome: PollOutcome::JobExpired,
          attempts,
        }
      }
      Err(e) => {
        tracing::warn!(attempt = attempts + 1, error = %e, "status poll failed; retrying");
      }
    }

    attempts += 1;
    if attempts >= policy.max_attempts {
      return PollResult {
        outcome: PollOutcome::TimedOut,
        attempts,
      };
    }

    tokio::select! {
      _ = tokio::time::sleep(policy.interval) => {}
      changed = run.changed() => {
        if changed.is_err() {
          return PollResult { outcome: PollOutcome::Cancelled, attempts };
        }
      }
    }
  }
}

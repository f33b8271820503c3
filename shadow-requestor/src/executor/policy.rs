//! Restore-method fallback.
//!
//! Each attempt materialises the whole component or nothing. Only a conflict
//! leads to another attempt, and no mode is attempted twice.

use tracing::warn;

use crate::catalog::{RestoreMethod, RestoreTarget};
use crate::transfer::{MaterializeMode, TransferError};

/// Mode of the first attempt.
pub fn initial_mode(method: RestoreMethod, target: RestoreTarget) -> MaterializeMode {
    if target == RestoreTarget::Alternate {
        return MaterializeMode::Overwrite;
    }
    match method {
        RestoreMethod::RestoreIfNotThere => MaterializeMode::CreateOnly,
        RestoreMethod::RestoreAtReboot => MaterializeMode::AtReboot,
        _ => MaterializeMode::Overwrite,
    }
}

/// Mode to retry with after `failed` hit a conflict.
pub fn fallback_mode(method: RestoreMethod, failed: MaterializeMode, has_alternate: bool) -> Option<MaterializeMode> {
    match failed {
        MaterializeMode::Overwrite if method == RestoreMethod::RestoreAtRebootIfCannotReplace => {
            Some(MaterializeMode::AtReboot)
        }
        MaterializeMode::CreateOnly | MaterializeMode::Overwrite if has_alternate => {
            Some(MaterializeMode::AlternateLocation)
        }
        _ => None,
    }
}

/// Result of [`run_with_fallback`].
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    /// Modes in the order they were attempted.
    pub attempts: Vec<MaterializeMode>,
    pub result: Result<T, TransferError>,
}

impl<T> FallbackOutcome<T> {
    pub fn retries(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }

    /// Mode of the last attempt.
    pub fn final_mode(&self) -> Option<MaterializeMode> {
        self.attempts.last().copied()
    }
}

/// Run `attempt` under the method's initial mode, falling back on conflicts.
pub fn run_with_fallback<T, F>(
    method: RestoreMethod,
    target: RestoreTarget,
    has_alternate: bool,
    mut attempt: F,
) -> FallbackOutcome<T>
where
    F: FnMut(MaterializeMode) -> Result<T, TransferError>,
{
    let mut attempts = Vec::new();
    let mut mode = initial_mode(method, target);

    loop {
        attempts.push(mode);
        let result = attempt(mode);

        let next = match &result {
            Err(e) if e.is_conflict() => fallback_mode(method, mode, has_alternate).filter(|m| !attempts.contains(m)),
            _ => None,
        };

        match (result, next) {
            (Err(e), Some(next)) => {
                warn!("{:?} restore hit a conflict ({}), retrying as {:?}", mode, e, next);
                mode = next;
            }
            (result, _) => return FallbackOutcome { attempts, result },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn conflict() -> TransferError {
        TransferError::Conflict {
            path: PathBuf::from("/srv/db/main.db"),
        }
    }

    #[test]
    fn test_conflict_retries_once_as_alternate_location() {
        let outcome = run_with_fallback(RestoreMethod::RestoreIfCanReplace, RestoreTarget::Original, true, |mode| {
            if mode == MaterializeMode::Overwrite {
                Err(conflict())
            } else {
                Ok(mode)
            }
        });
        assert_eq!(
            outcome.attempts,
            vec![MaterializeMode::Overwrite, MaterializeMode::AlternateLocation]
        );
        assert_eq!(outcome.retries(), 1);
        assert_eq!(outcome.result.unwrap(), MaterializeMode::AlternateLocation);
    }

    #[test]
    fn test_conflict_without_mapping_does_not_retry() {
        let outcome: FallbackOutcome<()> =
            run_with_fallback(RestoreMethod::RestoreIfCanReplace, RestoreTarget::Original, false, |_| {
                Err(conflict())
            });
        assert_eq!(outcome.retries(), 0);
        assert!(outcome.result.unwrap_err().is_conflict());
    }

    #[test]
    fn test_alternate_conflict_is_final() {
        let outcome: FallbackOutcome<()> =
            run_with_fallback(RestoreMethod::RestoreIfNotThere, RestoreTarget::Original, true, |_| Err(conflict()));
        assert_eq!(
            outcome.attempts,
            vec![MaterializeMode::CreateOnly, MaterializeMode::AlternateLocation]
        );
        assert!(outcome.result.is_err());
    }

    #[test]
    fn test_at_reboot_if_cannot_replace_retries_once() {
        let outcome: FallbackOutcome<()> = run_with_fallback(
            RestoreMethod::RestoreAtRebootIfCannotReplace,
            RestoreTarget::Original,
            true,
            |_| Err(conflict()),
        );
        assert_eq!(outcome.attempts, vec![MaterializeMode::Overwrite, MaterializeMode::AtReboot]);
    }

    #[test]
    fn test_io_failure_is_not_retried() {
        let outcome: FallbackOutcome<()> =
            run_with_fallback(RestoreMethod::RestoreIfCanReplace, RestoreTarget::Original, true, |_| {
                Err(TransferError::Journal("broken".into()))
            });
        assert_eq!(outcome.retries(), 0);
    }

    #[test]
    fn test_initial_modes() {
        assert_eq!(
            initial_mode(RestoreMethod::RestoreIfNotThere, RestoreTarget::Original),
            MaterializeMode::CreateOnly
        );
        assert_eq!(
            initial_mode(RestoreMethod::RestoreIfNotThere, RestoreTarget::Alternate),
            MaterializeMode::Overwrite
        );
        assert_eq!(
            initial_mode(RestoreMethod::RestoreToAlternateLocation, RestoreTarget::Original),
            MaterializeMode::Overwrite
        );
        assert_eq!(
            initial_mode(RestoreMethod::RestoreAtReboot, RestoreTarget::Original),
            MaterializeMode::AtReboot
        );
        assert_eq!(
            initial_mode(RestoreMethod::Undefined, RestoreTarget::Original),
            MaterializeMode::Overwrite
        );
    }
}

//! Per-device lifecycle transition rules.
//!
//! Pure functions over `SyncState`; the engine owns the state itself and
//! applies the returned transitions under its device lock.

use contracts::SyncState;
use thiserror::Error;

/// Input that may move a device to another state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Caller or auto-sync asked for a probe batch
    SyncRequested,
    EstimateSucceeded,
    /// Estimator rejected the batch (too few survivors, uncertainty)
    EstimateFailed,
    /// Probe or event send failed, valid from any state
    TransportFailed,
    RecoveryStarted,
    RecoverySucceeded,
    RecoveryFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition from {from} on {trigger:?}")]
pub struct InvalidTransition {
    pub from: SyncState,
    pub trigger: SyncTrigger,
}

/// Next state for `trigger`, or an error when the trigger is not valid in `current`.
pub fn next_state(current: SyncState, trigger: SyncTrigger) -> Result<SyncState, InvalidTransition> {
    use SyncState::*;
    use SyncTrigger::*;

    match trigger {
        SyncRequested => from_any_of(
            current,
            trigger,
            &[Idle, Synchronized, Error, NetworkError],
            Syncing,
        ),
        EstimateSucceeded => from_state(current, trigger, Syncing, Synchronized),
        EstimateFailed => from_state(current, trigger, Syncing, Error),
        TransportFailed => Ok(NetworkError),
        RecoveryStarted => from_state(current, trigger, NetworkError, Recovering),
        RecoverySucceeded => from_state(current, trigger, Recovering, Synchronized),
        RecoveryFailed => from_state(current, trigger, Recovering, NetworkError),
    }
}

/// Whether a new probe batch may start from `current`
pub fn can_start_sync(current: SyncState) -> bool {
    next_state(current, SyncTrigger::SyncRequested).is_ok()
}

fn from_state(
    current: SyncState,
    trigger: SyncTrigger,
    expected: SyncState,
    next: SyncState,
) -> Result<SyncState, InvalidTransition> {
    from_any_of(current, trigger, &[expected], next)
}

fn from_any_of(
    current: SyncState,
    trigger: SyncTrigger,
    allowed: &[SyncState],
    next: SyncState,
) -> Result<SyncState, InvalidTransition> {
    if allowed.contains(&current) {
        Ok(next)
    } else {
        Err(InvalidTransition {
            from: current,
            trigger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SyncState::*;
    use SyncTrigger::*;

    const ALL: [SyncState; 6] = [Idle, Syncing, Synchronized, Error, NetworkError, Recovering];

    #[test]
    fn test_sync_request_sources() {
        for state in [Idle, Synchronized, Error, NetworkError] {
            assert_eq!(next_state(state, SyncRequested), Ok(Syncing));
        }
        for state in [Syncing, Recovering] {
            assert!(!can_start_sync(state));
        }
    }

    #[test]
    fn test_estimate_outcomes() {
        assert_eq!(next_state(Syncing, EstimateSucceeded), Ok(Synchronized));
        assert_eq!(next_state(Syncing, EstimateFailed), Ok(Error));
        assert!(next_state(Idle, EstimateSucceeded).is_err());
    }

    #[test]
    fn test_transport_failure_from_any_state() {
        for state in ALL {
            assert_eq!(next_state(state, TransportFailed), Ok(NetworkError));
        }
    }

    #[test]
    fn test_recovery_cycle() {
        let recovering = next_state(NetworkError, RecoveryStarted).unwrap();
        assert_eq!(recovering, Recovering);
        assert_eq!(next_state(recovering, RecoveryFailed), Ok(NetworkError));
        assert_eq!(next_state(recovering, RecoverySucceeded), Ok(Synchronized));
        assert!(next_state(Error, RecoveryStarted).is_err());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = next_state(Idle, RecoverySucceeded).unwrap_err();
        assert_eq!(err.to_string(), "invalid transition from idle on RecoverySucceeded");
    }
}

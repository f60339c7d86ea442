use thiserror::Error;

use crate::task::State;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },
    #[error("state transition from {from} to {to} is not implemented")]
    NotImplemented { from: State, to: State },
}

/// Valida el paso `from -> to`. Las transiciones identidad no hacen nada.
pub fn validate_transition(from: State, to: State) -> Result<(), TransitionError> {
    use State::*;

    if from == to {
        return Ok(());
    }
    if from == Paused || to == Paused {
        return Err(TransitionError::NotImplemented { from, to });
    }

    let ok = match from {
        Unknown => to == Queued,
        Queued => matches!(to, Initializing | Running | SystemError | Canceled),
        Initializing => matches!(to, Running | ExecutorError | SystemError | Canceled),
        Running => matches!(to, Complete | ExecutorError | SystemError | Canceled),
        // estados terminales: nada sale de ellos
        Complete | ExecutorError | SystemError | Canceled | Paused => false,
    };

    if ok {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition { from, to })
    }
}

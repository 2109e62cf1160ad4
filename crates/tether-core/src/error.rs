//! Error taxonomy shared by the handle wrapper, the listener arena and
//! continuations.

use std::borrow::Cow;
use std::panic::Location;

use crate::continuation::State;

/// Everything the core reports to its caller.
///
/// None of these are retried or downgraded; they surface at the call that
/// violated the contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A handle-producing call returned the absent sentinel.
    #[error("{what} returned no handle ({location})")]
    ResourceAcquisition {
        what: Cow<'static, str>,
        location: &'static Location<'static>,
    },

    /// A second listener was registered on a single-registration handle.
    #[error("a listener is already registered on this {interface} handle")]
    DuplicateRegistration { interface: &'static str },

    /// The continuation contract was misused.
    #[error("cannot {operation} a continuation in state {state:?}")]
    InvalidContinuationState {
        operation: &'static str,
        state: State,
    },

    /// The transport reported the connection unusable.
    #[error("transport failure")]
    Transport(#[from] std::io::Error),
}

impl Error {
    #[track_caller]
    pub(crate) fn acquisition(what: impl Into<Cow<'static, str>>) -> Self {
        Self::ResourceAcquisition {
            what: what.into(),
            location: Location::caller(),
        }
    }

    /// Call site of a failed acquisition, if this is one.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            Self::ResourceAcquisition { location, .. } => Some(location),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_failure_reports_call_site() {
        let err = Error::acquisition("wl_display_connect");
        let location = err.location().unwrap();
        assert_eq!(location.file(), file!());

        let message = err.to_string();
        assert!(message.starts_with("wl_display_connect returned no handle"));
        assert!(message.contains(&format!("{}:{}", file!(), location.line())));
    }

    #[test]
    fn test_other_errors_have_no_location() {
        let err = Error::DuplicateRegistration { interface: "wl_seat" };
        assert!(err.location().is_none());
        assert_eq!(
            err.to_string(),
            "a listener is already registered on this wl_seat handle"
        );
    }
}

use fleet_common::bus::OutcomeKind;

/// Why a permanent failure is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// The resource does not exist (HTTP 404).
    NotFound,
    /// The request was refused even after the parameter-naming fallback.
    ClientRequest,
    /// Any other provider refusal (403, 409, ...).
    Rejected,
    /// The payload does not fit the internal schema.
    Schema,
}

/// Failure of a cloud API call after the retrying client is done with it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiFailure {
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    Transient {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
    #[error("{operation} failed permanently: {reason}")]
    Permanent {
        operation: &'static str,
        kind: PermanentKind,
        reason: String,
    },
}

impl ApiFailure {
    pub fn schema(operation: &'static str, reason: impl Into<String>) -> Self {
        ApiFailure::Permanent {
            operation,
            kind: PermanentKind::Schema,
            reason: reason.into(),
        }
    }

    /// The resource is absent: a 404, never a transient hiccup.
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            ApiFailure::Permanent {
                kind: PermanentKind::NotFound,
                ..
            }
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiFailure::Transient { .. })
    }
}

/// Reason an operation was refused or failed without timing out.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Rejection {
    #[error("{0}")]
    Precondition(String),
    #[error("{user} is not allowed to {operation} instance {instance_id}")]
    Forbidden {
        user: String,
        operation: &'static str,
        instance_id: String,
    },
    #[error("instance {0} is protected")]
    Protected(String),
    #[error("instance {0} is the orchestrator host")]
    SelfHost(String),
    #[error("cannot tell whether instance {0} is the orchestrator host")]
    IdentityUnresolved(String),
    #[error("snapshot failed")]
    SnapshotFailed,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Provider(#[from] ApiFailure),
}

/// Result of a lifecycle operation.
///
/// `TimedOut` is a soft failure: the command was accepted but the target state
/// was not observed within the budget. The last known state is attached so the
/// caller can decide whether to look again later.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Succeeded(T),
    TimedOut(Option<T>),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Succeeded(_) => OutcomeKind::Succeeded,
            Outcome::TimedOut(_) => OutcomeKind::TimedOut,
            Outcome::Rejected(_) => OutcomeKind::Rejected,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    pub fn succeeded(self) -> Option<T> {
        match self {
            Outcome::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(r) => Some(r),
            _ => None,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Outcome::Rejected(r) => Some(r.to_string()),
            Outcome::TimedOut(_) => Some("target state not reached in time".to_string()),
            Outcome::Succeeded(_) => None,
        }
    }
}

impl<T> From<Rejection> for Outcome<T> {
    fn from(r: Rejection) -> Self {
        Outcome::Rejected(r)
    }
}

impl<T> From<ApiFailure> for Outcome<T> {
    fn from(e: ApiFailure) -> Self {
        Outcome::Rejected(Rejection::Provider(e))
    }
}

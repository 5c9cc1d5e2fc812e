/// How the retrying layer should treat a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network trouble, timeouts, 408/429/5xx, unreadable bodies: retry.
    Transient,
    /// 404: the resource does not exist (any more).
    NotFound,
    /// 400/422: the request itself was refused, possibly over parameter naming.
    ClientRequest,
    /// Any other refusal. Never retried.
    Permanent,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("status={status} body={body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ApiError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        ApiError::Status {
            status,
            body: body.into(),
        }
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::status(404, format!("{} not found", what))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Transport(_) | ApiError::Timeout(_) | ApiError::MalformedResponse(_) => {
                ErrorClass::Transient
            }
            ApiError::Status { status, .. } => match *status {
                404 => ErrorClass::NotFound,
                400 | 422 => ErrorClass::ClientRequest,
                408 | 429 => ErrorClass::Transient,
                s if s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout(e.to_string())
        } else if e.is_decode() {
            ApiError::MalformedResponse(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::status(status.as_u16(), e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ApiError::status(404, "").class(), ErrorClass::NotFound);
        assert_eq!(ApiError::status(400, "").class(), ErrorClass::ClientRequest);
        assert_eq!(ApiError::status(422, "").class(), ErrorClass::ClientRequest);
        assert_eq!(ApiError::status(429, "").class(), ErrorClass::Transient);
        assert_eq!(ApiError::status(503, "").class(), ErrorClass::Transient);
        assert_eq!(ApiError::status(403, "").class(), ErrorClass::Permanent);
        assert_eq!(ApiError::status(409, "").class(), ErrorClass::Permanent);
    }

    #[test]
    fn transport_failures_are_transient() {
        assert_eq!(
            ApiError::Transport("connection reset".into()).class(),
            ErrorClass::Transient
        );
        let timeout = ApiError::Timeout("operation timed out".into());
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert_eq!(timeout.to_string(), "request timed out: operation timed out");
        assert_eq!(
            ApiError::MalformedResponse("eof".into()).class(),
            ErrorClass::Transient
        );
    }
}

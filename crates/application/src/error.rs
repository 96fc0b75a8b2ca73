use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::queue::QueueError;

/// 应用层错误
///
/// 变体与客户端可见的错误类别一一对应，见 [`ApplicationError::kind`]。
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("terminal state: {0}")]
    TerminalState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl ApplicationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// 回写给客户端的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Authorization(_) => "authorization",
            Self::Conflict(_) => "conflict",
            Self::Connectivity(_) => "connectivity",
            Self::TerminalState(_) => "terminal_state",
            Self::NotFound(_) => "not_found",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Repository(_) => "internal",
        }
    }

    /// 依赖暂时不可达，调用方可以稍后重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::ValidationError { .. } => Self::Validation(value.to_string()),
            DomainError::NotChatParticipant { .. } | DomainError::PermissionDenied { .. } => {
                Self::Authorization(value.to_string())
            }
            DomainError::CursorRegression { .. } => Self::Conflict(value.to_string()),
            DomainError::IllegalTransition { .. } => Self::TerminalState(value.to_string()),
            DomainError::ResourceNotFound { .. } => Self::NotFound(value.to_string()),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => Self::NotFound(value.to_string()),
            RepositoryError::Conflict { message } => Self::Conflict(message),
            RepositoryError::Unavailable { message } => Self::Connectivity(message),
            other => Self::Repository(other),
        }
    }
}

impl From<BrokerError> for ApplicationError {
    fn from(value: BrokerError) -> Self {
        Self::Connectivity(value.to_string())
    }
}

impl From<QueueError> for ApplicationError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::InvalidPayload(message) => Self::InvalidPayload(message),
            other => Self::Connectivity(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ChatId, MessageId, ScheduledMessageStatus, UserId};

    #[test]
    fn domain_errors_map_to_client_kinds() {
        let cases: Vec<(DomainError, &str)> = vec![
            (DomainError::validation_error("content", "cannot be empty"), "validation"),
            (
                DomainError::NotChatParticipant {
                    chat_id: ChatId::new(1),
                    user_id: UserId::new(2),
                },
                "authorization",
            ),
            (
                DomainError::CursorRegression {
                    current: Some(MessageId::new(5)),
                    requested: MessageId::new(4),
                },
                "conflict",
            ),
            (
                DomainError::IllegalTransition {
                    from: ScheduledMessageStatus::Sent,
                    to: ScheduledMessageStatus::Canceled,
                },
                "terminal_state",
            ),
        ];

        for (error, kind) in cases {
            assert_eq!(ApplicationError::from(error).kind(), kind);
        }
    }

    #[test]
    fn queue_errors_are_split_by_cause() {
        let unreachable = ApplicationError::from(QueueError::Connection("refused".into()));
        assert!(unreachable.is_retryable());

        let bad_input = ApplicationError::from(QueueError::InvalidPayload("too big".into()));
        assert_eq!(bad_input.kind(), "invalid_payload");
        assert!(!bad_input.is_retryable());
    }

    #[test]
    fn unavailable_storage_is_connectivity() {
        let error = ApplicationError::from(RepositoryError::unavailable("pool timed out"));
        assert_eq!(error.kind(), "connectivity");
    }
}

//! 领域模型错误定义
//!
//! 定义了投递核心中所有领域层错误，提供清晰的错误上下文。

use thiserror::Error;

use crate::scheduled_message::ScheduledMessageStatus;
use crate::value_objects::{ChatId, MessageId, UserId};

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// 用户不是聊天参与者
    #[error("用户 {user_id} 不是聊天 {chat_id} 的参与者")]
    NotChatParticipant { chat_id: ChatId, user_id: UserId },

    /// 权限错误
    #[error("权限不足: {action}")]
    PermissionDenied { action: String },

    /// 已读游标只能前进
    #[error("已读游标不能回退: 当前 {current:?}, 请求 {requested}")]
    CursorRegression {
        current: Option<MessageId>,
        requested: MessageId,
    },

    /// 定时消息状态机的非法迁移
    #[error("非法状态迁移: {from} -> {to}")]
    IllegalTransition {
        from: ScheduledMessageStatus,
        to: ScheduledMessageStatus,
    },

    /// 资源不存在错误
    #[error("资源不存在: {resource_type} ID {resource_id}")]
    ResourceNotFound {
        resource_type: String,
        resource_id: String,
    },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建权限错误
    pub fn permission_denied(action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            action: action.into(),
        }
    }

    /// 创建资源不存在错误
    pub fn resource_not_found(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self::ResourceNotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 存储层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

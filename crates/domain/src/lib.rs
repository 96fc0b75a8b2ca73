//! 聊天投递核心领域模型
//!
//! 包含消息、投递记录、已读游标、定时消息状态机以及实时事件信封。

pub mod errors;
pub mod events;
pub mod message;
pub mod message_delivery;
pub mod read_cursor;
pub mod scheduled_message;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use events::*;
pub use message::*;
pub use message_delivery::*;
pub use read_cursor::*;
pub use scheduled_message::*;
pub use value_objects::*;

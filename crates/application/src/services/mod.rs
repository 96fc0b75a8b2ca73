pub mod dispatch;
pub mod scheduled;

pub use dispatch::{MessageDispatchDependencies, MessageDispatchService};
pub use scheduled::{
    ScheduleRequest, ScheduledMessageService, ScheduledMessageServiceDependencies,
    ScheduledMessageWorker, ScheduledMessageWorkerDependencies, UpdateScheduledRequest,
};

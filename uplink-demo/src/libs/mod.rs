use stack::LoraEvent;

pub mod app;
pub mod config;
pub mod dispatcher;
pub mod downlink;
pub mod link;
pub mod lora_task;
pub mod lora_usb;
pub mod lpp;
pub mod sensor;
pub mod stack;
pub mod uplink;

/// Work items executed by the [`dispatcher::Dispatcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    /// Sample the sensor and attempt one uplink.
    SendUplink,
    /// An event reported by the network stack.
    Stack(LoraEvent),
}

impl From<LoraEvent> for Task {
    fn from(event: LoraEvent) -> Self {
        Task::Stack(event)
    }
}

/// Size of the application payload and downlink buffers.
pub const MAX_PAYLOAD: usize = 50;

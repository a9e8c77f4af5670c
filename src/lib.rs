mod backend;
mod broker;
mod config;
mod error;
mod event;
mod extender;
mod gpio;
mod i2c;
mod mcp23017;
mod pipeline;
mod publisher;
mod spool;
mod status;

pub use backend::MockGpioBackend;
#[cfg(feature = "hardware")]
pub use backend::LibgpiodBackend;
pub use broker::{BrokerLink, EVENTS_EXCHANGE, KEEPALIVE_EXCHANGE, KeepaliveSender, LinkState};
pub use config::{
    AppConfig, BitConfig, BoardConfig, BrokerConfig, ChipConfig, SelectorConfig,
};
pub use error::AppError;
pub use event::HardwareEvent;
pub use extender::{
    BitRole, BitTransition, ChipId, ExtenderBit, ExtenderChip, ExtenderController, MonitorHandle,
};
pub use gpio::{Bias, GpioBackend, LineManager};
pub use i2c::{BusFactory, MockBusFactory, MockExpanderState, RegisterBus};
#[cfg(feature = "hardware")]
pub use i2c::LinuxBusFactory;
pub use pipeline::EventPipeline;
pub use publisher::{EventPublisher, PublishSink, RetryPolicy};
pub use spool::Spool;
pub use status::FaultIndicator;

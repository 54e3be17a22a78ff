//! hilrig: command routing, event fan-out and test execution for
//! hardware-in-the-loop benches.

pub mod bridge;
pub mod client;
pub mod config;
pub mod devices;
pub mod engine;
pub mod event;
pub mod router;
pub mod server;

pub use bridge::ProtocolError;
pub use bridge::protocol::{
    Address, AddressPart, ClientRequest, Command, CommandResponse, ControlSignal, RecipientType,
    ServerMessage,
};
pub use client::{ClientError, ClientProxy};
pub use config::{ClientConfig, ServerConfig};
pub use engine::{
    Bench, BenchBuilder, DeviceCatalog, EngineError, InsertUut, JsonLinesSink, PlatformLayout,
    ResultSink, SpecError, Status, TestSpec, TracingSink,
};
pub use event::{Event, EventBus, EventKind};
pub use router::{CommandRouter, DispatchError};
pub use server::{ServerError, ServerHandle, ServerLoop};

pub const HILRIG_VERSION: &str = env!("CARGO_PKG_VERSION");

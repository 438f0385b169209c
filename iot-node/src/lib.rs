//! IoT testbed node: connections, listener, peer registry and the sensor/meter device actor.

pub mod config;
pub mod connection;
pub mod device;
pub mod listener;
pub mod registry;

pub use connection::{CloseError, ConnectError, Connection, ReceiveError, SendError};
pub use device::{CycleReport, Device, DeviceConfig, Role, RunningDevice, StartError};
pub use listener::{AcceptError, BindError, Listener};
pub use registry::PeerRegistry;

//! Control plane connection for the tether agent.
//!
//! - [`channel`]: the backhaul websocket state machine and its handle
//! - [`dispatcher`]: inbound query routing and command lifecycle notices
//! - [`executor`]: the shell command executor
//! - [`backoff`]: reconnect delay schedule

pub mod backoff;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod executor;

pub use backoff::ReconnectBackoff;
pub use channel::{backhaul_url, ChannelExit, ChannelHandle, ChannelState, ControlChannel, Endpoint};
pub use dispatcher::{report_ack, report_finish, CommandExecutor, Dispatcher, Disposition};
pub use error::ControlError;
pub use executor::ShellExecutor;

//! The data control plane's engine: the four independent loops (receiver,
//! queuer, cleaner, log exporter) that sit on top of [`dcp_store`],
//! [`dcp_bus`], and [`dcp_objectstore`] and turn bus traffic into committed
//! task state.

pub mod batcher;
pub mod cache;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logexport;
pub mod notify;
pub mod queuer;
pub mod receiver;

pub use batcher::Batcher;
pub use cache::JobSpecCache;
pub use cleaner::Cleaner;
pub use config::DcpConfig;
pub use error::EngineError;
pub use logexport::LogExportDriver;
pub use notify::{channel as terminal_notify_channel, TerminalNotifications, TerminalNotifier};
pub use queuer::{BusRouter, Queuer};
pub use receiver::{ReceiverContext, RoundRobinReceiver, SingleSubscriptionReceiver};

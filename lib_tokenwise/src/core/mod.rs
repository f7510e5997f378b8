//! # Core Module
//!
//! The live engine.
//!
//! - **`registry`**: connected subscribers and fan-out.
//! - **`discovery`**: top-holder discovery and the in-memory tracked view.
//! - **`dashboard`**: the snapshot broadcast after each cycle.
//! - **`monitor`**: the periodic cycle and its start/stop state machine.
//! - **`lifecycle`**: when the monitor runs.

pub mod dashboard;
pub mod discovery;
pub mod lifecycle;
pub mod monitor;
pub mod registry;

pub use dashboard::{build_dashboard, DashboardUpdate, LiveCounters};
pub use discovery::{Discovery, DiscoveryOutcome, TrackedSet};
pub use lifecycle::Lifecycle;
pub use monitor::{Monitor, MonitorSettings, MonitorState};
pub use registry::{encode_frame, Frame, RegistryEvent, SubscriberId, SubscriberRegistry};

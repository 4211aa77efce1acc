//! Background services
//!
//! Every fleet process runs its periodic work through the same framework:
//!
//! ```text
//! ┌────────────────┐   start_all    ┌───────────────────────────┐
//! │ ServiceManager │ ─────────────▶ │ Periodic<HeartbeatTask>   │
//! │                │                │ Periodic<FailureDetector> │
//! │                │ ◀── shutdown ─ │ Periodic<SchedulerTicker> │
//! └────────────────┘                └───────────────────────────┘
//! ```
//!
//! Components implement [`PeriodicTask`]; [`Periodic`] turns one into a
//! [`Service`] the manager can start and stop.

pub mod framework;

pub use framework::{
    Periodic, PeriodicTask, Service, ServiceError, ServiceManager, ServiceStatus,
};

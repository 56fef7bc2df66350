//! Core business logic - framework-agnostic reservation, delivery and batch-job operations.
//!
//! Operations take a database connection plus a [`clock::BusinessClock`] and return plain
//! entity models. Nothing in here knows about HTTP or payment providers.

/// Daily claim-based sales and delivery aggregation
pub mod aggregation;
/// Wall clock abstraction and business-local time
pub mod clock;
/// Human-facing display codes
pub mod code;
/// Deadline arithmetic relative to a business date
pub mod deadline;
/// Delivery order state machine, fees and slots
pub mod delivery;
/// No-show batch job
pub mod no_show;
/// Notification outbox
pub mod notify;
/// Product catalogue and stock ledger
pub mod product;
/// Reservation state machine
pub mod reservation;
/// Backoff and recovery for batch jobs
pub mod retry;
/// Interval-driven background jobs
pub mod scheduler;
/// Key-value bookkeeping for periodic jobs
pub mod system_state;
/// User statistics, warnings and restrictions
pub mod user;

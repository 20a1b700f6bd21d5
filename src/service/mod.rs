//! Service layer
//!
//! Business logic between the HTTP handlers and the data layer. Recording
//! an activity and scheduling the work it implies happen in one
//! transaction, so a stored activity never lacks its jobs.

mod activity;
mod inbox;
mod outbox;

pub use activity::ActivityService;

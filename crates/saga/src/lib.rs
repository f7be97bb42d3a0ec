//! Postulation saga for stall reservations.
//!
//! A postulation turns a citizen's request into a pending reservation order:
//! 1. Reserve the stall (the only mutual exclusion point)
//! 2. Create the order and link it to the request
//! 3. Register externally, unless the request is manual
//!
//! If the external registration fails, the stall is freed, the order rejected
//! and the request reverted so the citizen can postulate again.

pub mod config;
pub mod error;
pub mod postulation;
pub mod services;

pub use config::{DEFAULT_REFERENCE_ATTEMPTS, SagaConfig};
pub use error::{Result, SagaError};
pub use postulation::{
    MANUAL_PAYMENT_NOTE, PostulationSaga, STEP_CREATE_ORDER, STEP_REGISTER, STEP_RESERVE_STALL,
    SYSTEM_ACTOR,
};
pub use services::{
    HttpNotificationService, HttpRegistrationService, InMemoryNotificationService,
    InMemoryRegistrationService, Notification, NotificationConfig, NotificationService,
    RegistrationApplication, RegistrationConfig, RegistrationReceipt, RegistrationService,
    extract_session_id,
};

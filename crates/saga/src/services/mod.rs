//! External collaborators called by the postulation saga.

pub mod notification;
pub mod registration;

pub use notification::{
    HttpNotificationService, InMemoryNotificationService, Notification, NotificationConfig,
    NotificationService,
};
pub use registration::{
    HttpRegistrationService, InMemoryRegistrationService, RegistrationApplication,
    RegistrationConfig, RegistrationReceipt, RegistrationService, extract_session_id,
};

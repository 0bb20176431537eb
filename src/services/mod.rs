pub mod alerting;
pub mod encryption;

pub use alerting::{
    send_alert, AlertEvent, AlertSeverity, AlertSink, FanoutAlertSink, LogAlertSink,
    MemoryAlertSink, WebhookAlertSink,
};
pub use encryption::{hash_field, AesGcmFieldCipher, FieldCipher};

use tokio::sync::broadcast;
use tracing::info;

/// A structured event: category, subject, action, detail - the same shape the
/// original logs with `houselog_event(category, subject, action, detail)`.
/// Consumers may subscribe to these independently of the tracing output.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub category: &'static str,
    pub subject: String,
    pub action: &'static str,
    pub detail: String,
}

impl DeviceEvent {
    pub fn new(
        category: &'static str,
        subject: impl Into<String>,
        action: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            category,
            subject: subject.into(),
            action,
            detail: detail.into(),
        }
    }
}

pub type Receiver = broadcast::Receiver<DeviceEvent>;

#[derive(Clone)]
pub struct EventChannel(broadcast::Sender<DeviceEvent>);

impl EventChannel {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self(tx)
    }

    pub fn subscribe(&self) -> Receiver {
        self.0.subscribe()
    }

    /// Logs the event and publishes it to any subscribers. A `send` error here
    /// just means nobody is currently subscribed, which is fine.
    pub fn emit(&self, event: DeviceEvent) {
        info!(
            category = event.category,
            subject = %event.subject,
            action = event.action,
            detail = %event.detail,
            "{} {} {}: {}",
            event.category,
            event.subject,
            event.action,
            event.detail
        );
        let _ = self.0.send(event);
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

//! Redis key layout.

use crate::models::{EventId, JobId};

/// Default ready-set key.
pub const DEFAULT_QUEUE_KEY: &str = "webhook:queue";

/// Hash holding a job's fields.
pub fn job(id: &JobId) -> String {
    format!("webhook:job:{id}")
}

/// Hash holding an event's current status.
pub fn status(event_id: &EventId) -> String {
    format!("webhook:status:{event_id}")
}

/// List holding an event's attempt history, newest first.
pub fn history(event_id: &EventId) -> String {
    format!("webhook:history:{event_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(job(&JobId::from("abc")), "webhook:job:abc");
        assert_eq!(status(&EventId::from("evt_1")), "webhook:status:evt_1");
        assert_eq!(history(&EventId::from("evt_1")), "webhook:history:evt_1");
    }
}

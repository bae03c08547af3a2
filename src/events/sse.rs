//! Server-sent-event framing.
//!
//! Notifications are rendered as `data:` frames. Task events use the
//! `project_updated` / `status_changed` envelope dashboards already consume.

use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::task::{TaskId, TaskStatus};

use super::{Notification, Subscription, TaskEvent};

/// Frame sent first on every stream.
pub const CONNECTED_FRAME: &str = "data: connected\n\n";

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    action: &'static str,
    task_id: TaskId,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_ref: Option<&'a str>,
    project_ids: &'a [String],
}

/// JSON payload of a task event.
pub fn event_json(event: &TaskEvent) -> String {
    let envelope = Envelope {
        kind: "project_updated",
        action: "status_changed",
        task_id: event.task_id,
        status: event.status,
        result_ref: event.result_ref.as_deref(),
        project_ids: &event.affected_entity_ids,
    };
    // Plain strings and ids only, so serialization cannot fail
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// Renders one notification as an SSE frame.
pub fn frame(notification: &Notification) -> String {
    match notification {
        Notification::Connected => CONNECTED_FRAME.to_string(),
        Notification::Task(event) => format!("data: {}\n\n", event_json(event)),
    }
}

/// Turns a subscription into a stream of SSE frames.
pub fn frames(subscription: Subscription) -> impl Stream<Item = String> {
    subscription.into_stream().map(|n| frame(&n))
}

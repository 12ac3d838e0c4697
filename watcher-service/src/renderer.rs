//! Forwarding of change events to the renderer process.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::event::{ChangeEvent, ChangeKind};
use crate::service::WatcherService;
use crate::subscriber::Subscription;

/// Inter-process message sent to a connected UI surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererMessage {
    pub path: String,
    pub kind: ChangeKind,

    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
}

impl From<&ChangeEvent> for RendererMessage {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            path: event.path.to_string_lossy().into_owned(),
            kind: event.kind,
            timestamp: event.timestamp.timestamp_millis(),
            new_path: event
                .new_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Subscribe a renderer channel to `service`.
///
/// Every delivered change is converted to a [`RendererMessage`] and pushed to
/// `outgoing`. Once the receiving side is closed the listener reports a
/// failure per event until it is unsubscribed.
pub fn forward_to_renderer(
    service: &WatcherService,
    outgoing: mpsc::UnboundedSender<RendererMessage>,
) -> Subscription {
    service.on_change(move |event| {
        outgoing
            .send(RendererMessage::from(event))
            .map_err(|_| anyhow::anyhow!("renderer channel closed"))
    })
}

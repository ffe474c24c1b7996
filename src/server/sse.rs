//! Server-Sent Events endpoint mirroring the hub. The stream opens with the
//! hub's `connected` event and is heartbeated with `: keepalive` comment
//! frames every 30 seconds to defeat idle-connection timeouts.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;

use super::SharedState;
use crate::events::EventHub;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unsubscribes from the hub when the client goes away and the stream drops.
struct SubscriptionGuard {
    hub: Arc<EventHub>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

pub async fn stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = state.hub.subscribe();
    let guard = SubscriptionGuard {
        hub: state.hub.clone(),
        id: sub.id,
    };
    let stream = futures_util::stream::unfold((sub.rx, guard), |(mut rx, guard)| async move {
        let payload = rx.recv().await?;
        Some((Ok(Event::default().data(payload)), (rx, guard)))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

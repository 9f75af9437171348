//! Requesting end of a channel.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, warn};

use super::{Channel, ChannelConfig};
use crate::error::{Error, Result};
use crate::model::{RequestId, RequestState};
use crate::store::Store;
use crate::telemetry::{metrics, spans};

pub struct Client {
    channel: Channel,
}

impl Client {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self {
            channel: Channel::new(store, name),
        }
    }

    pub fn with_config(store: Arc<dyn Store>, name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            channel: Channel::with_config(store, name, config),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Store the payload under a fresh id and enqueue the id.
    ///
    /// If the payload is written but the enqueue fails, the request is lost
    /// and reported as [`Error::DeliveryLoss`]. The stored payload is left
    /// for its TTL, if any, to clean up.
    pub async fn send_req(&self, payload: impl AsRef<[u8]>) -> Result<RequestId> {
        let payload = payload.as_ref();
        let ordinal = self.channel.next_ordinal().await?;
        let id = self.channel.request_id(payload, ordinal);
        let span = spans::start_request_span(self.channel.name(), &id);

        async {
            self.channel
                .store()
                .set(
                    &self.channel.request_key(&id),
                    payload,
                    self.channel.config().request_ttl,
                )
                .await?;

            match self.channel.request_queue().push(id.as_bytes()).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(Error::DeliveryLoss {
                        request_id: id.to_string(),
                        source: Box::new(Error::Other("request queue rejected push".to_string())),
                    });
                }
                Err(e) => {
                    warn!("payload stored but enqueue failed: {e}");
                    return Err(Error::DeliveryLoss {
                        request_id: id.to_string(),
                        source: Box::new(e),
                    });
                }
            }
            spans::record_state_transition(&span, RequestState::Sent, RequestState::Enqueued);
            Ok::<(), Error>(())
        }
        .instrument(span.clone())
        .await?;

        metrics::channel_messages().add(
            1,
            &[
                KeyValue::new("channel", self.channel.name().to_string()),
                KeyValue::new("message", "request"),
            ],
        );
        Ok(id)
    }

    /// Claim the response for `id` if one has arrived.
    pub async fn recv_rsp(&self, id: &RequestId) -> Result<Option<Vec<u8>>> {
        let response = self.channel.response_queue(id).pop().await?;
        if response.is_some() {
            debug!(request_id = %id, "response claimed");
        }
        Ok(response)
    }

    /// Claim the response for `id`, waiting up to `timeout`.
    ///
    /// `None` or a zero timeout waits indefinitely; `Ok(None)` means the wait
    /// ran out.
    pub async fn block_recv_rsp(
        &self,
        id: &RequestId,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        let response = self.channel.response_queue(id).block_pop(timeout).await?;
        match response {
            Some(_) => debug!(request_id = %id, "response claimed"),
            None => debug!(request_id = %id, "no response before timeout"),
        }
        Ok(response)
    }

    /// Acknowledge a claimed response, completing the round trip.
    pub async fn ack_rsp(&self, id: &RequestId, response: impl AsRef<[u8]>) -> Result<bool> {
        let acked = self.channel.response_queue(id).ack(response).await?;
        if acked {
            let span = spans::start_request_span(self.channel.name(), id);
            spans::record_state_transition(
                &span,
                RequestState::ResponseClaimed,
                RequestState::ResponseAcked,
            );
        }
        Ok(acked)
    }

    /// Call `handler` with the id of each response the server announces.
    ///
    /// Notifications are unbuffered hints: any sent while no handler is
    /// listening are gone. Read the response itself with [`Client::recv_rsp`].
    pub async fn set_response_handler<F>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(RequestId) + Send + Sync + 'static,
    {
        self.channel.subscribe(handler).await
    }

    pub async fn reset_response_handler(&mut self) {
        self.channel.unsubscribe().await;
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

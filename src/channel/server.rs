//! Serving end of a channel.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::{Channel, ChannelConfig};
use crate::error::{Error, Result};
use crate::model::{Request, RequestId, RequestState};
use crate::store::Store;
use crate::telemetry::{metrics, spans};

pub struct Server {
    channel: Channel,
}

impl Server {
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

    /// Claim the next request without waiting.
    pub async fn recv_req(&self) -> Result<Option<Request>> {
        match self.channel.request_queue().pop().await? {
            Some(raw) => self.load(RequestId::from_bytes(&raw)).await.map(Some),
            None => Ok(None),
        }
    }

    /// Claim the next request, waiting up to `timeout`.
    ///
    /// `None` or a zero timeout waits indefinitely. A claimed id whose
    /// payload is gone fails with [`Error::MissingPayload`]; it stays in
    /// flight until [`Server::ack_req`] is called for it.
    pub async fn block_recv_req(&self, timeout: Option<Duration>) -> Result<Option<Request>> {
        match self.channel.request_queue().block_pop(timeout).await? {
            Some(raw) => self.load(RequestId::from_bytes(&raw)).await.map(Some),
            None => Ok(None),
        }
    }

    async fn load(&self, id: RequestId) -> Result<Request> {
        let span = spans::start_request_span(self.channel.name(), &id);
        spans::record_state_transition(&span, RequestState::Enqueued, RequestState::Claimed);

        let Some(payload) = self
            .channel
            .store()
            .get(&self.channel.request_key(&id))
            .await?
        else {
            warn!(request_id = %id, "claimed request has no payload");
            return Err(Error::MissingPayload {
                request_id: id.to_string(),
            });
        };
        Ok(Request { id, payload })
    }

    /// Acknowledge a claimed request and drop its stored payload.
    ///
    /// The payload is deleted only after the queue entry is gone, so a
    /// request that is still in flight can always be re-read. Returns
    /// `false` if the id was not in flight.
    pub async fn ack_req(&self, id: &RequestId) -> Result<bool> {
        if !self.channel.request_queue().ack(id.as_bytes()).await? {
            debug!(request_id = %id, "ack for a request that is not in flight");
            return Ok(false);
        }
        self.channel
            .store()
            .delete(&self.channel.request_key(id))
            .await?;

        let span = spans::start_request_span(self.channel.name(), id);
        spans::record_state_transition(&span, RequestState::Claimed, RequestState::Processed);
        Ok(true)
    }

    /// Push a response for `id` and announce it on the channel topic.
    ///
    /// Nothing is published unless the push succeeded.
    pub async fn send_rsp(&self, id: &RequestId, response: impl AsRef<[u8]>) -> Result<bool> {
        if !self.channel.response_queue(id).push(response).await? {
            return Ok(false);
        }
        let listeners = self
            .channel
            .store()
            .publish(self.channel.topic(), id.as_bytes())
            .await?;

        let span = spans::start_request_span(self.channel.name(), id);
        spans::record_state_transition(&span, RequestState::Processed, RequestState::ResponsePushed);
        debug!(request_id = %id, listeners, "response sent");

        let channel = KeyValue::new("channel", self.channel.name().to_string());
        metrics::channel_messages().add(1, &[channel.clone(), KeyValue::new("message", "response")]);
        metrics::channel_messages().add(1, &[channel, KeyValue::new("message", "notification")]);
        Ok(true)
    }

    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

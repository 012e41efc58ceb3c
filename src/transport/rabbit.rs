//! RabbitMQ transport.
//!
//! Reads go through the HTTP management API, which offers a single-call
//! destructive get (`ack_requeue_false`) and a non-destructive one
//! (`ack_requeue_true`). Publishes go over AMQP on a pooled connection with
//! publisher confirms enabled.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use deadpool_lapin::{Config, Pool, PoolError, Runtime};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{strip_reserved, Capabilities, PublishRequest, Transport};
use crate::error::BrokerError;
use crate::types::{BrokerKind, Credentials, EndpointSpec, Headers, Queue, RawMessage};

const DEFAULT_VHOST: &str = "/";

/// Transport for a single RabbitMQ virtual host.
pub struct RabbitTransport {
    http: reqwest::Client,
    admin_base: String,
    credentials: Option<Credentials>,
    vhost: String,
    pool: Pool,
    channel: Mutex<Option<Channel>>,
    connect_timeout: Duration,
    receipt_timeout: Duration,
}

impl RabbitTransport {
    /// Build the transport and prove both channels work.
    pub async fn connect(
        endpoint: &EndpointSpec,
        connect_timeout: Duration,
        receipt_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout.max(receipt_timeout) * 3)
            .build()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let cfg = Config {
            url: Some(endpoint.realtime_url().to_string()),
            ..Default::default()
        };
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::ConnectionRejected(e.to_string()))?;

        let transport = Self {
            http,
            admin_base: endpoint.admin_base(),
            credentials: endpoint.admin_credentials(),
            vhost: endpoint
                .namespace()
                .unwrap_or(DEFAULT_VHOST)
                .to_string(),
            pool,
            channel: Mutex::new(None),
            connect_timeout,
            receipt_timeout,
        };

        transport.ping().await?;
        transport.confirm_channel().await?;

        info!(endpoint = %endpoint, vhost = %transport.vhost, "RabbitMQ transport connected");
        Ok(transport)
    }

    fn queues_url(&self) -> String {
        format!(
            "{}/queues/{}",
            self.admin_base,
            urlencoding::encode(&self.vhost)
        )
    }

    fn queue_url(&self, queue: &str) -> String {
        format!("{}/{}", self.queues_url(), urlencoding::encode(queue))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credentials {
            Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        queue: Option<&str>,
    ) -> Result<reqwest::Response, BrokerError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => BrokerError::ConnectionRejected(format!("management API: {status}")),
            404 => match queue {
                Some(queue) => BrokerError::QueueNotFound(queue.to_string()),
                None => BrokerError::Protocol(format!("management API: {status} {body}")),
            },
            _ => BrokerError::Transport(format!("management API: {status} {body}")),
        })
    }

    async fn get_messages(
        &self,
        queue: &str,
        max: usize,
        ackmode: &'static str,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let request = GetRequest {
            count: max,
            ackmode,
            encoding: "auto",
        };
        let response = self
            .send(
                self.request(reqwest::Method::POST, &format!("{}/get", self.queue_url(queue)))
                    .json(&request),
                Some(queue),
            )
            .await?;

        let messages: Vec<WireMessage> = response.json().await?;
        messages.into_iter().map(WireMessage::into_raw).collect()
    }

    async fn confirm_channel(&self) -> Result<Channel, BrokerError> {
        let mut cached = self.channel.lock().await;
        if let Some(channel) = cached.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            debug!("Confirm channel closed, opening a new one");
        }

        let conn = self.pool.get().await.map_err(|e| pool_error(e, self.connect_timeout))?;
        let channel = conn.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        *cached = Some(channel.clone());
        Ok(channel)
    }

    async fn publish_confirmed(
        &self,
        channel: &Channel,
        queue: &str,
        request: &PublishRequest,
    ) -> Result<(), BrokerError> {
        let options = BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        };
        let confirm = channel
            .basic_publish("", queue, options, &request.body, properties_for(request))
            .await?;

        if !request.confirm {
            return Ok(());
        }

        match confirm.await? {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(returned)) => Err(BrokerError::PublishRejected {
                queue: queue.to_string(),
                reason: format!("unroutable: {}", returned.reply_text.as_str()),
            }),
            Confirmation::Nack(_) => Err(BrokerError::PublishRejected {
                queue: queue.to_string(),
                reason: "negative acknowledgement".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transport for RabbitTransport {
    fn kind(&self) -> BrokerKind {
        BrokerKind::RabbitMq
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            browse: true,
            confirmed_publish: true,
        }
    }

    #[instrument(skip(self), fields(vhost = %self.vhost))]
    async fn drain(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, BrokerError> {
        let messages = self.get_messages(queue, max, "ack_requeue_false").await?;
        debug!(count = messages.len(), "Drained messages");
        Ok(messages)
    }

    #[instrument(skip(self, request), fields(vhost = %self.vhost, receipt = %request.receipt))]
    async fn publish(&self, queue: &str, request: &PublishRequest) -> Result<(), BrokerError> {
        let channel = self.confirm_channel().await?;

        match tokio::time::timeout(
            self.receipt_timeout,
            self.publish_confirmed(&channel, queue, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(queue = %queue, receipt = %request.receipt, "Publish receipt timed out");
                Err(BrokerError::ReceiptTimeout {
                    queue: queue.to_string(),
                    receipt: request.receipt,
                })
            }
        }
    }

    #[instrument(skip(self), fields(vhost = %self.vhost))]
    async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        let response = self
            .send(self.request(reqwest::Method::GET, &self.queues_url()), None)
            .await?;
        let queues: Vec<WireQueue> = response.json().await?;
        Ok(queues
            .into_iter()
            .map(|q| Queue::new(&q.name, q.messages.unwrap_or(0)))
            .collect())
    }

    #[instrument(skip(self), fields(vhost = %self.vhost))]
    async fn browse(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, BrokerError> {
        self.get_messages(queue, max, "ack_requeue_true").await
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<u64>, BrokerError> {
        let response = self
            .send(
                self.request(reqwest::Method::GET, &self.queue_url(queue)),
                Some(queue),
            )
            .await?;
        let info: WireQueue = response.json().await?;
        Ok(info.messages)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let url = format!("{}/whoami", self.admin_base);
        self.send(self.request(reqwest::Method::GET, &url), None)
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close(200, "closing").await {
                debug!(error = %e, "Channel close failed");
            }
        }
        self.pool.close();
    }
}

fn pool_error(err: PoolError, connect_timeout: Duration) -> BrokerError {
    match err {
        PoolError::Backend(e) => BrokerError::from(e),
        PoolError::Timeout(_) => BrokerError::ConnectionTimeout(connect_timeout),
        other => BrokerError::Transport(other.to_string()),
    }
}

/// AMQP properties for a publish.
///
/// Provider properties from a drained message are mapped back field by
/// field. `user_id` is left out because the broker only accepts the
/// publishing user's own name. The receipt travels in the reserved
/// `receipt` header so a producer's `correlation_id` survives.
fn properties_for(request: &PublishRequest) -> BasicProperties {
    let carried = &request.properties;
    let text = |key: &str| {
        carried
            .get(key)
            .and_then(|v| match v {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .map(ShortString::from)
    };
    let octet = |key: &str| {
        carried
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u8::try_from(n).ok())
    };

    let mut headers = strip_reserved(&request.headers);
    headers.insert(
        "receipt".to_string(),
        serde_json::Value::String(request.receipt.to_string()),
    );

    let mut properties = BasicProperties::default()
        .with_delivery_mode(octet("delivery_mode").unwrap_or(2))
        .with_headers(field_table(&headers));

    if let Some(priority) = octet("priority") {
        properties = properties.with_priority(priority);
    }
    if let Some(timestamp) = carried.get("timestamp").and_then(serde_json::Value::as_u64) {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(value) = text("correlation_id") {
        properties = properties.with_correlation_id(value);
    }
    if let Some(value) = text("reply_to") {
        properties = properties.with_reply_to(value);
    }
    if let Some(value) = text("expiration") {
        properties = properties.with_expiration(value);
    }
    if let Some(value) = text("type") {
        properties = properties.with_type(value);
    }
    if let Some(value) = text("app_id") {
        properties = properties.with_app_id(value);
    }
    if let Some(value) = text("cluster_id") {
        properties = properties.with_cluster_id(value);
    }
    if let Some(value) = text("content_encoding") {
        properties = properties.with_content_encoding(value);
    }

    let message_id = request
        .message_id
        .clone()
        .map(ShortString::from)
        .or_else(|| text("message_id"));
    if let Some(id) = message_id {
        properties = properties.with_message_id(id);
    }
    let content_type = request
        .content_type
        .clone()
        .map(ShortString::from)
        .or_else(|| text("content_type"));
    if let Some(content_type) = content_type {
        properties = properties.with_content_type(content_type);
    }
    properties
}

fn field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;

    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

#[derive(Debug, Serialize)]
struct GetRequest {
    count: usize,
    ackmode: &'static str,
    encoding: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireQueue {
    name: String,
    #[serde(default)]
    messages: Option<u64>,
}

/// Message as returned by `POST /queues/{vhost}/{queue}/get`.
#[derive(Debug, Deserialize)]
struct WireMessage {
    payload: String,
    #[serde(default)]
    payload_encoding: String,
    #[serde(default)]
    redelivered: bool,
    #[serde(default)]
    exchange: String,
    #[serde(default)]
    routing_key: String,
    #[serde(default)]
    properties: serde_json::Value,
}

impl WireMessage {
    fn into_raw(self) -> Result<RawMessage, BrokerError> {
        let body = match self.payload_encoding.as_str() {
            "base64" => base64::engine::general_purpose::STANDARD
                .decode(&self.payload)
                .map_err(|e| BrokerError::Protocol(format!("bad base64 payload: {e}")))?,
            _ => self.payload.into_bytes(),
        };

        // The management API returns `[]` for empty properties.
        let mut properties = match self.properties {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        let headers: Headers = match properties.remove("headers") {
            Some(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => Headers::new(),
        };

        if !self.routing_key.is_empty() {
            properties.insert("routing_key".to_string(), self.routing_key.into());
        }
        if !self.exchange.is_empty() {
            properties.insert("exchange".to_string(), self.exchange.into());
        }

        Ok(RawMessage {
            body,
            properties,
            headers,
            redelivered: self.redelivered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_management_get_response() {
        let raw = json!([
            {
                "payload_bytes": 11,
                "redelivered": true,
                "exchange": "",
                "routing_key": "orders",
                "message_count": 4,
                "properties": {
                    "message_id": "m-1",
                    "timestamp": 1700000000,
                    "headers": {"x-delivery-count": 2, "tenant": "acme"}
                },
                "payload": "hello world",
                "payload_encoding": "string"
            },
            {
                "payload_bytes": 3,
                "redelivered": false,
                "exchange": "",
                "routing_key": "orders",
                "message_count": 3,
                "properties": [],
                "payload": "AP8B",
                "payload_encoding": "base64"
            }
        ]);

        let wire: Vec<WireMessage> = serde_json::from_value(raw).unwrap();
        let messages: Vec<RawMessage> = wire
            .into_iter()
            .map(WireMessage::into_raw)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(messages[0].body, b"hello world".to_vec());
        assert!(messages[0].redelivered);
        assert_eq!(messages[0].properties["message_id"], json!("m-1"));
        assert_eq!(messages[0].properties["routing_key"], json!("orders"));
        assert_eq!(messages[0].headers["tenant"], json!("acme"));
        assert!(!messages[0].properties.contains_key("headers"));

        assert_eq!(messages[1].body, vec![0x00, 0xff, 0x01]);
        assert!(messages[1].headers.is_empty());
    }

    #[test]
    fn test_decode_queue_listing() {
        let raw = json!([
            {"name": "orders", "messages": 12, "vhost": "/"},
            {"name": "fresh", "vhost": "/"}
        ]);
        let queues: Vec<WireQueue> = serde_json::from_value(raw).unwrap();
        assert_eq!(queues[0].messages, Some(12));
        assert_eq!(queues[1].messages, None);
    }

    #[test]
    fn test_publish_properties() {
        let mut request = PublishRequest::new("x");
        request.message_id = Some("m-9".to_string());
        request.content_type = Some("application/json".to_string());
        request
            .headers
            .insert("message-id".to_string(), json!("stale"));
        request.headers.insert("attempt".to_string(), json!(3));

        let properties = properties_for(&request);
        assert_eq!(
            properties.message_id().as_ref().map(|s| s.as_str()),
            Some("m-9")
        );
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(properties.correlation_id(), &None);

        let headers = properties.headers().as_ref().unwrap();
        assert!(headers.inner().get(&ShortString::from("message-id")).is_none());
        assert_eq!(
            headers.inner().get(&ShortString::from("attempt")),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(
            headers.inner().get(&ShortString::from("receipt")),
            Some(&AMQPValue::LongString(request.receipt.to_string().into()))
        );
    }

    #[test]
    fn test_republished_message_keeps_producer_properties() {
        let wire: WireMessage = serde_json::from_value(json!({
            "payload": "hello",
            "payload_encoding": "string",
            "redelivered": false,
            "exchange": "",
            "routing_key": "orders",
            "properties": {
                "message_id": "a",
                "timestamp": 1700000000,
                "correlation_id": "corr-1",
                "priority": 7,
                "expiration": "60000",
                "reply_to": "replies",
                "type": "order.created",
                "app_id": "shop",
                "user_id": "producer",
                "delivery_mode": 1,
                "headers": {"receipt": "r-old", "tenant": "acme"}
            }
        }))
        .unwrap();
        let message = crate::messaging::normalize(&wire.into_raw().unwrap(), 0);

        let request = PublishRequest::republish(&message);
        let properties = properties_for(&request);

        assert_eq!(properties.timestamp(), &Some(1_700_000_000));
        assert_eq!(properties.priority(), &Some(7));
        assert_eq!(properties.delivery_mode(), &Some(1));
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some("corr-1")
        );
        assert_eq!(
            properties.expiration().as_ref().map(|s| s.as_str()),
            Some("60000")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|s| s.as_str()),
            Some("replies")
        );
        assert_eq!(
            properties.kind().as_ref().map(|s| s.as_str()),
            Some("order.created")
        );
        assert_eq!(properties.app_id().as_ref().map(|s| s.as_str()), Some("shop"));
        assert_eq!(properties.user_id(), &None);
        assert_eq!(properties.message_id().as_ref().map(|s| s.as_str()), Some("a"));

        let headers = properties.headers().as_ref().unwrap();
        assert_eq!(
            headers.inner().get(&ShortString::from("receipt")),
            Some(&AMQPValue::LongString(request.receipt.to_string().into()))
        );
        assert!(headers.inner().get(&ShortString::from("tenant")).is_some());
    }

    #[test]
    fn test_pool_timeout_reports_connect_timeout() {
        let err = pool_error(
            PoolError::Timeout(deadpool_lapin::TimeoutType::Wait),
            Duration::from_secs(10),
        );
        assert!(matches!(
            err,
            BrokerError::ConnectionTimeout(d) if d == Duration::from_secs(10)
        ));
    }
}

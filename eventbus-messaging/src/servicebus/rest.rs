//! Azure Service Bus over its REST interface
//!
//! Management operations use the Atom entity API, messaging uses
//! send / peek-lock / unlock / delete. Every request carries a freshly signed
//! SAS token for the namespace.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::client::{
    CorrelationRule, ReceivedMessage, ServiceBusMessage, TopicClient, TopicManagement,
};
use super::connection_string::ServiceBusConnectionString;
use crate::config::ServiceBusConnection;
use crate::error::{EventBusError, Result};

const API_VERSION: &str = "2017-04";
const ATOM_CONTENT_TYPE: &str = "application/atom+xml;type=entry;charset=utf-8";
const SERVICE_BUS_NS: &str = "http://schemas.microsoft.com/netservices/2010/10/servicebus/connect";
const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
const RECEIVE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct OutgoingBrokerProperties<'a> {
    message_id: &'a str,
    label: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IncomingBrokerProperties {
    message_id: Option<String>,
    label: Option<String>,
    #[serde(default)]
    delivery_count: u32,
    lock_token: Option<String>,
}

/// Service Bus client speaking HTTPS.
///
/// Implements both [`TopicManagement`] and [`TopicClient`]. Subscriptions are
/// created with `MaxDeliveryCount` set to the delivery policy limit, so an
/// abandoned message moves to the subscription's dead-letter queue once the
/// limit is reached.
pub struct ServiceBusRestClient {
    http: reqwest::Client,
    connection: ServiceBusConnectionString,
    max_delivery_count: u32,
    closed: AtomicBool,
}

impl ServiceBusRestClient {
    pub fn new(config: &ServiceBusConnection, max_delivery_count: u32) -> Result<Self> {
        let connection = ServiceBusConnectionString::parse(&config.connection_string)?;
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            connection,
            max_delivery_count,
            closed: AtomicBool::new(false),
        })
    }

    pub fn namespace(&self) -> &str {
        self.connection.host()
    }

    fn entity_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.connection.https_endpoint())
            .map_err(|e| EventBusError::Configuration(format!("invalid endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| EventBusError::Configuration("endpoint cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    fn sas_token(&self) -> Result<String> {
        let resource = format!("{}/", self.connection.https_endpoint());
        let encoded_resource: String = url::form_urlencoded::byte_serialize(resource.as_bytes()).collect();
        let expiry = chrono::Utc::now().timestamp() + TOKEN_TTL.as_secs() as i64;

        let mut mac = Hmac::<Sha256>::new_from_slice(self.connection.key().as_bytes())
            .map_err(|e| EventBusError::Configuration(format!("invalid shared access key: {}", e)))?;
        mac.update(format!("{}\n{}", encoded_resource, expiry).as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        let encoded_signature: String = url::form_urlencoded::byte_serialize(signature.as_bytes()).collect();

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_resource,
            encoded_signature,
            expiry,
            self.connection.key_name()
        ))
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Disposed);
        }
        Ok(self
            .http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, self.sas_token()?))
    }

    async fn entity_exists(&self, segments: &[&str]) -> Result<bool> {
        let response = self
            .request(Method::GET, self.entity_url(segments)?)?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body = check(response, segments).await?.text().await?;
        // A missing entity can also come back as an empty feed.
        Ok(body.contains("<entry"))
    }

    async fn put_entity(&self, segments: &[&str], description: String) -> Result<()> {
        let body = format!(
            r#"<entry xmlns="http://www.w3.org/2005/Atom"><content type="application/xml">{}</content></entry>"#,
            description
        );
        let response = self
            .request(Method::PUT, self.entity_url(segments)?)?
            .header(reqwest::header::CONTENT_TYPE, ATOM_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(entity = %segments.join("/"), "Entity already exists");
            return Ok(());
        }
        check(response, segments).await?;
        Ok(())
    }

    fn message_url(&self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<Url> {
        self.entity_url(&[
            topic,
            "subscriptions",
            subscription,
            "messages",
            &message.message_id,
            &message.lock_token,
        ])
    }
}

async fn check(response: Response, segments: &[&str]) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let entity = segments.join("/");
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} {}: {}", status, entity, body.trim());
    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => EventBusError::TopologyNotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EventBusError::Configuration(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            EventBusError::Connectivity(detail)
        }
        s if s.is_server_error() => EventBusError::Connectivity(detail),
        _ => EventBusError::Topology(detail),
    })
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[async_trait]
impl TopicManagement for ServiceBusRestClient {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        self.entity_exists(&[topic]).await
    }

    async fn create_topic(&self, topic: &str) -> Result<()> {
        self.put_entity(
            &[topic],
            format!(r#"<TopicDescription xmlns="{}" />"#, SERVICE_BUS_NS),
        )
        .await
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool> {
        self.entity_exists(&[topic, "subscriptions", subscription]).await
    }

    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<()> {
        self.put_entity(
            &[topic, "subscriptions", subscription],
            format!(
                r#"<SubscriptionDescription xmlns="{}"><MaxDeliveryCount>{}</MaxDeliveryCount></SubscriptionDescription>"#,
                SERVICE_BUS_NS, self.max_delivery_count
            ),
        )
        .await
    }

    async fn rule_exists(&self, topic: &str, subscription: &str, rule: &str) -> Result<bool> {
        self.entity_exists(&[topic, "subscriptions", subscription, "rules", rule])
            .await
    }

    async fn create_rule(&self, topic: &str, subscription: &str, rule: &CorrelationRule) -> Result<()> {
        self.put_entity(
            &[topic, "subscriptions", subscription, "rules", &rule.name],
            format!(
                concat!(
                    r#"<RuleDescription xmlns:i="http://www.w3.org/2001/XMLSchema-instance" xmlns="{}">"#,
                    r#"<Filter i:type="CorrelationFilter"><Label>{}</Label></Filter>"#,
                    r#"<Action i:type="EmptyRuleAction" />"#,
                    r#"<Name>{}</Name>"#,
                    r#"</RuleDescription>"#
                ),
                SERVICE_BUS_NS,
                escape_xml(&rule.label),
                escape_xml(&rule.name)
            ),
        )
        .await
    }

    async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str) -> Result<()> {
        let segments = [topic, "subscriptions", subscription, "rules", rule];
        let response = self
            .request(Method::DELETE, self.entity_url(&segments)?)?
            .send()
            .await?;
        check(response, &segments).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TopicClient for ServiceBusRestClient {
    async fn send(&self, topic: &str, message: ServiceBusMessage) -> Result<()> {
        let properties = serde_json::to_string(&OutgoingBrokerProperties {
            message_id: &message.message_id,
            label: &message.label,
        })
        .map_err(|e| EventBusError::Serialization(e.to_string()))?;

        let segments = [topic, "messages"];
        let response = self
            .request(Method::POST, self.entity_url(&segments)?)?
            .header(reqwest::header::CONTENT_TYPE, message.content_type.as_str())
            .header("BrokerProperties", properties)
            .body(message.body)
            .send()
            .await?;
        check(response, &segments).await?;
        Ok(())
    }

    async fn receive(
        &self,
        topic: &str,
        subscription: &str,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let segments = [topic, "subscriptions", subscription, "messages", "head"];
        let mut url = self.entity_url(&segments)?;
        url.query_pairs_mut()
            .append_pair("timeout", &wait.as_secs().max(1).to_string());

        let response = self
            .request(Method::POST, url)?
            .timeout(wait + RECEIVE_GRACE)
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = check(response, &segments).await?;

        let properties: IncomingBrokerProperties = response
            .headers()
            .get("BrokerProperties")
            .and_then(|value| value.to_str().ok())
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| EventBusError::Other(format!("invalid BrokerProperties header: {}", e)))?
            .ok_or_else(|| EventBusError::Other("missing BrokerProperties header".to_string()))?;
        let body = response.bytes().await?.to_vec();

        let (Some(message_id), Some(lock_token)) = (properties.message_id, properties.lock_token)
        else {
            return Err(EventBusError::Other(
                "received message without id or lock token".to_string(),
            ));
        };
        Ok(Some(ReceivedMessage {
            message_id,
            label: properties.label,
            body,
            delivery_count: properties.delivery_count.max(1),
            lock_token,
        }))
    }

    async fn complete(&self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<()> {
        let url = self.message_url(topic, subscription, message)?;
        let response = self.request(Method::DELETE, url)?.send().await?;
        check(response, &[topic, subscription, &message.message_id])
            .await
            .map_err(|e| EventBusError::Acknowledge(e.to_string()))?;
        Ok(())
    }

    async fn abandon(&self, topic: &str, subscription: &str, message: &ReceivedMessage) -> Result<()> {
        let url = self.message_url(topic, subscription, message)?;
        let response = self.request(Method::PUT, url)?.send().await?;
        check(response, &[topic, subscription, &message.message_id])
            .await
            .map_err(|e| EventBusError::Acknowledge(e.to_string()))?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        topic: &str,
        subscription: &str,
        message: &ReceivedMessage,
    ) -> Result<()> {
        // The REST interface has no dead-letter verb; the subscription's
        // MaxDeliveryCount moves the message once its deliveries run out.
        warn!(
            subscription,
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "Releasing message for dead-lettering by the service"
        );
        self.abandon(topic, subscription, message).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for ServiceBusRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBusRestClient")
            .field("namespace", &self.connection.host())
            .field("max_delivery_count", &self.max_delivery_count)
            .finish_non_exhaustive()
    }
}

//! Connection descriptors and the `<realtime>;<admin>` endpoint format.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::Error;

/// Kind of broker behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// RabbitMQ (AMQP publish, management API for reads)
    RabbitMq,
    /// In-process broker
    Memory,
}

impl FromStr for BrokerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rabbitmq" | "rabbit_mq" | "rabbit" | "amqp" => Ok(BrokerKind::RabbitMq),
            "memory" | "in_memory" | "inmemory" => Ok(BrokerKind::Memory),
            other => Err(Error::InvalidRequest(format!("unknown broker kind '{other}'"))),
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKind::RabbitMq => write!(f, "rabbit_mq"),
            BrokerKind::Memory => write!(f, "memory"),
        }
    }
}

/// Liveness of a registered connection. Written only by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Connecting,
    Up,
    Down,
}

/// Parsed `<realtime-endpoint>;<admin-endpoint>` connection string.
///
/// The first segment is the real-time transport URL (scheme, host, path,
/// userinfo credentials). The second is the management HTTP base URL with
/// credentials and an optional `vhost`/`namespace` query parameter.
///
/// Credentials never appear in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    realtime: Url,
    admin: Url,
    namespace: Option<String>,
}

/// Username/password pair taken from URL userinfo.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl EndpointSpec {
    /// Real-time transport URL, credentials included.
    pub fn realtime_url(&self) -> &Url {
        &self.realtime
    }

    /// Management base URL without userinfo and query.
    pub fn admin_base(&self) -> String {
        let mut base = self.admin.clone();
        let _ = base.set_username("");
        let _ = base.set_password(None);
        base.set_query(None);
        base.set_fragment(None);
        base.as_str().trim_end_matches('/').to_string()
    }

    /// Credentials for the management API.
    pub fn admin_credentials(&self) -> Option<Credentials> {
        credentials_of(&self.admin)
    }

    /// Namespace (RabbitMQ vhost) selected by the admin query string.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Host used for display purposes.
    pub fn host(&self) -> Option<&str> {
        self.admin.host_str().or_else(|| self.realtime.host_str())
    }
}

fn credentials_of(url: &Url) -> Option<Credentials> {
    if url.username().is_empty() {
        return None;
    }
    let decode = |s: &str| {
        urlencoding::decode(s)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| s.to_string())
    };
    Some(Credentials {
        username: decode(url.username()),
        password: url.password().map(decode).unwrap_or_default(),
    })
}

fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("***"));
    }
    shown.to_string()
}

impl FromStr for EndpointSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = s.split(';');
        let (realtime, admin) = match (segments.next(), segments.next(), segments.next()) {
            (Some(r), Some(a), None) if !r.trim().is_empty() && !a.trim().is_empty() => {
                (r.trim(), a.trim())
            }
            _ => {
                return Err(Error::InvalidEndpoint(
                    "expected '<realtime-url>;<admin-url>'".to_string(),
                ))
            }
        };

        let realtime = Url::parse(realtime)
            .map_err(|e| Error::InvalidEndpoint(format!("realtime segment: {e}")))?;
        let admin =
            Url::parse(admin).map_err(|e| Error::InvalidEndpoint(format!("admin segment: {e}")))?;

        if realtime.host_str().is_none() && realtime.scheme() != "memory" {
            return Err(Error::InvalidEndpoint("realtime segment has no host".to_string()));
        }

        let namespace = admin
            .query_pairs()
            .find(|(k, _)| k == "vhost" || k == "namespace")
            .map(|(_, v)| v.into_owned());

        Ok(Self {
            realtime,
            admin,
            namespace,
        })
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", redacted(&self.realtime), redacted(&self.admin))
    }
}

impl fmt::Debug for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSpec")
            .field("realtime", &redacted(&self.realtime))
            .field("admin", &redacted(&self.admin))
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// A registered broker connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub broker_kind: BrokerKind,
    pub endpoint: EndpointSpec,
    pub liveness: Liveness,
    pub created_at: DateTime<Utc>,
}

/// Public view of a connection, safe to serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub name: String,
    pub broker_kind: BrokerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub liveness: Liveness,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    /// Convert to the serializable view.
    pub fn to_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            name: self.name.clone(),
            broker_kind: self.broker_kind,
            host: self.endpoint.host().map(String::from),
            namespace: self.endpoint.namespace().map(String::from),
            liveness: self.liveness,
            created_at: self.created_at,
        }
    }
}

/// Request to register a broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConnectionRequest {
    pub name: String,
    pub broker_kind: BrokerKind,
    /// `<realtime-url>;<admin-url>`
    pub endpoint: String,
}

//! Service Bus connection strings

use crate::error::{EventBusError, Result};

/// A parsed `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...` string
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceBusConnectionString {
    host: String,
    key_name: String,
    key: String,
    entity_path: Option<String>,
}

impl ServiceBusConnectionString {
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in connection_string.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = part.split_once('=') else {
                return Err(EventBusError::Configuration(format!(
                    "malformed connection string segment '{}'",
                    part
                )));
            };
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                "sharedaccesskey" => key = Some(value),
                "entitypath" => entity_path = Some(value),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| missing("Endpoint"))?;
        let host = endpoint
            .strip_prefix("sb://")
            .ok_or_else(|| {
                EventBusError::Configuration(format!(
                    "endpoint '{}' must use the sb:// scheme",
                    endpoint
                ))
            })?
            .trim_end_matches('/')
            .to_string();
        if host.is_empty() {
            return Err(missing("Endpoint host"));
        }

        Ok(Self {
            host,
            key_name: key_name.filter(|v| !v.is_empty()).ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.filter(|v| !v.is_empty()).ok_or_else(|| missing("SharedAccessKey"))?,
            entity_path: entity_path.filter(|v| !v.is_empty()),
        })
    }

    /// Fully qualified namespace, e.g. `shop.servicebus.windows.net`
    pub fn host(&self) -> &str {
        &self.host
    }

    /// HTTPS base address of the namespace
    pub fn https_endpoint(&self) -> String {
        format!("https://{}", self.host)
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }
}

// The shared access key stays out of logs.
impl std::fmt::Debug for ServiceBusConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBusConnectionString")
            .field("host", &self.host)
            .field("key_name", &self.key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

fn missing(what: &str) -> EventBusError {
    EventBusError::Configuration(format!("connection string is missing {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_string() {
        let parsed = ServiceBusConnectionString::parse(
            "Endpoint=sb://shop.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0",
        )
        .unwrap();

        assert_eq!(parsed.host(), "shop.servicebus.windows.net");
        assert_eq!(parsed.https_endpoint(), "https://shop.servicebus.windows.net");
        assert_eq!(parsed.key_name(), "RootManageSharedAccessKey");
        assert_eq!(parsed.key(), "c2VjcmV0");
        assert_eq!(parsed.entity_path(), None);
    }

    #[test]
    fn test_parse_is_case_insensitive_and_keeps_padding() {
        let parsed = ServiceBusConnectionString::parse(
            "endpoint=sb://ns.servicebus.windows.net;sharedaccesskeyname=send;sharedaccesskey=abc==;EntityPath=orders;",
        )
        .unwrap();

        assert_eq!(parsed.key(), "abc==");
        assert_eq!(parsed.entity_path(), Some("orders"));
    }

    #[test]
    fn test_parse_rejects_incomplete_strings() {
        assert!(ServiceBusConnectionString::parse("garbage").is_err());
        assert!(ServiceBusConnectionString::parse("Endpoint=https://ns/;SharedAccessKeyName=a;SharedAccessKey=b").is_err());
        assert!(ServiceBusConnectionString::parse("Endpoint=sb://ns/;SharedAccessKeyName=a").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let parsed = ServiceBusConnectionString::parse(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=a;SharedAccessKey=topsecret",
        )
        .unwrap();
        assert!(!format!("{:?}", parsed).contains("topsecret"));
    }
}

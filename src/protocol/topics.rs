//! DECADA topic construction
//!
//! Every topic lives under `/sys/<productKey>/<deviceId>/thing/`.

use thiserror::Error;

/// Service subscribed to on every boot
pub const DEFAULT_SERVICE: &str = "sensorpollrate";

const REPLY_SUFFIX: &str = "_reply";

/// Topic errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Service name cannot be empty")]
    EmptyServiceName,
    #[error("Service name contains invalid character: '{0}'")]
    InvalidServiceChar(char),
}

/// Service names end up as a single topic level
pub fn validate_service_name(name: &str) -> Result<(), TopicError> {
    if name.is_empty() {
        return Err(TopicError::EmptyServiceName);
    }
    match name.chars().find(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace()) {
        Some(ch) => Err(TopicError::InvalidServiceChar(ch)),
        None => Ok(()),
    }
}

/// Builds the topics of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    product_key: String,
    device_id: String,
}

impl TopicBuilder {
    pub fn new(product_key: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            product_key: product_key.into(),
            device_id: device_id.into(),
        }
    }

    fn base(&self) -> String {
        format!("/sys/{}/{}/thing", self.product_key, self.device_id)
    }

    /// Telemetry upload topic: `/sys/<pk>/<uid>/thing/measurepoint/post`
    pub fn measurepoint_post(&self) -> String {
        format!("{}/measurepoint/post", self.base())
    }

    /// Service command topic: `/sys/<pk>/<uid>/thing/service/<name>`
    pub fn service(&self, name: &str) -> Result<String, TopicError> {
        validate_service_name(name)?;
        Ok(format!("{}/service/{name}", self.base()))
    }

    /// Reply topic of a service: the service topic plus `_reply`
    pub fn service_reply(&self, name: &str) -> Result<String, TopicError> {
        Ok(format!("{}{REPLY_SUFFIX}", self.service(name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_topic_layout() {
        let topics = TopicBuilder::new("PK1", "abc123");
        assert_eq!(
            topics.measurepoint_post(),
            "/sys/PK1/abc123/thing/measurepoint/post"
        );
        assert_eq!(
            topics.service(DEFAULT_SERVICE).unwrap(),
            "/sys/PK1/abc123/thing/service/sensorpollrate"
        );
        assert_eq!(
            topics.service_reply(DEFAULT_SERVICE).unwrap(),
            "/sys/PK1/abc123/thing/service/sensorpollrate_reply"
        );
    }

    #[test]
    fn test_invalid_service_names() {
        let topics = TopicBuilder::new("PK1", "abc123");
        assert_eq!(topics.service(""), Err(TopicError::EmptyServiceName));
        assert_eq!(
            topics.service("a/b"),
            Err(TopicError::InvalidServiceChar('/'))
        );
        assert_eq!(
            topics.service("all#"),
            Err(TopicError::InvalidServiceChar('#'))
        );
    }

    proptest! {
        #[test]
        fn reply_topic_extends_service_topic(name in "[a-zA-Z0-9_]{1,24}") {
            let topics = TopicBuilder::new("PK1", "abc123");
            let service = topics.service(&name).unwrap();
            let reply = topics.service_reply(&name).unwrap();
            prop_assert_eq!(reply, format!("{service}_reply"));
        }
    }
}

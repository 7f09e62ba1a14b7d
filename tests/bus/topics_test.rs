// Topic Namespace Tests

use crashlink::bus::topics::{self, subscriptions_for_role};
use crashlink::bus::{BusConfig, Role};

// ============================================================================
// BUILDERS
// ============================================================================

#[test]
fn test_incident_topics() {
    assert_eq!(topics::alert_incident("42"), "emergency/alerts/42");
    assert_eq!(topics::status_incident("42"), "emergency/status/42");
    assert_eq!(topics::response_incident("42"), "emergency/response/42");
    assert_eq!(topics::response_ack("42"), "emergency/response/ack/42");
}

#[test]
fn test_topic_classification() {
    assert!(topics::is_alert_topic(topics::ALERT_BROADCAST));
    assert!(topics::is_alert_topic("emergency/alerts/42"));
    assert!(!topics::is_alert_topic("emergency/alertsx"));
    assert!(topics::is_ack_topic("emergency/response/ack/42"));
    assert!(!topics::is_ack_topic(topics::RESPONSE_BROADCAST));
}

#[test]
fn test_every_namespace_topic_is_valid_on_default_bus() {
    let config = BusConfig::default();
    for topic in [
        topics::EMERGENCY_ALERTS,
        topics::EMERGENCY_STATUS,
        topics::EMERGENCY_RESPONSE,
        topics::RESPONSE_ACK,
        topics::ALERT_BROADCAST,
        topics::STATUS_SYSTEM,
        topics::RESPONSE_BROADCAST,
    ] {
        assert!(config.is_valid_topic(topic), "{} rejected", topic);
    }
}

// ============================================================================
// ROLES
// ============================================================================

#[test]
fn test_publisher_subscriptions() {
    let subs = subscriptions_for_role(Role::Publisher, Some("inc_1"));

    assert_eq!(
        subs,
        vec![
            "emergency/alerts/inc_1",
            "emergency/status/system",
            "emergency/response/broadcast",
        ]
    );
}

#[test]
fn test_publisher_without_incident() {
    let subs = subscriptions_for_role(Role::Publisher, None);

    assert_eq!(subs.len(), 2);
    assert!(!subs.iter().any(|t| t.starts_with("emergency/alerts")));
}

#[test]
fn test_subscriber_subscriptions_are_wildcards() {
    let subs = subscriptions_for_role(Role::Subscriber, Some("ignored"));

    assert_eq!(
        subs,
        vec![
            "emergency/alerts/broadcast",
            "emergency/alerts/+",
            "emergency/status/+",
            "emergency/response/+",
            "emergency/response/ack/+",
        ]
    );
}

#[test]
fn test_role_parse_and_display() {
    assert_eq!("Publisher".parse::<Role>().unwrap(), Role::Publisher);
    assert_eq!("subscriber".parse::<Role>().unwrap(), Role::Subscriber);
    assert!("observer".parse::<Role>().is_err());
    assert_eq!(Role::Publisher.to_string(), "publisher");
}

// Payload Schema Tests
// Alert and acknowledgement JSON as seen on the wire

use crashlink::bus::schema::{ACK_TYPE, ALERT_TYPE};
use crashlink::bus::{EmergencyAlert, Location, MedicalInfo, ResponseAck};

fn location() -> Location {
    Location {
        latitude: 40.7128,
        longitude: -74.0060,
    }
}

// ============================================================================
// EMERGENCY ALERT
// ============================================================================

#[test]
fn test_alert_defaults() {
    let alert = EmergencyAlert::new("incident_123", "victim_456", "John Doe", location());

    assert_eq!(alert.kind, ALERT_TYPE);
    assert_eq!(alert.severity, "HIGH");
    assert!(alert.timestamp > 0);
    assert_eq!(alert.medical_info, MedicalInfo::default());
}

#[test]
fn test_alert_json_uses_camel_case() {
    let alert = EmergencyAlert::new("incident_123", "victim_456", "John Doe", location())
        .with_timestamp(1_700_000_000_000)
        .with_medical_info(MedicalInfo {
            blood_type: "O+".to_string(),
            allergies: vec!["Penicillin".to_string()],
            medications: vec![],
            conditions: vec!["Diabetes".to_string()],
        });

    let value: serde_json::Value = serde_json::from_slice(&alert.to_json().unwrap()).unwrap();

    assert_eq!(value["type"], "emergency_alert");
    assert_eq!(value["incidentId"], "incident_123");
    assert_eq!(value["victimId"], "victim_456");
    assert_eq!(value["victimName"], "John Doe");
    assert_eq!(value["location"]["latitude"], 40.7128);
    assert_eq!(value["timestamp"], 1_700_000_000_000i64);
    assert_eq!(value["medicalInfo"]["bloodType"], "O+");
    assert_eq!(value["medicalInfo"]["allergies"][0], "Penicillin");
}

#[test]
fn test_alert_from_external_json() {
    let json = br#"{
        "type": "emergency_alert",
        "incidentId": "incident_9",
        "victimId": "v1",
        "victimName": "Jane",
        "location": {"latitude": 1.5, "longitude": 2.5},
        "timestamp": 1234,
        "severity": "CRITICAL",
        "medicalInfo": {"bloodType": "A-"}
    }"#;

    let alert = EmergencyAlert::from_json(json).unwrap();

    assert_eq!(alert.incident_id, "incident_9");
    assert_eq!(alert.severity, "CRITICAL");
    assert_eq!(alert.medical_info.blood_type, "A-");
    assert!(alert.medical_info.allergies.is_empty());
}

#[test]
fn test_alert_with_severity() {
    let alert = EmergencyAlert::new("i", "v", "n", location()).with_severity("CRITICAL");

    assert_eq!(alert.severity, "CRITICAL");
}

#[test]
fn test_malformed_alert_is_serialization_error() {
    let result = EmergencyAlert::from_json(b"{not json");

    assert!(matches!(result, Err(crashlink::bus::BusError::Serialization(_))));
}

// ============================================================================
// RESPONSE ACK
// ============================================================================

#[test]
fn test_ack_json() {
    let ack = ResponseAck::new("incident_123", "responder_1", "Medic One", "EN_ROUTE", 300);

    let value: serde_json::Value = serde_json::from_slice(&ack.to_json().unwrap()).unwrap();

    assert_eq!(value["type"], ACK_TYPE);
    assert_eq!(value["incidentId"], "incident_123");
    assert_eq!(value["responderId"], "responder_1");
    assert_eq!(value["responderName"], "Medic One");
    assert_eq!(value["status"], "EN_ROUTE");
    assert_eq!(value["eta"], 300);
}

#[test]
fn test_ack_round_trip() {
    let ack = ResponseAck::new("incident_123", "responder_1", "Medic One", "ARRIVED", 0);

    let decoded = ResponseAck::from_json(&ack.to_json().unwrap()).unwrap();

    assert_eq!(decoded, ack);
}

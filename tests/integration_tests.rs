mod common;

use chrono::NaiveDate;
use moen::types::{Connectivity, FaucetState};
use moen::{Command, Error, MoenClient, SystemClock, Temperature, UsageRange};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn system_clock() -> Arc<SystemClock> {
    Arc::new(SystemClock)
}

#[tokio::test]
async fn test_full_authentication_flow_with_mock_server() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({
            "client_id": "moen_mobile_app",
            "username": "test@example.com",
            "password": "password123"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/auth_success.json")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/devices"))
        .and(header("authorization", "Bearer access123"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/devices.json")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::anonymous_client(&mock_server, system_clock());
    let credentials = client
        .login("moen_mobile_app", "test@example.com", "password123")
        .await
        .unwrap();
    assert_eq!(credentials.access_token, "access123");
    assert_eq!(credentials.refresh_token, Some("refresh456".to_string()));
    assert!(credentials.password.is_none());

    let devices = client.list_devices().await.unwrap();
    let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["D1", "D2"]);
    assert_eq!(devices[0].name(), "Kitchen");
    assert_eq!(devices[0].extra["firmwareVersion"], "1.4.2");
    assert_eq!(devices[1].name(), "Bar sink");
}

#[tokio::test]
async fn test_authentication_failure_with_mock_server() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_string(include_str!("fixtures/auth_failure.json")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::anonymous_client(&mock_server, system_clock());
    let err = client
        .login("moen_mobile_app", "test@example.com", "wrongpassword")
        .await
        .unwrap_err();
    assert!(err.is_auth());
    assert!(client.tokens().credentials().await.is_none());
}

#[tokio::test]
async fn test_wrapped_device_list() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "devices": [{"clientId": "D1", "deviceType": "VAK"}, {"clientId": "X", "deviceType": "FLO"}]
        })))
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, "D1");
}

#[tokio::test]
async fn test_mixed_product_list_keeps_readable_faucets() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/devices_mixed.json")),
        )
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let devices = client.list_devices().await.unwrap();

    let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["100234", "D1"]);
    assert_eq!(devices[0].name(), "Laundry");
}

#[tokio::test]
async fn test_get_device_status() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/status"))
        .and(header("authorization", "Bearer access123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connected": true,
            "state": "idle",
            "lastDispenseVolume": 250,
            "wifiRssi": -52
        })))
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let status = client.get_device_status("D1").await.unwrap();
    assert_eq!(status.device_id, "D1");
    assert_eq!(status.connectivity, Connectivity::Online);
    assert_eq!(status.faucet_state, FaucetState::Idle);
    assert_eq!(status.last_dispense_volume_ml, Some(250));
    assert_eq!(status.extra["wifiRssi"], -52);
}

#[tokio::test]
async fn test_unknown_device_is_not_found() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices/nope/status"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let err = client.get_device_status("nope").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_unrecognized_status_body_keeps_payload() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    match client.get_device_status("D1").await {
        Err(Error::Api { payload, .. }) => assert_eq!(payload, "<html>maintenance</html>"),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_shadow_and_temperature_definitions() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/shadow"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/shadow.json")),
        )
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let shadow = client.get_device_shadow("D1").await.unwrap();
    assert_eq!(shadow.faucet_state(), FaucetState::Idle);
    assert_eq!(shadow.reported.last_dispense_volume_ml, Some(500));
    assert_eq!(shadow.version, Some(1287));

    let temps = client.get_temperature_definitions("D1").await.unwrap();
    assert_eq!(temps.hot.unwrap().celsius, Some(49.0));
    assert_eq!(temps.warm.unwrap().fahrenheit, Some(100.0));
    assert_eq!(temps.cold.unwrap().celsius, Some(10.0));
}

#[tokio::test]
async fn test_temperature_definitions_default_to_empty() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/shadow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": {"reported": {}}})))
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let temps = client.get_temperature_definitions("D1").await.unwrap();
    assert!(temps.is_empty());
}

#[tokio::test]
async fn test_get_usage_ranges() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/usage"))
        .and(query_param("range", "week"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/usage.json")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/usage"))
        .and(query_param("range", "2026-10-01/2026-10-19"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());

    let usage = client.get_usage("D1", UsageRange::Week).await.unwrap();
    assert_eq!(usage.records.len(), 3);
    assert_eq!(usage.total_volume_ml(), 8190.5);
    assert_eq!(usage.records[0].sessions, Some(11));

    let range = UsageRange::Between(
        NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
    );
    let usage = client.get_usage("D1", range).await.unwrap();
    assert!(usage.records.is_empty());
}

#[tokio::test]
async fn test_get_user_profile() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": "test@example.com",
            "firstName": "Alex",
            "locale": "en_US"
        })))
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let profile = client.get_user_profile().await.unwrap();
    assert_eq!(profile.email.as_deref(), Some("test@example.com"));
    assert_eq!(profile.first_name.as_deref(), Some("Alex"));
    assert_eq!(profile.extra["locale"], "en_US");
}

#[tokio::test]
async fn test_dispense_command_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/D1/commands"))
        .and(header("authorization", "Bearer access123"))
        .and(body_json(json!({
            "commandSrc": "app",
            "action": "dispense",
            "volume_ml": 250,
            "dispenseActiveTimeout": 120
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"commandId": "c-42"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let ack = client.dispense("D1", 250, 120).await.unwrap();
    assert_eq!(ack.command_id.as_deref(), Some("c-42"));
}

#[tokio::test]
async fn test_start_water_flow_body_and_empty_ack() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/D1/commands"))
        .and(body_json(json!({
            "commandSrc": "app",
            "action": "start",
            "temperature": "hottest",
            "flowRate": 75
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let ack = client
        .start_water_flow("D1", Temperature::Hottest, 75)
        .await
        .unwrap();
    assert!(ack.command_id.is_none());
}

#[tokio::test]
async fn test_out_of_range_volume_is_never_sent() {
    let mock_server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let err = client
        .send_command("D1", &Command::dispense(10, 120))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_vendor_rejection_keeps_payload() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/D1/commands"))
        .respond_with(
            ResponseTemplate::new(422)
                .set_body_string(r#"{"error":"InvalidCommand","detail":"faucet busy"}"#),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    match client.dispense("D1", 500, 60).await {
        Err(Error::Api {
            status, payload, ..
        }) => {
            assert_eq!(status, Some(422));
            assert_eq!(payload, r#"{"error":"InvalidCommand","detail":"faucet busy"}"#);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_dispense_is_not_retried_on_server_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/D1/commands"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let err = client.dispense("D1", 500, 60).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_stop_is_retried_until_accepted() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/devices/D1/commands"))
        .and(body_json(json!({"commandSrc": "app", "action": "stop"})))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/devices/D1/commands"))
        .and(body_json(json!({"commandSrc": "app", "action": "stop"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let ack = client.stop_water_flow("D1").await.unwrap();
    assert_eq!(ack.status.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_reads_are_retried_after_server_errors() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"clientId": "D1"}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
}

#[tokio::test]
async fn test_reads_give_up_after_max_attempts() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let err = client.list_devices().await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_and_request_resent_once() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .and(header("authorization", "Bearer access123"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({
            "client_id": "moen_mobile_app",
            "grant_type": "refresh_token",
            "refresh_token": "refresh456"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/refresh_success.json")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .and(header("authorization", "Bearer access-refreshed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"clientId": "D1"}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);

    let credentials = client.tokens().credentials().await.unwrap();
    assert_eq!(credentials.access_token, "access-refreshed");
    assert_eq!(credentials.refresh_token, Some("refresh456".to_string()));
}

#[tokio::test]
async fn test_second_rejection_is_reported() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_partial_json(json!({"grant_type": "refresh_token"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(include_str!("fixtures/refresh_success.json")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = common::client(&mock_server, system_clock());
    let err = client.list_devices().await.unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn test_client_creation_with_base_url() {
    let client = MoenClient::new_with_base_url("http://localhost:8080/").unwrap();
    assert_eq!(client.base_url(), "http://localhost:8080");
}

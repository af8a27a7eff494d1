use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use sls_log_shipper::buffer::Batch;
use sls_log_shipper::client::{DeliveryClient, DeliveryOutcome};
use sls_log_shipper::encoder::{content_md5, LogGroup};
use sls_log_shipper::enrich::{Enricher, HostInfo};
use sls_log_shipper::stats::TransportStats;
use sls_log_shipper::{
    EnrichmentConfig, Fields, LogEvent, LogLevel, ShipperConfig, TraceContextHolder, WireFormat,
};
use wiremock::{
    matchers::{header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

const RESOURCE: &str = "/logstores/app-logs/shards/lb";

fn config(server: &MockServer) -> ShipperConfig {
    ShipperConfig::new(server.uri(), "test-ak", "test-sk", "proj", "app-logs")
        .with_max_retries(2)
        .with_retry_base_delay(Duration::from_millis(10))
        .with_request_timeout(Duration::from_millis(500))
}

fn batch(messages: &[&str]) -> Batch {
    let enricher = Enricher::new(
        HostInfo {
            hostname: "test-host".to_string(),
            process_id: 4242,
            host_ip: None,
        },
        EnrichmentConfig::default(),
        Arc::new(TraceContextHolder::new()),
    );
    let records = messages
        .iter()
        .map(|m| {
            enricher.enrich(
                LogEvent::new(LogLevel::Info, *m).with_fields(Fields::new().with("module", "auth")),
                None,
            )
        })
        .collect();
    Batch::new(records).with_pack_id("0123456789ABCDEF-1")
}

fn client(config: &ShipperConfig) -> (DeliveryClient, Arc<TransportStats>) {
    let stats = Arc::new(TransportStats::new());
    let client = DeliveryClient::new(config, stats.clone()).unwrap();
    (client, stats)
}

#[tokio::test]
async fn test_delivery_success_sends_signed_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(RESOURCE))
        .and(header("x-log-apiversion", "0.6.0"))
        .and(header("x-log-signaturemethod", "hmac-sha1"))
        .and(header("content-type", "application/json"))
        .and(header_exists("date"))
        .and(header_exists("content-md5"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (client, stats) = client(&config(&mock_server));
    let outcome = client.deliver(batch(&["a", "b"])).await;
    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });

    let requests = mock_server.received_requests().await.unwrap();
    let request = &requests[0];

    let authorization = request.headers.get("authorization").unwrap().to_str().unwrap();
    assert!(authorization.starts_with("LOG test-ak:"));

    let md5 = request.headers.get("content-md5").unwrap().to_str().unwrap();
    assert_eq!(md5, content_md5(&request.body));

    let raw_size = request.headers.get("x-log-bodyrawsize").unwrap().to_str().unwrap();
    assert_eq!(raw_size, request.body.len().to_string());

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["__topic__"], "loglayer");
    assert_eq!(body["__tags__"]["__pack_id__"], "0123456789ABCDEF-1");
    let logs = body["__logs__"].as_array().unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["message"], "a");
    assert_eq!(logs[1]["message"], "b");
    assert_eq!(logs[0]["hostname"], "test-host");
    assert_eq!(logs[0]["category"], "auth");
    assert!(logs[0]["__time__"].is_u64());

    let snap = stats.snapshot();
    assert_eq!(snap.total_sent, 2);
    assert_eq!(snap.success_count, 1);
    assert_eq!(snap.failure_count, 0);
    assert_eq!(snap.retry_count, 0);
}

#[tokio::test]
async fn test_server_error_retries_then_drops() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let (client, stats) = client(&config(&mock_server));
    let outcome = client.deliver(batch(&["a"])).await;

    match outcome {
        DeliveryOutcome::Dropped {
            attempts,
            retriable,
            error,
        } => {
            assert_eq!(attempts, 3);
            assert!(retriable);
            assert!(error.contains("503"));
        }
        other => panic!("Expected Dropped, got {:?}", other),
    }

    let snap = stats.snapshot();
    assert_eq!(snap.failure_count, 1);
    assert_eq!(snap.retry_count, 2);
    assert_eq!(snap.total_sent, 0);
    assert!(snap.last_error_at.is_some());
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(400).set_body_string("SignatureNotMatch"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (client, stats) = client(&config(&mock_server));
    let outcome = client.deliver(batch(&["a"])).await;

    assert_eq!(outcome.attempts(), 1);
    assert!(!outcome.is_delivered());
    assert_eq!(stats.snapshot().retry_count, 0);
    assert_eq!(stats.snapshot().failure_count, 1);
}

#[tokio::test]
async fn test_rate_limit_is_terminal() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (client, _) = client(&config(&mock_server));
    assert_eq!(client.deliver(batch(&["a"])).await.attempts(), 1);
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let (client, stats) = client(&config(&mock_server));
    let outcome = client.deliver(batch(&["a"])).await;

    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
    let snap = stats.snapshot();
    assert_eq!(snap.retry_count, 1);
    assert_eq!(snap.failure_count, 0);
    assert_eq!(snap.total_sent, 1);
}

#[tokio::test]
async fn test_timeout_is_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .mount(&mock_server)
        .await;

    let config = config(&mock_server).with_request_timeout(Duration::from_millis(100));
    let (client, stats) = client(&config);
    let outcome = client.deliver(batch(&["a"])).await;

    match outcome {
        DeliveryOutcome::Dropped {
            attempts, retriable, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(retriable);
        }
        other => panic!("Expected Dropped, got {:?}", other),
    }
    assert_eq!(stats.snapshot().retry_count, 2);
}

#[tokio::test]
async fn test_connection_refused_is_retried() {
    // Bind then release a port so nothing is listening on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = ShipperConfig::new(
        format!("http://127.0.0.1:{}", port),
        "test-ak",
        "test-sk",
        "proj",
        "app-logs",
    )
    .with_max_retries(1)
    .with_retry_base_delay(Duration::from_millis(10));

    let (client, stats) = client(&config);
    let outcome = client.deliver(batch(&["a"])).await;

    assert_eq!(outcome.attempts(), 2);
    assert_eq!(stats.snapshot().retry_count, 1);
}

#[tokio::test]
async fn test_protobuf_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(RESOURCE))
        .and(header("content-type", "application/x-protobuf"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = config(&mock_server).with_wire_format(WireFormat::Protobuf);
    let (client, _) = client(&config);
    let records = batch(&["first", "second", "third"]);
    let expected_time = records.records[0].unix_seconds();

    assert!(client.deliver(records).await.is_delivered());

    let requests = mock_server.received_requests().await.unwrap();
    let group = LogGroup::decode(requests[0].body.as_slice()).unwrap();
    assert_eq!(group.logs.len(), 3);
    assert_eq!(group.logs[0].time, expected_time);
    assert_eq!(group.topic.as_deref(), Some("loglayer"));
    assert_eq!(group.log_tags[0].value, "0123456789ABCDEF-1");

    let message = group.logs[2]
        .contents
        .iter()
        .find(|c| c.key == "message")
        .map(|c| c.value.as_str());
    assert_eq!(message, Some("third"));
}

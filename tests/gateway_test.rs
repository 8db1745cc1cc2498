//! Integration tests for request dispatch and the TCP gateway

use ofdr_control::config::SchedulerConfig;
use ofdr_control::error::ErrorCode;
use ofdr_control::hardware::mock::{MockFla, MockOpticalSwitch, MockReply};
use ofdr_control::network::messages::{Request, Response, SubmitRequest, TaskRef};
use ofdr_control::network::session::ClientSession;
use ofdr_control::network::server::MAX_REQUEST_BYTES;
use ofdr_control::network::{Gateway, GatewayServer};
use ofdr_control::scheduler::{DeviceBus, Scheduler, TaskId, TaskStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn gateway_with(fla: MockFla) -> (Gateway, Arc<MockFla>) {
    let fla = Arc::new(fla);
    let switch = Arc::new(MockOpticalSwitch::new(1..=8).with_latency(Duration::from_millis(2)));
    let bus = DeviceBus::new(switch, fla.clone());
    let scheduler = Scheduler::start(bus, SchedulerConfig::default());
    (Gateway::new(scheduler), fla)
}

fn gateway() -> Gateway {
    gateway_with(MockFla::new().with_latency(Duration::from_millis(5))).0
}

async fn poll_result(gateway: &Gateway, session: &Arc<ClientSession>, task_id: &TaskId) -> Response {
    timeout(Duration::from_secs(5), async {
        loop {
            let request = Request::Result(TaskRef {
                task_id: task_id.clone(),
            });
            let response = gateway.handle(request, session).await;
            if let Response::Result(result) = &response {
                if result.status.is_terminal() {
                    return response;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not finish")
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_submit_status_result_cycle() {
    let gateway = gateway();
    let session = Arc::new(ClientSession::detached());

    let response = gateway
        .handle(Request::Submit(SubmitRequest::new(2, "autopeak")), &session)
        .await;
    let Response::Ack(ack) = response else {
        panic!("expected ack, got {response:?}");
    };
    assert_eq!(ack.channel, 2);

    let status = gateway
        .handle(
            Request::Status(TaskRef {
                task_id: ack.task_id.clone(),
            }),
            &session,
        )
        .await;
    assert!(matches!(status, Response::Status(_)));

    let Response::Result(result) = poll_result(&gateway, &session, &ack.task_id).await else {
        unreachable!()
    };
    assert!(result.success);
    assert_eq!(result.status, TaskStatus::Done);
    assert!(result.data.is_some());
}

#[tokio::test]
async fn test_rejected_submit_returns_error_message() {
    let gateway = gateway();
    let session = Arc::new(ClientSession::detached());

    let response = gateway
        .handle_line(r#"{"op":"submit","channel":99,"mode":"autopeak"}"#, &session)
        .await;
    let Response::Error(error) = response else {
        panic!("expected error, got {response:?}");
    };
    assert_eq!(error.code, ErrorCode::ValidationError);
    assert!(gateway.scheduler().store().is_empty().await);
}

#[tokio::test]
async fn test_malformed_and_unknown_requests() {
    let gateway = gateway();
    let session = Arc::new(ClientSession::detached());

    for line in [
        "not json",
        r#"{"op":"reboot"}"#,
        r#"{"channel":1}"#,
        r#"{"op":"submit","channel":-1,"mode":"scan"}"#,
    ] {
        let response = gateway.handle_line(line, &session).await;
        let Response::Error(error) = response else {
            panic!("expected error for {line}, got {response:?}");
        };
        assert_eq!(error.code, ErrorCode::ValidationError, "{line}");
    }
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let gateway = gateway();
    let session = Arc::new(ClientSession::detached());

    for line in [
        r#"{"op":"status","taskId":"T20240101000000000-deadbeef"}"#,
        r#"{"op":"result","taskId":"T20240101000000000-deadbeef"}"#,
        r#"{"op":"cancel","taskId":"T20240101000000000-deadbeef"}"#,
    ] {
        let response = gateway.handle_line(line, &session).await;
        let Response::Error(error) = response else {
            panic!("expected error, got {response:?}");
        };
        assert_eq!(error.code, ErrorCode::NotFound);
        assert_eq!(
            error.task_id,
            Some(TaskId::from("T20240101000000000-deadbeef"))
        );
    }
}

#[tokio::test]
async fn test_protocol_fault_visible_through_gateway() {
    let (gateway, fla) = gateway_with(MockFla::new().with_latency(Duration::from_millis(5)));
    fla.push_reply(MockReply::Frame("OP_21.275_-57.128_9_SN9II1_PO".into()))
        .await;
    let session = Arc::new(ClientSession::detached());

    let Response::Ack(ack) = gateway
        .handle(Request::Submit(SubmitRequest::new(1, "autopeak")), &session)
        .await
    else {
        panic!("expected ack");
    };

    let Response::Result(result) = poll_result(&gateway, &session, &ack.task_id).await else {
        unreachable!()
    };
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, ErrorCode::ProtocolFault);
}

#[tokio::test]
async fn test_ping() {
    let gateway = gateway();
    let session = Arc::new(ClientSession::detached());
    assert_eq!(
        gateway.handle_line(r#"{"op":"ping"}"#, &session).await,
        Response::Pong
    );
}

// =============================================================================
// TCP transport
// =============================================================================

async fn read_json(lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>) -> Value {
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("no reply")
        .unwrap()
        .expect("connection closed");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_tcp_round_trip_with_result_push() {
    let (gateway, _fla) = gateway_with(MockFla::new().with_latency(Duration::from_millis(50)));
    let server = GatewayServer::bind("127.0.0.1:0", gateway, Duration::from_secs(30))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let sessions = server.sessions();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"{\"op\":\"ping\"}\n").await.unwrap();
    assert_eq!(read_json(&mut lines).await, json!({"op": "pong"}));

    let submit = json!({"op": "submit", "channel": 3, "mode": "AutoPeak", "params": {"thr": -80}});
    writer
        .write_all(format!("{submit}\n").as_bytes())
        .await
        .unwrap();
    let ack = read_json(&mut lines).await;
    assert_eq!(ack["op"], "ack");
    assert_eq!(ack["channel"], 3);
    assert_eq!(ack["mode"], "autopeak");
    let task_id = ack["taskId"].as_str().unwrap().to_string();

    // The worker pushes the final result on the same connection
    let pushed = read_json(&mut lines).await;
    assert_eq!(pushed["op"], "result");
    assert_eq!(pushed["taskId"], task_id.as_str());
    assert_eq!(pushed["success"], true);
    assert_eq!(pushed["data"]["kind"], "peaks");
    assert_eq!(pushed["data"]["serial"], "SN9II1");

    writer.write_all(b"garbage\n").await.unwrap();
    let error = read_json(&mut lines).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "ValidationError");

    assert_eq!(sessions.len().await, 1);
    drop(writer);
    drop(lines);

    timeout(Duration::from_secs(2), async {
        while !sessions.is_empty().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session not released after disconnect");

    shutdown.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_oversized_request_line_is_rejected_and_closed() {
    let server = GatewayServer::bind("127.0.0.1:0", gateway(), Duration::from_secs(30))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let sessions = server.sessions();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let flood = vec![b'a'; MAX_REQUEST_BYTES + 1];
    writer.write_all(&flood).await.unwrap();

    let error = read_json(&mut lines).await;
    assert_eq!(error["op"], "error");
    assert_eq!(error["code"], "ValidationError");

    let closed = timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("connection left open")
        .unwrap();
    assert!(closed.is_none());
    assert!(sessions.is_empty().await);

    shutdown.cancel();
}

#[tokio::test]
async fn test_idle_connection_is_kept() {
    let server = GatewayServer::bind("127.0.0.1:0", gateway(), Duration::from_millis(50))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    sleep(Duration::from_millis(200)).await;
    writer.write_all(b"{\"op\":\"ping\"}\n").await.unwrap();
    assert_eq!(read_json(&mut lines).await, json!({"op": "pong"}));

    shutdown.cancel();
}

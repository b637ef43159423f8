//! End-to-end node tests over loopback TCP: capabilities exchange,
//! request/answer correlation, routing, watchdog failure and the
//! default answers for unserved applications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use diabase::application::{answer_from, error_answer};
use diabase::avp::{Avp, AvpValue};
use diabase::common::{avp_code, base_cmd, RELAY_APPLICATION_ID};
use diabase::config::PeerSettings;
use diabase::transport::{Listener, Transport, TransportKind};
use diabase::{
    Application, DiameterError, DiameterMessage, Node, NodeConfig, NodeHandle, PeerState,
    ResultCode,
};

fn node_config(origin_host: &str) -> NodeConfig {
    let mut cfg = NodeConfig::new(origin_host, "example.net");
    cfg.wakeup_interval = Duration::from_millis(50);
    cfg
}

fn server_config(origin_host: &str) -> NodeConfig {
    let mut cfg = node_config(origin_host);
    cfg.ip_addresses = vec!["127.0.0.1".parse().unwrap()];
    cfg.tcp_port = Some(0);
    cfg.accept_unknown_peers = true;
    cfg
}

fn echo_application(origin_host: &str) -> Application {
    let origin_host = origin_host.to_string();
    Application::inline(4, true, false, move |req| {
        let mut answer = answer_from(&req, &origin_host, "example.net");
        answer.add_avp(Avp::mandatory(
            avp_code::RESULT_CODE,
            AvpValue::Unsigned32(ResultCode::Success as u32),
        ));
        Some(answer)
    })
}

fn credit_control_request(session_id: &str) -> DiameterMessage {
    let mut msg = DiameterMessage::new_request(base_cmd::CREDIT_CONTROL, 4);
    msg.add_avp(Avp::mandatory(
        avp_code::SESSION_ID,
        AvpValue::Utf8String(session_id.to_string()),
    ));
    msg.add_avp(Avp::mandatory(
        avp_code::ORIGIN_HOST,
        AvpValue::Identity("client.example.net".into()),
    ));
    msg.add_avp(Avp::mandatory(
        avp_code::ORIGIN_REALM,
        AvpValue::Identity("example.net".into()),
    ));
    msg.add_avp(Avp::mandatory(
        avp_code::DESTINATION_REALM,
        AvpValue::Identity("example.net".into()),
    ));
    msg
}

async fn start_client(server_ports: &[(String, u16)]) -> NodeHandle {
    let mut client = Node::new(node_config("client.example.net"));
    for (host, port) in server_ports {
        client
            .add_peer(
                &format!("aaa://{host}:{port}"),
                PeerSettings {
                    ip_addresses: vec!["127.0.0.1".parse().unwrap()],
                    persistent: true,
                    ..PeerSettings::default()
                },
            )
            .unwrap();
    }
    client
        .add_application(Application::inline(4, true, false, |_| None))
        .unwrap();
    client.start().await.unwrap()
}

async fn wait_for_state(handle: &NodeHandle, host: &str, state: PeerState) -> bool {
    for _ in 0..200 {
        if let Ok(Some(status)) = handle.peer_status(host).await {
            if status.state == state {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_capabilities_exchange_and_request_answer() {
    let mut server = Node::new(server_config("server.example.net"));
    server
        .add_application(echo_application("server.example.net"))
        .unwrap();
    let server_handle = server.start().await.unwrap();
    let port = server_handle.tcp_addrs()[0].port();

    let client_handle = start_client(&[("server.example.net".into(), port)]).await;

    // the peer becomes READY once CER/CEA completes
    assert!(wait_for_state(&client_handle, "server.example.net", PeerState::Open).await);

    let session_id = client_handle.session_id();
    let request = credit_control_request(&session_id);
    let answer = client_handle
        .send_request(request, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(answer.result_code(), Some(2001));
    assert_eq!(answer.session_id(), Some(session_id.as_str()));
    assert_eq!(answer.origin_host(), Some("server.example.net"));

    // the server recorded the processed request
    let stats = server_handle.statistics().await.unwrap();
    assert!(stats.avg_response_time.contains_key("Credit-Control"));
    assert!(stats.received_req_counters[0] >= 1);

    // orderly shutdown: DPR/DPA completes and the slot empties
    client_handle.stop(Duration::from_secs(5), false).await.unwrap();
    server_handle.stop(Duration::from_secs(1), true).await.unwrap();
}

#[tokio::test]
async fn test_destination_host_routing_is_deterministic() {
    let mut server_a = Node::new(server_config("a.example.net"));
    server_a.add_application(echo_application("a.example.net")).unwrap();
    let handle_a = server_a.start().await.unwrap();

    let mut server_b = Node::new(server_config("b.example.net"));
    server_b.add_application(echo_application("b.example.net")).unwrap();
    let handle_b = server_b.start().await.unwrap();

    let client_handle = start_client(&[
        ("a.example.net".into(), handle_a.tcp_addrs()[0].port()),
        ("b.example.net".into(), handle_b.tcp_addrs()[0].port()),
    ])
    .await;
    assert!(wait_for_state(&client_handle, "a.example.net", PeerState::Open).await);
    assert!(wait_for_state(&client_handle, "b.example.net", PeerState::Open).await);

    for _ in 0..4 {
        let mut request = credit_control_request(&client_handle.session_id());
        request.add_avp(Avp::mandatory(
            avp_code::DESTINATION_HOST,
            AvpValue::Identity("b.example.net".into()),
        ));
        let answer = client_handle
            .send_request(request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(answer.origin_host(), Some("b.example.net"));
    }

    client_handle.stop(Duration::from_secs(1), true).await.unwrap();
    handle_a.stop(Duration::from_secs(1), true).await.unwrap();
    handle_b.stop(Duration::from_secs(1), true).await.unwrap();
}

#[tokio::test]
async fn test_request_timeout_observed_by_caller() {
    let mut server = Node::new(server_config("slow.example.net"));
    // worker-pool application that cannot answer in time
    server
        .add_application(Application::worker_pool(4, true, false, 2, |_req| {
            std::thread::sleep(Duration::from_secs(3));
            None
        }))
        .unwrap();
    let server_handle = server.start().await.unwrap();
    let port = server_handle.tcp_addrs()[0].port();

    let client_handle = start_client(&[("slow.example.net".into(), port)]).await;
    assert!(wait_for_state(&client_handle, "slow.example.net", PeerState::Open).await);

    let started = std::time::Instant::now();
    let result = client_handle
        .send_request(
            credit_control_request(&client_handle.session_id()),
            Duration::from_millis(300),
        )
        .await;
    assert!(matches!(result, Err(DiameterError::RequestTimeout)));
    // fires at the timeout plus at most a few wakeup intervals
    assert!(started.elapsed() < Duration::from_millis(1500));

    client_handle.stop(Duration::from_secs(1), true).await.unwrap();
    server_handle.stop(Duration::from_secs(1), true).await.unwrap();
}

#[tokio::test]
async fn test_unserved_application_answered_with_3007() {
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_in_handler = invoked.clone();

    let mut server = Node::new(server_config("server.example.net"));
    server
        .add_application(Application::inline(4, true, false, move |req| {
            invoked_in_handler.store(true, Ordering::SeqCst);
            Some(error_answer(
                &req,
                "server.example.net",
                "example.net",
                ResultCode::Success,
            ))
        }))
        .unwrap();
    let server_handle = server.start().await.unwrap();
    let addr = server_handle.tcp_addrs()[0];

    // raw relay client, talking the wire protocol directly
    let mut conn = Transport::connect(vec![addr.ip()], addr.port(), TransportKind::Tcp)
        .await
        .unwrap();
    let mut cer = DiameterMessage::new_request(base_cmd::CAPABILITIES_EXCHANGE, 0);
    cer.header.hop_by_hop_id = 1;
    cer.header.end_to_end_id = 1;
    cer.add_avp(Avp::mandatory(
        avp_code::ORIGIN_HOST,
        AvpValue::Identity("relay.example.net".into()),
    ));
    cer.add_avp(Avp::mandatory(
        avp_code::ORIGIN_REALM,
        AvpValue::Identity("example.net".into()),
    ));
    cer.add_avp(Avp::mandatory(
        avp_code::AUTH_APPLICATION_ID,
        AvpValue::Unsigned32(RELAY_APPLICATION_ID),
    ));
    conn.send(&cer).await.unwrap();
    let cea = conn.recv().await.unwrap().unwrap();
    assert_eq!(cea.result_code(), Some(2001));

    // request for an application id nobody serves
    let mut request = DiameterMessage::new_request(272, 16777250);
    request.header.hop_by_hop_id = 7;
    request.header.end_to_end_id = 7;
    request.add_avp(Avp::mandatory(
        avp_code::ORIGIN_HOST,
        AvpValue::Identity("relay.example.net".into()),
    ));
    request.add_avp(Avp::mandatory(
        avp_code::ORIGIN_REALM,
        AvpValue::Identity("example.net".into()),
    ));
    conn.send(&request).await.unwrap();
    let answer = conn.recv().await.unwrap().unwrap();
    assert_eq!(answer.header.hop_by_hop_id, 7);
    assert_eq!(answer.result_code(), Some(3007));
    assert!(answer.header.is_error());
    assert!(!invoked.load(Ordering::SeqCst));

    conn.shutdown().await.unwrap();
    server_handle.stop(Duration::from_secs(1), true).await.unwrap();
}

#[tokio::test]
async fn test_watchdog_timeout_closes_connection() {
    // a bare-transport peer that completes CER/CEA but never answers DWRs
    let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0, TransportKind::Tcp)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<u32>(16);

    tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let cer = conn.recv().await.unwrap().unwrap();
        assert_eq!(cer.header.command_code, base_cmd::CAPABILITIES_EXCHANGE);
        let mut cea = DiameterMessage::new_answer(&cer);
        cea.add_avp(Avp::mandatory(
            avp_code::RESULT_CODE,
            AvpValue::Unsigned32(ResultCode::Success as u32),
        ));
        cea.add_avp(Avp::mandatory(
            avp_code::ORIGIN_HOST,
            AvpValue::Identity("mute.example.net".into()),
        ));
        cea.add_avp(Avp::mandatory(
            avp_code::ORIGIN_REALM,
            AvpValue::Identity("example.net".into()),
        ));
        cea.add_avp(Avp::mandatory(
            avp_code::AUTH_APPLICATION_ID,
            AvpValue::Unsigned32(4),
        ));
        conn.send(&cea).await.unwrap();
        // read whatever comes next but never answer
        while let Ok(Some(msg)) = conn.recv().await {
            let _ = seen_tx.send(msg.header.command_code).await;
        }
    });

    let mut client = Node::new(node_config("client.example.net"));
    client
        .add_peer(
            &format!("aaa://mute.example.net:{}", addr.port()),
            PeerSettings {
                ip_addresses: vec!["127.0.0.1".parse().unwrap()],
                persistent: true,
                timers: diabase::config::PeerTimerOverrides {
                    idle: Some(Duration::from_millis(300)),
                    dwa: Some(Duration::from_millis(300)),
                    ..Default::default()
                },
                ..PeerSettings::default()
            },
        )
        .unwrap();
    client
        .add_application(Application::inline(4, true, false, |_| None))
        .unwrap();
    let client_handle = client.start().await.unwrap();

    // READY may be short-lived here (the idle timer fires fast), so accept
    // either READY state before watching for the close
    let mut became_ready = false;
    for _ in 0..200 {
        if let Ok(Some(status)) = client_handle.peer_status("mute.example.net").await {
            if status.state.is_ready() {
                became_ready = true;
                break;
            }
            if status.disconnect_reason == Some(diabase::DisconnectReason::DwaTimeout) {
                became_ready = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(became_ready, "peer never completed CER/CEA");

    // idle timer fires a DWR; the missing DWA closes the connection
    let mut closed = false;
    for _ in 0..200 {
        let status = client_handle
            .peer_status("mute.example.net")
            .await
            .unwrap()
            .unwrap();
        if status.state == PeerState::Closed
            && status.disconnect_reason == Some(diabase::DisconnectReason::DwaTimeout)
        {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(closed, "expected a DWA-timeout disconnect");
    assert_eq!(seen_rx.recv().await, Some(base_cmd::DEVICE_WATCHDOG));

    client_handle.stop(Duration::from_secs(1), true).await.unwrap();
}

#[tokio::test]
async fn test_no_route_without_ready_peers() {
    let client_handle = start_client(&[]).await;
    let result = client_handle
        .send_request(
            credit_control_request("client.example.net;0;1"),
            Duration::from_millis(200),
        )
        .await;
    assert!(matches!(result, Err(DiameterError::NoRoute(_))));
    client_handle.stop(Duration::from_secs(1), true).await.unwrap();
}

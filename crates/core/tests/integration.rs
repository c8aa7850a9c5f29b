//! End-to-end ingest handshake: a simulated camera connects and drives
//! `ANNOUNCE -> SETUP -> RECORD -> TEARDOWN` against a real `Orchestrator`
//! bound to a loopback port, asserting on the wire responses.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use camrelay::{Orchestrator, OrchestratorConfig};

fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        if len > 0 {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            response.push_str(&String::from_utf8_lossy(&body));
        }
    }

    Ok(response)
}

fn session_header_id(resp: &str) -> &str {
    resp.lines()
        .find(|l| l.to_lowercase().starts_with("session:"))
        .and_then(|l| l.split(':').nth(1))
        .map(|v| v.trim().split(';').next().unwrap_or("").trim())
        .unwrap_or("")
}

fn start_test_orchestrator(rtsp_port: u16, monitor_port: u16) -> std::sync::Arc<Orchestrator> {
    let config = OrchestratorConfig {
        bind_ip: "127.0.0.1".to_string(),
        rtsp_port,
        workers: 2,
        monitor_ip: None,
        monitor_port,
    };
    let orchestrator = Orchestrator::start(config).expect("orchestrator start");
    let handle = orchestrator.clone();
    std::thread::spawn(move || {
        let _ = handle.run();
    });
    // Give the main reactor a moment to register the listener before the
    // first connection attempt.
    std::thread::sleep(Duration::from_millis(50));
    orchestrator
}

fn connect(port: u16) -> TcpStream {
    let addr = ("127.0.0.1", port).to_socket_addrs().unwrap().next().unwrap();
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to relay");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

#[test]
fn full_handshake_announce_setup_record_teardown() {
    let orchestrator = start_test_orchestrator(18_554, 19_000);
    let mut stream = connect(18_554);
    let uri = "rtsp://127.0.0.1:18554/cam-front";

    let options_req = format!("OPTIONS {uri} RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let options_resp = rtsp_request(&mut stream, &options_req).expect("OPTIONS response");
    assert!(options_resp.starts_with("RTSP/1.0 200 OK"), "{options_resp}");
    assert!(options_resp.contains("Public:"));

    let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=cam-front\r\nm=video 0 RTP/AVP 96\r\n";
    let announce_req = format!(
        "ANNOUNCE {uri} RTSP/1.0\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{sdp}",
        sdp.len()
    );
    let announce_resp = rtsp_request(&mut stream, &announce_req).expect("ANNOUNCE response");
    assert!(announce_resp.starts_with("RTSP/1.0 200 OK"), "{announce_resp}");

    let setup_req = format!(
        "SETUP {uri} RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/UDP;unicast;client_port=30000-30001\r\n\r\n"
    );
    let setup_resp = rtsp_request(&mut stream, &setup_req).expect("SETUP response");
    assert!(setup_resp.starts_with("RTSP/1.0 200 OK"), "{setup_resp}");
    assert!(setup_resp.contains("Transport:"));
    assert!(setup_resp.contains("server_port="));
    let session_id = session_header_id(&setup_resp).to_string();
    assert!(!session_id.is_empty(), "SETUP: no Session header in {setup_resp}");

    let record_req = format!(
        "RECORD {uri} RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\r\n"
    );
    let record_resp = rtsp_request(&mut stream, &record_req).expect("RECORD response");
    assert!(record_resp.starts_with("RTSP/1.0 200 OK"), "{record_resp}");

    assert!(
        orchestrator.registry().get(&session_id).is_some(),
        "session should still be tracked while streaming"
    );

    let teardown_req = format!("TEARDOWN {uri} RTSP/1.0\r\nCSeq: 5\r\nSession: {session_id}\r\n\r\n");
    let teardown_resp = rtsp_request(&mut stream, &teardown_req).expect("TEARDOWN response");
    assert!(teardown_resp.starts_with("RTSP/1.0 200 OK"), "{teardown_resp}");

    // A second TEARDOWN on an already-closed session reports not-found
    // rather than silently succeeding again.
    let second_teardown = rtsp_request(&mut stream, &teardown_req).expect("second TEARDOWN response");
    assert!(
        second_teardown.starts_with("RTSP/1.0 454"),
        "repeat TEARDOWN should be rejected: {second_teardown}"
    );

    orchestrator.stop();
}

#[test]
fn setup_without_transport_header_is_rejected() {
    let orchestrator = start_test_orchestrator(18_555, 19_001);
    let mut stream = connect(18_555);
    let uri = "rtsp://127.0.0.1:18555/cam-bad";

    let setup_req = format!("SETUP {uri} RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let resp = rtsp_request(&mut stream, &setup_req).expect("SETUP response");
    assert!(resp.starts_with("RTSP/1.0 400"), "{resp}");

    orchestrator.stop();
}

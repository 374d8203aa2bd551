//! End-to-end tests against a mock peer listening on a local TCP port.

use harmony_bridge::protocol::Call;
use harmony_bridge::{
    params, Application, BridgeClient, BridgeError, FrameCodec, FrameRange, Message, Params,
    RequestId, TransportError,
};
use harmony_core::{Config, Endpoint, TextEncoding};
use serde_json::json;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Script = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

/// Accept one connection, send `greeting`, then answer every message with
/// `script` until the client hangs up. Returns what the peer received.
fn spawn_peer(greeting: Vec<Message>, mut script: Script) -> (u16, JoinHandle<Vec<Message>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // the peer reads what the client writes and vice versa
        let mut codec = FrameCodec::with_encodings(TextEncoding::Utf8, TextEncoding::Utf16Be);

        for message in &greeting {
            stream.write_all(&codec.encode(message).unwrap()).unwrap();
        }

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for message in codec.decode_stream(&buf[..n]).unwrap() {
                for answer in script(&message) {
                    stream.write_all(&codec.encode(&answer).unwrap()).unwrap();
                }
                received.push(message);
            }
        }
        received
    });

    (port, handle)
}

fn config(port: u16) -> Config {
    let mut config = Config::default();
    config.bridge.port = Some(port);
    config.bridge.read_timeout_ms = 2_000;
    config.bridge.poll_interval_ms = 5;
    config.bridge.retry_interval_ms = 10;
    config
}

fn endpoint(port: u16) -> Endpoint {
    Endpoint {
        host: "127.0.0.1".to_string(),
        port,
    }
}

fn harmony_script() -> Script {
    Box::new(|message| match message {
        Message::Call(call) if call.request_return => match answer_for(call) {
            Some(result) => vec![Message::reply(call.id.clone(), result)],
            None => Vec::new(),
        },
        _ => Vec::new(),
    })
}

fn answer_for(call: &Call) -> Option<serde_json::Value> {
    match call.method.as_str() {
        "DIR" => Some(json!(["DIR", "GET_FRAME_RANGE", "GET_VERSION"])),
        "GET_FRAME_RANGE" => Some(json!({"start_frame": 1, "stop_frame": 48})),
        "GET_VERSION" => Some(json!("22.0.1")),
        "SAVE_PROJECT" => None,
        _ => None,
    }
}

#[test]
fn frame_range_round_trip() {
    let (port, peer) = spawn_peer(Vec::new(), harmony_script());
    let config = config(port);
    let app = Application::tcp(&endpoint(port), &config);

    app.connect().unwrap();
    assert_eq!(
        app.frame_range(),
        Some(FrameRange {
            start_frame: 1,
            stop_frame: 48
        })
    );
    drop(app);

    let received = peer.join().unwrap();
    let methods: Vec<&str> = received
        .iter()
        .filter_map(|message| match message {
            Message::Call(call) => Some(call.method.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(methods, vec!["DIR", "GET_FRAME_RANGE"]);
}

#[test]
fn peer_ping_is_answered_with_its_own_id() {
    let ping = Message::Call(Call {
        id: RequestId::Num(7),
        method: "PING".to_string(),
        params: Params::new(),
        request_return: true,
    });
    let (tx, rx) = mpsc::channel();
    let script: Script = Box::new(move |message| {
        if let Message::Reply(reply) = message {
            let _ = tx.send(serde_json::to_value(message).unwrap());
            assert_eq!(reply.id, RequestId::Num(7));
        }
        Vec::new()
    });
    let (port, peer) = spawn_peer(vec![ping], script);

    let config = config(port);
    let client = BridgeClient::tcp(&endpoint(port), &config.bridge);
    client.connect().unwrap();
    client.register_callback("PING", |_, _| Ok(Some(json!(true))));

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut dispatched = 0;
    while dispatched == 0 && Instant::now() < deadline {
        dispatched += client.poll(Duration::from_millis(20)).unwrap();
    }
    assert_eq!(dispatched, 1);

    let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(
        reply,
        json!({"jsonrpc": "2.0", "result": true, "request_return": false, "id": 7})
    );

    drop(client);
    peer.join().unwrap();
}

#[test]
fn silent_peer_times_out_without_breaking_the_link() {
    let (port, peer) = spawn_peer(Vec::new(), harmony_script());
    let config = config(port);
    let client = BridgeClient::tcp(&endpoint(port), &config.bridge);
    client.connect().unwrap();

    let started = Instant::now();
    let result = client
        .call_and_wait_timeout("SAVE_PROJECT", Params::new(), Duration::from_millis(100))
        .unwrap();
    assert_eq!(result, None);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(client.is_connected());

    let version = client.call_and_wait("GET_VERSION", params! {}).unwrap();
    assert_eq!(version, Some(json!("22.0.1")));

    drop(client);
    peer.join().unwrap();
}

#[test]
fn notifications_carry_params_and_no_return() {
    let (port, peer) = spawn_peer(Vec::new(), harmony_script());
    let config = config(port);
    let client = BridgeClient::tcp(&endpoint(port), &config.bridge);

    // sending on an unconnected client connects first
    client
        .notify("LOG_INFO", params! { "message" => "héllo ✓" })
        .unwrap();
    assert!(client.is_connected());
    drop(client);

    let received = peer.join().unwrap();
    let Some(Message::Call(call)) = received.first() else {
        panic!("expected a call, got {received:?}");
    };
    assert_eq!(call.method, "LOG_INFO");
    assert_eq!(call.params["message"], json!("héllo ✓"));
    assert!(!call.request_return);
}

#[test]
fn connect_gives_up_after_configured_attempts() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = config(port);
    config.bridge.max_connect_attempts = Some(2);
    config.bridge.connect_timeout_ms = 200;

    let app = Application::tcp(&endpoint(port), &config);
    let err = app.connect().expect_err("nothing is listening");
    assert!(matches!(
        err,
        BridgeError::Transport(TransportError::ConnectFailed { .. })
    ));
    assert!(!app.client().is_connected());
}

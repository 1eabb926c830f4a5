//! Session scenarios over the in-memory transport.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use giztoy_gemini_live::capture::ChannelSource;
use giztoy_gemini_live::events::EventStream;
use giztoy_gemini_live::message::{ClientMessage, ServerMessage};
use giztoy_gemini_live::pipe::{PipeConn, PipeServer, new_pipe};
use giztoy_gemini_live::playback::{ManualClock, ScheduledChunk};
use giztoy_gemini_live::transport::{CLOSE_NORMAL, Dialer, Frame};
use giztoy_gemini_live::*;
use serde_json::{Value, json};
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    session: Session,
    server: PipeServer,
    conn: PipeConn,
    clock: Arc<ManualClock>,
    events: EventStream,
}

fn client(dialer: pipe::PipeDialer, clock: Arc<ManualClock>) -> Client {
    Client::builder("test-key")
        .websocket_url("wss://live.test/ws")
        .dialer(dialer)
        .clock(clock)
        .build()
        .unwrap()
}

async fn connect(config: Configuration) -> Harness {
    connect_with(config, |builder| builder).await
}

async fn connect_with(
    config: Configuration,
    tune: impl FnOnce(ClientBuilder) -> ClientBuilder,
) -> Harness {
    let (dialer, mut server) = new_pipe();
    let clock = Arc::new(ManualClock::new());
    let builder = Client::builder("test-key")
        .websocket_url("wss://live.test/ws")
        .dialer(dialer)
        .clock(clock.clone());
    let session = tune(builder).build().unwrap().session();
    let events = session.events();

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(config).await })
    };
    let mut conn = server.accept().await.unwrap();
    let setup = conn.recv_message().await.unwrap();
    assert!(matches!(setup, ClientMessage::Setup(_)));
    conn.send(&ServerMessage::SetupComplete).unwrap();
    assert_ok!(connecting.await.unwrap());
    assert_eq!(session.status(), SessionStatus::Active);

    Harness {
        session,
        server,
        conn,
        clock,
        events,
    }
}

async fn wait_for(events: &mut EventStream, pred: impl Fn(&Event) -> bool) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn recv_json(conn: &mut PipeConn) -> Value {
    let frame = tokio::time::timeout(WAIT, conn.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("client hung up");
    match frame {
        Frame::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

fn audio_message(ms: usize) -> ServerMessage {
    // 24kHz mono PCM16 is 48 bytes per millisecond
    ServerMessage::ServerContent(ServerContent {
        parts: vec![Part::InlineData(Blob::new(
            "audio/pcm;rate=24000",
            vec![0u8; 48 * ms],
        ))],
        ..Default::default()
    })
}

fn tool_call(id: &str) -> ServerMessage {
    ServerMessage::ToolCall(ToolCall {
        function_calls: vec![FunctionCall {
            id: id.into(),
            name: "f".into(),
            args: json!({}),
        }],
    })
}

/// A source frame of `chunks` 40ms input chunks; every byte of chunk `i` is `i`.
fn tagged_frame(chunks: u8) -> AudioChunk {
    let data: Vec<u8> = (0..chunks)
        .flat_map(|i| std::iter::repeat_n(i, 1280))
        .collect();
    AudioChunk::new(AudioFormat::input(), data).unwrap()
}

/// Receives `n` realtime audio chunks and returns their tags.
async fn recv_chunk_tags(conn: &mut PipeConn, n: usize) -> Vec<u8> {
    let mut tags = Vec::new();
    for _ in 0..n {
        match tokio::time::timeout(WAIT, conn.recv_message()).await.unwrap() {
            Ok(ClientMessage::RealtimeInput(blob)) => {
                assert_eq!(blob.data.len(), 1280);
                tags.push(blob.data[0]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    tags
}

fn assert_no_overlap(windows: &[ScheduledChunk]) {
    for pair in windows.windows(2) {
        assert!(pair[0].end <= pair[1].start, "overlapping windows {:?}", pair);
    }
}

#[tokio::test]
async fn test_setup_is_first_frame() {
    let (dialer, mut server) = new_pipe();
    let session = client(dialer, Arc::new(ManualClock::new())).session();
    let config = Configuration::new("m1").with_modalities(ResponseModality::Text);

    let connecting = {
        let session = session.clone();
        let config = config.clone();
        tokio::spawn(async move { session.connect(config).await })
    };
    let mut conn = server.accept().await.unwrap();
    assert_eq!(
        recv_json(&mut conn).await,
        json!({"setup": {"model": "m1", "generationConfig": {"responseModalities": ["TEXT"]}}})
    );
    assert!(server.last_endpoint().unwrap().authorized_url().unwrap().contains("key=test-key"));

    assert!(matches!(
        session.send_text(vec![Part::text("early")], true),
        Err(Error::NotConnected)
    ));
    assert_eq!(session.status(), SessionStatus::AwaitingSetupAck);

    conn.send(&ServerMessage::SetupComplete).unwrap();
    assert_ok!(connecting.await.unwrap());
    assert_eq!(session.configuration(), Some(config));
}

#[tokio::test]
async fn test_send_text_hello() {
    let mut h = connect(Configuration::new("m1")).await;

    assert_ok!(h.session.send_text(vec![Part::text("hello")], true));

    let frame = recv_json(&mut h.conn).await;
    assert_eq!(
        frame,
        json!({"clientContent": {
            "turns": [{"role": "user", "parts": [{"text": "hello"}]}],
            "turnComplete": true,
        }})
    );
    tokio::task::yield_now().await;
    assert!(h.conn.try_recv().is_none());
}

#[tokio::test]
async fn test_reconnect_while_live_rejected() {
    let h = connect(Configuration::new("m1")).await;
    let err = h.session.connect(Configuration::new("m2")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyConnected));
    assert_eq!(h.session.configuration().unwrap().model, "m1");
    assert_eq!(h.server.dial_count(), 1);
}

#[tokio::test]
async fn test_tool_call_respond_once() {
    let mut h = connect(Configuration::new("m1")).await;

    h.conn.send(&tool_call("a")).unwrap();
    let event = wait_for(&mut h.events, |e| matches!(e, Event::ToolCall(_))).await;
    assert!(matches!(event, Event::ToolCall(ref c) if c.function_calls[0].id == "a"));
    assert_eq!(h.session.invocation_status("a"), Some(InvocationStatus::Pending));

    assert_ok!(h.session.respond("a", json!({"result": 42})));
    assert_eq!(
        recv_json(&mut h.conn).await,
        json!({"toolResponse": {"functionResponses": [{"id": "a", "response": {"result": 42}}]}})
    );
    assert_eq!(h.session.invocation_status("a"), Some(InvocationStatus::Answered));

    let err = assert_err!(h.session.respond("a", json!({"result": 43})));
    assert!(matches!(err, Error::UnknownInvocation(ref ids) if ids == &["a"]));
    assert_eq!(h.session.invocation_status("a"), Some(InvocationStatus::Answered));
    tokio::task::yield_now().await;
    assert!(h.conn.try_recv().is_none());
}

#[tokio::test]
async fn test_on_tool_call_can_respond_from_handler() {
    let mut h = connect(Configuration::new("m1")).await;
    let responder = h.session.clone();
    h.session.on_tool_call(move |call| {
        for fc in &call.function_calls {
            responder.respond(fc.id.clone(), json!({"ok": fc.name})).unwrap();
        }
    });

    h.conn
        .send(&ServerMessage::ToolCall(ToolCall {
            function_calls: vec![
                FunctionCall {
                    id: "x".into(),
                    name: "f".into(),
                    args: json!({}),
                },
                FunctionCall {
                    id: "y".into(),
                    name: "g".into(),
                    args: json!({"n": 1}),
                },
            ],
        }))
        .unwrap();

    let first = recv_json(&mut h.conn).await;
    let second = recv_json(&mut h.conn).await;
    assert_eq!(first["toolResponse"]["functionResponses"][0]["id"], "x");
    assert_eq!(second["toolResponse"]["functionResponses"][0]["id"], "y");
    assert!(h.session.pending_invocations().is_empty());
}

#[tokio::test]
async fn test_cancelled_invocation_respond_is_noop() {
    let mut h = connect(Configuration::new("m1")).await;
    h.conn.send(&tool_call("a")).unwrap();
    h.conn
        .send(&ServerMessage::ToolCallCancellation(vec!["a".into()]))
        .unwrap();
    let event = wait_for(&mut h.events, |e| {
        matches!(e, Event::ToolCallCancellation(_))
    })
    .await;
    assert_eq!(event, Event::ToolCallCancellation(vec!["a".into()]));

    assert_ok!(h.session.respond("a", json!({"late": true})));
    assert_eq!(h.session.invocation_status("a"), Some(InvocationStatus::Cancelled));
    tokio::task::yield_now().await;
    assert!(h.conn.try_recv().is_none());
}

#[tokio::test]
async fn test_disconnect_cancels_pending_invocation() {
    let mut h = connect(Configuration::new("m1")).await;
    h.conn.send(&tool_call("a")).unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::ToolCall(_))).await;

    h.session.disconnect().await;

    assert_eq!(h.session.status(), SessionStatus::Closed);
    assert_eq!(h.session.invocation_status("a"), Some(InvocationStatus::Cancelled));
    assert_ok!(h.session.respond("a", json!({"result": 42})));

    let close = wait_for(&mut h.events, |e| matches!(e, Event::Close(_))).await;
    let Event::Close(info) = close else {
        unreachable!()
    };
    assert_eq!(info.reason, CloseReason::ClientRequested);
    assert!(info.clean);
    assert_eq!(h.session.last_close(), Some(info));

    // the client closes the transport and sends nothing else
    assert_eq!(
        h.conn.recv().await,
        Some(Frame::Close(Some(transport::CloseFrame::new(CLOSE_NORMAL, ""))))
    );

    // idempotent
    h.session.disconnect().await;
    assert!(matches!(
        h.session.send_text(vec![Part::text("x")], true),
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_realtime_chunks_fifo() {
    let mut h = connect(Configuration::new("m1")).await;

    for i in 0..50u8 {
        assert_ok!(h.session.send_realtime_chunk("audio/pcm;rate=16000", vec![i, i]));
    }
    for i in 0..50u8 {
        match tokio::time::timeout(WAIT, h.conn.recv_message()).await.unwrap() {
            Ok(ClientMessage::RealtimeInput(blob)) => {
                assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
                assert_eq!(blob.data.as_ref(), &[i, i]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_mixed_sends_keep_call_order() {
    let mut h = connect(Configuration::new("m1")).await;
    h.conn.send(&tool_call("a")).unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::ToolCall(_))).await;

    h.session.send_realtime_chunk("audio/pcm;rate=16000", vec![0u8, 0]).unwrap();
    h.session.respond("a", json!(1)).unwrap();
    h.session.send_text(vec![Part::text("after")], false).unwrap();

    let kinds: Vec<&str> = vec![
        h.conn.recv_message().await.unwrap().kind(),
        h.conn.recv_message().await.unwrap().kind(),
        h.conn.recv_message().await.unwrap().kind(),
    ];
    assert_eq!(kinds, ["realtimeInput", "toolResponse", "clientContent"]);
}

#[tokio::test]
async fn test_audio_scheduled_back_to_back() {
    let mut h = connect(Configuration::new("m1").with_modalities(ResponseModality::Audio)).await;
    h.clock.set(Duration::from_millis(7));

    h.conn.send(&audio_message(40)).unwrap();
    h.conn.send(&audio_message(60)).unwrap();
    h.conn
        .send(&ServerMessage::ServerContent(ServerContent {
            turn_complete: true,
            ..Default::default()
        }))
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::TurnComplete)).await;

    let schedule = h.session.playback_schedule();
    assert_eq!(schedule.len(), 2);
    assert_eq!(schedule[0].start, Duration::from_millis(7));
    assert_eq!(schedule[1].start, schedule[0].end);
    assert_eq!(schedule[1].end, schedule[0].start + Duration::from_millis(100));
    assert_eq!(h.session.model_turn(), ModelTurn::Idle);
}

#[tokio::test]
async fn test_audio_event_per_chunk() {
    let mut h = connect(Configuration::new("m1")).await;
    h.conn.send(&audio_message(20)).unwrap();
    h.conn.send(&audio_message(20)).unwrap();

    for _ in 0..2 {
        let event = wait_for(&mut h.events, |e| matches!(e, Event::Audio(_))).await;
        let Event::Audio(chunk) = event else {
            unreachable!()
        };
        assert_eq!(chunk.format(), AudioFormat::output());
        assert_eq!(chunk.duration(), Duration::from_millis(20));
    }
}

#[tokio::test]
async fn test_interruption_drops_scheduled_audio() {
    let mut h = connect(Configuration::new("m1").with_modalities(ResponseModality::Audio)).await;

    for _ in 0..3 {
        h.conn.send(&audio_message(100)).unwrap();
    }
    for _ in 0..3 {
        wait_for(&mut h.events, |e| matches!(e, Event::Audio(_))).await;
    }
    let first_turn = h.session.playback_schedule();
    assert_eq!(first_turn.len(), 3);
    assert_eq!(h.session.model_turn(), ModelTurn::Responding);

    h.clock.advance(Duration::from_millis(50));
    h.conn
        .send(&ServerMessage::ServerContent(ServerContent {
            interrupted: true,
            ..Default::default()
        }))
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::Interrupted)).await;
    assert!(h.session.playback_schedule().is_empty());
    assert_eq!(h.session.model_turn(), ModelTurn::Interrupted);

    h.conn.send(&audio_message(100)).unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::Audio(_))).await;
    let second_turn = h.session.playback_schedule();
    assert_eq!(second_turn.len(), 1);
    assert_eq!(second_turn[0].start, Duration::from_millis(50));
    assert!(second_turn[0].turn > first_turn[0].turn);

    // audible windows: the first turn is cut at the interruption
    let mut audible: Vec<ScheduledChunk> = first_turn
        .iter()
        .filter(|w| w.start < Duration::from_millis(50))
        .map(|w| ScheduledChunk {
            end: w.end.min(Duration::from_millis(50)),
            ..*w
        })
        .collect();
    audible.extend(second_turn);
    assert_no_overlap(&audible);
}

#[tokio::test]
async fn test_malformed_frame_is_not_fatal() {
    let mut h = connect(Configuration::new("m1")).await;

    h.conn.send_frame(Frame::Text("{\"bogus\":{}}".into())).unwrap();
    h.conn.send_frame(Frame::Text("not json".into())).unwrap();
    let log = wait_for(&mut h.events, |e| matches!(e, Event::Log(r) if r.source == "codec")).await;
    let Event::Log(record) = log else {
        unreachable!()
    };
    assert_eq!(record.level, LogLevel::Warn);

    h.conn
        .send(&ServerMessage::ServerContent(ServerContent {
            parts: vec![Part::text("still here")],
            ..Default::default()
        }))
        .unwrap();
    let content = wait_for(&mut h.events, |e| matches!(e, Event::Content(_))).await;
    assert!(matches!(content, Event::Content(ref c) if c.text() == "still here"));
    assert_eq!(h.session.status(), SessionStatus::Active);
}

#[tokio::test]
async fn test_server_close_then_reconnect() {
    let mut h = connect(Configuration::new("m1")).await;
    h.conn.close(1011, "overloaded").unwrap();

    let close = wait_for(&mut h.events, |e| matches!(e, Event::Close(_))).await;
    let Event::Close(info) = close else {
        unreachable!()
    };
    assert_eq!(info.reason, CloseReason::ServerClosed);
    assert_eq!(info.code, Some(1011));
    assert!(!info.clean);
    assert_eq!(h.session.status(), SessionStatus::Closed);
    assert!(matches!(
        h.session.send_text(vec![Part::text("x")], true),
        Err(Error::NotConnected)
    ));

    let connecting = {
        let session = h.session.clone();
        tokio::spawn(async move { session.connect(Configuration::new("m1")).await })
    };
    let mut conn = h.server.accept().await.unwrap();
    assert!(matches!(conn.recv_message().await, Ok(ClientMessage::Setup(_))));
    conn.send(&ServerMessage::SetupComplete).unwrap();
    assert_ok!(connecting.await.unwrap());
    assert_ok!(h.session.send_text(vec![Part::text("again")], true));
    assert!(matches!(
        conn.recv_message().await,
        Ok(ClientMessage::ClientContent { .. })
    ));
}

#[tokio::test]
async fn test_dropped_transport_closes_with_error() {
    let mut h = connect(Configuration::new("m1")).await;
    drop(h.conn);

    let close = wait_for(&mut h.events, |e| matches!(e, Event::Close(_))).await;
    let Event::Close(info) = close else {
        unreachable!()
    };
    assert_eq!(info.reason, CloseReason::TransportError);
    assert!(!info.clean);
}

#[tokio::test]
async fn test_handshake_rejected() {
    let (dialer, server) = new_pipe();
    server.reject_with("HTTP 401");
    let session = client(dialer, Arc::new(ManualClock::new())).session();
    let mut events = session.events_on(&[Channel::Open, Channel::Close]);

    let err = session.connect(Configuration::new("m1")).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(
        events.try_recv().map(|e| e.channel()),
        Some(Channel::Close)
    );
    assert_eq!(session.status(), SessionStatus::Closed);
}

#[tokio::test]
async fn test_disconnect_cancels_connect() {
    let (dialer, mut server) = new_pipe();
    let session = client(dialer, Arc::new(ManualClock::new())).session();

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(Configuration::new("m1")).await })
    };
    let mut conn = server.accept().await.unwrap();
    assert!(matches!(conn.recv_message().await, Ok(ClientMessage::Setup(_))));

    session.disconnect().await;
    let result = tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::SessionClosed)));
    assert_eq!(session.status(), SessionStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_setup_timeout() {
    let (dialer, mut server) = new_pipe();
    let session = Client::builder("test-key")
        .dialer(dialer)
        .setup_timeout(Duration::from_millis(200))
        .build()
        .unwrap()
        .session();

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(Configuration::new("m1")).await })
    };
    let _conn = server.accept().await.unwrap();

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(
        session.last_close().map(|c| c.reason),
        Some(CloseReason::SetupTimeout)
    );
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let mut h = connect(Configuration::new("m1")).await;
    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let c = count.clone();
    let id = h.session.subscribe(Channel::TurnComplete, move |_| {
        c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let done = ServerMessage::ServerContent(ServerContent {
        turn_complete: true,
        ..Default::default()
    });
    h.conn.send(&done).unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::TurnComplete)).await;

    assert!(h.session.unsubscribe(id));
    h.conn.send(&done).unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::TurnComplete)).await;
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_capture_streams_fixed_chunks() {
    let mut h = connect(Configuration::new("m1")).await;
    let (tx, source) = ChannelSource::new(16);
    let mut capture = AudioCapture::start(&h.session, source, CaptureOptions::default()).unwrap();

    for _ in 0..4 {
        let frame = AudioChunk::new(AudioFormat::input(), vec![0u8; 2000]).unwrap();
        tx.send(frame).await.unwrap();
    }
    drop(tx);

    // 8000 bytes: six 40ms chunks and a 320 byte tail
    let mut sizes = Vec::new();
    for _ in 0..7 {
        match tokio::time::timeout(WAIT, h.conn.recv_message()).await.unwrap() {
            Ok(ClientMessage::RealtimeInput(blob)) => {
                assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
                sizes.push(blob.data.len());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    assert_eq!(sizes, [1280, 1280, 1280, 1280, 1280, 1280, 320]);

    capture.stop().await;
    let stats = capture.stats();
    assert_eq!(stats.sent, 7);
    assert_eq!(stats.dropped, 0);
    assert!(!capture.is_running());
}

#[tokio::test]
async fn test_capture_drops_while_disconnected() {
    let (dialer, _server) = new_pipe();
    let session = client(dialer, Arc::new(ManualClock::new())).session();
    let (tx, source) = ChannelSource::new(16);
    let capture = AudioCapture::start(&session, source, CaptureOptions::default()).unwrap();

    let frame = AudioChunk::new(AudioFormat::input(), vec![0u8; 1280 * 3]).unwrap();
    tx.send(frame).await.unwrap();
    drop(tx);

    tokio::time::timeout(WAIT, async {
        while capture.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let stats = capture.stats();
    assert_eq!(stats.captured, 3);
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.dropped, 3);
}

#[tokio::test(start_paused = true)]
async fn test_capture_pause_keeps_every_chunk() {
    let mut h = connect_with(Configuration::new("m1"), |b| {
        b.outbound_delay(Duration::from_millis(300))
    })
    .await;
    let (tx, source) = ChannelSource::new(4);
    let options = CaptureOptions::default()
        .with_policy(BackpressurePolicy::Pause)
        .with_queue_capacity(2)
        .with_max_in_flight(1);
    let mut capture = AudioCapture::start(&h.session, source, options).unwrap();

    tx.send(tagged_frame(5)).await.unwrap();
    drop(tx);

    assert_eq!(recv_chunk_tags(&mut h.conn, 5).await, [0, 1, 2, 3, 4]);
    capture.stop().await;
    assert_eq!(
        capture.stats(),
        CaptureCounters {
            captured: 5,
            sent: 5,
            dropped: 0,
            errors: 0,
        }
    );
    assert!(h.conn.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_capture_drop_oldest_under_slow_transport() {
    let mut h = connect_with(Configuration::new("m1"), |b| {
        b.outbound_delay(Duration::from_millis(300))
    })
    .await;
    let (tx, source) = ChannelSource::new(4);
    let options = CaptureOptions::default()
        .with_policy(BackpressurePolicy::DropOldest)
        .with_queue_capacity(2)
        .with_max_in_flight(1);
    let mut capture = AudioCapture::start(&h.session, source, options).unwrap();

    tx.send(tagged_frame(5)).await.unwrap();
    drop(tx);

    // the queue keeps the newest two chunks
    assert_eq!(recv_chunk_tags(&mut h.conn, 2).await, [3, 4]);
    capture.stop().await;
    assert_eq!(
        capture.stats(),
        CaptureCounters {
            captured: 5,
            sent: 2,
            dropped: 3,
            errors: 0,
        }
    );
    assert!(h.conn.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_capture_limits_frames_in_flight() {
    let mut h = connect_with(Configuration::new("m1"), |b| {
        b.outbound_delay(Duration::from_millis(300))
    })
    .await;
    let (tx, source) = ChannelSource::new(4);
    let options = CaptureOptions::default().with_max_in_flight(2);
    let mut capture = AudioCapture::start(&h.session, source, options).unwrap();

    tx.send(tagged_frame(6)).await.unwrap();
    drop(tx);

    // time stands still while this task keeps yielding
    for _ in 0..1000 {
        if capture.stats().captured == 6 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(capture.stats().captured, 6);
    assert_eq!(capture.stats().sent, 2);
    assert_eq!(h.session.outbound_backlog(), 2);

    let mut tags = Vec::new();
    for _ in 0..6 {
        tags.extend(recv_chunk_tags(&mut h.conn, 1).await);
        assert!(h.session.outbound_backlog() <= 2);
    }
    assert_eq!(tags, [0, 1, 2, 3, 4, 5]);

    capture.stop().await;
    assert_eq!(capture.stats().sent, 6);
    assert_eq!(capture.stats().dropped, 0);
}

struct DisconnectOnDial {
    pipe: pipe::PipeDialer,
    session: Arc<OnceLock<Session>>,
}

#[async_trait::async_trait]
impl Dialer for DisconnectOnDial {
    async fn dial(
        &self,
        endpoint: &transport::Endpoint,
    ) -> giztoy_gemini_live::Result<(Box<dyn transport::FrameSink>, Box<dyn transport::FrameSource>)>
    {
        let pair = self.pipe.dial(endpoint).await?;
        if let Some(session) = self.session.get() {
            session.disconnect().await;
        }
        Ok(pair)
    }
}

#[tokio::test]
async fn test_disconnect_during_dial_never_opens() {
    let (pipe, mut server) = new_pipe();
    let slot = Arc::new(OnceLock::new());
    let session = Client::builder("test-key")
        .dialer(DisconnectOnDial {
            pipe,
            session: slot.clone(),
        })
        .build()
        .unwrap()
        .session();
    slot.set(session.clone()).unwrap();
    let mut events = session.events_on(&[Channel::Open, Channel::Close]);

    let err = session.connect(Configuration::new("m1")).await.unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
    assert_eq!(events.try_recv().map(|e| e.channel()), Some(Channel::Close));
    assert!(events.try_recv().is_none());
    assert_eq!(session.status(), SessionStatus::Closed);

    // the dead link writes nothing but its close
    let mut conn = server.accept().await.unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, conn.recv()).await.unwrap(),
        Some(Frame::Close(Some(transport::CloseFrame::new(CLOSE_NORMAL, ""))))
    );
}

#[tokio::test]
async fn test_video_frames_stream_as_images() {
    let mut h = connect(Configuration::new("m1")).await;

    assert_ok!(h.session.send_video_frame(vec![0xFF, 0xD8, 0xFF]));
    assert_ok!(h.session.send_image(MIME_IMAGE_PNG, vec![0x89, b'P']));
    let err = assert_err!(h.session.send_image("image/gif", vec![1u8]));
    assert!(matches!(err, Error::InvalidConfig(_)));

    for (mime, data) in [(MIME_IMAGE_JPEG, vec![0xFF, 0xD8, 0xFF]), (MIME_IMAGE_PNG, vec![0x89, b'P'])] {
        match h.conn.recv_message().await {
            Ok(ClientMessage::RealtimeInput(blob)) => {
                assert_eq!(blob.mime_type, mime);
                assert_eq!(blob.data.as_ref(), data.as_slice());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
    tokio::task::yield_now().await;
    assert!(h.conn.try_recv().is_none());
}

struct StatusSink {
    session: Session,
    seen: Arc<Mutex<Vec<SessionStatus>>>,
}

impl AudioSink for StatusSink {
    fn schedule(&mut self, _at: Duration, _chunk: &AudioChunk) -> giztoy_gemini_live::Result<()> {
        self.seen.lock().unwrap().push(self.session.status());
        Ok(())
    }

    fn cancel(&mut self, _now: Duration) {}
}

#[tokio::test]
async fn test_audio_sink_may_query_its_session() {
    let mut h = connect(Configuration::new("m1")).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    h.session.set_audio_sink(Box::new(StatusSink {
        session: h.session.clone(),
        seen: seen.clone(),
    }));

    h.conn.send(&audio_message(20)).unwrap();
    h.conn
        .send(&ServerMessage::ServerContent(ServerContent {
            turn_complete: true,
            ..Default::default()
        }))
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, Event::TurnComplete)).await;
    assert_eq!(*seen.lock().unwrap(), [SessionStatus::Active]);
}

#[tokio::test]
async fn test_usage_attached_to_content_is_logged() {
    let mut h = connect(Configuration::new("m1")).await;
    let frame = json!({
        "serverContent": { "modelTurn": { "parts": [{ "text": "hi" }] } },
        "usageMetadata": { "totalTokenCount": 7 },
    });
    h.conn.send_frame(Frame::Text(frame.to_string())).unwrap();

    let content = wait_for(&mut h.events, |e| matches!(e, Event::Content(_))).await;
    assert!(matches!(content, Event::Content(ref c) if c.text() == "hi"));
    let log = wait_for(&mut h.events, |e| {
        matches!(e, Event::Log(r) if r.source == "server.usageMetadata")
    })
    .await;
    let Event::Log(record) = log else {
        unreachable!()
    };
    assert_eq!(record.level, LogLevel::Debug);
    assert!(record.message.contains("totalTokenCount"));
}

#[tokio::test]
async fn test_go_away_is_delivered() {
    let mut h = connect(Configuration::new("m1")).await;
    let mut go_away = h.session.events_on(&[Channel::GoAway]);

    h.conn
        .send(&ServerMessage::GoAway {
            time_left: Some("5s".into()),
        })
        .unwrap();
    let event = tokio::time::timeout(WAIT, go_away.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(Event::GoAway {
            time_left: Some("5s".into())
        })
    );
    let warning = wait_for(&mut h.events, |e| {
        matches!(e, Event::Log(r) if r.source == "server.goAway")
    })
    .await;
    assert!(matches!(warning, Event::Log(ref r) if r.level == LogLevel::Warn));
    assert_eq!(h.session.status(), SessionStatus::Active);
}

#[tokio::test]
async fn test_binary_json_frames_are_decoded() {
    let mut h = connect(Configuration::new("m1")).await;
    let frame = json!({"serverContent": {"modelTurn": {"parts": [{"text": "bin"}]}, "turnComplete": true}});
    h.conn
        .send_frame(Frame::Binary(frame.to_string().into_bytes().into()))
        .unwrap();

    let content = wait_for(&mut h.events, |e| matches!(e, Event::Content(_))).await;
    assert!(matches!(content, Event::Content(ref c) if c.text() == "bin"));
    wait_for(&mut h.events, |e| matches!(e, Event::TurnComplete)).await;
}

#[tokio::test(start_paused = true)]
async fn test_outbound_delay_keeps_call_order() {
    let mut h = connect_with(Configuration::new("m1"), |b| {
        b.outbound_delay(Duration::from_millis(50))
    })
    .await;
    let start = tokio::time::Instant::now();

    assert_ok!(h.session.send_text(vec![Part::text("one")], false));
    assert_ok!(h.session.send_realtime_chunk("audio/pcm;rate=16000", vec![0u8, 0]));
    assert_ok!(h.session.send_text(vec![Part::text("two")], true));
    assert_eq!(h.session.outbound_backlog(), 3);

    let first = h.conn.recv_message().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    let second = h.conn.recv_message().await.unwrap();
    let third = h.conn.recv_message().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(150));

    assert!(matches!(first, ClientMessage::ClientContent { ref parts, .. } if parts[0] == Part::text("one")));
    assert!(matches!(second, ClientMessage::RealtimeInput(_)));
    assert!(matches!(third, ClientMessage::ClientContent { turn_complete: true, .. }));
}

#[tokio::test]
#[ignore]
async fn test_live_text_turn() {
    let client = Client::from_env().expect("GEMINI_API_KEY required");
    let session = client.session();
    let mut events = session.events_on(&[Channel::Content, Channel::TurnComplete]);

    session
        .connect(Configuration::new(MODEL_GEMINI_2_0_FLASH_EXP))
        .await
        .expect("connect");
    session
        .send_text(vec![Part::text("Say hello in one word.")], true)
        .expect("send");

    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = events.recv().await {
            match event {
                Event::Content(c) => text.push_str(&c.text()),
                Event::TurnComplete => break,
                _ => {}
            }
        }
    })
    .await
    .expect("timeout waiting for turn");
    assert!(!text.is_empty());

    session.disconnect().await;
}

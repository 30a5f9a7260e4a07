//! End-to-end tests driving the connection service over an in-memory
//! endpoint: one side is the service under test, the peer is the test body
//! feeding encoded packets through `process`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use sshmux_conn::{
    ChannelKind, CloseMode, ConnectionService, GlobalRequestHandler, RequestOutcome,
};
use sshmux_core::constants::{
    SSH_EXTENDED_DATA_STDERR, SSH_MSG_CHANNEL_CLOSE, SSH_MSG_CHANNEL_DATA, SSH_MSG_CHANNEL_EOF,
    SSH_MSG_CHANNEL_OPEN, SSH_MSG_CHANNEL_OPEN_CONFIRMATION, SSH_MSG_CHANNEL_OPEN_FAILURE,
    SSH_MSG_CHANNEL_WINDOW_ADJUST, SSH_MSG_REQUEST_FAILURE, SSH_MSG_REQUEST_SUCCESS,
    SSH_OPEN_ADMINISTRATIVELY_PROHIBITED, SSH_OPEN_CONNECT_FAILED, SSH_OPEN_RESOURCE_SHORTAGE,
    SSH_OPEN_UNKNOWN_CHANNEL_TYPE,
};
use sshmux_core::wire::{
    ChannelData, ChannelExtendedData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelWindowAdjust, GlobalRequest, WireReader, recipient_packet,
};
use sshmux_core::{ConnectionConfig, Error};
use sshmux_test_utils::{AcceptFactory, CollectSink, MockEndpoint, RefuseFactory, feed};

const WIN: u32 = 0x200000;
const PKT: u32 = 0x8000;

fn open_packet(channel_type: &str, sender: u32) -> Bytes {
    ChannelOpen {
        channel_type: channel_type.into(),
        sender,
        initial_window: WIN,
        max_packet: PKT,
        type_data: Bytes::new(),
    }
    .encode()
}

fn data_packet(recipient: u32, data: &[u8]) -> Bytes {
    ChannelData {
        recipient,
        data: Bytes::copy_from_slice(data),
    }
    .encode()
}

fn extended_data_packet(recipient: u32, data_type: u32, data: &[u8]) -> Bytes {
    ChannelExtendedData {
        recipient,
        data_type,
        data: Bytes::copy_from_slice(data),
    }
    .encode()
}

/// Handler answering exactly one request name with a fixed outcome.
struct StaticHandler {
    name: &'static str,
    outcome: RequestOutcome,
    hits: AtomicUsize,
}

impl StaticHandler {
    fn new(name: &'static str, outcome: RequestOutcome) -> Arc<Self> {
        Arc::new(Self {
            name,
            outcome,
            hits: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl GlobalRequestHandler for StaticHandler {
    async fn process(
        &self,
        _service: &Arc<ConnectionService>,
        name: &str,
        _want_reply: bool,
        _payload: &mut WireReader,
    ) -> sshmux_core::Result<RequestOutcome> {
        if name != self.name {
            return Ok(RequestOutcome::Unsupported);
        }
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome)
    }
}

// =============================================================================
// Scenario 1: open-and-echo session with window replenishment
// =============================================================================

#[tokio::test]
async fn open_and_echo_session() {
    let endpoint = MockEndpoint::new();
    let factory = AcceptFactory::new("session");
    let service = ConnectionService::builder()
        .channel_factory(factory.clone())
        .build(endpoint.clone());

    feed(&service, open_packet("session", 0)).await.unwrap();
    endpoint.wait_for_packets(1).await;

    let (cmd, payload) = endpoint.take_packets().remove(0);
    assert_eq!(cmd, SSH_MSG_CHANNEL_OPEN_CONFIRMATION);
    let conf = ChannelOpenConfirmation::decode(&mut WireReader::new(payload)).unwrap();
    assert_eq!(conf.recipient, 0);
    assert_eq!(conf.sender, 0);
    assert_eq!(conf.window, WIN);
    assert_eq!(conf.max_packet, PKT);

    // Five bytes: delivered, no WINDOW_ADJUST yet.
    feed(&service, data_packet(0, b"hello")).await.unwrap();
    let sink = factory.last_sink().unwrap();
    sink.wait_data_len(5).await;
    assert_eq!(sink.data(), b"hello");
    assert!(endpoint.sent_packets().is_empty());

    // Push the cumulative total past the low-water mark (half the window).
    let chunk = vec![0x5Au8; PKT as usize];
    for _ in 0..32 {
        feed(&service, data_packet(0, &chunk)).await.unwrap();
    }
    endpoint.wait_for_packets(1).await;

    let mut adjusted = 0u64;
    for (cmd, payload) in endpoint.take_packets() {
        assert_eq!(cmd, SSH_MSG_CHANNEL_WINDOW_ADJUST);
        let adj = ChannelWindowAdjust::decode(&mut WireReader::new(payload)).unwrap();
        assert_eq!(adj.recipient, 0);
        adjusted += u64::from(adj.bytes_to_add);
    }
    assert!(adjusted >= 0x100001, "adjusted only {adjusted:#x}");
    sink.wait_data_len(5 + 32 * PKT as usize).await;
}

// =============================================================================
// Scenario 2: unknown channel type
// =============================================================================

#[tokio::test]
async fn unknown_channel_type_is_refused() {
    let endpoint = MockEndpoint::new();
    let service = ConnectionService::builder().build(endpoint.clone());

    feed(&service, open_packet("bogus", 7)).await.unwrap();
    endpoint.wait_for_packets(1).await;

    let (cmd, payload) = endpoint.take_packets().remove(0);
    assert_eq!(cmd, SSH_MSG_CHANNEL_OPEN_FAILURE);
    let fail = ChannelOpenFailure::decode(&mut WireReader::new(payload)).unwrap();
    assert_eq!(fail.recipient, 7);
    assert_eq!(fail.reason_code, SSH_OPEN_UNKNOWN_CHANNEL_TYPE);
    assert_eq!(fail.message, "Unsupported channel type: bogus");
    assert_eq!(fail.language, "");

    assert_eq!(service.channel_count().await, 0);
}

#[tokio::test]
async fn factory_refusal_reports_its_own_reason() {
    let endpoint = MockEndpoint::new();
    let factory = RefuseFactory::new(
        "session",
        SSH_OPEN_ADMINISTRATIVELY_PROHIBITED,
        "sessions are disabled on this host",
    );
    let service = ConnectionService::builder()
        .channel_factory(factory)
        .build(endpoint.clone());

    // The factory is found, registers the channel, then rejects the open.
    feed(&service, open_packet("session", 4)).await.unwrap();
    endpoint.wait_for_packets(1).await;

    let (cmd, payload) = endpoint.take_packets().remove(0);
    assert_eq!(cmd, SSH_MSG_CHANNEL_OPEN_FAILURE);
    let fail = ChannelOpenFailure::decode(&mut WireReader::new(payload)).unwrap();
    assert_eq!(fail.recipient, 4);
    assert_eq!(fail.reason_code, SSH_OPEN_ADMINISTRATIVELY_PROHIBITED);
    assert_eq!(fail.message, "sessions are disabled on this host");

    // The half-registered channel is gone again; the session is untouched.
    assert_eq!(service.channel_count().await, 0);
    assert!(!service.is_closing());
}

// =============================================================================
// Extended data (stderr)
// =============================================================================

#[tokio::test]
async fn stderr_extended_data_is_delivered_and_window_accounted() {
    let endpoint = MockEndpoint::new();
    let factory = AcceptFactory::new("session");
    let service = ConnectionService::builder()
        .channel_factory(factory.clone())
        .build(endpoint.clone());

    feed(&service, open_packet("session", 0)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    endpoint.take_packets();

    feed(
        &service,
        extended_data_packet(0, SSH_EXTENDED_DATA_STDERR, b"oops"),
    )
    .await
    .unwrap();
    let sink = factory.last_sink().unwrap();
    assert_eq!(sink.stderr(), b"oops");
    assert!(sink.data().is_empty());
    assert!(endpoint.sent_packets().is_empty());

    // Stderr bytes consume the same local window as regular data and
    // trigger the same replenishment past the low-water mark.
    let chunk = vec![0x5Au8; PKT as usize];
    for _ in 0..32 {
        feed(
            &service,
            extended_data_packet(0, SSH_EXTENDED_DATA_STDERR, &chunk),
        )
        .await
        .unwrap();
    }
    endpoint.wait_for_packets(1).await;

    let mut adjusted = 0u64;
    for (cmd, payload) in endpoint.take_packets() {
        assert_eq!(cmd, SSH_MSG_CHANNEL_WINDOW_ADJUST);
        let adj = ChannelWindowAdjust::decode(&mut WireReader::new(payload)).unwrap();
        assert_eq!(adj.recipient, 0);
        adjusted += u64::from(adj.bytes_to_add);
    }
    assert!(adjusted >= 0x100001, "adjusted only {adjusted:#x}");
    assert_eq!(sink.stderr().len(), 4 + 32 * PKT as usize);
}

#[tokio::test]
async fn non_stderr_extended_data_closes_channel_but_not_session() {
    let endpoint = MockEndpoint::new();
    let factory = AcceptFactory::new("session");
    let service = ConnectionService::builder()
        .channel_factory(factory.clone())
        .build(endpoint.clone());

    // Two channels; confirmations awaited one at a time so the factory's
    // sink order matches channel ids.
    feed(&service, open_packet("session", 0)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    endpoint.take_packets();
    feed(&service, open_packet("session", 5)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    endpoint.take_packets();

    // A type code other than stderr closes the offending channel only.
    feed(&service, extended_data_packet(0, 2, b"bogus"))
        .await
        .unwrap();
    endpoint.wait_for_packets(1).await;
    let (cmd, payload) = endpoint.take_packets().remove(0);
    assert_eq!(cmd, SSH_MSG_CHANNEL_CLOSE);
    assert_eq!(WireReader::new(payload).get_u32().unwrap(), 0);

    let sinks = factory.sinks();
    assert!(sinks[0].stderr().is_empty());

    // The session survives: the other channel still carries data.
    assert!(!service.is_closing());
    feed(&service, data_packet(1, b"still alive")).await.unwrap();
    assert_eq!(sinks[1].data(), b"still alive");

    // The closing channel stays registered until the peer's CLOSE lands.
    assert!(service.channel(0).await.is_some());
    feed(&service, recipient_packet(SSH_MSG_CHANNEL_CLOSE, 0))
        .await
        .unwrap();
    assert!(service.channel(0).await.is_none());
    assert_eq!(service.channel_count().await, 1);
}

// =============================================================================
// Scenario 3: graceful close with in-flight writes
// =============================================================================

#[tokio::test]
async fn graceful_close_flushes_writes_before_eof_and_close() {
    let endpoint = MockEndpoint::new();
    let service = ConnectionService::builder().build(endpoint.clone());

    let sink = CollectSink::new();
    let (channel, open) = service
        .open_channel(ChannelKind::Session, Bytes::new(), sink)
        .await
        .unwrap();
    assert_eq!(channel.local_id(), 0);

    endpoint.wait_for_packets(1).await;
    assert_eq!(endpoint.sent_packets()[0].0, SSH_MSG_CHANNEL_OPEN);

    feed(
        &service,
        ChannelOpenConfirmation {
            recipient: 0,
            sender: 9,
            window: WIN,
            max_packet: PKT,
            type_data: Bytes::new(),
        }
        .encode(),
    )
    .await
    .unwrap();
    let params = open.wait().await.unwrap();
    assert_eq!(params.remote_id, 9);

    channel.send_data(Bytes::from_static(b"A")).await.unwrap();
    channel.send_data(Bytes::from_static(b"B")).await.unwrap();
    channel.send_data(Bytes::from_static(b"C")).await.unwrap();
    let closing = channel.close_graceful();

    endpoint.wait_for_packets(6).await;
    let packets = endpoint.take_packets();
    let cmds: Vec<u8> = packets.iter().map(|(cmd, _)| *cmd).collect();
    assert_eq!(
        cmds,
        vec![
            SSH_MSG_CHANNEL_OPEN,
            SSH_MSG_CHANNEL_DATA,
            SSH_MSG_CHANNEL_DATA,
            SSH_MSG_CHANNEL_DATA,
            SSH_MSG_CHANNEL_EOF,
            SSH_MSG_CHANNEL_CLOSE,
        ]
    );
    // A, B, C in order, none after EOF.
    let bodies: Vec<Bytes> = packets[1..4]
        .iter()
        .map(|(_, payload)| {
            ChannelData::decode(&mut WireReader::new(payload.clone()))
                .unwrap()
                .data
        })
        .collect();
    assert_eq!(bodies, vec![
        Bytes::from_static(b"A"),
        Bytes::from_static(b"B"),
        Bytes::from_static(b"C"),
    ]);

    // Peer confirms: channel leaves the registry and the future resolves.
    assert!(!closing.is_closed());
    feed(&service, recipient_packet(SSH_MSG_CHANNEL_CLOSE, 0))
        .await
        .unwrap();
    closing.wait_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(service.channel_count().await, 0);
}

// =============================================================================
// Scenario 4: too many channels
// =============================================================================

#[tokio::test]
async fn too_many_channels_reports_resource_shortage() {
    let endpoint = MockEndpoint::new();
    let factory = AcceptFactory::new("session");
    let config = ConnectionConfig {
        max_channels: 2,
        ..ConnectionConfig::default()
    };
    let service = ConnectionService::builder()
        .config(config)
        .channel_factory(factory)
        .build(endpoint.clone());

    feed(&service, open_packet("session", 0)).await.unwrap();
    feed(&service, open_packet("session", 1)).await.unwrap();
    feed(&service, open_packet("session", 2)).await.unwrap();
    endpoint.wait_for_packets(3).await;

    let packets = endpoint.take_packets();
    let confirmations = packets
        .iter()
        .filter(|(cmd, _)| *cmd == SSH_MSG_CHANNEL_OPEN_CONFIRMATION)
        .count();
    assert_eq!(confirmations, 2);

    let (_, payload) = packets
        .iter()
        .find(|(cmd, _)| *cmd == SSH_MSG_CHANNEL_OPEN_FAILURE)
        .expect("third open must be refused")
        .clone();
    let fail = ChannelOpenFailure::decode(&mut WireReader::new(payload)).unwrap();
    assert_eq!(fail.recipient, 2);
    assert_eq!(fail.reason_code, SSH_OPEN_RESOURCE_SHORTAGE);

    // The two accepted channels got ids 0 and 1.
    assert!(service.channel(0).await.is_some());
    assert!(service.channel(1).await.is_some());
    assert_eq!(service.channel_count().await, 2);
}

// =============================================================================
// Scenario 5: global request routing
// =============================================================================

fn global_request_packet(name: &str, want_reply: bool) -> Bytes {
    GlobalRequest {
        name: name.into(),
        want_reply,
        payload: Bytes::new(),
    }
    .encode()
}

#[tokio::test]
async fn global_request_chain_first_acceptor_wins() {
    let endpoint = MockEndpoint::new();
    let a = StaticHandler::new("tcpip-forward", RequestOutcome::Unsupported);
    let b = StaticHandler::new("tcpip-forward", RequestOutcome::ReplySuccess);
    let service = ConnectionService::builder()
        .global_handler(a.clone())
        .global_handler(b.clone())
        .build(endpoint.clone());

    feed(&service, global_request_packet("tcpip-forward", true))
        .await
        .unwrap();
    endpoint.wait_for_packets(1).await;
    let packets = endpoint.take_packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].0, SSH_MSG_REQUEST_SUCCESS);
    assert_eq!(b.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn global_request_without_want_reply_sends_nothing() {
    let endpoint = MockEndpoint::new();
    let b = StaticHandler::new("tcpip-forward", RequestOutcome::ReplySuccess);
    let service = ConnectionService::builder()
        .global_handler(b)
        .build(endpoint.clone());

    feed(&service, global_request_packet("tcpip-forward", false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(endpoint.sent_packets().is_empty());
}

#[tokio::test]
async fn unhandled_global_request_fails_iff_want_reply() {
    let endpoint = MockEndpoint::new();
    let a = StaticHandler::new("tcpip-forward", RequestOutcome::Unsupported);
    let service = ConnectionService::builder()
        .global_handler(a)
        .build(endpoint.clone());

    feed(&service, global_request_packet("tcpip-forward", false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(endpoint.sent_packets().is_empty());

    feed(&service, global_request_packet("tcpip-forward", true))
        .await
        .unwrap();
    endpoint.wait_for_packets(1).await;
    assert_eq!(endpoint.take_packets()[0].0, SSH_MSG_REQUEST_FAILURE);
}

// =============================================================================
// Scenario 6: protocol violation tears the session down
// =============================================================================

#[tokio::test]
async fn unknown_channel_recipient_is_session_fatal() {
    let endpoint = MockEndpoint::new();
    let service = ConnectionService::builder().build(endpoint.clone());

    // A healthy channel with a pending open.
    let (_channel, open) = service
        .open_channel(ChannelKind::Session, Bytes::new(), CollectSink::new())
        .await
        .unwrap();

    let err = feed(&service, data_packet(42, b"stray")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownChannel {
            recipient: 42,
            cmd: SSH_MSG_CHANNEL_DATA
        }
    ));

    // Pending futures fail with ClosedChannel, the transport is closed.
    assert!(matches!(open.wait().await, Err(Error::ClosedChannel)));
    assert!(service.is_closing());
    assert!(endpoint.is_closed());
    assert_eq!(service.channel_count().await, 0);
}

#[tokio::test]
async fn unsupported_message_is_session_fatal() {
    let endpoint = MockEndpoint::new();
    let service = ConnectionService::builder().build(endpoint.clone());

    let err = service.process(50, Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedMessage { cmd: 50 }));
    assert!(endpoint.is_closed());
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn channel_ids_are_monotonic_across_directions() {
    let endpoint = MockEndpoint::new();
    let factory = AcceptFactory::new("session");
    let service = ConnectionService::builder()
        .channel_factory(factory)
        .build(endpoint.clone());

    feed(&service, open_packet("session", 10)).await.unwrap();
    let (a, _) = service
        .open_channel(ChannelKind::Session, Bytes::new(), CollectSink::new())
        .await
        .unwrap();
    feed(&service, open_packet("session", 11)).await.unwrap();
    let (b, _) = service
        .open_channel(ChannelKind::Session, Bytes::new(), CollectSink::new())
        .await
        .unwrap();

    assert_eq!(a.local_id(), 1);
    assert_eq!(b.local_id(), 3);
    assert_eq!(service.channel_count().await, 4);

    // Closing a channel never recycles its id.
    feed(&service, recipient_packet(SSH_MSG_CHANNEL_CLOSE, 0))
        .await
        .unwrap();
    let (c, _) = service
        .open_channel(ChannelKind::Session, Bytes::new(), CollectSink::new())
        .await
        .unwrap();
    assert_eq!(c.local_id(), 4);
}

#[tokio::test]
async fn global_replies_resolve_fifo() {
    let endpoint = MockEndpoint::new();
    let service = ConnectionService::builder().build(endpoint.clone());

    let first = service
        .send_global_request("tcpip-forward", true, Bytes::new())
        .unwrap();
    let second = service
        .send_global_request("tcpip-forward", true, Bytes::new())
        .unwrap();
    assert!(service
        .send_global_request("no-reply", false, Bytes::new())
        .is_none());

    feed(
        &service,
        Bytes::from_static(&[SSH_MSG_REQUEST_SUCCESS, 0, 0, 0x1F, 0x90]),
    )
    .await
    .unwrap();
    feed(&service, Bytes::from_static(&[SSH_MSG_REQUEST_FAILURE]))
        .await
        .unwrap();

    let reply = first.wait().await.unwrap();
    assert!(reply.success);
    assert_eq!(&reply.payload[..], &[0, 0, 0x1F, 0x90]);
    assert!(!second.wait().await.unwrap().success);
}

#[tokio::test]
async fn close_is_idempotent() {
    let endpoint = MockEndpoint::new();
    let service = ConnectionService::builder().build(endpoint.clone());

    let first = service.close(CloseMode::Graceful);
    let second = service.close(CloseMode::Immediate);
    first.wait_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(second.is_closed());
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn closing_service_refuses_registration_and_opens() {
    let endpoint = MockEndpoint::new();
    let factory = AcceptFactory::new("session");
    let service = ConnectionService::builder()
        .channel_factory(factory)
        .build(endpoint.clone());

    // One live channel keeps the graceful close draining while we probe.
    feed(&service, open_packet("session", 0)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    endpoint.take_packets();

    let closing = service.close(CloseMode::Graceful);
    // The draining channel's EOF + CLOSE go out first.
    endpoint.wait_for_packets(2).await;
    endpoint.take_packets();

    let err = service
        .open_channel(ChannelKind::Session, Bytes::new(), CollectSink::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceClosing));

    feed(&service, open_packet("session", 3)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    let (cmd, payload) = endpoint.take_packets().remove(0);
    assert_eq!(cmd, SSH_MSG_CHANNEL_OPEN_FAILURE);
    let fail = ChannelOpenFailure::decode(&mut WireReader::new(payload)).unwrap();
    assert_eq!(fail.reason_code, SSH_OPEN_CONNECT_FAILED);

    // Complete the peer's half of the close handshake; shutdown finishes.
    feed(&service, recipient_packet(SSH_MSG_CHANNEL_CLOSE, 0))
        .await
        .unwrap();
    closing.wait_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn immediate_close_fails_pending_writes() {
    let endpoint = MockEndpoint::new();
    let service = ConnectionService::builder().build(endpoint.clone());

    let (channel, open) = service
        .open_channel(ChannelKind::Session, Bytes::new(), CollectSink::new())
        .await
        .unwrap();
    feed(
        &service,
        ChannelOpenConfirmation {
            recipient: 0,
            sender: 1,
            window: WIN,
            max_packet: PKT,
            type_data: Bytes::new(),
        }
        .encode(),
    )
    .await
    .unwrap();
    open.wait().await.unwrap();

    service
        .close(CloseMode::Immediate)
        .wait_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    let err = channel.send_data(Bytes::from_static(b"late")).await.unwrap_err();
    assert!(matches!(err, Error::ClosedChannel));
    assert_eq!(service.channel_count().await, 0);
}

// =============================================================================
// Session gate (no-more-sessions@openssh.com)
// =============================================================================

#[tokio::test]
async fn no_more_sessions_gates_only_session_opens() {
    let endpoint = MockEndpoint::new();
    let sessions = AcceptFactory::new("session");
    let tcpip = AcceptFactory::new("direct-tcpip");
    let service = ConnectionService::builder()
        .channel_factory(sessions)
        .channel_factory(tcpip)
        .standard_handlers()
        .build(endpoint.clone());

    feed(
        &service,
        global_request_packet("no-more-sessions@openssh.com", true),
    )
    .await
    .unwrap();
    endpoint.wait_for_packets(1).await;
    assert_eq!(endpoint.take_packets()[0].0, SSH_MSG_REQUEST_SUCCESS);
    assert!(!service.allow_more_sessions());

    // Session opens are now refused...
    feed(&service, open_packet("session", 5)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    let (cmd, payload) = endpoint.take_packets().remove(0);
    assert_eq!(cmd, SSH_MSG_CHANNEL_OPEN_FAILURE);
    let fail = ChannelOpenFailure::decode(&mut WireReader::new(payload)).unwrap();
    assert_eq!(fail.reason_code, SSH_OPEN_CONNECT_FAILED);
    assert_eq!(fail.message, "additional sessions disabled");

    // ...but other channel types still open (strict RFC reading).
    feed(&service, open_packet("direct-tcpip", 6)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    assert_eq!(
        endpoint.take_packets()[0].0,
        SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    );
}

#[tokio::test]
async fn gate_all_channel_types_refuses_everything() {
    let endpoint = MockEndpoint::new();
    let tcpip = AcceptFactory::new("direct-tcpip");
    let config = ConnectionConfig {
        gate_all_channel_types: true,
        ..ConnectionConfig::default()
    };
    let service = ConnectionService::builder()
        .config(config)
        .channel_factory(tcpip)
        .build(endpoint.clone());
    service.set_allow_more_sessions(false);

    feed(&service, open_packet("direct-tcpip", 0)).await.unwrap();
    endpoint.wait_for_packets(1).await;
    let (cmd, payload) = endpoint.take_packets().remove(0);
    assert_eq!(cmd, SSH_MSG_CHANNEL_OPEN_FAILURE);
    let fail = ChannelOpenFailure::decode(&mut WireReader::new(payload)).unwrap();
    assert_eq!(fail.reason_code, SSH_OPEN_CONNECT_FAILED);
}

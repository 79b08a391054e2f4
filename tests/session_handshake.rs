mod common;

use common::{FakeBroker, BrokerConn, CONNECT, DISCONNECT, PUBLISH, SUBSCRIBE};
use lightlink::mqtt::{
    BrokerUri, ConnectionState, DeviceIdentity, LightStateHandler, NoopHandler, SessionConfig,
    SessionController, SessionMode,
};
use lightlink::wifi::{shared, LogLed};
use std::time::Duration;

const SWITCH: &str = "/buildings/42/state/switch";
const COLOR: &str = "/devices/42/state/color";

fn config(broker: &FakeBroker, mode: SessionMode) -> SessionConfig {
    let uri = BrokerUri {
        host: "127.0.0.1".into(),
        port: broker.port(),
    };
    let mut config = SessionConfig::new(uri, Duration::from_secs(5), mode);
    config.reconnect_delay = Duration::from_millis(100);
    config
}

/// Accepts a connection and checks the announcement and the first stage.
async fn connect_and_expect_switch_stage(broker: &FakeBroker) -> BrokerConn {
    let mut conn = broker.accept().await;
    let connect = conn.expect(CONNECT).await;
    assert!(connect.contains(b"light_42"));
    assert!(connect.contains(b"/disconnected"));
    conn.connack().await;

    let announce = conn.expect(PUBLISH).await;
    assert_eq!(announce.topic(), "/connected");
    assert_eq!(announce.payload(), b"42");
    conn.puback(announce.packet_id()).await;

    let subscribe = conn.expect(SUBSCRIBE).await;
    assert_eq!(subscribe.topic(), SWITCH);
    conn.suback(subscribe.packet_id()).await;
    conn
}

#[tokio::test]
async fn subscriptions_follow_the_received_state() {
    let broker = FakeBroker::bind().await;
    let mut controller = SessionController::new(shared(LogLed));
    let (handler, mut light) = LightStateHandler::new();

    let mut context = controller
        .start_session(
            DeviceIdentity::new(42),
            config(&broker, SessionMode::Run),
            Box::new(handler),
        )
        .await
        .unwrap();

    let mut conn = connect_and_expect_switch_stage(&broker).await;
    assert_eq!(context.connection_state(), ConnectionState::Connected);

    // No color subscription before a switch message arrived.
    assert!(conn.silent_for(Duration::from_millis(300)).await);

    conn.publish(SWITCH, b"on").await;
    let subscribe = conn.expect(SUBSCRIBE).await;
    assert_eq!(subscribe.topic(), COLOR);
    conn.suback(subscribe.packet_id()).await;
    assert!(!context.is_ready());

    conn.publish(COLOR, b"#ff0000").await;
    let subscribe = conn.expect(SUBSCRIBE).await;
    assert_eq!(subscribe.topic(), "/check");
    conn.suback(subscribe.packet_id()).await;

    assert!(tokio::time::timeout(Duration::from_secs(2), context.wait_ready())
        .await
        .unwrap());
    let state = tokio::time::timeout(Duration::from_secs(2), light.wait_for(|s| s.ready))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(state.switched_on, Some(true));
    assert_eq!(state.color.as_deref(), Some("#ff0000"));

    // Check messages are answered with a fresh announcement.
    conn.publish("/check", b"").await;
    let announce = conn.expect(PUBLISH).await;
    assert_eq!(announce.topic(), "/connected");
    assert_eq!(announce.payload(), b"42");
    conn.puback(announce.packet_id()).await;

    controller.end_session().await;
    assert!(matches!(conn.read().await.map(|p| p.kind), None | Some(DISCONNECT)));
    assert!(!controller.is_active());
}

#[tokio::test]
async fn reconnect_restarts_the_handshake() {
    let broker = FakeBroker::bind().await;
    let mut controller = SessionController::new(shared(LogLed));
    let (handler, mut light) = LightStateHandler::new();

    let mut context = controller
        .start_session(
            DeviceIdentity::new(42),
            config(&broker, SessionMode::Run),
            Box::new(handler),
        )
        .await
        .unwrap();

    let mut conn = connect_and_expect_switch_stage(&broker).await;
    conn.publish(SWITCH, b"off").await;
    let subscribe = conn.expect(SUBSCRIBE).await;
    conn.suback(subscribe.packet_id()).await;
    conn.publish(COLOR, b"#00ff00").await;
    let subscribe = conn.expect(SUBSCRIBE).await;
    conn.suback(subscribe.packet_id()).await;
    assert!(tokio::time::timeout(Duration::from_secs(2), context.wait_ready())
        .await
        .unwrap());

    assert!(tokio::time::timeout(Duration::from_secs(2), light.wait_for(|s| s.ready))
        .await
        .unwrap()
        .is_ok());

    // Broker goes away, the client comes back and starts over.
    drop(conn);
    let mut conn = connect_and_expect_switch_stage(&broker).await;
    assert!(!context.is_ready());
    assert!(!light.borrow().ready);
    assert_eq!(light.borrow().switched_on, Some(false));
    assert!(conn.silent_for(Duration::from_millis(300)).await);

    // Only the fresh stages make the light ready again.
    conn.publish(SWITCH, b"on").await;
    let subscribe = conn.expect(SUBSCRIBE).await;
    assert_eq!(subscribe.topic(), COLOR);
    conn.suback(subscribe.packet_id()).await;
    conn.publish(COLOR, b"#0000ff").await;
    let subscribe = conn.expect(SUBSCRIBE).await;
    assert_eq!(subscribe.topic(), "/check");
    conn.suback(subscribe.packet_id()).await;
    let state = tokio::time::timeout(Duration::from_secs(2), light.wait_for(|s| s.ready))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(state.switched_on, Some(true));
    assert_eq!(state.color.as_deref(), Some("#0000ff"));

    controller.end_session().await;
}

#[tokio::test]
async fn test_mode_only_connects() {
    let broker = FakeBroker::bind().await;
    let mut controller = SessionController::new(shared(LogLed));

    let mut context = controller
        .start_session(
            DeviceIdentity::new(42),
            config(&broker, SessionMode::Test),
            Box::new(NoopHandler),
        )
        .await
        .unwrap();

    let mut conn = broker.accept().await;
    conn.expect(CONNECT).await;
    conn.connack().await;

    assert_eq!(
        context.wait_for_connection(Duration::from_secs(2)).await,
        ConnectionState::Connected
    );
    assert!(conn.silent_for(Duration::from_millis(300)).await);

    controller.end_session().await;
    // Ending twice is harmless.
    controller.end_session().await;
}

#[tokio::test]
async fn unreachable_broker_stays_unset() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut controller = SessionController::new(shared(LogLed));
    let uri = BrokerUri {
        host: "127.0.0.1".into(),
        port,
    };
    let mut context = controller
        .start_session(
            DeviceIdentity::new(42),
            SessionConfig::new(uri, Duration::from_secs(5), SessionMode::Test),
            Box::new(NoopHandler),
        )
        .await
        .unwrap();

    assert_eq!(
        context.wait_for_connection(Duration::from_millis(500)).await,
        ConnectionState::Unset
    );
    assert!(context.snapshot().last_error.is_some());
    controller.end_session().await;
}

#[tokio::test]
async fn keepalive_below_a_second_is_rejected() {
    let mut controller = SessionController::new(shared(LogLed));
    let uri = BrokerUri::parse("mqtt://127.0.0.1:1883/").unwrap();

    let result = controller
        .start_session(
            DeviceIdentity::new(42),
            SessionConfig::new(uri, Duration::from_millis(500), SessionMode::Test),
            Box::new(NoopHandler),
        )
        .await;

    assert!(result.is_err());
    assert!(!controller.is_active());
}

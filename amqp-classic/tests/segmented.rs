use amqp_classic::{
    framing::{Method, MethodKind},
    AcknowledgeMode, Error, ProtocolVersion, SessionOptions,
};
use bytes::Bytes;
use tokio::sync::oneshot;

mod common;

use common::{eventually, settings, Handshake, ScriptedConnector};

fn handshake() -> Handshake {
    Handshake {
        version: (0, 10),
        frame_max: u16::MAX as u32,
        ..Default::default()
    }
}

#[tokio::test]
async fn sessions_attach_and_detach_over_segments() {
    let (detach, detached) = oneshot::channel::<()>();
    let connector = ScriptedConnector::default();
    connector.script_segmented("a", move |mut broker| async move {
        let log = broker.handshake(&handshake()).await;
        assert_eq!(log.header, ProtocolVersion::V0_10.header());
        assert!(matches!(
            log.tune_ok.method,
            Method::ConnectionTuneOk {
                frame_max: 65535,
                ..
            }
        ));

        let attach = broker.expect(MethodKind::SessionAttach).await;
        assert_eq!(attach.channel, 1);
        assert_eq!(
            attach.method,
            Method::SessionAttach {
                name: Bytes::from_static(b"test-client-1"),
                force: false
            }
        );
        broker.answer(&attach).await;
        let declare = broker.serve_until(MethodKind::QueueDeclare).await;
        broker.answer(&declare).await;

        detached.await.unwrap();
        broker
            .send(
                1,
                Method::SessionDetached {
                    name: Bytes::from_static(b"test-client-1"),
                    code: 3,
                },
            )
            .await;
        broker.serve().await;
        assert!(!broker.received_kinds().contains(&MethodKind::ChannelOpen));
    });

    let mut settings = settings(&["a"]);
    settings.protocol_version = ProtocolVersion::V0_10;
    let connection = connector.factory().open(settings).await.unwrap();
    assert_eq!(connection.protocol_version(), ProtocolVersion::V0_10);

    let session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Client))
        .await
        .unwrap();
    let declared = session
        .declare_queue("orders", Default::default())
        .await
        .unwrap();
    assert_eq!(declared.queue, "orders");

    detach.send(()).unwrap();
    assert!(eventually(|| session.close_reason().is_some()).await);
    assert!(matches!(
        session.close_reason(),
        Some(Error::SessionDetached(reason)) if reason.contains("code 3")
    ));
    assert!(matches!(
        session.declare_queue("orders", Default::default()).await,
        Err(Error::SessionClosed(1))
    ));

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn recover_uses_basic_recover_on_0_10() {
    let connector = ScriptedConnector::default();
    connector.script_segmented("a", |mut broker| async move {
        broker.handshake(&handshake()).await;
        broker.serve().await;
        let kinds = broker.received_kinds();
        assert!(kinds.contains(&MethodKind::SessionAttach));
        assert!(kinds.contains(&MethodKind::BasicRecover));
        assert!(!kinds.contains(&MethodKind::BasicRecoverSync));
    });

    let mut settings = settings(&["a"]);
    settings.protocol_version = ProtocolVersion::V0_10;
    let connection = connector.factory().open(settings).await.unwrap();
    let session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Client))
        .await
        .unwrap();
    session.recover().await.unwrap();

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

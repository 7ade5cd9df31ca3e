use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use std::time::Duration;

use amqp_classic::{
    framing::{BasicProperties, Method, MethodKind},
    AcknowledgeMode, ConnectionListener, ConsumerOptions, Error, FailoverStatus, ProtocolVersion,
    SessionOptions,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

mod common;

use common::{eventually, settings, Handshake, ScriptedConnector};

fn forced_close() -> Method {
    Method::ConnectionClose {
        reply_code: 320,
        reply_text: "CONNECTION_FORCED".into(),
        class_id: 0,
        method_id: 0,
    }
}

#[derive(Default, Clone)]
struct Recorder {
    veto: bool,
    pre_failover: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl ConnectionListener for Recorder {
    fn pre_failover(&self, _redirect: bool) -> bool {
        self.pre_failover.fetch_add(1, Ordering::SeqCst);
        !self.veto
    }

    fn failover_complete(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn forced_close_fails_over_and_retries_declare() {
    let connector = ScriptedConnector::default();
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.serve_until(MethodKind::QueueDeclare).await;
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let before = broker.received.len();
        let declare = broker.serve_until(MethodKind::QueueDeclare).await;
        assert_eq!(declare.channel, 1);
        broker.answer(&declare).await;
        broker.serve().await;

        let kinds = broker.received_kinds();
        assert_eq!(
            kinds[before..before + 3],
            [
                MethodKind::ChannelOpen,
                MethodKind::BasicQos,
                MethodKind::QueueDeclare
            ]
        );
    });

    let connection = connector.factory().open(settings(&["a"])).await.unwrap();
    let recorder = Recorder::default();
    connection.add_connection_listener(recorder.clone());

    let session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Client))
        .await
        .unwrap();
    let declared = session
        .declare_queue("orders", Default::default())
        .await
        .unwrap();
    assert_eq!(declared.queue, "orders");

    assert_eq!(connector.attempts(), ["a", "a"]);
    assert!(matches!(
        connection.failover_status(),
        FailoverStatus::Connected
    ));
    assert_eq!(recorder.pre_failover.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn declarations_are_replayed_after_failover() {
    let (lose, lost) = oneshot::channel::<()>();
    let connector = ScriptedConnector::default();
    connector.script("a", move |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let consume = broker.serve_until(MethodKind::BasicConsume).await;
        broker.answer(&consume).await;
        lost.await.unwrap();
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });
    connector.script("b", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let before = broker.received.len();
        let consume = broker.serve_until(MethodKind::BasicConsume).await;
        broker.answer(&consume).await;
        broker.deliver(1, "ctag-1-1", 1, b"after failover").await;
        broker.serve().await;

        let kinds = broker.received_kinds();
        assert_eq!(
            kinds[before..before + 5],
            [
                MethodKind::ChannelOpen,
                MethodKind::BasicQos,
                MethodKind::QueueDeclare,
                MethodKind::QueueBind,
                MethodKind::BasicConsume
            ]
        );
    });

    let connection = connector
        .factory()
        .open(settings(&["a", "b"]))
        .await
        .unwrap();
    let session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Auto))
        .await
        .unwrap();
    let queue = session
        .declare_queue("", Default::default())
        .await
        .unwrap();
    assert_eq!(queue.queue, "amq.gen-1");
    session
        .bind_queue(&queue.queue, "amq.direct", "key", Default::default())
        .await
        .unwrap();
    let consumer = session
        .create_consumer(&queue.queue, Default::default())
        .await
        .unwrap();
    assert_eq!(consumer.tag(), "ctag-1-1");

    lose.send(()).unwrap();
    let message = consumer
        .receive(std::time::Duration::from_secs(3))
        .await
        .unwrap()
        .expect("message after failover");
    assert_eq!(&message.body[..], b"after failover");
    assert_eq!(connector.attempts(), ["a", "a", "b"]);
    assert_eq!(connection.current_broker().unwrap().host, "b");

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn redirect_targets_are_tried_first() {
    let connector = ScriptedConnector::default();
    connector.script("a", |mut broker| async move {
        broker.handshake_until_open(&Handshake::default()).await;
        broker
            .send(
                0,
                Method::ConnectionRedirect {
                    host: "b:5672".into(),
                    known_hosts: "c:5672".into(),
                },
            )
            .await;
        assert!(broker.recv().await.is_none());
    });
    connector.script("c", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.serve().await;
    });

    let mut settings = settings(&["a"]);
    settings.protocol_version = ProtocolVersion::V0_9;
    let connection = connector.factory().open(settings).await.unwrap();
    assert_eq!(connector.attempts(), ["a", "b", "c"]);
    assert_eq!(connection.current_broker().unwrap().host, "c");

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn exception_listener_is_told_once() {
    let (lose, lost) = oneshot::channel::<()>();
    let connector = ScriptedConnector::default();
    connector.script("a", move |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        lost.await.unwrap();
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });

    let mut settings = settings(&["a"]);
    settings.failover_enabled = false;
    let connection = connector.factory().open(settings).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        connection.set_exception_listener(move |error: &Error| seen.lock().push(error.clone()));
    }
    lose.send(()).unwrap();

    assert!(eventually(|| !seen.lock().is_empty()).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert!(matches!(
        seen[0],
        Error::ConnectionClosedByPeer {
            reply_code: 320,
            ..
        }
    ));
    assert!(connection.is_closed());
    assert!(matches!(
        connection.failover_status(),
        FailoverStatus::Abandoned(_)
    ));

    let session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Auto))
        .await;
    assert!(session.is_err());
    connector.join_brokers().await;
}

#[tokio::test]
async fn vetoed_failover_closes_connection() {
    let (lose, lost) = oneshot::channel::<()>();
    let connector = ScriptedConnector::default();
    connector.script("a", move |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        lost.await.unwrap();
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });

    let connection = connector.factory().open(settings(&["a"])).await.unwrap();
    let recorder = Recorder {
        veto: true,
        ..Default::default()
    };
    connection.add_connection_listener(recorder.clone());
    lose.send(()).unwrap();

    assert!(eventually(|| connection.is_closed()).await);
    assert_eq!(recorder.pre_failover.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 0);
    assert_eq!(connector.attempts(), ["a"]);
    connector.join_brokers().await;
}

#[tokio::test]
async fn broken_resubscribe_moves_on_to_next_broker() {
    let connector = ScriptedConnector::default();
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.serve_until(MethodKind::QueueDeclare).await;
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });
    connector.script("b", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.expect(MethodKind::ChannelOpen).await;
    });
    connector.script("c", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let before = broker.received.len();
        broker.serve().await;

        let kinds = broker.received_kinds();
        assert_eq!(
            kinds[before..before + 3],
            [
                MethodKind::ChannelOpen,
                MethodKind::BasicQos,
                MethodKind::QueueDeclare
            ]
        );
    });

    let connection = connector
        .factory()
        .open(settings(&["a", "b", "c"]))
        .await
        .unwrap();
    let recorder = Recorder::default();
    connection.add_connection_listener(recorder.clone());
    let session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Client))
        .await
        .unwrap();
    let declared = session
        .declare_queue("orders", Default::default())
        .await
        .unwrap();
    assert_eq!(declared.queue, "orders");

    assert_eq!(connector.attempts(), ["a", "a", "b", "c"]);
    assert_eq!(connection.current_broker().unwrap().host, "c");
    assert!(matches!(
        connection.failover_status(),
        FailoverStatus::Connected
    ));
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn commit_interrupted_by_failover_reports_rollback() {
    let connector = ScriptedConnector::default();
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.serve_until(MethodKind::TxCommit).await;
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let before = broker.received.len();
        broker.serve().await;

        let kinds = broker.received_kinds();
        assert_eq!(
            kinds[before..before + 5],
            [
                MethodKind::ChannelOpen,
                MethodKind::TxSelect,
                MethodKind::BasicQos,
                MethodKind::BasicPublish,
                MethodKind::TxCommit
            ]
        );
        assert_eq!(
            kinds.iter().filter(|kind| **kind == MethodKind::TxCommit).count(),
            1
        );
    });

    let connection = connector.factory().open(settings(&["a"])).await.unwrap();
    let session = connection
        .create_session(SessionOptions::transacted())
        .await
        .unwrap();
    let producer = session.create_producer("amq.direct", "key").unwrap();
    producer
        .publish(BasicProperties::default(), "lost")
        .await
        .unwrap();
    assert!(matches!(
        session.commit().await,
        Err(Error::TransactionRolledBack)
    ));

    producer
        .publish(BasicProperties::default(), "kept")
        .await
        .unwrap();
    session.commit().await.unwrap();

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn transaction_dirtied_before_failover_is_rolled_back_on_commit() {
    let connector = ScriptedConnector::default();
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.serve_until(MethodKind::BasicPublish).await;
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let before = broker.received.len();
        broker.serve().await;

        let kinds = broker.received_kinds();
        assert_eq!(
            kinds[before..before + 5],
            [
                MethodKind::ChannelOpen,
                MethodKind::TxSelect,
                MethodKind::BasicQos,
                MethodKind::TxRollback,
                MethodKind::TxCommit
            ]
        );
    });

    let connection = connector.factory().open(settings(&["a"])).await.unwrap();
    let recorder = Recorder::default();
    connection.add_connection_listener(recorder.clone());
    let session = connection
        .create_session(SessionOptions::transacted())
        .await
        .unwrap();
    let producer = session.create_producer("amq.direct", "key").unwrap();
    producer
        .publish(BasicProperties::default(), "lost")
        .await
        .unwrap();
    assert!(eventually(|| recorder.completed.load(Ordering::SeqCst) == 1).await);

    assert!(matches!(
        session.commit().await,
        Err(Error::TransactionRolledBack)
    ));
    session.commit().await.unwrap();

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn deliveries_from_lost_connection_are_not_acknowledged() {
    let (lose, lost) = oneshot::channel::<()>();
    let connector = ScriptedConnector::default();
    connector.script("a", move |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let consume = broker.serve_until(MethodKind::BasicConsume).await;
        broker.answer(&consume).await;
        broker.deliver(1, "ctag-1-1", 7, b"before failover").await;
        lost.await.unwrap();
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });
    connector.script("a", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.serve().await;
        assert!(!broker.received_kinds().contains(&MethodKind::BasicAck));
    });

    let connection = connector.factory().open(settings(&["a"])).await.unwrap();
    let recorder = Recorder::default();
    connection.add_connection_listener(recorder.clone());
    let session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Client))
        .await
        .unwrap();
    let consumer = session
        .create_consumer("q", ConsumerOptions::default())
        .await
        .unwrap();
    let message = consumer
        .receive(Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.delivery_tag, 7);

    lose.send(()).unwrap();
    assert!(eventually(|| recorder.completed.load(Ordering::SeqCst) == 1).await);

    session.acknowledge(7, true).await.unwrap();
    session.acknowledge(u64::MAX, true).await.unwrap();
    assert!(session.unacknowledged_tags().is_empty());

    connection.close().await.unwrap();
    connector.join_brokers().await;
}

#[tokio::test]
async fn failed_failover_closes_the_new_connection() {
    let (lose, lost) = oneshot::channel::<()>();
    let connector = ScriptedConnector::default();
    connector.script("a", move |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        let qos = broker.serve_until(MethodKind::BasicQos).await;
        broker.answer(&qos).await;
        lost.await.unwrap();
        broker.send(0, forced_close()).await;
        broker.expect(MethodKind::ConnectionCloseOk).await;
    });
    connector.script("b", |mut broker| async move {
        broker.handshake(&Handshake::default()).await;
        broker.expect(MethodKind::ChannelOpen).await;
        broker
            .send(
                1,
                Method::ChannelClose {
                    reply_code: 530,
                    reply_text: "NOT_ALLOWED".into(),
                    class_id: 20,
                    method_id: 10,
                },
            )
            .await;
        broker.expect(MethodKind::ChannelCloseOk).await;
        let close = broker.expect(MethodKind::ConnectionClose).await;
        assert!(matches!(
            close.method,
            Method::ConnectionClose {
                reply_code: 541,
                ..
            }
        ));
    });

    let connection = connector
        .factory()
        .open(settings(&["a", "b"]))
        .await
        .unwrap();
    let _session = connection
        .create_session(SessionOptions::new(AcknowledgeMode::Client))
        .await
        .unwrap();
    lose.send(()).unwrap();

    assert!(eventually(|| connection.is_closed()).await);
    assert!(matches!(
        connection.failover_status(),
        FailoverStatus::Abandoned(Error::ConnectionClosedByPeer {
            reply_code: 320,
            ..
        })
    ));
    assert_eq!(connector.attempts(), ["a", "a", "b"]);
    connector.join_brokers().await;
}

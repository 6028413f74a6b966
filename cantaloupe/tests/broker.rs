use std::{sync::Arc, time::Duration};

use cantaloupe::proto::{ChannelName, ConnectRequest, StartPosition, SubscriptionRequest};
use cantaloupe::proto::{decode, encode, ConnectResponse};
use cantaloupe::{Broker, Bus as _, ChannelLimits, MemoryBus};
use claims::{assert_none, assert_ok, assert_some};

use crate::common::{recv_msg, TestClient, REQUEST_TIMEOUT};

mod common;

async fn start_broker(bus: &Arc<MemoryBus>) -> Broker {
    Broker::start(Broker::options(), Arc::clone(bus) as Arc<dyn cantaloupe::Bus>)
        .await
        .expect("start broker")
}

#[tokio::test]
async fn connect_returns_the_control_subjects() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;

    let client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);
    assert_some!(client.info.pub_prefix.as_ref());
    assert_some!(client.info.sub_requests.as_ref());
    assert_some!(client.info.unsub_requests.as_ref());
    assert_some!(client.info.close_requests.as_ref());
    assert_eq!(vec!["me"], broker.client_ids().iter().map(|id| id.to_string()).collect::<Vec<_>>());

    broker.shutdown().await;
}

#[tokio::test]
async fn connect_rejects_malformed_requests() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;

    // no heartbeat inbox
    let request = ConnectRequest {
        client_id: "me".to_owned(),
        heartbeat_inbox: String::new(),
    };
    let reply = bus
        .request(broker.discover_subject(), encode(&request), REQUEST_TIMEOUT)
        .await
        .unwrap();
    let response: ConnectResponse = decode(&reply.payload).unwrap();
    assert_eq!("invalid connect request", response.error);

    // unparsable payload
    let reply = bus
        .request(
            broker.discover_subject(),
            bytes::Bytes::from_static(b"not json"),
            REQUEST_TIMEOUT,
        )
        .await
        .unwrap();
    let response: ConnectResponse = decode(&reply.payload).unwrap();
    assert_eq!("invalid connect request", response.error);

    assert_eq!(0, broker.client_count());
    broker.shutdown().await;
}

#[tokio::test]
async fn connect_rejects_bad_client_ids() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;

    for bad in ["id with spaces", "id.with.dots", "id,with,commas", "id:with:colons", "id!@#$%"] {
        let err = TestClient::connect(&bus, &broker, bad).await.unwrap_err();
        assert_eq!("invalid client id", err, "client id {bad:?}");
    }

    // an absent id is a malformed request, not a bad id
    let err = TestClient::connect(&bus, &broker, "").await.unwrap_err();
    assert_eq!("invalid connect request", err);

    assert_eq!(0, broker.client_count());
    broker.shutdown().await;
}

#[tokio::test]
async fn subscribe_rejects_bad_channels() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;
    let client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);

    for bad in ["foo*.bar", "foo.bar*", "foo.>.*", "", "foo..bar", "foo.bar."] {
        let err = client
            .subscribe(|request| request.channel = bad.to_owned())
            .await
            .unwrap_err();
        assert_eq!("invalid channel", err, "channel {bad:?}");
    }

    broker.shutdown().await;
}

#[tokio::test]
async fn subscribe_validates_the_request() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;
    let client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);

    let err = client
        .subscribe(|request| {
            request.channel = "foo".to_owned();
            request.ack_wait_secs = 0;
        })
        .await
        .unwrap_err();
    assert_eq!("invalid subscription request", err);

    let err = client
        .subscribe(|request| {
            request.channel = "foo".to_owned();
            request.max_in_flight = 0;
        })
        .await
        .unwrap_err();
    assert_eq!("invalid subscription request", err);

    // names that would collide with directory keys
    let err = client
        .subscribe(|request| {
            request.channel = "foo".to_owned();
            request.durable_name = "du:rable".to_owned();
            request.q_group = "workers".to_owned();
        })
        .await
        .unwrap_err();
    assert_eq!("invalid subscription request", err);

    // unregistered client
    let response = client
        .subscribe_raw(&SubscriptionRequest {
            client_id: "ghost".to_owned(),
            channel: "foo".to_owned(),
            inbox: "_INBOX.ghost".to_owned(),
            ack_wait_secs: 30,
            max_in_flight: 1,
            ..SubscriptionRequest::default()
        })
        .await;
    assert_eq!("unknown client id", response.error);

    // invalid client id string
    let response = client
        .subscribe_raw(&SubscriptionRequest {
            client_id: "id with spaces".to_owned(),
            channel: "foo".to_owned(),
            inbox: "_INBOX.ghost".to_owned(),
            ack_wait_secs: 30,
            max_in_flight: 1,
            ..SubscriptionRequest::default()
        })
        .await;
    assert_eq!("invalid client id", response.error);

    broker.shutdown().await;
}

#[tokio::test]
async fn subscribe_validates_start_positions() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;
    let client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);

    client.publish("foo", b"m1").await;

    let err = client
        .subscribe(|request| {
            request.channel = "foo".to_owned();
            request.start_position = StartPosition::SequenceStart;
            request.start_sequence = 10;
        })
        .await
        .unwrap_err();
    assert_eq!("unknown start sequence", err);

    let err = client
        .subscribe(|request| {
            request.channel = "empty".to_owned();
            request.start_position = StartPosition::TimeDeltaStart;
            request.start_time_delta_nanos = 1_000_000_000;
        })
        .await
        .unwrap_err();
    assert_eq!("unknown time delta", err);

    let err = client
        .subscribe(|request| {
            request.channel = "empty".to_owned();
            request.start_position = StartPosition::LastReceived;
        })
        .await
        .unwrap_err();
    assert_eq!("unknown start sequence", err);

    broker.shutdown().await;
}

#[tokio::test]
async fn publish_cannot_create_channels_past_the_limit() {
    let bus = Arc::new(MemoryBus::new());
    let options = Broker::options().limits(ChannelLimits {
        max_channels: 1,
        ..ChannelLimits::default()
    });
    let broker = Broker::start(options, Arc::clone(&bus) as Arc<dyn cantaloupe::Bus>)
        .await
        .expect("start broker");
    let client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);

    let ack = client.publish("foo", b"m1").await;
    assert_eq!("", ack.error);

    let ack = client.publish("bar", b"m1").await;
    assert_eq!("too many channels", ack.error);
    // the failed publish must not leave a channel behind
    assert_eq!(
        vec![ChannelName::from_static("foo")],
        broker.channel_names()
    );

    broker.shutdown().await;
}

#[tokio::test]
async fn publish_rejects_missing_fields() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;
    let client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);

    let ack = client.publish("foo", b"").await;
    assert_eq!("invalid publish request", ack.error);

    broker.shutdown().await;
}

#[tokio::test]
async fn subscribe_publish_receive_ack_roundtrip() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;
    let client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);

    let mut sub = assert_ok!(
        client
            .subscribe(|request| request.channel = "foo".to_owned())
            .await
    );

    let ack = client.publish("foo", b"hello").await;
    assert_eq!("", ack.error);
    assert!(ack.guid.starts_with("guid-foo"));

    let msg = assert_some!(recv_msg(&mut sub, Duration::from_secs(2)).await);
    assert_eq!(1, msg.sequence);
    assert_eq!(b"hello".as_slice(), &msg.payload[..]);
    assert!(!msg.redelivered);

    let channel = ChannelName::from_static("foo");
    let snapshot = assert_some!(broker.subscription_snapshot(&channel, &sub.ack_inbox));
    assert_eq!(vec![1], snapshot.pending);
    assert_eq!(1, snapshot.last_sent);

    client.ack("foo", &sub, 1).await;
    wait_until(|| {
        broker
            .subscription_snapshot(&channel, &sub.ack_inbox)
            .is_some_and(|snapshot| snapshot.pending.is_empty())
    })
    .await;

    broker.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_requires_ownership() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;
    let owner = assert_ok!(TestClient::connect(&bus, &broker, "owner").await);
    let thief = assert_ok!(TestClient::connect(&bus, &broker, "thief").await);

    let sub = assert_ok!(
        owner
            .subscribe(|request| request.channel = "foo".to_owned())
            .await
    );

    let response = thief.unsubscribe("foo", &sub.ack_inbox).await;
    assert_eq!("subscription not owned by client", response.error);

    let response = owner.unsubscribe("foo", &sub.ack_inbox).await;
    assert_eq!("", response.error);

    // now the subscription is gone
    let response = owner.unsubscribe("foo", &sub.ack_inbox).await;
    assert_eq!("invalid unsubscribe request", response.error);

    broker.shutdown().await;
}

#[tokio::test]
async fn close_destroys_plain_subscriptions() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;
    let mut client = assert_ok!(TestClient::connect(&bus, &broker, "me").await);

    let sub = assert_ok!(
        client
            .subscribe(|request| request.channel = "foo".to_owned())
            .await
    );

    let response = client.close().await;
    assert_eq!("", response.error);
    assert_eq!(0, broker.client_count());

    let channel = ChannelName::from_static("foo");
    assert_none!(broker.subscription_snapshot(&channel, &sub.ack_inbox));

    broker.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let bus = Arc::new(MemoryBus::new());
    let broker = start_broker(&bus).await;

    broker.shutdown().await;
    // the second call must return promptly without panicking
    assert_ok!(
        tokio::time::timeout(Duration::from_millis(250), broker.shutdown()).await
    );
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

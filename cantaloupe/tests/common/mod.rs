//! A minimal streaming client speaking the control protocol over an
//! in-process bus, playing the role a client library would.
#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use cantaloupe::proto::{
    decode, encode, Ack, CloseRequest, CloseResponse, ConnectRequest, ConnectResponse, MsgProto,
    PubAck, PubMsg, Subject, SubscriptionRequest, SubscriptionResponse, UnsubscribeRequest,
};
use cantaloupe::{Broker, Bus, BusMessage, BusSubscription, MemoryBus};
use futures_util::StreamExt as _;
use tokio::task::JoinHandle;

pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) struct TestClient {
    bus: Arc<MemoryBus>,
    pub(crate) client_id: String,
    pub(crate) hb_inbox: Subject,
    pub(crate) info: ConnectResponse,
    hb_responder: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub(crate) struct TestSubscription {
    pub(crate) inbox: Subject,
    pub(crate) ack_inbox: Subject,
    pub(crate) messages: BusSubscription,
}

impl TestClient {
    /// Connect with a background task answering broker heartbeats
    pub(crate) async fn connect(
        bus: &Arc<MemoryBus>,
        broker: &Broker,
        client_id: &str,
    ) -> Result<Self, String> {
        let hb_inbox = bus.new_inbox();
        let responder = spawn_heartbeat_responder(bus, &hb_inbox).await;

        let request = ConnectRequest {
            client_id: client_id.to_owned(),
            heartbeat_inbox: hb_inbox.to_string(),
        };
        let reply = bus
            .request(broker.discover_subject(), encode(&request), REQUEST_TIMEOUT)
            .await
            .expect("connect request");
        let info: ConnectResponse = decode(&reply.payload).expect("connect response");

        if !info.error.is_empty() {
            responder.abort();
            return Err(info.error);
        }

        Ok(Self {
            bus: Arc::clone(bus),
            client_id: client_id.to_owned(),
            hb_inbox,
            info,
            hb_responder: Some(responder),
        })
    }

    /// Connect without ever answering heartbeats, like a client that
    /// dies right after registering
    pub(crate) async fn connect_without_heartbeats(
        bus: &Arc<MemoryBus>,
        broker: &Broker,
        client_id: &str,
    ) -> Result<Self, String> {
        let hb_inbox = bus.new_inbox();

        let request = ConnectRequest {
            client_id: client_id.to_owned(),
            heartbeat_inbox: hb_inbox.to_string(),
        };
        let reply = bus
            .request(broker.discover_subject(), encode(&request), REQUEST_TIMEOUT)
            .await
            .expect("connect request");
        let info: ConnectResponse = decode(&reply.payload).expect("connect response");

        if !info.error.is_empty() {
            return Err(info.error);
        }

        Ok(Self {
            bus: Arc::clone(bus),
            client_id: client_id.to_owned(),
            hb_inbox,
            info,
            hb_responder: None,
        })
    }

    /// Simulate a silent failure: the client stays registered but no
    /// longer answers heartbeats
    pub(crate) fn stop_heartbeats(&mut self) {
        if let Some(responder) = self.hb_responder.take() {
            responder.abort();
        }
    }

    pub(crate) async fn publish(&self, channel: &str, payload: &[u8]) -> PubAck {
        let subject = Subject::try_from(format!(
            "{}.{channel}",
            self.info.pub_prefix.as_ref().expect("connected")
        ))
        .expect("publish subject");
        let request = PubMsg {
            guid: format!("guid-{channel}-{}", payload.len()),
            channel: channel.to_owned(),
            payload: Bytes::copy_from_slice(payload),
        };

        let reply = self
            .bus
            .request(subject, encode(&request), REQUEST_TIMEOUT)
            .await
            .expect("publish request");
        decode(&reply.payload).expect("pub ack")
    }

    /// Subscribe, binding a fresh delivery inbox first
    ///
    /// Returns the error string instead when the broker refuses.
    pub(crate) async fn subscribe(
        &self,
        configure: impl FnOnce(&mut SubscriptionRequest),
    ) -> Result<TestSubscription, String> {
        let inbox = self.bus.new_inbox();
        let messages = self
            .bus
            .subscribe(inbox.clone())
            .await
            .expect("bind delivery inbox");

        let mut request = SubscriptionRequest {
            client_id: self.client_id.clone(),
            inbox: inbox.to_string(),
            ack_wait_secs: 30,
            max_in_flight: 1024,
            ..SubscriptionRequest::default()
        };
        configure(&mut request);

        let response = self.subscribe_raw(&request).await;
        if !response.error.is_empty() {
            return Err(response.error);
        }

        Ok(TestSubscription {
            inbox,
            ack_inbox: response.ack_inbox.expect("ack inbox on success"),
            messages,
        })
    }

    /// Send a subscription request as-is and return the raw response
    pub(crate) async fn subscribe_raw(&self, request: &SubscriptionRequest) -> SubscriptionResponse {
        let reply = self
            .bus
            .request(
                self.info.sub_requests.clone().expect("connected"),
                encode(request),
                REQUEST_TIMEOUT,
            )
            .await
            .expect("subscribe request");
        decode(&reply.payload).expect("subscribe response")
    }

    pub(crate) async fn ack(&self, channel: &str, sub: &TestSubscription, sequence: u64) {
        let ack = Ack {
            channel: channel.to_owned(),
            sequence,
        };
        self.bus
            .publish(BusMessage {
                subject: sub.ack_inbox.clone(),
                reply: None,
                payload: encode(&ack),
            })
            .await
            .expect("publish ack");
    }

    pub(crate) async fn unsubscribe(&self, channel: &str, ack_inbox: &Subject) -> SubscriptionResponse {
        let request = UnsubscribeRequest {
            client_id: self.client_id.clone(),
            channel: channel.to_owned(),
            ack_inbox: ack_inbox.to_string(),
        };
        let reply = self
            .bus
            .request(
                self.info.unsub_requests.clone().expect("connected"),
                encode(&request),
                REQUEST_TIMEOUT,
            )
            .await
            .expect("unsubscribe request");
        decode(&reply.payload).expect("unsubscribe response")
    }

    pub(crate) async fn close(&mut self) -> CloseResponse {
        let request = CloseRequest {
            client_id: self.client_id.clone(),
        };
        let reply = self
            .bus
            .request(
                self.info.close_requests.clone().expect("connected"),
                encode(&request),
                REQUEST_TIMEOUT,
            )
            .await
            .expect("close request");
        self.stop_heartbeats();
        decode(&reply.payload).expect("close response")
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.stop_heartbeats();
    }
}

async fn spawn_heartbeat_responder(bus: &Arc<MemoryBus>, hb_inbox: &Subject) -> JoinHandle<()> {
    let mut hb_sub = bus
        .subscribe(hb_inbox.clone())
        .await
        .expect("bind heartbeat inbox");
    let bus = Arc::clone(bus);
    tokio::spawn(async move {
        while let Some(msg) = hb_sub.next().await {
            if let Some(reply) = msg.reply {
                let _ = bus
                    .publish(BusMessage {
                        subject: reply,
                        reply: None,
                        payload: Bytes::new(),
                    })
                    .await;
            }
        }
    })
}

/// Receive the next data message, with a deadline
pub(crate) async fn recv_msg(sub: &mut TestSubscription, timeout: Duration) -> Option<MsgProto> {
    let msg = tokio::time::timeout(timeout, sub.messages.next())
        .await
        .ok()??;
    Some(decode(&msg.payload).expect("data frame"))
}

/// Assert no data message arrives within the window
pub(crate) async fn expect_silence(sub: &mut TestSubscription, window: Duration) {
    assert!(
        tokio::time::timeout(window, sub.messages.next())
            .await
            .is_err(),
        "expected no delivery",
    );
}

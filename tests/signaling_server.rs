use std::sync::Arc;
use std::time::Duration;

use confer::auth::{Identity, TokenValidator};
use confer::config::RetryPolicy;
use confer::media::SyntheticDevices;
use confer::peer::sim::SimNetwork;
use confer::peer::ConnectionState;
use confer::protocol::{Envelope, Presence, PresenceEvent, SessionDescription, SignalingMessage};
use confer::signaling::server::RunningServer;
use confer::signaling::{ChannelEvent, SignalingChannel, SignalingServer, Subscription, WsSignalingChannel};
use confer::{MeetingSession, SessionOptions, SignalingError};

const SECRET: &str = "integration-secret";

async fn start_server() -> RunningServer {
  SignalingServer::bind("127.0.0.1:0", TokenValidator::new(SECRET))
    .await
    .unwrap()
    .spawn()
    .unwrap()
}

fn channel_for(server: &RunningServer, id: &str) -> WsSignalingChannel {
  let token = TokenValidator::new(SECRET).issue(&Identity::new(id), 300).unwrap();
  WsSignalingChannel::new(Some(server.endpoint()), token)
}

async fn next_message(subscription: &mut Subscription) -> SignalingMessage {
  let message = tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      match subscription.recv().await {
        Some(ChannelEvent::Message(message)) => return message,
        Some(_) => continue,
        None => panic!("subscription ended"),
      }
    }
  })
  .await;
  message.expect("no message within 5s")
}

async fn next_presence(subscription: &mut Subscription) -> Presence {
  loop {
    if let SignalingMessage::Presence(presence) = next_message(subscription).await {
      return presence;
    }
  }
}

#[tokio::test]
async fn test_unauthenticated_connection_is_rejected() {
  let server = start_server().await;

  let channel = WsSignalingChannel::new(Some(server.endpoint()), "not-a-token");
  let result = channel.subscribe("room-1", &Identity::new("alice")).await;
  assert!(matches!(result, Err(SignalingError::Rejected { status: 401 })));

  let forged = TokenValidator::new("other-secret").issue(&Identity::new("alice"), 300).unwrap();
  let channel = WsSignalingChannel::new(Some(server.endpoint()), forged);
  let result = channel.subscribe("room-1", &Identity::new("alice")).await;
  assert!(matches!(result, Err(SignalingError::Rejected { status: 401 })));

  assert!(server.participants("room-1").is_empty());
}

#[tokio::test]
async fn test_presence_and_targeted_relay() {
  let server = start_server().await;
  let alice = channel_for(&server, "alice");
  let bob = channel_for(&server, "bob");
  let carol = channel_for(&server, "carol");

  let mut alice_sub = alice.subscribe("room-1", &Identity::new("alice")).await.unwrap();
  let mut bob_sub = bob.subscribe("room-1", &Identity::new("bob")).await.unwrap();

  let seen_by_alice = next_presence(&mut alice_sub).await;
  assert_eq!(seen_by_alice.info.participant_id, "bob");
  assert_eq!(seen_by_alice.event, PresenceEvent::Joined);
  assert_eq!(next_presence(&mut bob_sub).await.info.participant_id, "alice");

  let mut carol_sub = carol.subscribe("room-1", &Identity::new("carol")).await.unwrap();
  let mut carol_saw = vec![
    next_presence(&mut carol_sub).await.info.participant_id,
    next_presence(&mut carol_sub).await.info.participant_id,
  ];
  carol_saw.sort();
  assert_eq!(carol_saw, vec!["alice", "bob"]);
  assert_eq!(next_presence(&mut alice_sub).await.info.participant_id, "carol");

  // The sender field is taken from the token, not from the message.
  let forged = Envelope::offer("mallory", "alice", SessionDescription::offer("v=0"));
  bob.send(SignalingMessage::Negotiation(forged)).await.unwrap();
  match next_message(&mut alice_sub).await {
    SignalingMessage::Negotiation(envelope) => {
      assert_eq!(envelope.from, "bob");
      assert_eq!(envelope.to, "alice");
    }
    other => panic!("unexpected {other:?}"),
  }

  bob.send(SignalingMessage::Presence(Presence::left("bob"))).await.unwrap();
  assert_eq!(next_presence(&mut alice_sub).await, Presence::left("bob"));

  // carol never saw the offer meant for alice, only bob leaving.
  assert_eq!(next_presence(&mut carol_sub).await, Presence::left("bob"));
  assert_eq!(server.participants("room-1"), vec!["alice", "carol"]);

  bob_sub.unsubscribe();
  alice_sub.unsubscribe();
  carol_sub.unsubscribe();
}

#[tokio::test]
async fn test_rooms_are_isolated() {
  let server = start_server().await;
  let alice = channel_for(&server, "alice");
  let bob = channel_for(&server, "bob");

  let mut alice_sub = alice.subscribe("room-a", &Identity::new("alice")).await.unwrap();
  let _bob_sub = bob.subscribe("room-b", &Identity::new("bob")).await.unwrap();

  let nothing = tokio::time::timeout(Duration::from_millis(200), alice_sub.recv()).await;
  assert!(nothing.is_err());
  assert_eq!(server.participants("room-a"), vec!["alice"]);
  assert_eq!(server.participants("room-b"), vec!["bob"]);
}

#[tokio::test]
async fn test_meeting_over_websocket_signaling() {
  let server = start_server().await;
  let network = SimNetwork::new();

  let mut handles = Vec::new();
  for id in ["alice", "bob"] {
    let handle = MeetingSession::join(
      SessionOptions::new("standup", Identity::new(id)).with_retry(RetryPolicy::immediate()),
      Arc::new(channel_for(&server, id)),
      &SyntheticDevices::new(true, true),
      Arc::new(network.factory(id)),
    )
    .await
    .unwrap();
    handles.push(handle);
  }

  let connected = tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      let mut all = true;
      for handle in &handles {
        let states = handle.connection_states().await.unwrap();
        all &= states.len() == 1 && states[0].1 == ConnectionState::Connected;
      }
      if all {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await;
  assert!(connected.is_ok(), "peers never connected over the signaling server");

  handles[0].leave().await;
  let dropped = tokio::time::timeout(Duration::from_secs(5), async {
    while handles[1].participants().len() != 1 {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await;
  assert!(dropped.is_ok(), "bob still lists alice");
  assert!(handles[1].connection_states().await.unwrap().is_empty());

  handles[1].leave().await;
}

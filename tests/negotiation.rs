use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use confer::config::RetryPolicy;
use confer::media::{LocalTrack, TrackKind};
use confer::peer::sim::{sdp_origin, SimNetwork};
use confer::peer::{ConnectionState, PeerConnectionManager, PeerEvent, RemoteTrack};
use confer::protocol::{Envelope, SdpKind, SignalingMessage};

struct Node {
  id: String,
  manager: PeerConnectionManager,
  outbound: mpsc::UnboundedReceiver<SignalingMessage>,
  events: mpsc::UnboundedReceiver<PeerEvent>,
  pending_events: VecDeque<PeerEvent>,
  /// Incoming envelopes, one FIFO queue per sender.
  inbox: HashMap<String, VecDeque<Envelope>>,
  tracks: Vec<(String, RemoteTrack)>,
}

impl Node {
  fn new(network: &SimNetwork, id: &str) -> Self {
    let (tx, outbound) = mpsc::unbounded_channel();
    let (mut manager, events) =
      PeerConnectionManager::new(id, Arc::new(network.factory(id)), tx, RetryPolicy::immediate());
    manager.set_local_tracks(vec![LocalTrack::new(TrackKind::Audio, &format!("stream-{id}"))]);
    Self {
      id: id.to_string(),
      manager,
      outbound,
      events,
      pending_events: VecDeque::new(),
      inbox: HashMap::new(),
      tracks: Vec::new(),
    }
  }
}

enum Step {
  Deliver(usize, String),
  Event(usize),
}

/// Moves everything the managers emitted into the recipients' inboxes and
/// collects pending peer events.
fn route(nodes: &mut [Node]) {
  let mut envelopes = Vec::new();
  for node in nodes.iter_mut() {
    while let Ok(message) = node.outbound.try_recv() {
      if let SignalingMessage::Negotiation(envelope) = message {
        envelopes.push(envelope);
      }
    }
    while let Ok(event) = node.events.try_recv() {
      node.pending_events.push_back(event);
    }
  }
  for envelope in envelopes {
    if let Some(node) = nodes.iter_mut().find(|node| node.id == envelope.to) {
      node.inbox.entry(envelope.from.clone()).or_default().push_back(envelope);
    }
  }
}

fn pending_steps(nodes: &[Node]) -> Vec<Step> {
  let mut steps = Vec::new();
  for (index, node) in nodes.iter().enumerate() {
    for (from, queue) in &node.inbox {
      if !queue.is_empty() {
        steps.push(Step::Deliver(index, from.clone()));
      }
    }
    if !node.pending_events.is_empty() {
      steps.push(Step::Event(index));
    }
  }
  steps
}

fn converged(network: &SimNetwork, nodes: &[Node]) -> bool {
  nodes.iter().all(|a| {
    a.manager.connection_count() == nodes.len() - 1
      && nodes
        .iter()
        .filter(|b| b.id != a.id)
        .all(|b| network.connection_state(&a.id, &b.id) == Some(ConnectionState::Connected))
  })
}

/// Every node connects to every other node at once, then messages and peer
/// events are delivered in a random order that keeps each sender's messages
/// in sequence.
async fn run_mesh(seed: u64, ids: &[&str]) -> (SimNetwork, Vec<Node>) {
  let mut rng = StdRng::seed_from_u64(seed);
  let network = SimNetwork::new();
  let mut nodes: Vec<Node> = ids.iter().map(|id| Node::new(&network, id)).collect();

  for a in 0..nodes.len() {
    for b in 0..nodes.len() {
      if a != b {
        let remote = nodes[b].id.clone();
        nodes[a].manager.connect(&remote).await.unwrap();
      }
    }
  }

  for _ in 0..5_000 {
    route(&mut nodes);
    let steps = pending_steps(&nodes);
    if steps.is_empty() {
      if converged(&network, &nodes) {
        return (network, nodes);
      }
      // Only delayed re-offers can still be outstanding.
      tokio::time::sleep(Duration::from_millis(10)).await;
      continue;
    }

    match &steps[rng.gen_range(0..steps.len())] {
      Step::Deliver(index, from) => {
        let node = &mut nodes[*index];
        let Some(envelope) = node.inbox.get_mut(from).and_then(|queue| queue.pop_front()) else {
          continue;
        };
        node.manager.handle_signal(envelope).await.unwrap();
      }
      Step::Event(index) => {
        let node = &mut nodes[*index];
        let Some(event) = node.pending_events.pop_front() else { continue };
        let from = event.participant_id.clone();
        if let Some(track) = node.manager.handle_event(event).await.unwrap() {
          node.tracks.push((from, track));
        }
      }
    }
  }
  panic!("seed {seed}: negotiation did not converge");
}

#[tokio::test]
async fn test_simultaneous_connect_converges_for_two() {
  for seed in 0..40 {
    let (network, nodes) = run_mesh(seed, &["alice", "bob"]).await;

    for node in &nodes {
      assert_eq!(node.manager.connection_count(), 1, "seed {seed}");
    }
    // Both ends agree on the descriptions they exchanged.
    assert_eq!(
      network.local_description("alice", "bob"),
      network.remote_description("bob", "alice"),
      "seed {seed}"
    );
    assert_eq!(
      network.remote_description("alice", "bob"),
      network.local_description("bob", "alice"),
      "seed {seed}"
    );
    // Whatever collided, the surviving negotiation is alice's offer.
    let offer = network.remote_description("bob", "alice").expect("bob holds an offer");
    assert_eq!(offer.kind, SdpKind::Offer, "seed {seed}");
    assert_eq!(sdp_origin(&offer.sdp), Some("alice"), "seed {seed}");
  }
}

#[tokio::test]
async fn test_simultaneous_connect_converges_for_four() {
  for seed in 100..120 {
    let (network, nodes) = run_mesh(seed, &["dave", "alice", "carol", "bob"]).await;

    for node in &nodes {
      assert_eq!(node.manager.connection_count(), 3, "seed {seed}");
      assert_eq!(network.open_links(&node.id), 3, "seed {seed}");

      // Each peer's audio shows up exactly once on the current connection.
      for other in nodes.iter().filter(|other| other.id != node.id) {
        let received: Vec<_> = node.tracks.iter().filter(|(from, _)| *from == other.id).collect();
        assert_eq!(received.len(), 1, "seed {seed}: {} from {}", node.id, other.id);
        assert_eq!(received[0].1.stream_id, format!("stream-{}", other.id));
        assert_eq!(received[0].1.kind, TrackKind::Audio);
      }
    }
  }
}

#[tokio::test]
async fn test_rejoin_after_close_negotiates_fresh_connection() {
  let (network, mut nodes) = run_mesh(7, &["alice", "bob"]).await;

  // bob leaves and comes back with a new manager.
  nodes[1].manager.close_all().await;
  assert_eq!(
    network.connection_state("alice", "bob"),
    Some(ConnectionState::Disconnected)
  );
  nodes[0].manager.close_connection("bob").await;

  nodes[1] = Node::new(&network, "bob");
  nodes[0].manager.connect("bob").await.unwrap();
  nodes[1].manager.connect("alice").await.unwrap();

  let mut rng = StdRng::seed_from_u64(7);
  for _ in 0..1_000 {
    route(&mut nodes);
    let steps = pending_steps(&nodes);
    if steps.is_empty() {
      break;
    }
    match &steps[rng.gen_range(0..steps.len())] {
      Step::Deliver(index, from) => {
        let node = &mut nodes[*index];
        if let Some(envelope) = node.inbox.get_mut(from).and_then(|queue| queue.pop_front()) {
          node.manager.handle_signal(envelope).await.unwrap();
        }
      }
      Step::Event(index) => {
        let node = &mut nodes[*index];
        if let Some(event) = node.pending_events.pop_front() {
          node.manager.handle_event(event).await.unwrap();
        }
      }
    }
  }

  assert!(converged(&network, &nodes));
  assert_eq!(nodes[0].manager.generation("bob"), Some(2));
}

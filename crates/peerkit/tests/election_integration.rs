//! Host election across several peers sharing one in-memory hub.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    as_host_observer, connected_ids, start_manager, start_manager_with_transport, wait_for,
    Recorder,
};
use peerkit::infrastructure::transport::memory::MemoryHub;
use peerkit::{HostElection, HostRole, PeerTransport};
use peerkit_core::{encode_event, HostEvent, PeerId, PeerIdentity, HOST_SELECTOR_EVENT};

fn host_id(election: &HostElection) -> Option<PeerId> {
    election.host().map(|h| h.id())
}

fn elect(hub: &MemoryHub, name: &str, token: &str) -> Arc<HostElection> {
    HostElection::attach(start_manager(hub, name, token))
}

fn both_connected(a: &HostElection, b: &HostElection) -> bool {
    a.session().connected_peers().len() == 1 && b.session().connected_peers().len() == 1
}

#[tokio::test]
async fn test_late_joiner_learns_existing_host() {
    // Arrange
    let hub = MemoryHub::new();
    let a = elect(&hub, "a", "t1");
    let b = elect(&hub, "b", "t2");
    let a_id = a.session().my_identity().id();
    wait_for("a and b connected", || both_connected(&a, &b)).await;

    // Act
    a.make_me_host();
    wait_for("b follows a", || host_id(&b) == Some(a_id)).await;
    let c = elect(&hub, "c", "t3");

    // Assert
    wait_for("c follows a", || host_id(&c) == Some(a_id)).await;
    assert_eq!(a.role(), HostRole::IAmHost);
    assert!(matches!(b.role(), HostRole::PeerIsHost(ref h) if h.id() == a_id));
    assert!(a.host_start_time().is_some());
}

#[tokio::test]
async fn test_earlier_claim_wins_over_later_claim() {
    // Arrange
    let hub = MemoryHub::new();
    let a = elect(&hub, "a", "t1");
    let b = elect(&hub, "b", "t2");
    let b_id = b.session().my_identity().id();
    wait_for("connected", || both_connected(&a, &b)).await;

    // Act
    a.make_me_host_at(100.0);
    b.make_me_host_at(50.0);

    // Assert
    wait_for("both agree on b", || {
        host_id(&a) == Some(b_id) && host_id(&b) == Some(b_id)
    })
    .await;
    assert!(b.is_host());
    assert!(!a.is_host());
}

#[tokio::test]
async fn test_equal_claims_resolve_to_lower_peer_id() {
    // Arrange
    let hub = MemoryHub::new();
    let a = elect(&hub, "a", "t1");
    let b = elect(&hub, "b", "t2");
    wait_for("connected", || both_connected(&a, &b)).await;
    let lower = a.session().my_identity().id().min(b.session().my_identity().id());

    // Act
    a.make_me_host_at(75.0);
    b.make_me_host_at(75.0);

    // Assert
    wait_for("tie resolved", || {
        host_id(&a) == Some(lower) && host_id(&b) == Some(lower)
    })
    .await;
}

#[tokio::test]
async fn test_three_peers_follow_host_then_clear_when_it_leaves() {
    // Arrange
    let hub = MemoryHub::new();
    let (a_session, a_transport) = start_manager_with_transport(&hub, "a", "t1");
    let a = HostElection::attach(a_session);
    let b = elect(&hub, "b", "t2");
    let c = elect(&hub, "c", "t3");
    let a_id = a.session().my_identity().id();
    wait_for("full mesh", || {
        [&a, &b, &c]
            .iter()
            .all(|e| e.session().connected_peers().len() == 2)
    })
    .await;

    a.make_me_host();
    wait_for("b and c follow a", || {
        host_id(&b) == Some(a_id) && host_id(&c) == Some(a_id)
    })
    .await;
    let b_seen = Arc::new(Recorder::default());
    let c_seen = Arc::new(Recorder::default());
    b.add_host_observer(Arc::downgrade(&as_host_observer(&b_seen)));
    c.add_host_observer(Arc::downgrade(&as_host_observer(&c_seen)));

    // Act
    a_transport.disconnect();

    // Assert
    wait_for("b and c drop the host", || b.host().is_none() && c.host().is_none()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for (election, seen) in [(&b, &b_seen), (&c, &c_seen)] {
        assert_eq!(seen.host_updates(), vec![None], "exactly one host change");
        assert_eq!(election.role(), HostRole::NoHost);
        assert!(!connected_ids(election.session()).contains(&a_id));
        assert_eq!(election.session().connected_peers().len(), 1);
    }
}

#[tokio::test]
async fn test_host_leaving_clears_host_everywhere() {
    // Arrange
    let hub = MemoryHub::new();
    let a = elect(&hub, "a", "t1");
    let b = elect(&hub, "b", "t2");
    let a_id = a.session().my_identity().id();
    wait_for("connected", || both_connected(&a, &b)).await;
    a.make_me_host();
    wait_for("b follows a", || host_id(&b) == Some(a_id)).await;

    let recorder = Arc::new(Recorder::default());
    b.add_host_observer(Arc::downgrade(&as_host_observer(&recorder)));

    // Act
    hub.suspend(a_id);

    // Assert
    wait_for("b has no host", || b.host().is_none()).await;
    assert_eq!(recorder.host_updates(), vec![None]);
    assert_eq!(b.role(), HostRole::NoHost);
}

#[tokio::test]
async fn test_announcement_from_unreachable_peer_clears_host() {
    // Arrange
    let hub = MemoryHub::new();
    let a = elect(&hub, "a", "t1");
    let b = elect(&hub, "b", "t2");
    let a_id = a.session().my_identity().id();
    wait_for("connected", || connected_ids(b.session()) == vec![a_id]).await;
    wait_for("connected back", || both_connected(&a, &b)).await;
    a.make_me_host();
    wait_for("b follows a", || host_id(&b) == Some(a_id)).await;

    let recorder = Arc::new(Recorder::default());
    b.add_host_observer(Arc::downgrade(&as_host_observer(&recorder)));
    let stranger = PeerIdentity::local("stranger");
    let claim = encode_event(HOST_SELECTOR_EVENT, &HostEvent::announce(1.0)).expect("encode");

    // Act
    hub.inject_data(b.session().my_identity().id(), &stranger, claim);

    // Assert
    wait_for("host cleared", || b.host().is_none()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.host_updates(), vec![None]);
}

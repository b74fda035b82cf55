// Multi-node cluster integration tests
//
// Each test runs a small cluster of real nodes on loopback with tightened
// timers. Count-sensitive tests run encrypted with a per-test key so stray
// datagrams from other tests (e.g. gossip aimed at a recycled port) are
// rejected at the codec instead of polluting the membership view.

use rusty_mesh::net::codec::{encode_message, PacketCodec};
use rusty_mesh::net::{MessageKind, Suspect};
use rusty_mesh::{Delegate, Member, MemberState, Membership, MembershipConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn node_config(name: &str, secret_key: Option<[u8; 16]>) -> MembershipConfig {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();

    let mut config = MembershipConfig::local();
    config.name = name.to_string();
    config.bind_port = 0;
    config.probe_interval = Duration::from_millis(100);
    config.probe_timeout = Duration::from_millis(30);
    config.gossip_interval = Duration::from_millis(30);
    config.push_pull_interval = Duration::from_millis(500);
    config.suspicion_mult = 2;
    config.gossip_to_the_dead_time = Duration::from_secs(10);
    config.secret_key = secret_key.map(|k| k.to_vec());
    config
}

/// Poll `check` every 20ms until it passes or the deadline elapses.
async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn member_names(members: &[Member]) -> Vec<String> {
    let mut names: Vec<String> = members.iter().map(|m| m.name.clone()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_three_node_join_converges() {
    let key = Some([11u8; 16]);
    let a = Membership::create(node_config("a", key)).await.unwrap();
    let b = Membership::create(node_config("b", key)).await.unwrap();
    let c = Membership::create(node_config("c", key)).await.unwrap();

    let seed = a.advertise_addr().to_string();
    assert_eq!(b.join(&[seed.clone()]).await.unwrap(), 1);
    assert_eq!(c.join(&[seed]).await.unwrap(), 1);

    // b and c joined through a; everyone converges on a 3-member view
    // through gossip and push/pull
    let converged = wait_until(Duration::from_secs(10), || {
        a.num_members() == 3 && b.num_members() == 3 && c.num_members() == 3
    })
    .await;
    assert!(converged, "cluster did not converge to 3 members");

    assert_eq!(member_names(&a.members()), vec!["a", "b", "c"]);
    assert_eq!(member_names(&b.members()), vec!["a", "b", "c"]);
    assert_eq!(member_names(&c.members()), vec!["a", "b", "c"]);

    for node in [a, b, c] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_failure_detection_removes_dead_node() {
    let key = Some([22u8; 16]);
    let a = Membership::create(node_config("a", key)).await.unwrap();
    let b = Membership::create(node_config("b", key)).await.unwrap();
    let c = Membership::create(node_config("c", key)).await.unwrap();

    let seed = a.advertise_addr().to_string();
    b.join(&[seed.clone()]).await.unwrap();
    c.join(&[seed]).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.num_members() == 3 && b.num_members() == 3 && c.num_members() == 3
        })
        .await
    );

    // Hard-kill b: no leave broadcast, peers must detect via probing
    b.shutdown().await.unwrap();

    let detected = wait_until(Duration::from_secs(10), || {
        a.num_members() == 2 && c.num_members() == 2
    })
    .await;
    assert!(detected, "survivors did not detect the dead node");

    assert_eq!(member_names(&a.members()), vec!["a", "c"]);

    a.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leave_broadcasts_departure() {
    let key = Some([33u8; 16]);
    let a = Membership::create(node_config("a", key)).await.unwrap();
    let b = Membership::create(node_config("b", key)).await.unwrap();

    b.join(&[a.advertise_addr().to_string()]).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.num_members() == 2 && b.num_members() == 2
        })
        .await
    );

    // Graceful departure blocks until the death rumor has been gossiped
    a.leave(Duration::from_secs(5)).await.unwrap();

    let observed = wait_until(Duration::from_secs(10), || b.num_members() == 1).await;
    assert!(observed, "peer did not observe the departure");
    assert_eq!(member_names(&b.members()), vec!["b"]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_suspicion_of_live_node_is_refuted() {
    let key = [44u8; 16];
    let a = Membership::create(node_config("a", Some(key))).await.unwrap();
    let b = Membership::create(node_config("b", Some(key))).await.unwrap();

    b.join(&[a.advertise_addr().to_string()]).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.num_members() == 2 && b.num_members() == 2
        })
        .await
    );

    // Inject a forged suspicion about a directly into its socket
    let codec = PacketCodec::new(Some(key.as_slice())).unwrap();
    let rumor = encode_message(
        MessageKind::Suspect,
        &Suspect {
            incarnation: 0,
            node: "a".to_string(),
            from: "x".to_string(),
        },
    )
    .unwrap();
    let packet = codec.seal(&rumor).unwrap();
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&packet, a.advertise_addr()).await.unwrap();

    // a refutes with a strictly greater incarnation and stays alive
    let refuted = wait_until(Duration::from_secs(5), || {
        a.local_member().incarnation >= 1 && a.local_member().state == MemberState::Alive
    })
    .await;
    assert!(refuted, "node did not refute the forged suspicion");

    // Observers never see a leave the cluster
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(b.num_members(), 2);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

struct RecordingDelegate {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Delegate for RecordingDelegate {
    fn notify_msg(&self, msg: &[u8]) {
        self.received.lock().unwrap().push(msg.to_vec());
    }
}

#[tokio::test]
async fn test_user_messages_reach_remote_delegate() {
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut receiver_config = node_config("receiver", None);
    receiver_config.delegate = Some(Arc::new(RecordingDelegate {
        received: received.clone(),
    }));
    let receiver = Membership::create(receiver_config).await.unwrap();
    let sender = Membership::create(node_config("sender", None)).await.unwrap();

    sender
        .send_to(receiver.advertise_addr(), b"hello mesh")
        .await
        .unwrap();

    let delivered = wait_until(Duration::from_secs(5), || {
        received.lock().unwrap().iter().any(|m| m == b"hello mesh")
    })
    .await;
    assert!(delivered, "user message was not delivered");

    sender.shutdown().await.unwrap();
    receiver.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_via_member_record_send_to_udp() {
    let a = Membership::create(node_config("a", None)).await.unwrap();
    let b = Membership::create(node_config("b", None)).await.unwrap();

    b.join(&[a.advertise_addr().to_string()]).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            b.members().iter().any(|m| m.name == "a")
        })
        .await
    );

    // send_to_udp resolves the address from the member record
    let target = b
        .members()
        .into_iter()
        .find(|m| m.name == "a")
        .expect("a is in b's view");
    b.send_to_udp(&target, b"ping over records").await.unwrap();

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

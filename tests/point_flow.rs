//! End-to-end point scenarios over in-memory collaborators: a scripted
//! switch on one side and a scripted device on the other.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use overlan::config::{InterfaceConfig, PointConfig, Protocol, Provider};
use overlan::device::{DeviceMode, DeviceOpener, MemoryDevice, MemoryDeviceHandle, TapDevice};
use overlan::packet::arp::{ArpOperation, ArpPacket};
use overlan::packet::frame::{action, Frame};
use overlan::point::{ConnState, PointListener};
use overlan::route::PrefixRule;
use overlan::transport::{MemorySwitch, MemoryTransport};
use overlan::Point;

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> PointConfig {
    PointConfig {
        connection: "switch.test:10002".into(),
        protocol: Protocol::Tcp,
        username: "alice".into(),
        password: "secret".into(),
        network: "private".into(),
        alias: "test-point".into(),
        request_addr: true,
        interface: InterfaceConfig {
            name: "mem0".into(),
            provider: Provider::Tun,
            address: String::new(),
            mtu: 1514,
        },
        timeout: 30,
        crypt: Default::default(),
    }
}

fn memory_opener(handle: &MemoryDeviceHandle) -> DeviceOpener {
    let handle = handle.clone();
    Box::new(move || Ok(Arc::new(handle.attach("mem0", DeviceMode::Tun, 1514)) as Arc<dyn TapDevice>))
}

/// Wait for the next control frame with the given action, skipping pings
/// and data frames.
async fn expect_control(switch: &MemorySwitch, want: &str) -> Value {
    let deadline = Instant::now() + WAIT;
    loop {
        assert!(Instant::now() < deadline, "no {want} frame from point");
        let Ok(Some(bytes)) = timeout(WAIT, switch.recv()).await else {
            panic!("switch link closed while waiting for {want}");
        };
        let frame = Frame::decode(bytes).expect("point sent malformed frame");
        if frame.action() == Some(want) {
            return serde_json::from_slice(frame.body()).unwrap_or(Value::Null);
        }
    }
}

/// Wait for the next non-control (Ethernet) frame.
async fn expect_data(switch: &MemorySwitch) -> Vec<u8> {
    let deadline = Instant::now() + WAIT;
    loop {
        assert!(Instant::now() < deadline, "no data frame from point");
        let Ok(Some(bytes)) = timeout(WAIT, switch.recv()).await else {
            panic!("switch link closed while waiting for data");
        };
        let frame = Frame::decode(bytes).expect("point sent malformed frame");
        if !frame.is_control() {
            return frame.into_vec();
        }
    }
}

async fn accept_login(switch: &MemorySwitch) -> Value {
    let credential = expect_control(switch, action::LOGIN).await;
    switch
        .send(Frame::response(action::LOGIN, b"okay").unwrap().into_vec())
        .await;
    credential
}

async fn grant_lease(switch: &MemorySwitch, body: &str) {
    expect_control(switch, action::IPADDR).await;
    switch
        .send(
            Frame::response(action::IPADDR, body.as_bytes())
                .unwrap()
                .into_vec(),
        )
        .await;
}

async fn wait_state(point: &Point, want: ConnState) {
    let deadline = Instant::now() + WAIT;
    while point.state() != want {
        assert!(
            Instant::now() < deadline,
            "state stuck at {} waiting for {want}",
            point.state()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[derive(Default)]
struct RecordingListener {
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    routes_added: Mutex<Vec<PrefixRule>>,
    routes_removed: Mutex<Vec<PrefixRule>>,
}

impl PointListener for RecordingListener {
    fn add_address(&self, addr: &str) {
        self.added.lock().unwrap().push(addr.to_string());
    }
    fn del_address(&self, addr: &str) {
        self.removed.lock().unwrap().push(addr.to_string());
    }
    fn add_routes(&self, routes: &[PrefixRule]) {
        self.routes_added.lock().unwrap().extend_from_slice(routes);
    }
    fn del_routes(&self, routes: &[PrefixRule]) {
        self.routes_removed
            .lock()
            .unwrap()
            .extend_from_slice(routes);
    }
}

const LEASE_BODY: &str = r#"{
    "address": "192.168.30.5",
    "netmask": "255.255.255.0",
    "routes": [{"prefix": "10.0.0.0/8", "nexthop": "192.168.30.1"}]
}"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_lease_and_apply() {
    let (transport, switch) = MemoryTransport::pair();
    let (_device, handle) = MemoryDevice::pair("mem0", DeviceMode::Tun, 1514);

    let point = Point::new(test_config());
    let listener = Arc::new(RecordingListener::default());
    point.set_listener(listener.clone());
    point
        .start_with(Arc::new(transport), memory_opener(&handle))
        .await
        .unwrap();

    // Login carries the configured credentials and the generated UUID.
    let credential = accept_login(&switch).await;
    assert_eq!(credential["name"], "alice");
    assert_eq!(credential["network"], "private");
    assert_eq!(credential["uuid"], point.uuid());

    wait_state(&point, ConnState::Authenticated).await;

    // An address was requested, so a lease request follows; grant it.
    grant_lease(&switch, LEASE_BODY).await;

    let deadline = Instant::now() + WAIT;
    while listener.added.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "lease never applied");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(listener.added.lock().unwrap()[0], "192.168.30.5/24");
    assert_eq!(listener.routes_added.lock().unwrap().len(), 1);
    assert_eq!(point.address().as_deref(), Some("192.168.30.5/24"));

    point.stop().await;

    // Stop is graceful: a left notification reaches the switch.
    expect_control(&switch, action::LEFT).await;
    assert_eq!(point.state(), ConnState::Terminal);
    assert_eq!(point.uptime(), Duration::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_after_read_error_with_backoff_reset() {
    let (transport, switch) = MemoryTransport::pair();
    let (_device, handle) = MemoryDevice::pair("mem0", DeviceMode::Tun, 1514);

    let point = Point::new(test_config());
    point
        .start_with(Arc::new(transport), memory_opener(&handle))
        .await
        .unwrap();

    accept_login(&switch).await;
    grant_lease(&switch, LEASE_BODY).await;
    wait_state(&point, ConnState::Authenticated).await;
    assert_eq!(switch.connect_count(), 1);

    // First failure: the read loop errors, one reconnect is scheduled with
    // the minimum 5s delay (plus up to one 2s tick).
    let failed_at = Instant::now();
    switch.inject_read_error("reset by peer").await;
    accept_login(&switch).await;
    wait_state(&point, ConnState::Authenticated).await;
    let first_gap = failed_at.elapsed();
    assert_eq!(switch.connect_count(), 2);
    assert!(
        first_gap >= Duration::from_secs(4),
        "reconnected too fast: {first_gap:?}"
    );
    assert!(
        first_gap < Duration::from_secs(9),
        "reconnected too slow: {first_gap:?}"
    );

    // Authentication reset the backoff counter, so the next failure is
    // again a ~5s gap, not a continuation of the prior count.
    let failed_at = Instant::now();
    switch.inject_read_error("reset again").await;
    accept_login(&switch).await;
    wait_state(&point, ConnState::Authenticated).await;
    let second_gap = failed_at.elapsed();
    assert_eq!(switch.connect_count(), 3);
    assert!(
        second_gap < Duration::from_secs(9),
        "backoff did not reset: {second_gap:?}"
    );

    point.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tun_traffic_resolves_neighbors_end_to_end() {
    let (transport, switch) = MemoryTransport::pair();
    let (_device, handle) = MemoryDevice::pair("mem0", DeviceMode::Tun, 1514);

    let point = Point::new(test_config());
    point
        .start_with(Arc::new(transport), memory_opener(&handle))
        .await
        .unwrap();

    accept_login(&switch).await;
    grant_lease(&switch, LEASE_BODY).await;
    wait_state(&point, ConnState::Authenticated).await;

    let peer_ip = Ipv4Addr::new(192, 168, 30, 9);
    let peer_mac = [0x02, 0x55, 0x66, 0x77, 0x88, 0x99];

    // A packet to an unresolved destination triggers an ARP request and is
    // itself dropped.
    let mut packet = vec![0u8; 60];
    packet[0] = 0x45;
    packet[16..20].copy_from_slice(&peer_ip.octets());
    handle.inject(packet.clone());

    let wire = expect_data(&switch).await;
    let arp = ArpPacket::parse(&wire).expect("expected ARP request");
    assert_eq!(arp.operation, ArpOperation::Request);
    assert_eq!(arp.target_ip, peer_ip);
    assert_eq!(arp.sender_ip, Ipv4Addr::new(192, 168, 30, 5));

    // The peer's reply teaches the point the binding.
    let reply = ArpPacket::reply(peer_mac, peer_ip, arp.sender_mac, arp.sender_ip).to_vec();
    switch.send(reply).await;

    // Retried traffic now goes out as a synthesized Ethernet frame.
    let deadline = Instant::now() + WAIT;
    let frame = loop {
        assert!(Instant::now() < deadline, "traffic never resolved");
        handle.inject(packet.clone());
        let wire = expect_data(&switch).await;
        if ArpPacket::parse(&wire).is_none() {
            break wire;
        }
    };
    assert_eq!(&frame[..6], &peer_mac);
    assert_eq!(&frame[14..], packet.as_slice());

    point.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_sign_in_tears_down_lease() {
    let (transport, switch) = MemoryTransport::pair();
    let (_device, handle) = MemoryDevice::pair("mem0", DeviceMode::Tun, 1514);

    let point = Point::new(test_config());
    let listener = Arc::new(RecordingListener::default());
    point.set_listener(listener.clone());
    point
        .start_with(Arc::new(transport), memory_opener(&handle))
        .await
        .unwrap();

    accept_login(&switch).await;
    grant_lease(&switch, LEASE_BODY).await;
    wait_state(&point, ConnState::Authenticated).await;

    // The switch demands a fresh sign-in and rejects it this time.
    switch
        .send(Frame::request(action::SIGNIN, b"{}").unwrap().into_vec())
        .await;
    expect_control(&switch, action::LOGIN).await;
    switch
        .send(
            Frame::response(action::LOGIN, b"user or password invalid")
                .unwrap()
                .into_vec(),
        )
        .await;

    wait_state(&point, ConnState::UnAuthenticated).await;

    // The applied address and routes were torn down.
    let deadline = Instant::now() + WAIT;
    while listener.removed.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "lease never torn down");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(listener.removed.lock().unwrap()[0], "192.168.30.5/24");
    assert_eq!(listener.routes_removed.lock().unwrap().len(), 1);

    point.stop().await;
}

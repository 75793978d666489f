use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::commands::Command;
use super::{Policy, Supervisor};
use crate::ap::ApClient;
use crate::capture::CaptureScheduler;
use crate::config::CaptureConfig;
use crate::crypt::CryptStore;
use crate::db::Database;
use crate::metrics::Metrics;
use crate::nft::NetfilterController;
use crate::sock::split_tokens;
use crate::state::{IfaceConfig, MacAddr, StateStore};
use crate::timers::TimerQueue;

fn iface(vlanid: u16, third_octet: u8) -> IfaceConfig {
    IfaceConfig {
        vlanid,
        ifname: format!("if{}", vlanid),
        ip: format!("10.0.{}.1", third_octet).parse().unwrap(),
        brd: format!("10.0.{}.255", third_octet).parse().unwrap(),
        netmask: "255.255.255.0".parse().unwrap(),
    }
}

fn policy() -> Policy {
    Policy {
        allow_all_connections: false,
        allow_all_nat: false,
        default_open_vlanid: 1,
        wpa_passphrase: "open-sesame".to_string(),
        exec_capture: false,
        ticket_ttl: Duration::from_secs(60),
        ticket_passphrase_len: 16,
        dhcp_lease_file: None,
    }
}

async fn supervisor_with(policy: Policy) -> Arc<Supervisor> {
    let ifaces = vec![iface(1, 1), iface(3, 3), iface(7, 7)];
    let db = Database::open_in_memory().await.unwrap();
    let crypt = CryptStore::new(db.clone(), Some(b"test-master".to_vec()));
    let ap = ApClient::new("/nonexistent/hostapd.sock".into(), Duration::from_millis(50));
    let nft = NetfilterController::new("eth0", false);
    let capture = CaptureScheduler::new(
        CaptureConfig::default(),
        "/tmp/edgesec-test.db".into(),
        "/tmp/edgesec-test.sock".into(),
    );

    Supervisor::new(
        policy,
        StateStore::new(&ifaces),
        db,
        crypt,
        ap,
        nft,
        capture,
        Arc::new(TimerQueue::new()),
        Metrics::new().unwrap(),
    )
}

async fn supervisor() -> Arc<Supervisor> {
    supervisor_with(policy()).await
}

async fn cmd(sup: &Supervisor, line: &str) -> String {
    let tokens = split_tokens(line);
    let command = Command::parse(&tokens).expect("test command must parse");
    sup.handle_command(command, Some(PathBuf::from("/tmp/test-client.sock")))
        .await
}

fn mac(s: &str) -> MacAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_accept_then_get_map() {
    let sup = supervisor().await;

    assert_eq!(cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await, "OK");

    let row = cmd(&sup, "GET_MAP aa:bb:cc:dd:ee:ff").await;
    assert!(row.contains("aa:bb:cc:dd:ee:ff"));
    assert!(row.contains("vlan=3"));
    assert!(row.contains("if=if3"));
}

#[tokio::test]
async fn test_accept_unknown_vlan_fails_without_state_change() {
    let sup = supervisor().await;

    // VLAN 9 has no configured interface.
    assert_eq!(cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 9").await, "FAIL");
    assert_eq!(cmd(&sup, "GET_MAP aa:bb:cc:dd:ee:ff").await, "FAIL");
}

#[tokio::test]
async fn test_last_command_per_mac_wins() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    cmd(&sup, "DENY_MAC aa:bb:cc:dd:ee:ff").await;
    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 7").await;

    cmd(&sup, "ACCEPT_MAC 11:22:33:44:55:66 7").await;
    cmd(&sup, "DENY_MAC 11:22:33:44:55:66").await;

    let first = cmd(&sup, "GET_MAP aa:bb:cc:dd:ee:ff").await;
    assert!(first.contains("allow=true"));
    assert!(first.contains("vlan=7"));

    let second = cmd(&sup, "GET_MAP 11:22:33:44:55:66").await;
    assert!(second.contains("allow=false"));

    let all = cmd(&sup, "GET_ALL").await;
    assert_eq!(all.lines().count(), 2);
}

#[tokio::test]
async fn test_nat_toggle_idempotence() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    assert_eq!(cmd(&sup, "SET_IP add aa:bb:cc:dd:ee:ff 10.0.3.7").await, "OK");

    assert_eq!(cmd(&sup, "ADD_NAT aa:bb:cc:dd:ee:ff").await, "OK");
    assert_eq!(cmd(&sup, "ADD_NAT aa:bb:cc:dd:ee:ff").await, "OK");

    sup.with_inner(|inner| {
        assert!(inner.nft.has_nat("10.0.3.7".parse().unwrap(), "if3"));
        assert_eq!(inner.nft.rule_count(), 1);
    })
    .await;

    assert_eq!(cmd(&sup, "REMOVE_NAT aa:bb:cc:dd:ee:ff").await, "OK");
    sup.with_inner(|inner| assert_eq!(inner.nft.rule_count(), 0)).await;
}

#[tokio::test]
async fn test_set_ip_installs_nat_for_nat_devices() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    // NAT flagged before any address is known.
    assert_eq!(cmd(&sup, "ADD_NAT aa:bb:cc:dd:ee:ff").await, "OK");
    sup.with_inner(|inner| assert_eq!(inner.nft.rule_count(), 0)).await;

    assert_eq!(cmd(&sup, "SET_IP add aa:bb:cc:dd:ee:ff 10.0.3.7").await, "OK");
    sup.with_inner(|inner| {
        assert!(inner.nft.has_nat("10.0.3.7".parse().unwrap(), "if3"));
    })
    .await;

    // The DHCP release clears the rule again.
    assert_eq!(cmd(&sup, "SET_IP del aa:bb:cc:dd:ee:ff 10.0.3.7").await, "OK");
    sup.with_inner(|inner| assert_eq!(inner.nft.rule_count(), 0)).await;

    let row = cmd(&sup, "GET_MAP aa:bb:cc:dd:ee:ff").await;
    assert!(row.contains("ip=-"));
}

#[tokio::test]
async fn test_set_ip_outside_known_subnets_fails() {
    let sup = supervisor().await;
    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    assert_eq!(
        cmd(&sup, "SET_IP add aa:bb:cc:dd:ee:ff 192.168.99.5").await,
        "FAIL"
    );
}

#[tokio::test]
async fn test_bridge_symmetry_and_rules() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    cmd(&sup, "SET_IP add aa:bb:cc:dd:ee:ff 10.0.3.7").await;
    cmd(&sup, "ACCEPT_MAC 11:22:33:44:55:66 7").await;
    cmd(&sup, "SET_IP add 11:22:33:44:55:66 10.0.7.9").await;

    assert_eq!(
        cmd(&sup, "ADD_BRIDGE aa:bb:cc:dd:ee:ff 11:22:33:44:55:66").await,
        "OK"
    );
    assert_eq!(
        cmd(&sup, "ADD_BRIDGE 11:22:33:44:55:66 aa:bb:cc:dd:ee:ff").await,
        "OK"
    );

    sup.with_inner(|inner| {
        assert_eq!(inner.nft.rule_count(), 1);
        assert_eq!(inner.state.bridges.edge_count(), 1);
    })
    .await;

    assert_eq!(
        cmd(&sup, "REMOVE_BRIDGE aa:bb:cc:dd:ee:ff 11:22:33:44:55:66").await,
        "OK"
    );
    sup.with_inner(|inner| assert_eq!(inner.nft.rule_count(), 0)).await;

    // Removing the reversed pair again is a no-op OK.
    assert_eq!(
        cmd(&sup, "REMOVE_BRIDGE 11:22:33:44:55:66 aa:bb:cc:dd:ee:ff").await,
        "OK"
    );
    sup.with_inner(|inner| assert_eq!(inner.state.bridges.edge_count(), 0)).await;
}

#[tokio::test]
async fn test_set_ip_refreshes_bridge_peer_rules() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    cmd(&sup, "ACCEPT_MAC 11:22:33:44:55:66 7").await;
    cmd(&sup, "SET_IP add 11:22:33:44:55:66 10.0.7.9").await;

    // Bridge exists but only one endpoint has an address yet.
    cmd(&sup, "ADD_BRIDGE aa:bb:cc:dd:ee:ff 11:22:33:44:55:66").await;
    sup.with_inner(|inner| assert_eq!(inner.nft.rule_count(), 0)).await;

    // The second endpoint's lease triggers the pair rule.
    cmd(&sup, "SET_IP add aa:bb:cc:dd:ee:ff 10.0.3.7").await;
    sup.with_inner(|inner| {
        assert!(inner.nft.has_bridge(
            ("10.0.3.7".parse().unwrap(), "if3"),
            ("10.0.7.9".parse().unwrap(), "if7"),
        ));
    })
    .await;

    cmd(&sup, "SET_IP del aa:bb:cc:dd:ee:ff 10.0.3.7").await;
    sup.with_inner(|inner| assert_eq!(inner.nft.rule_count(), 0)).await;
}

#[tokio::test]
async fn test_fingerprint_set_and_query() {
    let sup = supervisor().await;

    assert_eq!(
        cmd(
            &sup,
            "SET_FINGERPRINT aa:bb:cc:dd:ee:ff 11:22:33:44:55:66 dhcp 1,3,6,15 5000 host lease",
        )
        .await,
        "OK"
    );

    // The event appears once per endpoint MAC.
    let src_rows = cmd(&sup, "QUERY_FINGERPRINT aa:bb:cc:dd:ee:ff 0 >= all").await;
    assert_eq!(src_rows.lines().count(), 1);
    assert!(src_rows.contains("aa:bb:cc:dd:ee:ff,dhcp,1,3,6,15,5000,host lease"));

    let dst_rows = cmd(&sup, "QUERY_FINGERPRINT 11:22:33:44:55:66 0 >= all").await;
    assert_eq!(dst_rows.lines().count(), 1);
    assert!(dst_rows.contains("11:22:33:44:55:66"));

    // Window excluding the event, and a protocol filter miss.
    assert_eq!(
        cmd(&sup, "QUERY_FINGERPRINT aa:bb:cc:dd:ee:ff 5000 > all").await,
        "OK"
    );
    assert_eq!(
        cmd(&sup, "QUERY_FINGERPRINT aa:bb:cc:dd:ee:ff 0 >= dns").await,
        "OK"
    );
    // Protocol "all" is a wildcard, not a literal.
    assert_ne!(
        cmd(&sup, "QUERY_FINGERPRINT aa:bb:cc:dd:ee:ff 0 >= dhcp").await,
        "OK"
    );
}

#[tokio::test]
async fn test_ticket_single_and_adoption() {
    let sup = supervisor().await;

    let passphrase = cmd(&sup, "REGISTER_TICKET 11:22:33:44:55:66 guest 7").await;
    assert_eq!(passphrase.len(), 16);
    assert_ne!(passphrase, "FAIL");

    // Only one live ticket at a time.
    assert_eq!(
        cmd(&sup, "REGISTER_TICKET 11:22:33:44:55:66 other 3").await,
        "FAIL"
    );

    // The next unknown-MAC join adopts the ticket.
    let identity = sup.get_mac_conn(mac("aa:aa:aa:aa:aa:aa")).await.unwrap();
    assert_eq!(identity.vlan_id, 7);
    assert_eq!(identity.psk.as_deref(), Some(passphrase.as_bytes()));

    let row = cmd(&sup, "GET_MAP aa:aa:aa:aa:aa:aa").await;
    assert!(row.contains("label=guest"));
    assert!(row.contains("vlan=7"));

    // Ticket consumed: the following join falls back to the open VLAN.
    let fallback = sup.get_mac_conn(mac("bb:bb:bb:bb:bb:bb")).await.unwrap();
    assert_eq!(fallback.vlan_id, 1);
    assert_eq!(fallback.psk.as_deref(), Some(b"open-sesame".as_slice()));
}

#[tokio::test]
async fn test_ticket_expiry_falls_back_to_default_vlan() {
    let sup = supervisor().await;

    let passphrase = cmd(&sup, "REGISTER_TICKET 11:22:33:44:55:66 guest 7").await;
    assert_eq!(passphrase.len(), 16);

    sup.expire_ticket().await;

    let identity = sup.get_mac_conn(mac("aa:aa:aa:aa:aa:aa")).await.unwrap();
    assert_eq!(identity.vlan_id, 1);
    assert_eq!(identity.psk.as_deref(), Some(b"open-sesame".as_slice()));

    // The slot is free again.
    assert_ne!(
        cmd(&sup, "REGISTER_TICKET 11:22:33:44:55:66 guest 3").await,
        "FAIL"
    );
}

#[tokio::test]
async fn test_radius_flow_known_denied_and_assigned() {
    let sup = supervisor().await;

    // Assigned device with PSK.
    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    cmd(&sup, "ASSIGN_PSK aa:bb:cc:dd:ee:ff device-psk").await;
    let identity = sup.get_mac_conn(mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
    assert_eq!(identity.vlan_id, 3);
    assert_eq!(identity.psk.as_deref(), Some(b"device-psk".as_slice()));

    // Denied device.
    cmd(&sup, "DENY_MAC 11:22:33:44:55:66").await;
    assert!(sup.get_mac_conn(mac("11:22:33:44:55:66")).await.is_none());

    // Allowed device without a PSK falls into the unassigned path.
    cmd(&sup, "ACCEPT_MAC 22:22:22:22:22:22 3").await;
    let open = sup.get_mac_conn(mac("22:22:22:22:22:22")).await.unwrap();
    assert_eq!(open.vlan_id, 1);
    assert_eq!(open.psk.as_deref(), Some(b"open-sesame".as_slice()));
}

#[tokio::test]
async fn test_radius_salt_is_memoized_per_device() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    cmd(&sup, "ASSIGN_PSK aa:bb:cc:dd:ee:ff device-psk").await;

    let first = sup.get_mac_conn(mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
    let second = sup.get_mac_conn(mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
    assert_eq!(first.tunnel_salt, second.tunnel_salt);

    // A credential change invalidates the memoized chain.
    cmd(&sup, "ASSIGN_PSK aa:bb:cc:dd:ee:ff rotated-psk").await;
    let third = sup.get_mac_conn(mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
    assert_eq!(third.psk.as_deref(), Some(b"rotated-psk".as_slice()));
}

#[tokio::test]
async fn test_allow_all_policy() {
    let mut open_policy = policy();
    open_policy.allow_all_connections = true;
    let sup = supervisor_with(open_policy).await;

    let identity = sup.get_mac_conn(mac("aa:aa:aa:aa:aa:aa")).await.unwrap();
    assert_eq!(identity.vlan_id, 1);
    assert_eq!(identity.psk.as_deref(), Some(b"open-sesame".as_slice()));

    // Even a previously denied device gets in.
    cmd(&sup, "DENY_MAC aa:aa:aa:aa:aa:aa").await;
    assert!(sup.get_mac_conn(mac("aa:aa:aa:aa:aa:aa")).await.is_some());
}

#[tokio::test]
async fn test_psk_persisted_encrypted_and_reloaded() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    cmd(&sup, "ASSIGN_PSK aa:bb:cc:dd:ee:ff secret-psk").await;

    // Drop the in-memory copy, then reload from the database mirrors.
    sup.with_inner(|inner| {
        inner.state.mac_conns.clear();
    })
    .await;
    assert_eq!(cmd(&sup, "GET_MAP aa:bb:cc:dd:ee:ff").await, "FAIL");

    let count = sup.reload_from_db().await.unwrap();
    assert_eq!(count, 1);

    let identity = sup.get_mac_conn(mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
    assert_eq!(identity.psk.as_deref(), Some(b"secret-psk".as_slice()));
}

#[tokio::test]
async fn test_clear_psk_moves_device_to_open_path() {
    let sup = supervisor().await;

    cmd(&sup, "ACCEPT_MAC aa:bb:cc:dd:ee:ff 3").await;
    cmd(&sup, "ASSIGN_PSK aa:bb:cc:dd:ee:ff device-psk").await;
    assert_eq!(cmd(&sup, "CLEAR_PSK aa:bb:cc:dd:ee:ff").await, "OK");

    // Allowed but PSK-less devices take the default assignment.
    let identity = sup.get_mac_conn(mac("aa:bb:cc:dd:ee:ff")).await.unwrap();
    assert_eq!(identity.vlan_id, 1);
}

#[tokio::test]
async fn test_subscribe_requires_bound_client() {
    let sup = supervisor().await;
    let command = Command::parse(&split_tokens("SUBSCRIBE_EVENTS")).unwrap();
    assert_eq!(sup.handle_command(command.clone(), None).await, "FAIL");
    assert_eq!(
        sup.handle_command(command, Some(PathBuf::from("/tmp/sub.sock")))
            .await,
        "OK"
    );
}

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ipnet::Ipv4Net;
use netaudit_rs::error::ScanError;
use netaudit_rs::target::{expand_cidr_hosts, parse_target, resolve, TargetKind};

#[test]
fn cidr_target_is_recognised() {
    let spec = parse_target("10.0.0.0/30").expect("valid cidr");
    let net = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap();
    assert_eq!(spec.kind, TargetKind::Cidr(net));
    assert_eq!(
        expand_cidr_hosts(net),
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
}

#[tokio::test]
async fn cidr_resolves_to_one_target_per_host() {
    let spec = parse_target("192.168.7.0/29").unwrap();
    let targets = resolve(&spec, Duration::from_secs(1)).await.unwrap();
    assert_eq!(targets.len(), 6);
    assert!(targets.iter().all(|t| t.hostname.is_none()));
    assert_eq!(targets[0].ip, IpAddr::V4(Ipv4Addr::new(192, 168, 7, 1)));
}

#[tokio::test]
async fn localhost_resolves() {
    let spec = parse_target("localhost").unwrap();
    let targets = resolve(&spec, Duration::from_secs(5)).await.expect("localhost resolves");
    assert_eq!(targets[0].hostname.as_deref(), Some("localhost"));
    assert!(targets[0].ip.is_loopback());
}

#[tokio::test]
async fn unknown_name_is_unresolvable() {
    // `.invalid` is reserved and never resolves.
    let spec = parse_target("no-such-host.invalid").unwrap();
    let err = resolve(&spec, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, ScanError::UnresolvableTarget { .. }));
}

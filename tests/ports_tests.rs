use netaudit_rs::error::ScanError;
use netaudit_rs::ports::{expand, PortSpec};

#[test]
fn expands_mixed_list_in_ascending_order() {
    let ports = expand("80,443,1000-1002", false).expect("parse ok");
    assert_eq!(ports.as_slice(), &[80, 443, 1000, 1001, 1002]);
}

#[test]
fn output_is_strictly_ascending_for_overlapping_ranges() {
    let ports = PortSpec::parse("3000-3010,2995-3005,3003,1").expect("parse ok");
    assert!(ports.as_slice().windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ports.len(), 17);
}

#[test]
fn malformed_ranges_rejected() {
    for bad in ["80-", "70000", "5-2"] {
        assert!(matches!(expand(bad, false), Err(ScanError::InvalidPortRange(_))));
    }
}

#[test]
fn quick_scan_keeps_requested_common_ports() {
    let ports = expand("80,443,3306", true).expect("parse ok");
    assert_eq!(ports.as_slice(), &[80, 443, 3306]);
}

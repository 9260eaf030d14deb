//! Syntax checks for identifiers that arrive from outside the state layer.
//!
//! ## Accepted shapes
//!
//! - Machine ids: `0`, `12`, `1/lxc/0`, `1/lxc/0/kvm/3`; no leading zeros.
//! - Machine tags: `machine-` followed by the id with `/` written as `-`.
//! - Service names: lowercase, start with a letter, `-` separated, no
//!   all-digit segment after the first.
//! - Unit names: `<service>/<n>`.
//! - MAC addresses: six colon-separated pairs of hex digits.

use crate::types::{ContainerType, MachineId};

fn is_sequence(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

/// Whether `id` is a syntactically valid machine id.
pub fn is_valid_machine_id(id: &str) -> bool {
    let parts: Vec<&str> = id.split('/').collect();
    if parts.len() % 2 == 0 || !is_sequence(parts[0]) {
        return false;
    }
    parts[1..].chunks(2).all(|pair| match pair {
        [kind, seq] => {
            matches!(kind.parse::<ContainerType>(), Ok(ContainerType::Lxc | ContainerType::Kvm))
                && is_sequence(seq)
        },
        _ => false,
    })
}

/// Parses a machine tag (`machine-1-lxc-0`) into a machine id (`1/lxc/0`).
pub fn parse_machine_tag(tag: &str) -> Option<MachineId> {
    let rest = tag.strip_prefix("machine-")?;
    let id = rest.replace('-', "/");
    is_valid_machine_id(&id).then(|| MachineId::new(id))
}

/// Whether `name` is a syntactically valid service name.
pub fn is_valid_service_name(name: &str) -> bool {
    let mut segments = name.split('-');
    let Some(first) = segments.next() else {
        return false;
    };
    let segment_ok = |s: &str| {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    };
    if !segment_ok(first) || !first.as_bytes()[0].is_ascii_lowercase() {
        return false;
    }
    segments.all(|s| segment_ok(s) && s.bytes().any(|b| b.is_ascii_lowercase()))
}

/// Whether `name` is a syntactically valid unit name.
pub fn is_valid_unit_name(name: &str) -> bool {
    match name.split_once('/') {
        Some((service, seq)) => is_valid_service_name(service) && is_sequence(seq),
        None => false,
    }
}

/// Whether `mac` looks like `aa:bb:cc:dd:ee:ff`.
pub fn is_valid_mac_address(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts.iter().all(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_ids() {
        for ok in ["0", "1", "42", "1/lxc/0", "1/lxc/0/kvm/10"] {
            assert!(is_valid_machine_id(ok), "{ok} should be valid");
        }
        for bad in ["", "01", "-1", "1/lxc", "1/none/0", "1/lxc/01", "a", "1/docker/0"] {
            assert!(!is_valid_machine_id(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn test_parse_machine_tag() {
        assert_eq!(parse_machine_tag("machine-0"), Some(MachineId::new("0")));
        assert_eq!(parse_machine_tag("machine-1-lxc-2"), Some(MachineId::new("1/lxc/2")));
        assert_eq!(parse_machine_tag("unit-wordpress-0"), None);
        assert_eq!(parse_machine_tag("machine-"), None);
        assert_eq!(parse_machine_tag("machine-x"), None);
    }

    #[test]
    fn test_service_and_unit_names() {
        assert!(is_valid_service_name("wordpress"));
        assert!(is_valid_service_name("mysql-2a"));
        assert!(!is_valid_service_name("mysql-2"));
        assert!(!is_valid_service_name("2mysql"));
        assert!(!is_valid_service_name("Mysql"));
        assert!(!is_valid_service_name("mysql-"));
        assert!(is_valid_unit_name("wordpress/0"));
        assert!(!is_valid_unit_name("wordpress"));
        assert!(!is_valid_unit_name("wordpress/x"));
    }

    #[test]
    fn test_mac_addresses() {
        assert!(is_valid_mac_address("aa:bb:cc:dd:ee:f0"));
        assert!(!is_valid_mac_address(""));
        assert!(!is_valid_mac_address("aa:bb:cc:dd:ee"));
        assert!(!is_valid_mac_address("aa:bb:cc:dd:ee:fg"));
    }
}

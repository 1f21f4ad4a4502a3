//! Interface-name ordinals and the policy-routing tables derived from them.

/// Table id of the first secondary interface (`net1`)
pub const BASE_ROUTE_TABLE: u32 = 100;
/// Name of the pod's primary interface
pub const FIRST_INTERFACE: &str = "eth0";
/// Prefix shared by all secondary interfaces (`net1`, `net2`, ...)
pub const SECONDARY_PREFIX: &str = "net";
/// Kernel main routing table
pub const MAIN_TABLE: u32 = libc::RT_TABLE_MAIN as u32;

/// Routing table for a secondary interface: `net1` -> 100, `net2` -> 101.
///
/// Returns `None` when the name has no `net<number>` form.
pub fn route_table(iface: &str) -> Option<u32> {
    let ordinal: u32 = iface.strip_prefix(SECONDARY_PREFIX)?.parse().ok()?;
    BASE_ROUTE_TABLE.checked_add(ordinal)?.checked_sub(1)
}

/// Whether `current` sorts after `previous`.
///
/// The primary interface is always earliest. Otherwise both names must be
/// secondary interfaces, compared as plain strings (so `net10` sorts before
/// `net9`).
pub fn is_ordinal_advance(current: &str, previous: &str) -> bool {
    if previous == FIRST_INTERFACE {
        return true;
    }
    if !current.starts_with(SECONDARY_PREFIX) || !previous.starts_with(SECONDARY_PREFIX) {
        return false;
    }
    current >= previous
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_follow_ordinal() {
        assert_eq!(route_table("net1"), Some(100));
        assert_eq!(route_table("net2"), Some(101));
        assert_eq!(route_table("net12"), Some(111));
    }

    #[test]
    fn unmappable_names() {
        assert_eq!(route_table("eth0"), None);
        assert_eq!(route_table("net"), None);
        assert_eq!(route_table("netx"), None);
        assert_eq!(route_table("net1a"), None);
        assert_eq!(route_table("cali12345"), None);
        // suffix fits in u32 but the table id would not
        assert_eq!(route_table("net4294967295"), None);
        assert_eq!(route_table("net4294967195"), Some(u32::MAX - 1));
    }

    #[test]
    fn first_interface_is_earliest() {
        assert!(is_ordinal_advance("net1", "eth0"));
        assert!(is_ordinal_advance("net9", "eth0"));
        assert!(is_ordinal_advance("cali0", "eth0"));
    }

    #[test]
    fn secondary_names_compare_lexically() {
        assert!(is_ordinal_advance("net2", "net1"));
        assert!(!is_ordinal_advance("net1", "net2"));
        // string order, not numeric order
        assert!(!is_ordinal_advance("net10", "net9"));
        assert!(is_ordinal_advance("net9", "net10"));
    }

    #[test]
    fn unprefixed_names_never_advance() {
        assert!(!is_ordinal_advance("eth1", "net1"));
        assert!(!is_ordinal_advance("net1", "eth1"));
    }

    #[test]
    fn main_table_id() {
        assert_eq!(MAIN_TABLE, 254);
    }
}

use std::{fs, net::Ipv4Addr, path::Path};

/// Parse one dnsmasq lease line: `<expiry> <mac> <ip> <hostname> <client-id>`.
/// Only the MAC and IP are consumed; extra trailing tokens are fine.
fn parse_line(line: &str) -> Option<(String, Ipv4Addr)> {
    let mut parts = line.split_whitespace();
    let _expiry = parts.next()?;
    let mac = parts.next()?;
    let ip: Ipv4Addr = parts.next()?.parse().ok()?;
    Some((mac.to_ascii_lowercase(), ip))
}

/// Look up the leased IP for `mac` in a dnsmasq lease file. The first
/// matching line wins. A missing lease file means no DHCP server has run
/// yet and is not an error.
pub fn find_ip(path: &Path, mac: &str) -> Option<Ipv4Addr> {
    let contents = fs::read_to_string(path).ok()?;
    let mac = mac.to_ascii_lowercase();
    contents
        .lines()
        .filter_map(parse_line)
        .find(|(lease_mac, _)| *lease_mac == mac)
        .map(|(_, ip)| ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_leases(tag: &str, contents: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("labvisor-leases-{}-{}", std::process::id(), tag));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn finds_mac_case_insensitively() {
        let path = scratch_leases(
            "case",
            "1700000000 52:54:00:AB:CD:EF 192.168.100.42 hostname *\n",
        );
        assert_eq!(
            find_ip(&path, "52:54:00:ab:cd:ef"),
            Some(Ipv4Addr::new(192, 168, 100, 42))
        );
    }

    #[test]
    fn first_match_wins() {
        let path = scratch_leases(
            "first",
            "1700000000 52:54:00:00:00:01 192.168.100.10 a *\n\
             1700000001 52:54:00:00:00:01 192.168.100.11 b *\n",
        );
        assert_eq!(
            find_ip(&path, "52:54:00:00:00:01"),
            Some(Ipv4Addr::new(192, 168, 100, 10))
        );
    }

    #[test]
    fn tolerates_short_and_malformed_lines() {
        let path = scratch_leases(
            "malformed",
            "garbage\n\
             1700000000 52:54:00:00:00:02\n\
             1700000000 52:54:00:00:00:02 not-an-ip host *\n\
             1700000000 52:54:00:00:00:02 192.168.100.20 host *\n",
        );
        assert_eq!(
            find_ip(&path, "52:54:00:00:00:02"),
            Some(Ipv4Addr::new(192, 168, 100, 20))
        );
    }

    #[test]
    fn missing_file_is_no_lease() {
        assert_eq!(
            find_ip(Path::new("/nonexistent/dnsmasq.leases"), "52:54:00:00:00:03"),
            None
        );
    }

    #[test]
    fn unknown_mac_is_no_lease() {
        let path = scratch_leases("unknown", "1700000000 52:54:00:00:00:04 192.168.100.30 h *\n");
        assert_eq!(find_ip(&path, "52:54:00:ff:ff:ff"), None);
    }
}

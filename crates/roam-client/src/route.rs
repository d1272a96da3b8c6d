//! Default-route discovery over the platform routing table.

use std::ffi::CStr;
use std::fs;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::context::RunContext;
use crate::migrate::MigrationController;

/// Route has a viable next hop.
const RTF_UP: u16 = 0x0001;
/// Next hop is a gateway.
const RTF_GATEWAY: u16 = 0x0002;

/// Soft wall-clock budget for one routing-table scan.
const SCAN_BUDGET: Duration = Duration::from_millis(10);

const ROUTE_TABLE: &str = "/proc/net/route";

/// One parsed routing-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub interface: String,
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub flags: u16,
    pub mask: Ipv4Addr,
}

impl RouteEntry {
    /// Default route with a live gateway.
    pub fn is_default_gateway(&self) -> bool {
        self.flags & (RTF_UP | RTF_GATEWAY) == (RTF_UP | RTF_GATEWAY)
            && self.destination == Ipv4Addr::UNSPECIFIED
    }

    /// Entry standing in for the currently confirmed default route, used
    /// when re-examining an unchanged gateway for local-address drift.
    pub fn assumed_default(interface: impl Into<String>, gateway: Ipv4Addr) -> Self {
        Self {
            interface: interface.into(),
            destination: Ipv4Addr::UNSPECIFIED,
            gateway,
            flags: RTF_UP | RTF_GATEWAY,
            mask: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Scans the routing table once and returns the first UP+GATEWAY default
/// route whose gateway differs from `seen`. An unreadable or unparseable
/// table yields `None`, which callers treat as "no change detected".
pub fn discover_default_route(seen: Option<Ipv4Addr>) -> Option<RouteEntry> {
    let started = Instant::now();
    let table = match fs::read_to_string(ROUTE_TABLE) {
        Ok(table) => table,
        Err(error) => {
            warn!(%error, path = ROUTE_TABLE, "cannot read routing table");
            return None;
        }
    };
    scan_route_table(&table, seen, started)
}

fn scan_route_table(table: &str, seen: Option<Ipv4Addr>, started: Instant) -> Option<RouteEntry> {
    for line in table.lines().skip(1) {
        if started.elapsed() > SCAN_BUDGET {
            debug!("routing-table scan budget exhausted");
            return None;
        }
        let Some(entry) = parse_route_line(line) else {
            continue;
        };
        if !entry.is_default_gateway() {
            continue;
        }
        if seen == Some(entry.gateway) {
            continue;
        }
        trace!(gateway = %entry.gateway, interface = %entry.interface, "default route candidate");
        return Some(entry);
    }
    None
}

/// Parses one `/proc/net/route` data row
/// (`Iface Destination Gateway Flags RefCnt Use Metric Mask ...`).
/// Header and malformed rows yield `None`.
fn parse_route_line(line: &str) -> Option<RouteEntry> {
    let mut fields = line.split_whitespace();
    let interface = fields.next()?;
    let destination = parse_hex_ipv4(fields.next()?)?;
    let gateway = parse_hex_ipv4(fields.next()?)?;
    let flags = u16::from_str_radix(fields.next()?, 16).ok()?;
    // skip RefCnt, Use and Metric
    let mask = parse_hex_ipv4(fields.nth(3)?)?;
    Some(RouteEntry {
        interface: interface.to_string(),
        destination,
        gateway,
        flags,
        mask,
    })
}

/// The kernel prints each address as the raw in-memory (network-order)
/// word, so the hex value is byte-swapped on little-endian hosts.
fn parse_hex_ipv4(field: &str) -> Option<Ipv4Addr> {
    let raw = u32::from_str_radix(field, 16).ok()?;
    Some(Ipv4Addr::from(u32::from_be(raw)))
}

/// IPv4 address currently assigned to `interface`, via `getifaddrs`.
pub fn interface_ipv4(interface: &str) -> Option<Ipv4Addr> {
    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills the list on success; the pointers are only
    // read between that call and freeifaddrs below.
    unsafe {
        if libc::getifaddrs(&mut addrs) != 0 {
            warn!(interface, "getifaddrs failed");
            return None;
        }
        let mut found = None;
        let mut cursor = addrs;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;
            if entry.ifa_addr.is_null() {
                continue;
            }
            if (*entry.ifa_addr).sa_family != libc::AF_INET as libc::sa_family_t {
                continue;
            }
            if CStr::from_ptr(entry.ifa_name).to_bytes() != interface.as_bytes() {
                continue;
            }
            let sockaddr = &*(entry.ifa_addr as *const libc::sockaddr_in);
            found = Some(Ipv4Addr::from(u32::from_be(sockaddr.sin_addr.s_addr)));
            break;
        }
        libc::freeifaddrs(addrs);
        found
    }
}

/// Background poll of the routing table at the configured cadence, feeding
/// the controller until the run token cancels.
pub fn spawn_route_monitor(
    context: RunContext,
    controller: Arc<MigrationController>,
) -> JoinHandle<()> {
    let cancel = context.cancellation();
    let interval = context.config().route_poll_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let decision = controller.poll_routes().await;
            trace!(?decision, "route poll");
        }
        debug!("route monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
        wlan1\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0\n\
        wlan1\t0001A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0\n";

    #[test]
    fn parses_default_route_line() {
        let entry = parse_route_line("wlan1\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0")
            .unwrap();
        assert_eq!(entry.interface, "wlan1");
        assert_eq!(entry.destination, Ipv4Addr::UNSPECIFIED);
        assert_eq!(entry.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(entry.flags, 0x0003);
        assert!(entry.is_default_gateway());
    }

    #[test]
    fn link_route_is_not_a_default_gateway() {
        let entry = parse_route_line("wlan1\t0001A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0")
            .unwrap();
        assert!(!entry.is_default_gateway());
        assert_eq!(entry.mask, Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn header_and_garbage_rows_are_skipped() {
        assert!(parse_route_line("Iface\tDestination\tGateway").is_none());
        assert!(parse_route_line("wlan1\tzzzz\t0101A8C0\t0003\t0\t0\t600\t00000000").is_none());
        assert!(parse_route_line("").is_none());
    }

    #[test]
    fn scan_skips_already_seen_gateway() {
        let started = Instant::now();
        let entry = scan_route_table(TABLE, None, started).unwrap();
        assert_eq!(entry.gateway, Ipv4Addr::new(192, 168, 1, 1));

        let seen = Some(Ipv4Addr::new(192, 168, 1, 1));
        assert!(scan_route_table(TABLE, seen, Instant::now()).is_none());
    }

    #[test]
    fn scan_finds_gateway_past_seen_one() {
        let table = concat!(
            "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n",
            "wlan1\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0\n",
            "wlan2\t00000000\t0102A8C0\t0003\t0\t0\t601\t00000000\t0\t0\t0\n",
        );
        let seen = Some(Ipv4Addr::new(192, 168, 1, 1));
        let entry = scan_route_table(table, seen, Instant::now()).unwrap();
        assert_eq!(entry.interface, "wlan2");
        assert_eq!(entry.gateway, Ipv4Addr::new(192, 168, 2, 1));
    }

    #[test]
    fn loopback_interface_resolves() {
        let ip = interface_ipv4("lo").expect("loopback should carry an IPv4 address");
        assert!(ip.is_loopback());
        assert_eq!(interface_ipv4("definitely-not-an-iface"), None);
    }

    #[test]
    fn assumed_default_counts_as_default() {
        let entry = RouteEntry::assumed_default("wlan1", Ipv4Addr::new(192, 168, 1, 1));
        assert!(entry.is_default_gateway());
    }
}

//! Startup identity: server name and advertised address.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use rand::seq::SliceRandom;

pub const FALLBACK_NAME: &str = "VLServer";

const SERVER_NAMES: &[&str] = &[
    "Aurora", "Basalt", "Cedar", "Delta", "Ember", "Fjord", "Granite", "Harbor", "Indigo", "Juniper",
    "Kestrel", "Lantern", "Meridian", "Nimbus", "Onyx", "Prairie", "Quartz", "Rook", "Sierra", "Tundra",
    "Umber", "Vesper", "Willow", "Zephyr",
];

/// Pick a name from the built-in list.
pub fn random_server_name() -> String {
    pick_name(SERVER_NAMES)
}

fn pick_name(names: &[&str]) -> String {
    names
        .choose(&mut rand::thread_rng())
        .map(|n| n.to_string())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// Best guess at the LAN address: the local end of a UDP socket "connected"
/// to a public address. No packet is sent. Falls back to loopback.
pub fn detect_local_ip() -> IpAddr {
    probe_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn probe_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

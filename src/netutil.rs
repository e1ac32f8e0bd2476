//! Network probes used during startup

use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};

/// Check that the admin port can be bound. The listener is dropped right
/// away; this is a reservation test only.
pub fn probe_port(port: u16) -> anyhow::Result<()> {
    TcpListener::bind(("0.0.0.0", port))
        .map_err(|e| anyhow::anyhow!("port {} is not available: {}", port, e))?;
    Ok(())
}

/// Discover a local non-loopback IPv4 address by asking the OS which source
/// address it would pick for an outbound datagram. No packet is sent.
pub fn discover_local_ipv4() -> anyhow::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket
        .connect("10.254.254.254:1")
        .map_err(|e| anyhow::anyhow!("no route for local address discovery: {}", e))?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
        other => anyhow::bail!("no usable non-loopback IPv4 address (got {})", other),
    }
}

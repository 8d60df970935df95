use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{info, warn};
use tokio::net::UdpSocket;

use crate::error::Error;

pub const BROADCAST_PORT: u16 = 6600;

const REPLY_WAIT: Duration = Duration::from_secs(5);

const MAGIC: [u8; 4] = *b"ZZZZ";
const FLAGS: [u8; 4] = [0x00, 0x41, 0x3a, 0x04];

/// The hello datagram: magic, flags, then our own address.
pub fn hello_packet(self_ip: Ipv4Addr) -> [u8; 12] {
    let mut packet = [0u8; 12];
    packet[..4].copy_from_slice(&MAGIC);
    packet[4..8].copy_from_slice(&FLAGS);
    packet[8..].copy_from_slice(&self_ip.octets());
    packet
}

/// Tells the inverter which address will connect to it. Some firmware
/// refuses TCP connections until it has seen this.
///
/// No reply is expected across subnets, so a missing one is only logged.
pub async fn broadcast_hello(destination: Ipv4Addr, self_ip: Ipv4Addr) -> Result<(), Error> {
    announce(
        SocketAddr::from((destination, BROADCAST_PORT)),
        self_ip,
        REPLY_WAIT,
    )
    .await
}

pub async fn announce(
    destination: SocketAddr,
    self_ip: Ipv4Addr,
    reply_wait: Duration,
) -> Result<(), Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket.connect(destination).await?;

    let packet = hello_packet(self_ip);
    let n = socket.send(&packet).await?;
    info!("sent broadcast hello to {} ({} bytes)", destination, n);

    let mut buf = vec![0u8; 8192];
    match tokio::time::timeout(reply_wait, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => info!("broadcast hello reply ({} bytes): {:?}", n, &buf[..n]),
        Ok(Err(e)) => warn!("no reply to broadcast hello, continuing anyway: {}", e),
        Err(_) => warn!(
            "no reply to broadcast hello within {:?}, continuing anyway",
            reply_wait
        ),
    }

    Ok(())
}

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// How many times to look for an even RTP port before taking any pair.
const EVEN_PORT_ATTEMPTS: usize = 8;

/// UDP transport for one session's RTP delivery.
///
/// Binds a socket pair on the control connection's local address: RTP on an
/// even port when one can be found, RTCP on the next one up (RFC 3550 §11).
/// The RTCP socket is only held so the advertised `server_port` stays
/// reserved; nothing is read from it.
#[derive(Debug)]
pub struct UdpTransport {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    client_rtp: SocketAddr,
}

impl UdpTransport {
    pub fn bind(local_ip: IpAddr, client_rtp: SocketAddr) -> io::Result<Self> {
        for _ in 0..EVEN_PORT_ATTEMPTS {
            let rtp = UdpSocket::bind((local_ip, 0))?;
            let port = rtp.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            if let Ok(rtcp) = UdpSocket::bind((local_ip, port + 1)) {
                return Ok(Self {
                    rtp,
                    rtcp,
                    client_rtp,
                });
            }
        }

        // No even/odd pair was free; any two ports will do.
        let rtp = UdpSocket::bind((local_ip, 0))?;
        let rtcp = UdpSocket::bind((local_ip, 0))?;
        tracing::debug!(
            rtp = rtp.local_addr()?.port(),
            rtcp = rtcp.local_addr()?.port(),
            "no adjacent port pair, using arbitrary ports"
        );
        Ok(Self {
            rtp,
            rtcp,
            client_rtp,
        })
    }

    /// `(rtp, rtcp)` ports to advertise as `server_port`.
    pub fn server_ports(&self) -> io::Result<(u16, u16)> {
        Ok((self.rtp.local_addr()?.port(), self.rtcp.local_addr()?.port()))
    }

    pub fn client_rtp(&self) -> SocketAddr {
        self.client_rtp
    }

    pub fn send_rtp(&self, packet: &[u8]) -> io::Result<usize> {
        self.rtp.send_to(packet, self.client_rtp)
    }
}

use std::net::SocketAddr;

use crate::error::{Result, StreamError};

/// Client-requested transport from a SETUP `Transport` header
/// (RFC 2326 §12.39).
///
/// ```text
/// RTP/AVP;unicast;client_port=8000-8001        → Udp
/// RTP/AVP/TCP;unicast;interleaved=0-1          → Interleaved
/// RTP/AVP/TCP;unicast                          → Interleaved, channels 0-1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Udp { client_rtp: u16, client_rtcp: u16 },
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// Only the first entry of a comma-separated list is
    /// considered.
    ///
    /// ```
    /// use streamcore::session::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th, TransportHeader::Udp { client_rtp: 8000, client_rtcp: 8001 });
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").is_err());
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        let entry = header.split(',').next().unwrap_or_default().trim();
        let mut params = entry.split(';').map(str::trim);

        let profile = params.next().unwrap_or_default();
        let tcp = match profile.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            _ => return Err(invalid(format!("unsupported profile {profile:?}"))),
        };

        let mut client_ports = None;
        let mut interleaved = None;
        for param in params {
            if param.eq_ignore_ascii_case("multicast") {
                return Err(invalid("multicast is not supported".into()));
            }
            if let Some(value) = param.strip_prefix("client_port=") {
                client_ports = Some(parse_pair::<u16>(value, "client_port")?);
            } else if let Some(value) = param.strip_prefix("interleaved=") {
                interleaved = Some(parse_pair::<u8>(value, "interleaved")?);
            }
        }

        match (tcp, interleaved, client_ports) {
            (false, Some(_), _) => Err(invalid(format!(
                "interleaved requires RTP/AVP/TCP, got {profile:?}"
            ))),
            (true, Some((rtp_channel, rtcp_channel)), _) => Ok(Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            }),
            (true, None, _) => Ok(Self::Interleaved {
                rtp_channel: 0,
                rtcp_channel: 1,
            }),
            (false, None, Some((client_rtp, client_rtcp))) => {
                if client_rtp == 0 {
                    return Err(invalid("client_port must be non-zero".into()));
                }
                Ok(Self::Udp {
                    client_rtp,
                    client_rtcp,
                })
            }
            (false, None, None) => Err(invalid("missing client_port".into())),
        }
    }
}

fn invalid(reason: String) -> StreamError {
    StreamError::Transport(reason)
}

/// `a-b` or a bare `a` (meaning `a-(a+1)`).
fn parse_pair<T>(value: &str, name: &str) -> Result<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32> + Into<u32>,
{
    let bad = || invalid(format!("malformed {name}={value}"));
    let mut parts = value.splitn(2, '-');
    let first: T = parts.next().and_then(|p| p.trim().parse().ok()).ok_or_else(bad)?;
    let second = match parts.next() {
        Some(p) => p.trim().parse::<T>().map_err(|_| bad())?,
        None => T::try_from(first.into() + 1).map_err(|_| bad())?,
    };
    Ok((first, second))
}

/// Transport negotiated for a session, as echoed in the SETUP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp {
        /// Where RTP is sent (`client_ip:client_rtp_port`).
        client_rtp: SocketAddr,
        client_rtcp_port: u16,
        server_rtp_port: u16,
        server_rtcp_port: u16,
    },
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl Transport {
    /// Value of the response `Transport` header.
    pub fn response_header(&self, ssrc: u32) -> String {
        match self {
            Self::Udp {
                client_rtp,
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
            } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{};ssrc={:08X}",
                client_rtp.port(),
                client_rtcp_port,
                server_rtp_port,
                server_rtcp_port,
                ssrc
            ),
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel};ssrc={ssrc:08X}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Udp { .. } => "udp",
            Self::Interleaved { .. } => "tcp",
        }
    }
}

//! NAT traversal (§4.5): UPnP IGD port mapping, NAT-PMP as its fallback, and
//! STUN/HTTP external-IP discovery.
//!
//! Every probe and mapping attempt here is best-effort. A router that never
//! answers SSDP, or a mapping the gateway rejects, must never stop the
//! server session from starting; callers are expected to log a warning and
//! move on, which is why every public method here returns a [`Result`]
//! rather than panicking, and why none of their failures are treated as
//! fatal by anything that calls them.
//!
//! There is no XML or SOAP crate in the dependency graph, so the device
//! description and SOAP envelopes below are built and scraped with plain
//! string operations, in the same spirit as `disk::io`'s hand-rolled byte
//! handling for things with no existing crate to reach for.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::conf::NatConf;
use crate::error::{Error, Result};

const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";
const SSDP_RESPONSE_WAIT: Duration = Duration::from_secs(3);
const NAT_PMP_PORT: u16 = 5351;
const NAT_PMP_RESPONSE_WAIT: Duration = Duration::from_secs(1);
const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const STUN_RESPONSE_WAIT: Duration = Duration::from_secs(2);

/// Public STUN servers tried in order for external-IP discovery.
const STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun1.l.google.com:19302"];

/// HTTP ip-echo services tried in order, as the last resort for external-IP
/// discovery.
const IP_ECHO_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

/// The transport protocol a port mapping applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn upnp_tag(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }

    /// NAT-PMP opcode for a mapping request (RFC 6886 §3.3).
    fn nat_pmp_opcode(self) -> u8 {
        match self {
            Self::Udp => 1,
            Self::Tcp => 2,
        }
    }
}

/// A single port mapping this service has successfully established, kept so
/// [`NatService::remove_all`] can tear them back down.
#[derive(Clone, Debug)]
struct ActiveMapping {
    external_port: u16,
    protocol: Protocol,
}

struct UpnpGateway {
    control_url: String,
}

/// Coordinates NAT port mapping and external-IP discovery for the listener
/// service. One instance is expected to live for the lifetime of a session.
pub struct NatService {
    conf: NatConf,
    http: reqwest::Client,
    gateway: Mutex<Option<UpnpGateway>>,
    active: Mutex<Vec<ActiveMapping>>,
}

impl NatService {
    pub fn new(conf: NatConf) -> Self {
        Self {
            conf,
            http: reqwest::Client::new(),
            gateway: Mutex::new(None),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Maps `internal` to `external` (or `internal` again, if `external` is
    /// `None`) on the gateway, trying UPnP IGD first and NAT-PMP second.
    /// Returns the external port the gateway actually assigned.
    pub async fn map_port(
        &self,
        internal: u16,
        external: Option<u16>,
        protocol: Protocol,
    ) -> Result<u16> {
        let wanted = external.unwrap_or(internal);

        if self.conf.enable_upnp {
            match self.map_port_upnp(internal, wanted, protocol).await {
                Ok(port) => {
                    self.remember(port, protocol).await;
                    return Ok(port);
                }
                Err(e) => warn!("upnp port mapping failed: {}", e),
            }
        }
        if self.conf.enable_nat_pmp {
            match self.map_port_nat_pmp(internal, wanted, protocol).await {
                Ok(port) => {
                    self.remember(port, protocol).await;
                    return Ok(port);
                }
                Err(e) => warn!("nat-pmp port mapping failed: {}", e),
            }
        }
        Err(Error::MappingFailed(
            "no nat traversal method succeeded".to_owned(),
        ))
    }

    async fn remember(&self, external_port: u16, protocol: Protocol) {
        self.active.lock().await.push(ActiveMapping {
            external_port,
            protocol,
        });
    }

    /// Removes every mapping this instance has established. Individual
    /// failures are logged and otherwise ignored; there is nothing more
    /// useful to do with a gateway that won't honor a `DeletePortMapping`.
    pub async fn remove_all(&self) {
        let mappings = std::mem::take(&mut *self.active.lock().await);
        for mapping in mappings {
            if let Err(e) = self
                .delete_port_mapping_upnp(mapping.external_port, mapping.protocol)
                .await
            {
                warn!(
                    "failed to remove upnp mapping for port {}: {}",
                    mapping.external_port, e
                );
            }
        }
    }

    /// Discovers our externally visible IP, preferring UPnP's own view of it,
    /// then STUN, then a plain HTTP ip-echo service.
    pub async fn discover_external_ip(&self) -> Option<Ipv4Addr> {
        if let Some(ip) = self.external_ip_via_upnp().await {
            return Some(ip);
        }
        tokio::time::sleep(self.conf.probe_spacing).await;
        if let Some(ip) = self.external_ip_via_stun().await {
            return Some(ip);
        }
        tokio::time::sleep(self.conf.probe_spacing).await;
        self.external_ip_via_http().await
    }

    // ---- UPnP IGD ----

    async fn ensure_gateway(&self) -> Result<String> {
        {
            let guard = self.gateway.lock().await;
            if let Some(gw) = guard.as_ref() {
                return Ok(gw.control_url.clone());
            }
        }
        let control_url = self.discover_upnp_gateway().await?;
        *self.gateway.lock().await = Some(UpnpGateway {
            control_url: control_url.clone(),
        });
        Ok(control_url)
    }

    /// Runs SSDP discovery, trying the IGD device type first and the
    /// WANIPConnection service type as a fallback, spaced `probe_spacing`
    /// apart per §4.5.
    async fn discover_upnp_gateway(&self) -> Result<String> {
        let location = match self
            .ssdp_search("urn:schemas-upnp-org:device:InternetGatewayDevice:1")
            .await
        {
            Some(loc) => loc,
            None => {
                tokio::time::sleep(self.conf.probe_spacing).await;
                self.ssdp_search("urn:schemas-upnp-org:service:WANIPConnection:1")
                    .await
                    .ok_or(Error::NoGatewayFound)?
            }
        };
        let description = self
            .http
            .get(&location)
            .send()
            .await
            .map_err(|e| Error::MappingFailed(e.to_string()))?
            .text()
            .await
            .map_err(|e| Error::MappingFailed(e.to_string()))?;
        let control_path =
            extract_tag(&description, "controlURL").ok_or(Error::NoGatewayFound)?;
        Ok(resolve_control_url(&location, &control_path))
    }

    async fn ssdp_search(&self, search_target: &str) -> Option<String> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
        let request = format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 2\r\n\
             ST: {}\r\n\r\n",
            search_target
        );
        let dest: SocketAddr = SSDP_MULTICAST_ADDR.parse().ok()?;
        socket.send_to(request.as_bytes(), &dest).await.ok()?;

        let mut buf = [0u8; 2048];
        let read = tokio::time::timeout(SSDP_RESPONSE_WAIT, socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        let response = String::from_utf8_lossy(&buf[..read.0]);
        response.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("location") {
                Some(value.trim().to_owned())
            } else {
                None
            }
        })
    }

    async fn map_port_upnp(&self, internal: u16, external: u16, protocol: Protocol) -> Result<u16> {
        let control_url = self.ensure_gateway().await?;
        let local_ip = local_ip_for_gateway()?;
        let body = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external}</NewExternalPort>\
             <NewProtocol>{proto}</NewProtocol>\
             <NewInternalPort>{internal}</NewInternalPort>\
             <NewInternalClient>{local_ip}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{description}</NewPortMappingDescription>\
             <NewLeaseDuration>0</NewLeaseDuration>",
            external = external,
            proto = protocol.upnp_tag(),
            internal = internal,
            local_ip = local_ip,
            description = self.conf.mapping_description,
        );
        self.soap_request(&control_url, "AddPortMapping", &body)
            .await?;
        Ok(external)
    }

    async fn delete_port_mapping_upnp(&self, external_port: u16, protocol: Protocol) -> Result<()> {
        let control_url = self.ensure_gateway().await?;
        let body = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external}</NewExternalPort>\
             <NewProtocol>{proto}</NewProtocol>",
            external = external_port,
            proto = protocol.upnp_tag(),
        );
        self.soap_request(&control_url, "DeletePortMapping", &body)
            .await?;
        Ok(())
    }

    async fn external_ip_via_upnp(&self) -> Option<Ipv4Addr> {
        let control_url = self.ensure_gateway().await.ok()?;
        let response = self
            .soap_request(&control_url, "GetExternalIPAddress", "")
            .await
            .ok()?;
        extract_tag(&response, "NewExternalIPAddress")?.parse().ok()
    }

    async fn soap_request(&self, control_url: &str, action: &str, body: &str) -> Result<String> {
        let envelope = format!(
            "<?xml version=\"1.0\"?>\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{action} xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">\
             {body}</u:{action}></s:Body></s:Envelope>",
            action = action,
            body = body,
        );
        let soap_action = format!("\"urn:schemas-upnp-org:service:WANIPConnection:1#{}\"", action);
        let response = self
            .http
            .post(control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", soap_action)
            .body(envelope)
            .send()
            .await
            .map_err(|e| Error::MappingFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::MappingFailed(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| Error::MappingFailed(e.to_string()))
    }

    // ---- NAT-PMP ----

    async fn map_port_nat_pmp(
        &self,
        internal: u16,
        external: u16,
        protocol: Protocol,
    ) -> Result<u16> {
        let gateway = nat_pmp_gateway()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.map_err(Error::from)?;

        let mut request = [0u8; 12];
        request[0] = 0; // version
        request[1] = protocol.nat_pmp_opcode();
        request[4..6].copy_from_slice(&internal.to_be_bytes());
        request[6..8].copy_from_slice(&external.to_be_bytes());
        request[8..12].copy_from_slice(&(self.conf.nat_pmp_lease.as_secs() as u32).to_be_bytes());

        socket
            .send_to(&request, (gateway, NAT_PMP_PORT))
            .await
            .map_err(Error::from)?;

        let mut buf = [0u8; 16];
        let (read, _) = tokio::time::timeout(NAT_PMP_RESPONSE_WAIT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::DiscoveryTimeout)?
            .map_err(Error::from)?;
        parse_nat_pmp_response(&buf[..read])
    }

    // ---- STUN ----

    async fn external_ip_via_stun(&self) -> Option<Ipv4Addr> {
        for server in STUN_SERVERS {
            if let Some(ip) = self.stun_query(server).await {
                return Some(ip);
            }
        }
        None
    }

    async fn stun_query(&self, server: &str) -> Option<Ipv4Addr> {
        let server = server.to_owned();
        let addrs = tokio::task::spawn_blocking(move || {
            use std::net::ToSocketAddrs;
            server.to_socket_addrs().ok().and_then(|mut a| a.next())
        })
        .await
        .ok()??;

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        let mut request = [0u8; 20];
        request[0..2].copy_from_slice(&0x0001u16.to_be_bytes()); // binding request
        request[2..4].copy_from_slice(&0u16.to_be_bytes()); // no attributes
        request[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        request[8..20].copy_from_slice(&transaction_id);

        socket.send_to(&request, addrs).await.ok()?;

        let mut buf = [0u8; 512];
        let (read, _) = tokio::time::timeout(STUN_RESPONSE_WAIT, socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        parse_stun_binding_response(&buf[..read], &transaction_id)
    }

    // ---- HTTP ip-echo fallback ----

    async fn external_ip_via_http(&self) -> Option<Ipv4Addr> {
        for service in IP_ECHO_SERVICES {
            let result = self.http.get(*service).send().await;
            if let Ok(response) = result {
                if let Ok(text) = response.text().await {
                    if let Ok(ip) = text.trim().parse::<Ipv4Addr>() {
                        return Some(ip);
                    }
                }
            }
        }
        None
    }
}

/// Finds our LAN IP by "connecting" a UDP socket to a public address. No
/// packet is actually sent; this only asks the kernel which local address
/// would be used to route there, which is what a.b.c.1 gateway inference and
/// `NewInternalClient` both need.
fn local_ip_for_gateway() -> Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(Error::NoLocalIp),
    }
}

/// Infers the default gateway as `a.b.c.1`, the convention NAT-PMP clients
/// fall back on when there is no portable way to read the kernel routing
/// table without an extra crate.
fn nat_pmp_gateway() -> Result<Ipv4Addr> {
    let local = local_ip_for_gateway()?;
    let octets = local.octets();
    Ok(Ipv4Addr::new(octets[0], octets[1], octets[2], 1))
}

fn parse_nat_pmp_response(buf: &[u8]) -> Result<u16> {
    if buf.len() < 16 {
        return Err(Error::MappingFailed("short nat-pmp response".to_owned()));
    }
    let result_code = u16::from_be_bytes([buf[2], buf[3]]);
    if result_code != 0 {
        return Err(Error::MappingFailed(format!(
            "nat-pmp result code {}",
            result_code
        )));
    }
    Ok(u16::from_be_bytes([buf[14], buf[15]]))
}

/// Parses a STUN binding response for its XOR-MAPPED-ADDRESS attribute
/// (falling back to the older, non-XORed MAPPED-ADDRESS), rejecting anything
/// whose transaction ID doesn't match.
fn parse_stun_binding_response(buf: &[u8], transaction_id: &[u8; 12]) -> Option<Ipv4Addr> {
    if buf.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != 0x0101 {
        return None;
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if &buf[4..8] != STUN_MAGIC_COOKIE.to_be_bytes() || &buf[8..20] != transaction_id {
        return None;
    }
    let attrs_end = (20 + length).min(buf.len());
    let mut pos = 20;
    let mut mapped_address = None;
    while pos + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        let value_start = pos + 4;
        let value_end = value_start + attr_len;
        if value_end > attrs_end {
            break;
        }
        let value = &buf[value_start..value_end];
        match attr_type {
            0x0020 if value.len() >= 8 => {
                // XOR-MAPPED-ADDRESS: family must be 0x01 (IPv4).
                if value[1] == 0x01 {
                    let port = u16::from_be_bytes([value[2], value[3]])
                        ^ (STUN_MAGIC_COOKIE >> 16) as u16;
                    let cookie_bytes = STUN_MAGIC_COOKIE.to_be_bytes();
                    let ip = Ipv4Addr::new(
                        value[4] ^ cookie_bytes[0],
                        value[5] ^ cookie_bytes[1],
                        value[6] ^ cookie_bytes[2],
                        value[7] ^ cookie_bytes[3],
                    );
                    mapped_address = Some((ip, port));
                }
            }
            0x0001 if value.len() >= 8 && mapped_address.is_none() => {
                if value[1] == 0x01 {
                    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
                    mapped_address = Some((ip, u16::from_be_bytes([value[2], value[3]])));
                }
            }
            _ => {}
        }
        // attributes are padded to a 4-byte boundary
        pos = value_end + (4 - attr_len % 4) % 4;
    }
    mapped_address.map(|(ip, _)| ip)
}

/// Scrapes the first `<tag>value</tag>` occurrence out of an XML document
/// without pulling in an XML parser, matching the device-description and
/// SOAP-response formats UPnP gateways actually emit.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_owned())
}

/// Resolves a possibly-relative `controlURL` against the `LOCATION` URL the
/// device description was fetched from.
fn resolve_control_url(location: &str, control_path: &str) -> String {
    if control_path.starts_with("http://") || control_path.starts_with("https://") {
        return control_path.to_owned();
    }
    match url::Url::parse(location) {
        Ok(base) => match base.join(control_path) {
            Ok(joined) => joined.to_string(),
            Err(_) => control_path.to_owned(),
        },
        Err(_) => control_path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_control_url_from_device_description() {
        let xml = "<root><device><serviceList><service>\
                   <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>\
                   <controlURL>/upnp/control/WANIPConn1</controlURL>\
                   </service></serviceList></device></root>";
        assert_eq!(
            extract_tag(xml, "controlURL"),
            Some("/upnp/control/WANIPConn1".to_owned())
        );
    }

    #[test]
    fn resolves_relative_control_url_against_location() {
        let resolved = resolve_control_url(
            "http://192.168.1.1:5000/rootDesc.xml",
            "/upnp/control/WANIPConn1",
        );
        assert_eq!(resolved, "http://192.168.1.1:5000/upnp/control/WANIPConn1");
    }

    #[test]
    fn absolute_control_url_is_kept_as_is() {
        let resolved = resolve_control_url(
            "http://192.168.1.1:5000/rootDesc.xml",
            "http://other-host/control",
        );
        assert_eq!(resolved, "http://other-host/control");
    }

    #[test]
    fn parses_external_ip_from_soap_response() {
        let soap = "<?xml version=\"1.0\"?><s:Envelope><s:Body>\
                    <u:GetExternalIPAddressResponse>\
                    <NewExternalIPAddress>203.0.113.42</NewExternalIPAddress>\
                    </u:GetExternalIPAddressResponse></s:Body></s:Envelope>";
        assert_eq!(
            extract_tag(soap, "NewExternalIPAddress").and_then(|s| s.parse::<Ipv4Addr>().ok()),
            Some(Ipv4Addr::new(203, 0, 113, 42))
        );
    }

    #[test]
    fn parses_nat_pmp_success_response() {
        let mut buf = [0u8; 16];
        buf[1] = 0x81; // response to opcode 1 (UDP)
        buf[2..4].copy_from_slice(&0u16.to_be_bytes()); // result code 0
        buf[14..16].copy_from_slice(&2234u16.to_be_bytes());
        assert_eq!(parse_nat_pmp_response(&buf).unwrap(), 2234);
    }

    #[test]
    fn rejects_nat_pmp_error_result_code() {
        let mut buf = [0u8; 16];
        buf[2..4].copy_from_slice(&3u16.to_be_bytes()); // network failure
        assert!(parse_nat_pmp_response(&buf).is_err());
    }

    #[test]
    fn infers_gateway_as_dot_one_of_local_subnet() {
        let local = Ipv4Addr::new(192, 168, 1, 57);
        let octets = local.octets();
        let gateway = Ipv4Addr::new(octets[0], octets[1], octets[2], 1);
        assert_eq!(gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn parses_xor_mapped_address_stun_response() {
        let transaction_id = [1u8; 12];
        let mut buf = vec![0u8; 32];
        buf[0..2].copy_from_slice(&0x0101u16.to_be_bytes());
        buf[2..4].copy_from_slice(&12u16.to_be_bytes());
        buf[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf[8..20].copy_from_slice(&transaction_id);
        // XOR-MAPPED-ADDRESS attribute: type 0x0020, length 8
        buf[20..22].copy_from_slice(&0x0020u16.to_be_bytes());
        buf[22..24].copy_from_slice(&8u16.to_be_bytes());
        buf[24] = 0;
        buf[25] = 0x01; // IPv4
        let cookie_bytes = STUN_MAGIC_COOKIE.to_be_bytes();
        let real_port: u16 = 51820;
        let xored_port = real_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        buf[26..28].copy_from_slice(&xored_port.to_be_bytes());
        let real_ip = [203, 0, 113, 5];
        for i in 0..4 {
            buf[28 + i] = real_ip[i] ^ cookie_bytes[i];
        }
        let parsed = parse_stun_binding_response(&buf, &transaction_id);
        assert_eq!(parsed, Some(Ipv4Addr::new(203, 0, 113, 5)));
    }

    #[test]
    fn rejects_stun_response_with_mismatched_transaction_id() {
        let mut buf = vec![0u8; 20];
        buf[0..2].copy_from_slice(&0x0101u16.to_be_bytes());
        buf[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf[8..20].copy_from_slice(&[9u8; 12]);
        assert_eq!(parse_stun_binding_response(&buf, &[1u8; 12]), None);
    }
}

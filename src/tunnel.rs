//! A point-to-point tunnel interface built on `VariantRoot`.
//!
//! The tunnel's endpoints and the encapsulation routine chosen for their
//! address family form one immutable `TunnelConfig`. Reconfiguration builds a
//! new config under the interface's own lock and swaps it in; the output path
//! pins whatever config is current and never takes a lock.

use crate::domain::PserializeDomain;
use crate::psref::PsrefClass;
use crate::reader::Participant;
use crate::sync::Mutex;
use crate::variant::VariantRoot;
use std::net::IpAddr;

/// Errors reported by tunnel configuration and output.
/// 隧道配置和输出报告的错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel `{0}` has no endpoints configured")]
    NotConfigured(String),
    #[error("tunnel endpoints {src} and {dst} belong to different address families")]
    AddressFamilyMismatch { src: IpAddr, dst: IpAddr },
    #[error("tunnel source and destination are both {0}")]
    SameEndpoints(IpAddr),
    #[error("payload of {0} bytes does not fit in one outer packet")]
    PayloadTooLarge(usize),
}

/// Per-family output routine stored inside a tunnel config.
/// 存储在隧道配置中的按地址族区分的输出例程。
pub trait Encapsulate: Send + Sync {
    /// Size of the outer header this routine prepends.
    fn header_len(&self) -> usize;

    /// Wrap `payload` in an outer header addressed from `src` to `dst`.
    fn encapsulate(
        &self,
        src: IpAddr,
        dst: IpAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>, TunnelError>;
}

/// IP protocol number carried in the outer header.
const PROTO_IPIP: u8 = 4;
const DEFAULT_TTL: u8 = 64;

/// Outer IPv4 header.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inet4Encap;

impl Inet4Encap {
    const HEADER_LEN: usize = 20;
}

impl Encapsulate for Inet4Encap {
    fn header_len(&self) -> usize {
        Self::HEADER_LEN
    }

    fn encapsulate(
        &self,
        src: IpAddr,
        dst: IpAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>, TunnelError> {
        let (IpAddr::V4(src), IpAddr::V4(dst)) = (src, dst) else {
            return Err(TunnelError::AddressFamilyMismatch { src, dst });
        };
        let total = Self::HEADER_LEN + payload.len();
        let total =
            u16::try_from(total).map_err(|_| TunnelError::PayloadTooLarge(payload.len()))?;

        let mut packet = Vec::with_capacity(total as usize);
        packet.push(0x45);
        packet.push(0);
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0]);
        packet.push(DEFAULT_TTL);
        packet.push(PROTO_IPIP);
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());

        let checksum = inet4_checksum(&packet);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        packet.extend_from_slice(payload);
        Ok(packet)
    }
}

fn inet4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Outer IPv6 header.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inet6Encap;

impl Inet6Encap {
    const HEADER_LEN: usize = 40;
}

impl Encapsulate for Inet6Encap {
    fn header_len(&self) -> usize {
        Self::HEADER_LEN
    }

    fn encapsulate(
        &self,
        src: IpAddr,
        dst: IpAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>, TunnelError> {
        let (IpAddr::V6(src), IpAddr::V6(dst)) = (src, dst) else {
            return Err(TunnelError::AddressFamilyMismatch { src, dst });
        };
        let length = u16::try_from(payload.len())
            .map_err(|_| TunnelError::PayloadTooLarge(payload.len()))?;

        let mut packet = Vec::with_capacity(Self::HEADER_LEN + payload.len());
        packet.extend_from_slice(&[0x60, 0, 0, 0]);
        packet.extend_from_slice(&length.to_be_bytes());
        packet.push(PROTO_IPIP);
        packet.push(DEFAULT_TTL);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        packet.extend_from_slice(payload);
        Ok(packet)
    }
}

/// One published tunnel configuration.
/// 一个已发布的隧道配置。
pub struct TunnelConfig {
    pub src: IpAddr,
    pub dst: IpAddr,
    encap: Box<dyn Encapsulate>,
}

impl TunnelConfig {
    /// Validate the endpoints and pick the encapsulation routine for their family.
    /// 校验端点并为其地址族选择封装例程。
    pub fn new(src: IpAddr, dst: IpAddr) -> Result<Self, TunnelError> {
        if src == dst {
            return Err(TunnelError::SameEndpoints(src));
        }
        let encap: Box<dyn Encapsulate> = match (src, dst) {
            (IpAddr::V4(_), IpAddr::V4(_)) => Box::new(Inet4Encap),
            (IpAddr::V6(_), IpAddr::V6(_)) => Box::new(Inet6Encap),
            _ => return Err(TunnelError::AddressFamilyMismatch { src, dst }),
        };
        Ok(Self { src, dst, encap })
    }

    /// Bytes the outer header adds to every packet.
    pub fn overhead(&self) -> usize {
        self.encap.header_len()
    }

    /// Wrap `payload` in the outer header for these endpoints.
    pub fn encapsulate(&self, payload: &[u8]) -> Result<Vec<u8>, TunnelError> {
        self.encap.encapsulate(self.src, self.dst, payload)
    }
}

impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("overhead", &self.overhead())
            .finish()
    }
}

/// A tunnel interface.
///
/// ```
/// use psz_sync::{PserializeDomain, PsrefClass, Tunnel};
///
/// let domain = PserializeDomain::new();
/// let class = PsrefClass::new("tunnel");
/// let tun = Tunnel::new("gif0", &domain, &class);
/// let participant = domain.register_participant();
///
/// assert!(tun.output(&participant, b"ping").is_err());
///
/// tun.set_tunnel("192.0.2.1".parse().unwrap(), "198.51.100.7".parse().unwrap())
///     .unwrap();
/// let packet = tun.output(&participant, b"ping").unwrap();
/// assert_eq!(packet.len(), 20 + 4);
/// ```
///
/// 隧道接口。端点配置通过 `VariantRoot` 发布，输出路径从不加锁。
pub struct Tunnel {
    name: String,
    /// Serializes reconfiguration.
    config_lock: Mutex<()>,
    config: VariantRoot<TunnelConfig>,
}

impl Tunnel {
    /// Create an unconfigured tunnel.
    /// 创建一个未配置的隧道。
    pub fn new(name: impl Into<String>, domain: &PserializeDomain, class: &PsrefClass) -> Self {
        Self {
            name: name.into(),
            config_lock: Mutex::new(()),
            config: VariantRoot::empty(domain, class),
        }
    }

    /// Interface name, used in log lines and `NotConfigured`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the outer endpoints. Blocks until packets still using the previous
    /// endpoints have been sent.
    /// 设置外层端点。阻塞直到仍使用旧端点的数据包发送完毕。
    pub fn set_tunnel(&self, src: IpAddr, dst: IpAddr) -> Result<(), TunnelError> {
        let config = TunnelConfig::new(src, dst)?;
        let _guard = self.config_lock.lock();
        let previous = self.config.replace(config);
        match previous {
            Some(old) => log::debug!(
                "{}: tunnel {} -> {} replaced by {src} -> {dst}",
                self.name,
                old.src,
                old.dst
            ),
            None => log::debug!("{}: tunnel {src} -> {dst} configured", self.name),
        }
        Ok(())
    }

    /// Remove the endpoints; output fails with `NotConfigured` afterwards.
    /// 移除端点；之后输出返回 `NotConfigured`。
    pub fn delete_tunnel(&self) -> Option<(IpAddr, IpAddr)> {
        let _guard = self.config_lock.lock();
        let old = self.config.clear()?;
        log::debug!("{}: tunnel {} -> {} deleted", self.name, old.src, old.dst);
        Some((old.src, old.dst))
    }

    /// Current endpoints, if configured.
    pub fn addresses(&self, participant: &Participant) -> Option<(IpAddr, IpAddr)> {
        let config = self.config.get(participant)?;
        Some((config.src, config.dst))
    }

    /// Encapsulate one packet with the current configuration.
    /// 使用当前配置封装一个数据包。
    pub fn output(
        &self,
        participant: &Participant,
        payload: &[u8],
    ) -> Result<Vec<u8>, TunnelError> {
        let config = self
            .config
            .get(participant)
            .ok_or_else(|| TunnelError::NotConfigured(self.name.clone()))?;
        let packet = config.encapsulate(payload);
        config.put();
        packet
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.name)
            .field("configured", &self.config.is_published())
            .finish()
    }
}

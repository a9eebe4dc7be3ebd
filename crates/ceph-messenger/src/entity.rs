use std::net::SocketAddr;

/// The kind of participant an [`Identity`] names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntityType {
    Mon,
    Mds,
    Osd,
    Client,
    Admin,
}

impl EntityType {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Mon => "mon",
            EntityType::Mds => "mds",
            EntityType::Osd => "osd",
            EntityType::Client => "client",
            EntityType::Admin => "admin",
        }
    }
}

/// `(entity_type, entity_num, network_address)` — names a peer independently of
/// whatever connection currently carries traffic to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub entity_type: EntityType,
    pub entity_num: u64,
    pub addr: SocketAddr,
}

impl Identity {
    pub fn new(entity_type: EntityType, entity_num: u64, addr: SocketAddr) -> Self {
        Self { entity_type, entity_num, addr }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} {}", self.entity_type.as_str(), self.entity_num, self.addr)
    }
}

/// Numeric comparison used to break simultaneous-connect races: the identity whose
/// address compares lower defers (replies `WAIT`) and lets the other side's
/// connect through (§4.2).
#[inline]
pub fn addr_must_defer(ours: &SocketAddr, theirs: &SocketAddr) -> bool {
    addr_key(ours) < addr_key(theirs)
}

fn addr_key(addr: &SocketAddr) -> (u8, [u8; 16], u16) {
    match addr {
        SocketAddr::V4(v4) => (4, v4.ip().to_ipv6_mapped().octets(), v4.port()),
        SocketAddr::V6(v6) => (6, v6.ip().octets(), v6.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_address_defers() {
        let low: SocketAddr = "10.0.0.1:6800".parse().unwrap();
        let high: SocketAddr = "10.0.0.2:6800".parse().unwrap();
        assert!(addr_must_defer(&low, &high));
        assert!(!addr_must_defer(&high, &low));
    }
}

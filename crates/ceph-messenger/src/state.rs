use bitflags::bitflags;

/// Primary connection state, per §4.2. Exactly one of these holds at a time;
/// the orthogonal [`ConnFlags`] may be set regardless of which state is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    New,
    Connecting,
    Open,
    Standby,
    Wait,
    Closed,
}

bitflags! {
    /// Flags that coexist with the primary [`ConnState`].
    ///
    /// `QUEUED`/`BUSY` jointly guarantee single-writer: work arriving on a
    /// connection sets `QUEUED` and submits it to the receive work queue; the
    /// worker clears `QUEUED` and sets `BUSY` while draining, looping if
    /// `QUEUED` was set again in the meantime.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConnFlags: u16 {
        const WRITE_PENDING     = 1 << 0;
        const KEEPALIVE_PENDING = 1 << 1;
        const QUEUED            = 1 << 2;
        const BUSY               = 1 << 3;
        const SOCK_CLOSED        = 1 << 4;
        const LOSSYTX            = 1 << 5;
        const LOSSYRX            = 1 << 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_busy_are_independent_bits() {
        let mut flags = ConnFlags::empty();
        flags.insert(ConnFlags::QUEUED);
        assert!(flags.contains(ConnFlags::QUEUED));
        flags.remove(ConnFlags::QUEUED);
        flags.insert(ConnFlags::BUSY);
        assert!(!flags.contains(ConnFlags::QUEUED));
        assert!(flags.contains(ConnFlags::BUSY));
    }
}

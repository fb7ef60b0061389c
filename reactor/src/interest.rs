//! Interest masks describing the event kinds a registration waits for.

use bitflags::bitflags;

bitflags! {
    /// Bitset of event kinds a session registration is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        /// Read readiness
        const READ = 0b0001;
        /// Write readiness
        const WRITE = 0b0010;
        /// Accept readiness (listener registrations)
        const ACCEPT = 0b0100;
        /// Connect completion readiness (pending outbound connects)
        const CONNECT = 0b1000;
    }
}

impl EventMask {
    /// Translates the mask into a mio interest set, or `None` when the mask
    /// requests no multiplexer-visible events.
    ///
    /// ACCEPT maps to read readiness and CONNECT to write readiness, which
    /// is how poll-based multiplexers report them.
    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        let mut interest: Option<mio::Interest> = None;
        if self.intersects(EventMask::READ | EventMask::ACCEPT) {
            interest = Some(mio::Interest::READABLE);
        }
        if self.intersects(EventMask::WRITE | EventMask::CONNECT) {
            interest = Some(match interest {
                Some(i) => i | mio::Interest::WRITABLE,
                None => mio::Interest::WRITABLE,
            });
        }
        interest
    }

    /// Renders the mask in the compact `[rwac]` form used by session
    /// formatting.
    pub(crate) fn render(self) -> String {
        let mut out = String::with_capacity(6);
        out.push('[');
        if self.contains(EventMask::READ) {
            out.push('r');
        }
        if self.contains(EventMask::WRITE) {
            out.push('w');
        }
        if self.contains(EventMask::ACCEPT) {
            out.push('a');
        }
        if self.contains(EventMask::CONNECT) {
            out.push('c');
        }
        out.push(']');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mask_has_no_mio_interest() {
        assert!(EventMask::empty().to_mio().is_none());
    }

    #[test]
    fn read_write_mask_maps_to_both_directions() {
        let interest = (EventMask::READ | EventMask::WRITE).to_mio().unwrap();
        assert!(interest.is_readable());
        assert!(interest.is_writable());
    }

    #[test]
    fn accept_maps_to_readable() {
        let interest = EventMask::ACCEPT.to_mio().unwrap();
        assert!(interest.is_readable());
        assert!(!interest.is_writable());
    }

    #[test]
    fn render_is_compact() {
        assert_eq!((EventMask::READ | EventMask::WRITE).render(), "[rw]");
        assert_eq!(EventMask::empty().render(), "[]");
    }
}

//! Readiness bitsets and source direction types.

use std::{fmt, ops};

/// A set of readiness events, as reported by (and requested from) epoll.
///
/// `EventSet` wraps the raw `epoll(7)` event bits. Sources receive one in
/// their dispatch hook with the events the kernel delivered; the monitor
/// keeps one per source with the events currently requested (the *active
/// mask*). Dispatch hooks must tolerate spurious or stale bits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EventSet(u32);

impl EventSet {
    /// The empty set.
    pub const EMPTY: EventSet = EventSet(0);

    /// Input readiness (`EPOLLIN`).
    pub const IN: EventSet = EventSet(libc::EPOLLIN as u32);

    /// Output readiness (`EPOLLOUT`).
    pub const OUT: EventSet = EventSet(libc::EPOLLOUT as u32);

    /// Peer closed its writing half (`EPOLLRDHUP`).
    pub const RDHUP: EventSet = EventSet(libc::EPOLLRDHUP as u32);

    /// Priority data readiness (`EPOLLPRI`).
    pub const PRI: EventSet = EventSet(libc::EPOLLPRI as u32);

    /// Error condition (`EPOLLERR`).
    pub const ERR: EventSet = EventSet(libc::EPOLLERR as u32);

    /// Hang up (`EPOLLHUP`).
    pub const HUP: EventSet = EventSet(libc::EPOLLHUP as u32);

    /// The events considered as an error when occurring on a source.
    ///
    /// A source whose delivered events intersect this set is removed from
    /// its monitor after its dispatch hook has had a chance to observe them.
    pub const ERROR_EVENTS: EventSet =
        EventSet(Self::ERR.0 | Self::HUP.0 | Self::RDHUP.0);

    /// Builds a set from raw epoll bits.
    pub const fn from_bits(bits: u32) -> EventSet {
        EventSet(bits)
    }

    /// Returns the raw epoll bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Add together two `EventSet`s.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    pub const fn add(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }

    /// Returns true if every bit of `other` is present in `self`.
    pub const fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if `self` and `other` share at least one bit.
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the set contains at least one error event.
    pub const fn has_error(self) -> bool {
        self.intersects(Self::ERROR_EVENTS)
    }
}

impl ops::BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }
}

impl ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, other: EventSet) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for EventSet {
    type Output = EventSet;

    fn bitand(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }
}

impl ops::Sub for EventSet {
    type Output = EventSet;

    fn sub(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (EventSet::IN, "IN"),
            (EventSet::OUT, "OUT"),
            (EventSet::RDHUP, "RDHUP"),
            (EventSet::PRI, "PRI"),
            (EventSet::ERR, "ERR"),
            (EventSet::HUP, "HUP"),
        ];
        for (flag, name) in flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "(empty)")?;
        }
        Ok(())
    }
}

/// Renders the set in the event-loop diagnostic dump format:
///
/// ```
/// use evio::EventSet;
///
/// assert_eq!(
///     (EventSet::OUT | EventSet::HUP).to_string(),
///     "epoll events :\n\tEPOLLOUT\n\tEPOLLHUP\n",
/// );
/// ```
impl fmt::Display for EventSet {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("epoll events :\n")?;
        let flags = [
            (EventSet::IN, "EPOLLIN"),
            (EventSet::OUT, "EPOLLOUT"),
            (EventSet::RDHUP, "EPOLLRDHUP"),
            (EventSet::PRI, "EPOLLPRI"),
            (EventSet::ERR, "EPOLLERR"),
            (EventSet::HUP, "EPOLLHUP"),
        ];
        for (flag, name) in flags {
            if self.contains(flag) {
                writeln!(fmt, "\t{}", name)?;
            }
        }
        Ok(())
    }
}

/// The set of directions a source can ever serve.
///
/// The monitor refuses to activate a direction outside the source's
/// direction type, and auto-enables only the input side when a source is
/// added.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The source only ever produces input readiness.
    In,
    /// The source only ever produces output readiness.
    Out,
    /// The source serves both directions over a single descriptor.
    Duplex,
}

impl Direction {
    /// Returns true if the direction covers input readiness.
    pub const fn readable(self) -> bool {
        matches!(self, Direction::In | Direction::Duplex)
    }

    /// Returns true if the direction covers output readiness.
    pub const fn writable(self) -> bool {
        matches!(self, Direction::Out | Direction::Duplex)
    }

    /// The readiness events the direction can ever request.
    pub const fn event_set(self) -> EventSet {
        match self {
            Direction::In => EventSet::IN,
            Direction::Out => EventSet::OUT,
            Direction::Duplex => EventSet::IN.add(EventSet::OUT),
        }
    }

    /// Returns true if every bit of `events` is within the direction type.
    pub const fn allows(self, events: EventSet) -> bool {
        self.event_set().contains(events)
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, EventSet};

    #[test]
    fn set_algebra() {
        let set = EventSet::IN | EventSet::OUT;
        assert!(set.contains(EventSet::IN));
        assert!(set.intersects(EventSet::OUT));
        assert!(!set.contains(EventSet::IN | EventSet::HUP));
        assert_eq!(set - EventSet::OUT, EventSet::IN);
        assert!((set & EventSet::HUP).is_empty());
        assert!(!set.has_error());
        assert!((set | EventSet::RDHUP).has_error());
    }

    #[test]
    fn dump_format() {
        assert_eq!(EventSet::OUT.to_string(), "epoll events :\n\tEPOLLOUT\n");
        assert_eq!(
            (EventSet::OUT | EventSet::HUP).to_string(),
            "epoll events :\n\tEPOLLOUT\n\tEPOLLHUP\n",
        );
        assert_eq!(EventSet::EMPTY.to_string(), "epoll events :\n");
    }

    #[test]
    fn direction_algebra() {
        assert!(Direction::In.readable() && !Direction::In.writable());
        assert!(Direction::Duplex.readable() && Direction::Duplex.writable());
        assert_eq!(
            Direction::Duplex.event_set(),
            EventSet::IN | EventSet::OUT,
        );
        assert!(Direction::Duplex.allows(EventSet::OUT));
        assert!(!Direction::In.allows(EventSet::OUT));
    }
}

use std::fmt;
use std::ops;

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const URGENT: u8 = 0b100;

/// The set of readiness conditions a [`Channel`](crate::channel::Channel) is
/// interested in.
///
/// Mirrors the three interest bits the core's readiness notifier needs:
/// read, write, and urgent (out-of-band / `EPOLLPRI`) data. Unlike `mio`'s
/// `Interest`, an empty set is representable — the channel uses it to mean
/// "registered but not currently interested in anything", which the
/// notifier's `updateChannel` turns into a deregistration.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(READABLE);
    pub const WRITABLE: Interest = Interest(WRITABLE);
    pub const URGENT: Interest = Interest(URGENT);

    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub const fn is_urgent(self) -> bool {
        self.0 & URGENT != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Interest) {
        *self = self.add(other);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        macro_rules! flag {
            ($name:expr, $test:expr) => {
                if $test {
                    if !first {
                        write!(f, " | ")?;
                    }
                    write!(f, $name)?;
                    first = false;
                }
            };
        }
        flag!("READABLE", self.is_readable());
        flag!("WRITABLE", self.is_writable());
        flag!("URGENT", self.is_urgent());
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove() {
        let i = Interest::READABLE.add(Interest::WRITABLE);
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_urgent());
        let i = i.remove(Interest::WRITABLE);
        assert!(i.is_readable());
        assert!(!i.is_writable());
    }

    #[test]
    fn empty_is_none() {
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::READABLE.is_empty());
    }
}

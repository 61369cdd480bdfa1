/// Operation tags encoded in the upper 8 bits of user_data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpTag {
    /// One-shot `POLL_ADD` on a registered socket.
    PollAdd = 1,
    /// `POLL_REMOVE` cancelling an armed poll (informational CQE only).
    PollRemove = 2,
}

impl OpTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(OpTag::PollAdd),
            2 => Some(OpTag::PollRemove),
            _ => None,
        }
    }
}

/// Encoded user_data for io_uring CQE identification.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: OpTag (8 bits)
/// Bits 55..32: Generation (24 bits, wraps)
/// Bits 31..0:  Socket descriptor
/// ```
///
/// The generation changes every time a socket's poll is re-armed, so a
/// completion for a poll that has since been replaced is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    const TAG_SHIFT: u64 = 56;
    const GEN_SHIFT: u64 = 32;
    const TAG_MASK: u64 = 0xFF << Self::TAG_SHIFT;
    const GEN_MASK: u64 = 0x00FF_FFFF << Self::GEN_SHIFT;
    const FD_MASK: u64 = 0xFFFF_FFFF;
    pub const GENERATION_MASK: u32 = 0x00FF_FFFF;

    #[inline]
    pub fn encode(tag: OpTag, generation: u32, fd: i32) -> Self {
        let v = ((tag as u64) << Self::TAG_SHIFT)
            | (((generation & Self::GENERATION_MASK) as u64) << Self::GEN_SHIFT)
            | (fd as u32 as u64);
        UserData(v)
    }

    #[inline]
    pub fn tag(self) -> Option<OpTag> {
        let raw = ((self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT) as u8;
        OpTag::from_u8(raw)
    }

    #[inline]
    pub fn generation(self) -> u32 {
        ((self.0 & Self::GEN_MASK) >> Self::GEN_SHIFT) as u32
    }

    #[inline]
    pub fn fd(self) -> i32 {
        (self.0 & Self::FD_MASK) as u32 as i32
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_do_not_overlap() {
        let ud = UserData::encode(OpTag::PollAdd, 0x00AB_CDEF, 0x7FFF_FFFF);
        assert_eq!(ud.tag(), Some(OpTag::PollAdd));
        assert_eq!(ud.generation(), 0x00AB_CDEF);
        assert_eq!(ud.fd(), 0x7FFF_FFFF);
    }

    #[test]
    fn generation_wraps_at_24_bits() {
        let ud = UserData::encode(OpTag::PollRemove, 0x0100_0005, 3);
        assert_eq!(ud.generation(), 5);
        assert_eq!(ud.tag(), Some(OpTag::PollRemove));
    }

    #[test]
    fn unknown_tag() {
        assert_eq!(UserData(0).tag(), None);
    }
}

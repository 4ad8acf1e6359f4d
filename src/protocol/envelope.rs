use std::fmt;

/// Current protocol version.
pub const CURRENT_VERSION: u16 = 1;

/// Oldest protocol version this build still decodes.
pub const MIN_SUPPORTED_VERSION: u16 = 1;

/// Message kind discriminant carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Job = 0x01,
    Result = 0x02,
    Heartbeat = 0x03,
    ControlAck = 0x04,
    Cancel = 0x05,
}

impl MessageKind {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::Job),
            0x02 => Some(Self::Result),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::ControlAck),
            0x05 => Some(Self::Cancel),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Job => write!(f, "job"),
            MessageKind::Result => write!(f, "result"),
            MessageKind::Heartbeat => write!(f, "heartbeat"),
            MessageKind::ControlAck => write!(f, "control_ack"),
            MessageKind::Cancel => write!(f, "cancel"),
        }
    }
}

/// Envelope describing a message: what kind of body follows and which
/// protocol version produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub version: u16,
    pub kind: MessageKind,
}

impl Envelope {
    #[must_use]
    pub const fn new(kind: MessageKind) -> Self {
        Self {
            version: CURRENT_VERSION,
            kind,
        }
    }

    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        self.version >= MIN_SUPPORTED_VERSION && self.version <= CURRENT_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_from_u16() {
        for kind in [
            MessageKind::Job,
            MessageKind::Result,
            MessageKind::Heartbeat,
            MessageKind::ControlAck,
            MessageKind::Cancel,
        ] {
            assert_eq!(MessageKind::from_u16(kind.as_u16()), Some(kind));
        }
        assert_eq!(MessageKind::from_u16(0), None);
        assert_eq!(MessageKind::from_u16(0xFF), None);
    }

    #[test]
    fn envelope_compatibility() {
        assert!(Envelope::new(MessageKind::Job).is_compatible());
        let future = Envelope {
            version: CURRENT_VERSION + 1,
            kind: MessageKind::Job,
        };
        assert!(!future.is_compatible());
    }
}

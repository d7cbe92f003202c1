//! Messages exchanged between nodes.

use crate::gpu::Texture;
use std::fmt;

/// The kinds of data a port can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Image,
    Keypoints,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Image => f.write_str("image"),
            MessageKind::Keypoints => f.write_str("keypoints"),
        }
    }
}

/// A set of [`MessageKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u8);

impl KindSet {
    pub const EMPTY: KindSet = KindSet(0);
    pub const IMAGE: KindSet = KindSet(1);
    pub const KEYPOINTS: KindSet = KindSet(2);
    pub const ALL: KindSet = KindSet(3);

    fn bit(kind: MessageKind) -> u8 {
        match kind {
            MessageKind::Image => 1,
            MessageKind::Keypoints => 2,
        }
    }

    pub fn of(kinds: &[MessageKind]) -> Self {
        KindSet(kinds.iter().fold(0, |bits, &kind| bits | Self::bit(kind)))
    }

    pub fn contains(&self, kind: MessageKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn intersects(&self, other: KindSet) -> bool {
        self.0 & other.0 != 0
    }
}

impl From<MessageKind> for KindSet {
    fn from(kind: MessageKind) -> Self {
        KindSet(Self::bit(kind))
    }
}

/// Channel layout of an image message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Rgba,
    Greyscale,
}

/// A message: a texture plus what it encodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    Image { texture: Texture, format: ImageFormat },
    /// Corner texture holding at most `capacity` keypoints.
    Keypoints { texture: Texture, capacity: usize },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Image { .. } => MessageKind::Image,
            Message::Keypoints { .. } => MessageKind::Keypoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sets() {
        let images = KindSet::from(MessageKind::Image);
        assert!(images.contains(MessageKind::Image));
        assert!(!images.contains(MessageKind::Keypoints));
        assert!(KindSet::ALL.intersects(KindSet::KEYPOINTS));
        assert!(!KindSet::IMAGE.intersects(KindSet::KEYPOINTS));
        assert_eq!(KindSet::of(&[MessageKind::Image, MessageKind::Keypoints]), KindSet::ALL);
        assert!(!KindSet::EMPTY.intersects(KindSet::ALL));
    }
}

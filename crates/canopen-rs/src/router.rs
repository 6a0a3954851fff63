use crate::bus::CanFrame;
use alloc::vec::Vec;

/// One (id, mask) subscription routing matching frames to a consumer token.
#[derive(Debug, Clone, Copy)]
struct Subscription<T> {
    cob_id: u32,
    mask: u32,
    extended: bool,
    target: T,
}

/// Dispatches received frames to subscribed consumers by `(id, mask)`.
///
/// The router is deliberately decoupled from the consumers themselves: it
/// yields opaque target tokens and the owner performs the actual dispatch.
/// This keeps routing testable and sidesteps shared mutable borrows of the
/// consumer state. Delivery order between multiple matching subscriptions is
/// unspecified.
#[derive(Debug, Default)]
pub struct FrameRouter<T> {
    subscriptions: Vec<Subscription<T>>,
}

impl<T: Copy> FrameRouter<T> {
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }

    /// Registers a consumer for frames where `(frame.id & mask) == cob_id`.
    pub fn subscribe(&mut self, cob_id: u32, mask: u32, extended: bool, target: T) {
        self.subscriptions.push(Subscription {
            cob_id: cob_id & mask,
            mask,
            extended,
            target,
        });
    }

    /// Drops every subscription; used on communication reset.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    /// Yields the targets of all subscriptions matching the frame.
    pub fn route<'a>(&'a self, frame: &'a CanFrame) -> impl Iterator<Item = T> + 'a {
        let id = frame.can_id();
        let extended = frame.is_extended();
        self.subscriptions
            .iter()
            .filter(move |s| s.extended == extended && (id & s.mask) == s.cob_id)
            .map(|s| s.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_exact_match() {
        let mut router = FrameRouter::new();
        router.subscribe(0x580 + 0x10, 0x7FF, false, 1u32);
        router.subscribe(0x600 + 0x10, 0x7FF, false, 2u32);

        let frame = CanFrame::new(0x590, &[]);
        let targets: Vec<u32> = router.route(&frame).collect();
        assert_eq!(targets, vec![1]);
    }

    #[test]
    fn test_masked_match() {
        let mut router = FrameRouter::new();
        // All heartbeat producers: 0x700..=0x77F.
        router.subscribe(0x700, 0x780, false, 7u32);

        assert_eq!(router.route(&CanFrame::new(0x701, &[])).count(), 1);
        assert_eq!(router.route(&CanFrame::new(0x77F, &[])).count(), 1);
        assert_eq!(router.route(&CanFrame::new(0x780, &[])).count(), 0);
    }

    #[test]
    fn test_multiple_matches() {
        let mut router = FrameRouter::new();
        router.subscribe(0x080, 0x7FF, false, 1u32);
        router.subscribe(0x000, 0x780, false, 2u32);

        let mut targets: Vec<u32> = router.route(&CanFrame::new(0x080, &[])).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![1, 2]);
    }

    #[test]
    fn test_extended_frames_do_not_match_standard_subscriptions() {
        let mut router = FrameRouter::new();
        router.subscribe(0x080, 0x7FF, false, 1u32);
        let frame = CanFrame {
            id: crate::bus::CAN_ID_FLAG_EXTENDED | 0x080,
            dlc: 0,
            flags: 0,
            data: [0; 8],
        };
        assert_eq!(router.route(&frame).count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut router = FrameRouter::new();
        router.subscribe(0x080, 0x7FF, false, 1u32);
        router.clear();
        assert_eq!(router.route(&CanFrame::new(0x080, &[])).count(), 0);
    }
}

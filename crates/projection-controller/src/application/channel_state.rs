//! Transport selection and connection sub-state machines.
//!
//! A device can be attached over USB, over wireless, or over both at once.
//! [`ChannelSlots`] records which transports are present and which one is
//! *active*, i.e. the one the control and image channels are dialed through.
//!
//! # Fail-over rules
//!
//! ```text
//! attach usb       nothing active  ──►  usb becomes active (no reconnect)
//! attach wireless  nothing active  ──►  wireless becomes active (no reconnect)
//! attach wireless  usb active      ──►  wireless promoted, reconnect
//! detach active    other present   ──►  other promoted, reconnect
//! detach active    none left       ──►  active cleared
//! detach inactive                  ──►  active unchanged
//! ```
//!
//! The slots only *decide*; the device connection performs the reconnect.
//!
//! # Sub-state machines
//!
//! The control channel and the image channel progress independently:
//!
//! ```text
//! ConnectState:  Idle ──► Connecting ──► Connected ──► Closed
//!                  ▲            │            │
//!                  └────────────┘ (failure)  └──► Connecting (forced reconnect)
//!
//! ImageState:    Idle ──► Connecting ──► Streaming ──► Idle
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use projection_core::{TransportHandle, TransportKind};

// ── Connection states ─────────────────────────────────────────────────────────

/// State of a device's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// No control session and no connect attempt running.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// The `create-session` handshake completed.
    Connected,
    /// The connection was disposed; terminal.
    Closed,
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectState::Idle => "idle",
            ConnectState::Connecting => "connecting",
            ConnectState::Connected => "connected",
            ConnectState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// State of a device's image channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Idle,
    Connecting,
    /// The image socket is open and its draining task is running.
    Streaming,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageState::Idle => "idle",
            ImageState::Connecting => "connecting",
            ImageState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

// ── Channel slots ─────────────────────────────────────────────────────────────

/// Effect of a slot mutation on the active transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotChange {
    /// The active transport did not change.
    Unchanged,
    /// Nothing was active; the handle became active without a reconnect.
    Activated(TransportHandle),
    /// A different transport became active; established channels must be
    /// re-dialed through it.
    Switched(TransportHandle),
    /// The active transport went away and nothing replaced it.
    Cleared,
}

/// Result of [`ChannelSlots::detach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub change: SlotChange,
    /// Whether any transport is still attached.
    pub remaining: bool,
}

/// The USB slot, the wireless slot, and the currently active transport.
///
/// Invariant: `active` is always a clone of one of the non-empty slots, or
/// `None` when both slots are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSlots {
    usb: Option<TransportHandle>,
    wireless: Option<TransportHandle>,
    active: Option<TransportHandle>,
}

impl ChannelSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a USB transport.
    ///
    /// USB never pre-empts an active wireless link.  Replacing the USB handle
    /// while USB is active moves `active` along with it.
    pub fn attach_usb(&mut self, handle: TransportHandle) -> SlotChange {
        self.usb = Some(handle.clone());
        match &self.active {
            None => {
                self.active = Some(handle.clone());
                SlotChange::Activated(handle)
            }
            Some(current) if current.kind == TransportKind::Usb && *current != handle => {
                self.active = Some(handle.clone());
                SlotChange::Switched(handle)
            }
            Some(_) => SlotChange::Unchanged,
        }
    }

    /// Records a wireless transport and prefers it over USB.
    pub fn attach_wireless(&mut self, handle: TransportHandle) -> SlotChange {
        self.wireless = Some(handle.clone());
        self.select(handle)
    }

    /// Clears the slot holding `handle`.
    ///
    /// A handle that does not match the slot's current occupant is ignored,
    /// so a stale detach cannot evict a newer transport.
    pub fn detach(&mut self, handle: &TransportHandle) -> Detached {
        let slot = match handle.kind {
            TransportKind::Usb => &mut self.usb,
            TransportKind::Wireless => &mut self.wireless,
        };
        if slot.as_ref() == Some(handle) {
            *slot = None;
        }

        let change = if self.active.as_ref() == Some(handle) {
            let fallback = match handle.kind {
                TransportKind::Usb => self.wireless.clone(),
                TransportKind::Wireless => self.usb.clone(),
            };
            match fallback {
                Some(other) => {
                    self.active = Some(other.clone());
                    SlotChange::Switched(other)
                }
                None => {
                    self.active = None;
                    SlotChange::Cleared
                }
            }
        } else {
            SlotChange::Unchanged
        };

        Detached {
            change,
            remaining: self.has_any(),
        }
    }

    /// Makes `handle` active.  A no-op when it already is.
    fn select(&mut self, handle: TransportHandle) -> SlotChange {
        match &self.active {
            Some(current) if *current == handle => SlotChange::Unchanged,
            None => {
                self.active = Some(handle.clone());
                SlotChange::Activated(handle)
            }
            Some(_) => {
                self.active = Some(handle.clone());
                SlotChange::Switched(handle)
            }
        }
    }

    pub fn active(&self) -> Option<&TransportHandle> {
        self.active.as_ref()
    }

    pub fn usb(&self) -> Option<&TransportHandle> {
        self.usb.as_ref()
    }

    pub fn wireless(&self) -> Option<&TransportHandle> {
        self.wireless.as_ref()
    }

    pub fn has_any(&self) -> bool {
        self.usb.is_some() || self.wireless.is_some()
    }

    /// Whether the active transport is the wireless one.
    pub fn is_wireless_mode(&self) -> bool {
        self.active.as_ref().is_some_and(TransportHandle::is_wireless)
    }
}

// ── Single-flight guard ───────────────────────────────────────────────────────

/// Atomic test-and-set flag admitting one operation at a time.
///
/// A second caller that finds the guard taken is expected to return
/// immediately rather than wait.
#[derive(Debug, Default)]
pub struct OperationGuard {
    busy: AtomicBool,
}

/// Releases its [`OperationGuard`] when dropped, on every exit path.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a OperationGuard,
}

impl OperationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the guard, or returns `None` when another operation holds it.
    pub fn try_acquire(&self) -> Option<GuardToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn usb() -> TransportHandle {
        TransportHandle::usb("R58M12")
    }

    fn wifi() -> TransportHandle {
        TransportHandle::wireless("192.168.1.20:5555")
    }

    // ── Attach ────────────────────────────────────────────────────────────────

    #[test]
    fn test_first_usb_attach_activates_without_switch() {
        // Arrange
        let mut slots = ChannelSlots::new();

        // Act
        let change = slots.attach_usb(usb());

        // Assert
        assert_eq!(change, SlotChange::Activated(usb()));
        assert_eq!(slots.active(), Some(&usb()));
        assert!(!slots.is_wireless_mode());
    }

    #[test]
    fn test_first_wireless_attach_activates_without_switch() {
        let mut slots = ChannelSlots::new();
        assert_eq!(slots.attach_wireless(wifi()), SlotChange::Activated(wifi()));
        assert!(slots.is_wireless_mode());
    }

    #[test]
    fn test_wireless_attach_while_usb_active_switches() {
        let mut slots = ChannelSlots::new();
        slots.attach_usb(usb());

        let change = slots.attach_wireless(wifi());

        assert_eq!(change, SlotChange::Switched(wifi()));
        assert_eq!(slots.active(), Some(&wifi()));
        assert_eq!(slots.usb(), Some(&usb()));
    }

    #[test]
    fn test_usb_attach_while_wireless_active_keeps_wireless() {
        let mut slots = ChannelSlots::new();
        slots.attach_wireless(wifi());

        let change = slots.attach_usb(usb());

        assert_eq!(change, SlotChange::Unchanged);
        assert_eq!(slots.active(), Some(&wifi()));
    }

    #[test]
    fn test_reattaching_active_wireless_handle_is_unchanged() {
        let mut slots = ChannelSlots::new();
        slots.attach_wireless(wifi());
        assert_eq!(slots.attach_wireless(wifi()), SlotChange::Unchanged);
    }

    #[test]
    fn test_replacing_active_usb_handle_moves_active() {
        let mut slots = ChannelSlots::new();
        slots.attach_usb(usb());

        let replacement = TransportHandle::usb("R58M99");
        let change = slots.attach_usb(replacement.clone());

        assert_eq!(change, SlotChange::Switched(replacement.clone()));
        assert_eq!(slots.active(), Some(&replacement));
    }

    // ── Detach ────────────────────────────────────────────────────────────────

    #[test]
    fn test_detach_active_wireless_falls_back_to_usb() {
        // Arrange
        let mut slots = ChannelSlots::new();
        slots.attach_usb(usb());
        slots.attach_wireless(wifi());

        // Act
        let detached = slots.detach(&wifi());

        // Assert
        assert_eq!(detached.change, SlotChange::Switched(usb()));
        assert!(detached.remaining);
        assert_eq!(slots.active(), Some(&usb()));
        assert!(slots.wireless().is_none());
    }

    #[test]
    fn test_detach_active_usb_falls_back_to_wireless() {
        let mut slots = ChannelSlots::new();
        slots.attach_usb(usb());
        // attach_wireless always promotes, so set the slot directly.
        slots.wireless = Some(wifi());

        let detached = slots.detach(&usb());

        assert_eq!(detached.change, SlotChange::Switched(wifi()));
        assert_eq!(slots.active(), Some(&wifi()));
    }

    #[test]
    fn test_detach_inactive_usb_leaves_active_alone() {
        let mut slots = ChannelSlots::new();
        slots.attach_usb(usb());
        slots.attach_wireless(wifi());

        let detached = slots.detach(&usb());

        assert_eq!(detached.change, SlotChange::Unchanged);
        assert!(detached.remaining);
        assert_eq!(slots.active(), Some(&wifi()));
    }

    #[test]
    fn test_detach_last_transport_clears_active() {
        let mut slots = ChannelSlots::new();
        slots.attach_usb(usb());

        let detached = slots.detach(&usb());

        assert_eq!(detached.change, SlotChange::Cleared);
        assert!(!detached.remaining);
        assert!(slots.active().is_none());
    }

    #[test]
    fn test_stale_detach_does_not_evict_newer_handle() {
        let mut slots = ChannelSlots::new();
        let newer = TransportHandle::usb("R58M99");
        slots.attach_usb(newer.clone());

        let detached = slots.detach(&usb());

        assert_eq!(detached.change, SlotChange::Unchanged);
        assert_eq!(slots.usb(), Some(&newer));
        assert_eq!(slots.active(), Some(&newer));
    }

    #[test]
    fn test_active_is_always_one_of_the_slots() {
        let mut slots = ChannelSlots::new();
        let steps: Vec<Box<dyn Fn(&mut ChannelSlots)>> = vec![
            Box::new(|s| {
                s.attach_usb(usb());
            }),
            Box::new(|s| {
                s.attach_wireless(wifi());
            }),
            Box::new(|s| {
                s.detach(&wifi());
            }),
            Box::new(|s| {
                s.attach_wireless(wifi());
            }),
            Box::new(|s| {
                s.detach(&usb());
            }),
            Box::new(|s| {
                s.detach(&wifi());
            }),
        ];

        for step in steps {
            step(&mut slots);
            match slots.active() {
                Some(a) => assert!(slots.usb() == Some(a) || slots.wireless() == Some(a)),
                None => assert!(!slots.has_any()),
            }
        }
    }

    // ── OperationGuard ────────────────────────────────────────────────────────

    #[test]
    fn test_guard_admits_one_holder_and_releases_on_drop() {
        let guard = OperationGuard::new();

        let first = guard.try_acquire();
        assert!(first.is_some());
        assert!(guard.try_acquire().is_none());
        assert!(guard.is_busy());

        drop(first);
        assert!(!guard.is_busy());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_guard_released_when_holder_panics() {
        let guard = OperationGuard::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _token = guard.try_acquire();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!guard.is_busy());
    }

    #[test]
    fn test_state_display_is_lowercase() {
        assert_eq!(ConnectState::Connecting.to_string(), "connecting");
        assert_eq!(ImageState::Streaming.to_string(), "streaming");
    }
}

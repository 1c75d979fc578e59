//! Shared-memory mailbox backend.
//!
//! Devices without a dedicated mailbox block emulate one with a patch of
//! shared memory and a cross-core software interrupt. [`SoftMailbox`] is
//! that patch of memory: the slot words plus per-side interrupt flag,
//! enable and handler state. Each core talks to it through its own
//! [`SoftEndpoint`] view, obtained from [`SoftMailbox::hp`] or
//! [`SoftMailbox::lp`].
//!
//! Writing a slot raises the slot's flag on both sides and, where that flag
//! is enabled, invokes the side's installed handler on the writing thread,
//! standing in for the cross-core interrupt. Enabling interrupts re-checks
//! pending flags the same way, so the handler also fires for messages that
//! arrived while masked.
//!
//! The host test suites use the LP endpoint to play the LP core's role
//! with plain slot reads and writes.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::{MailboxBackend, SLOT_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Hp,
    Lp,
}

impl Side {
    const fn index(self) -> usize {
        match self {
            Side::Hp => 0,
            Side::Lp => 1,
        }
    }

    const fn peer(self) -> Side {
        match self {
            Side::Hp => Side::Lp,
            Side::Lp => Side::Hp,
        }
    }
}

struct Shared {
    slots: [usize; SLOT_COUNT],
    raw: [u32; 2],
    enabled: [u32; 2],
    handler: [Option<fn()>; 2],
    attached: [bool; 2],
}

/// The shared-memory core of a software mailbox.
///
/// Lives in a `static` so both endpoint views can refer to it.
pub struct SoftMailbox {
    shared: Mutex<RefCell<Shared>>,
}

impl SoftMailbox {
    /// Creates an empty mailbox with all interrupts masked and cleared.
    pub const fn new() -> Self {
        SoftMailbox {
            shared: Mutex::new(RefCell::new(Shared {
                slots: [0; SLOT_COUNT],
                raw: [0; 2],
                enabled: [0; 2],
                handler: [None; 2],
                attached: [false; 2],
            })),
        }
    }

    /// The HP core's view of this mailbox.
    pub const fn hp(&'static self) -> SoftEndpoint {
        SoftEndpoint {
            mailbox: self,
            side: Side::Hp,
        }
    }

    /// The LP core's view of this mailbox.
    pub const fn lp(&'static self) -> SoftEndpoint {
        SoftEndpoint {
            mailbox: self,
            side: Side::Lp,
        }
    }
}

/// One side's view of a [`SoftMailbox`].
pub struct SoftEndpoint {
    mailbox: &'static SoftMailbox,
    side: Side,
}

impl SoftEndpoint {
    /// Marks this side's half of the shared state as published.
    ///
    /// The peer's [`MailboxBackend::peer_ready`] reports `true` from then
    /// on. The LP program (or the test harness playing its role) calls this
    /// once its slot handling is in place.
    pub fn attach(&self) {
        critical_section::with(|cs| {
            self.mailbox.shared.borrow_ref_mut(cs).attached[self.side.index()] = true;
        });
    }
}

impl MailboxBackend for SoftEndpoint {
    fn message(&self, slot: usize) -> usize {
        critical_section::with(|cs| self.mailbox.shared.borrow_ref(cs).slots[slot])
    }

    fn set_message(&self, slot: usize, value: usize) {
        let bit = 1u32 << slot;
        let mut pending: [Option<fn()>; 2] = [None; 2];
        critical_section::with(|cs| {
            let mut shared = self.mailbox.shared.borrow_ref_mut(cs);
            shared.slots[slot] = value;
            for index in 0..2 {
                shared.raw[index] |= bit;
                if shared.enabled[index] & bit != 0 {
                    pending[index] = shared.handler[index];
                }
            }
        });
        // Handlers run on the writing thread, outside the lock, standing in
        // for the cross-core interrupt.
        for handler in pending.into_iter().flatten() {
            handler();
        }
    }

    fn interrupt_status(&self) -> u32 {
        critical_section::with(|cs| {
            let shared = self.mailbox.shared.borrow_ref(cs);
            shared.raw[self.side.index()] & shared.enabled[self.side.index()]
        })
    }

    fn raw_interrupt_status(&self) -> u32 {
        critical_section::with(|cs| self.mailbox.shared.borrow_ref(cs).raw[self.side.index()])
    }

    fn enable_interrupts(&self, mask: u32) {
        let index = self.side.index();
        let mut pending = None;
        critical_section::with(|cs| {
            let mut shared = self.mailbox.shared.borrow_ref_mut(cs);
            shared.enabled[index] |= mask;
            if shared.raw[index] & mask != 0 {
                pending = shared.handler[index];
            }
        });
        // Level semantics: enabling an already-raised flag delivers the
        // interrupt immediately.
        if let Some(handler) = pending {
            handler();
        }
    }

    fn disable_interrupts(&self, mask: u32) {
        critical_section::with(|cs| {
            self.mailbox.shared.borrow_ref_mut(cs).enabled[self.side.index()] &= !mask;
        });
    }

    fn clear_interrupts(&self, mask: u32) {
        critical_section::with(|cs| {
            self.mailbox.shared.borrow_ref_mut(cs).raw[self.side.index()] &= !mask;
        });
    }

    fn install_interrupt_handler(&self, handler: fn()) {
        let index = self.side.index();
        let mut pending = None;
        critical_section::with(|cs| {
            let mut shared = self.mailbox.shared.borrow_ref_mut(cs);
            shared.handler[index] = Some(handler);
            if shared.raw[index] & shared.enabled[index] != 0 {
                pending = Some(handler);
            }
        });
        if let Some(handler) = pending {
            handler();
        }
    }

    fn remove_interrupt_handler(&self) {
        critical_section::with(|cs| {
            self.mailbox.shared.borrow_ref_mut(cs).handler[self.side.index()] = None;
        });
    }

    fn peer_ready(&self) -> bool {
        critical_section::with(|cs| {
            self.mailbox.shared.borrow_ref(cs).attached[self.side.peer().index()]
        })
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn write_raises_flags_on_both_sides() {
        static MAILBOX: SoftMailbox = SoftMailbox::new();
        static HP: SoftEndpoint = MAILBOX.hp();
        static LP: SoftEndpoint = MAILBOX.lp();

        LP.set_message(3, 0xfeed);
        assert_eq!(HP.message(3), 0xfeed);
        assert_eq!(HP.raw_interrupt_status(), 1 << 3);
        assert_eq!(LP.raw_interrupt_status(), 1 << 3);
        // Masked on both sides, so nothing shows in the masked status.
        assert_eq!(HP.interrupt_status(), 0);

        // Clearing is side-local.
        HP.clear_interrupts(1 << 3);
        assert_eq!(HP.raw_interrupt_status(), 0);
        assert_eq!(LP.raw_interrupt_status(), 1 << 3);
    }

    #[test]
    fn unmasking_pending_flag_fires_handler() {
        static MAILBOX: SoftMailbox = SoftMailbox::new();
        static HP: SoftEndpoint = MAILBOX.hp();
        static LP: SoftEndpoint = MAILBOX.lp();
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        fn handler() {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        HP.install_interrupt_handler(handler);

        // A write while masked pends without firing.
        LP.set_message(8, 1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        // Enabling the pending flag delivers the deferred interrupt.
        HP.enable_interrupts(1 << 8);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        // A write while enabled fires directly.
        LP.set_message(8, 2);
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);

        HP.disable_interrupts(1 << 8);
        LP.set_message(8, 3);
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn attach_is_directional() {
        static MAILBOX: SoftMailbox = SoftMailbox::new();
        static HP: SoftEndpoint = MAILBOX.hp();
        static LP: SoftEndpoint = MAILBOX.lp();

        assert!(!HP.peer_ready());
        LP.attach();
        assert!(HP.peer_ready());
        assert!(!LP.peer_ready());
    }
}

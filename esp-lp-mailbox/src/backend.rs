//! Mailbox slot backend interface.
//!
//! The mailbox protocol is built on a very small primitive: a fixed array of
//! word-sized message slots shared between the two cores, where writing a slot
//! raises that slot's interrupt flag on both sides. Everything else, pairing
//! payloads with acknowledgements, directions, blocking and callbacks, lives
//! in [`LpMailbox`][crate::LpMailbox].
//!
//! A backend is implemented once per platform: on devices with a hardware
//! mailbox block it wraps that block's registers, elsewhere (and in host
//! tests) the [`soft`][crate::soft] module provides a shared-memory emulation
//! driven by a cross-core interrupt.

/// Access to the shared message slots and their interrupt flags, as seen from
/// one side of the mailbox.
///
/// Slot indices are absolute: both sides address the same physical slot array
/// and bit `i` of every interrupt mask corresponds to slot `i`. Interrupt
/// *flags* (the raw status) are shared per side, while the *enable* mask and
/// the installed handler are private to the side the backend represents.
///
/// Interrupt semantics are level-style: as long as a raw flag is set and
/// enabled, the interrupt is asserted. In particular, enabling a mask whose
/// raw flags are already pending must deliver the interrupt to the installed
/// handler; implementations without that hardware behavior have to emulate it.
pub trait MailboxBackend: Sync {
    /// Reads the current value of a message slot.
    fn message(&self, slot: usize) -> usize;

    /// Writes a message slot.
    ///
    /// Raises slot `slot`'s raw interrupt flag on both sides, including the
    /// writing side's own.
    fn set_message(&self, slot: usize, value: usize);

    /// Returns the masked interrupt status of this side (raw flags that are
    /// also enabled).
    fn interrupt_status(&self) -> u32;

    /// Returns the raw interrupt flags of this side, regardless of the enable
    /// mask.
    fn raw_interrupt_status(&self) -> u32;

    /// Enables the interrupts selected by `mask` for this side.
    ///
    /// If any selected raw flag is already pending this delivers the
    /// interrupt to the installed handler.
    fn enable_interrupts(&self, mask: u32);

    /// Disables the interrupts selected by `mask` for this side. Does not
    /// touch the raw flags.
    fn disable_interrupts(&self, mask: u32);

    /// Clears the raw interrupt flags selected by `mask` on this side only.
    fn clear_interrupts(&self, mask: u32);

    /// Installs this side's interrupt handler and enables the interrupt
    /// line. Replaces any previously installed handler.
    fn install_interrupt_handler(&self, handler: fn());

    /// Removes this side's interrupt handler and disables the interrupt line.
    fn remove_interrupt_handler(&self);

    /// Whether the other side has published its half of the mailbox.
    ///
    /// Hardware backends return `true` unconditionally; the software backend
    /// reports whether the LP program has attached yet.
    fn peer_ready(&self) -> bool;
}

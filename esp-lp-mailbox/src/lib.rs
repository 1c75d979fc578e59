//! Message mailbox between the HP core and the LP coprocessor.
//!
//! The mailbox turns a bare array of interrupt-triggerable message slots
//! (see [`MailboxBackend`]) into a duplex, acknowledged channel. Half of the
//! slots carry HP-to-LP messages, the other half LP-to-HP messages, and
//! within each half the slots are used in pairs: the first slot of a pair
//! carries the payload, the second the receiver's acknowledgement. The
//! transmit cursor therefore always advances by two and wraps within its
//! half.
//!
//! Received messages can be consumed in two ways, which are mutually
//! exclusive per mailbox:
//!
//! - synchronously, with [`LpMailbox::receive`] blocking the calling task
//!   until a message arrives or the timeout expires;
//! - asynchronously, with [`LpMailbox::receive_async`] registering a
//!   callback that the mailbox interrupt handler invokes for a bounded
//!   number of messages.
//!
//! [`LpMailbox::send`] blocks until the LP side acknowledges the message.
//! This is a best-effort exchange: a send that times out leaves delivery
//! genuinely unknown, but never leaves interrupt state behind that would
//! disturb a later exchange.
//!
//! There is at most one live [`LpMailbox`] per program, matching the single
//! mailbox block of the hardware; [`LpMailbox::take`] enforces this and
//! dropping the handle makes the mailbox available again.
//!
//! ## Usage
//!
//! ```rust, no_run
//! # use esp_rtos_std as _;
//! use esp_lp_mailbox::{Config, LpMailbox, soft::{SoftEndpoint, SoftMailbox}};
//!
//! static MAILBOX: SoftMailbox = SoftMailbox::new();
//! static HP: SoftEndpoint = MAILBOX.hp();
//!
//! # fn main() -> Result<(), esp_lp_mailbox::Error> {
//! let mailbox = LpMailbox::take(&HP, Config::default())?;
//! mailbox.send(0x42, Some(10_000))?;
//! let reply = mailbox.receive(Some(10_000))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
#![doc = ""]
#![doc = include_str!(concat!(env!("OUT_DIR"), "/esp_lp_mailbox_config_table.md"))]
#![doc = ""]
//! ## Feature Flags
#![doc = document_features::document_features!()]
#![doc(html_logo_url = "https://avatars.githubusercontent.com/u/46717278")]
#![deny(missing_docs)]
#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// MUST be the first module
mod fmt;

mod backend;
pub mod soft;

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use critical_section::Mutex;
use esp_config::esp_config_int_parse;
use esp_rtos_driver::semaphore::{SemaphoreHandle, SemaphoreKind, SemaphorePtr};

pub use crate::backend::MailboxBackend;

/// Total number of message slots shared between the two cores.
pub const SLOT_COUNT: usize = esp_config::esp_config_int!(usize, "ESP_LP_MAILBOX_SLOT_COUNT");

const _: () = {
    assert!(
        SLOT_COUNT % 4 == 0,
        "ESP_LP_MAILBOX_SLOT_COUNT must be a multiple of 4"
    );
    assert!(
        SLOT_COUNT <= 32,
        "ESP_LP_MAILBOX_SLOT_COUNT must not exceed 32"
    );
};

/// Number of slots owned by each transfer direction.
const HALF: usize = SLOT_COUNT / 2;
/// First slot of the HP transmit half.
const TX_FIRST: usize = 0;
/// First slot of the HP receive half.
const RX_FIRST: usize = HALF;
/// Most messages a single interrupt can deliver in asynchronous mode.
const MAX_BURST: usize = HALF / 2;

const ALL_SLOTS: u32 = ((1u64 << SLOT_COUNT) - 1) as u32;

/// Payload bits of the HP receive half. Ack slots are deliberately absent:
/// an ack write must never be taken for an inbound message.
const RX_PAYLOAD: u32 = {
    let mut mask = 0;
    let mut slot = RX_FIRST;
    while slot < SLOT_COUNT {
        mask |= 1 << slot;
        slot += 2;
    }
    mask
};

/// Errors returned by mailbox operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The mailbox is already taken, the LP side has not published its half
    /// yet, or the operation conflicts with an active asynchronous receive.
    InvalidState,
    /// The operation did not complete within the caller's timeout.
    Timeout,
    /// An argument is outside its valid range.
    InvalidArgument,
}

/// Mailbox configuration.
#[non_exhaustive]
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {}

/// An asynchronous receive registration.
struct AsyncReceive {
    callback: fn(usize),
    remaining: usize,
}

/// Wake-semaphore pointer shared with the interrupt handler.
///
/// The owning [`SemaphoreHandle`] lives in the [`LpMailbox`] and outlives
/// this copy: dropping the mailbox removes the shared state before the
/// handle is deleted.
struct WakeSemaphore(SemaphorePtr);

unsafe impl Send for WakeSemaphore {}

impl WakeSemaphore {
    fn try_give_from_isr(&self) {
        unsafe { SemaphoreHandle::ref_from_ptr(&self.0) }.try_give_from_isr(None);
    }
}

/// State the interrupt handler works on.
struct IsrState {
    backend: &'static dyn MailboxBackend,
    wake: WakeSemaphore,
    async_receive: Option<AsyncReceive>,
}

static TAKEN: AtomicBool = AtomicBool::new(false);
static ISR_STATE: Mutex<RefCell<Option<IsrState>>> = Mutex::new(RefCell::new(None));

/// The HP side of the LP core mailbox.
///
/// Obtained from [`LpMailbox::take`]; at most one instance is live at a
/// time. All operations take `&self` and may be called from any task;
/// one logical send or receive runs at a time, serialized internally.
pub struct LpMailbox {
    backend: &'static dyn MailboxBackend,
    op: SemaphoreHandle,
    wake: SemaphoreHandle,
    tx_slot: AtomicUsize,
}

impl LpMailbox {
    /// Binds the mailbox singleton to `backend`.
    ///
    /// Fails with [`Error::InvalidState`] if a mailbox instance is already
    /// live, or if the LP-side counterpart has not published its half of the
    /// shared state yet.
    ///
    /// Receive-direction interrupts start out masked but are not cleared:
    /// a message the LP core sent before this call is deferred until the
    /// first receive, not lost.
    pub fn take(
        backend: &'static dyn MailboxBackend,
        _config: Config,
    ) -> Result<LpMailbox, Error> {
        if TAKEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidState);
        }
        if !backend.peer_ready() {
            TAKEN.store(false, Ordering::Release);
            return Err(Error::InvalidState);
        }

        // Mask every slot interrupt, leaving raw flags untouched.
        backend.disable_interrupts(ALL_SLOTS);

        let op = SemaphoreHandle::new(SemaphoreKind::Mutex);
        let wake_ptr = SemaphoreHandle::new(SemaphoreKind::Counting { max: 1, initial: 0 }).leak();
        let wake = unsafe { SemaphoreHandle::from_ptr(wake_ptr) };

        critical_section::with(|cs| {
            *ISR_STATE.borrow_ref_mut(cs) = Some(IsrState {
                backend,
                wake: WakeSemaphore(wake_ptr),
                async_receive: None,
            });
        });
        backend.install_interrupt_handler(interrupt_handler);

        debug!("lp mailbox ready, {} slots per direction", HALF);
        Ok(LpMailbox {
            backend,
            op,
            wake,
            tx_slot: AtomicUsize::new(TX_FIRST),
        })
    }

    /// Releases the mailbox, making [`LpMailbox::take`] available again.
    ///
    /// Equivalent to dropping the handle.
    pub fn deinit(self) {
        drop(self);
    }

    /// Sends a message and waits for the LP side's acknowledgement.
    ///
    /// Returns [`Error::Timeout`] if the acknowledgement does not arrive in
    /// time. The message may or may not have been consumed in that case;
    /// the exchange's interrupt state is wound down either way, so later
    /// sends are unaffected.
    ///
    /// Fails with [`Error::InvalidState`] while an asynchronous receive is
    /// registered.
    pub fn send(&self, message: usize, timeout_us: Option<u32>) -> Result<(), Error> {
        if !self.op.take(timeout_us) {
            return Err(Error::Timeout);
        }
        let result = self.send_locked(message, timeout_us);
        self.op.give();
        result
    }

    /// Sends a message without waiting for an acknowledgement.
    ///
    /// The transmit cursor still advances, so a later [`LpMailbox::send`]
    /// does not collide with this message's slot pair.
    ///
    /// Fails with [`Error::InvalidState`] while an asynchronous receive is
    /// registered.
    pub fn send_async(&self, message: usize) -> Result<(), Error> {
        if !self.op.take(None) {
            return Err(Error::Timeout);
        }
        let result = if async_receive_active() {
            Err(Error::InvalidState)
        } else {
            let slot = self.claim_tx_slot();
            self.backend
                .clear_interrupts((1 << slot) | (1 << (slot + 1)));
            self.backend.set_message(slot, message);
            Ok(())
        };
        self.op.give();
        result
    }

    /// Waits for a message from the LP side and acknowledges it.
    ///
    /// Fails with [`Error::InvalidState`] while an asynchronous receive is
    /// registered, and with [`Error::Timeout`] if no message arrives in
    /// time.
    pub fn receive(&self, timeout_us: Option<u32>) -> Result<usize, Error> {
        if !self.op.take(timeout_us) {
            return Err(Error::Timeout);
        }
        let result = self.receive_locked(timeout_us);
        self.op.give();
        result
    }

    /// Registers `callback` to be invoked from interrupt context for the
    /// next `count` inbound messages.
    ///
    /// Messages are acknowledged by the interrupt handler before the
    /// callback runs. Once `count` messages have been delivered the
    /// registration clears itself and the mailbox accepts synchronous
    /// operations again.
    ///
    /// Fails with [`Error::InvalidArgument`] if `count` is zero and with
    /// [`Error::InvalidState`] if an asynchronous receive is already
    /// registered.
    pub fn receive_async(&self, count: usize, callback: fn(usize)) -> Result<(), Error> {
        if count == 0 {
            return Err(Error::InvalidArgument);
        }
        if !self.op.take(None) {
            return Err(Error::Timeout);
        }
        let result = critical_section::with(|cs| {
            let mut state = ISR_STATE.borrow_ref_mut(cs);
            let Some(state) = state.as_mut() else {
                return Err(Error::InvalidState);
            };
            if state.async_receive.is_some() {
                return Err(Error::InvalidState);
            }
            state.async_receive = Some(AsyncReceive {
                callback,
                remaining: count,
            });
            Ok(())
        });
        if result.is_ok() {
            trace!("async receive armed for {} messages", count);
            // Messages that arrived while masked are delivered right away.
            self.backend.enable_interrupts(RX_PAYLOAD);
        }
        self.op.give();
        result
    }

    /// Cancels an active asynchronous receive registration.
    ///
    /// Returns how many of the requested messages had not arrived yet.
    /// Fails with [`Error::InvalidState`] if no registration is active.
    pub fn receive_async_cancel(&self) -> Result<usize, Error> {
        if !self.op.take(None) {
            return Err(Error::Timeout);
        }
        // Stop delivery before deregistering so the handler cannot observe
        // a half-cancelled state.
        self.backend.disable_interrupts(RX_PAYLOAD);
        let result = critical_section::with(|cs| {
            let mut state = ISR_STATE.borrow_ref_mut(cs);
            match state.as_mut().and_then(|state| state.async_receive.take()) {
                Some(async_receive) => Ok(async_receive.remaining),
                None => Err(Error::InvalidState),
            }
        });
        self.op.give();
        result
    }

    fn send_locked(&self, message: usize, timeout_us: Option<u32>) -> Result<(), Error> {
        if async_receive_active() {
            return Err(Error::InvalidState);
        }

        let slot = self.claim_tx_slot();
        let pair = (1u32 << slot) | (1u32 << (slot + 1));
        let ack_bit = 1u32 << (slot + 1);

        // Flags left on this pair by an earlier timed-out or fire-and-forget
        // exchange must not satisfy the ack wait below.
        self.backend.clear_interrupts(pair);
        self.backend.set_message(slot, message);
        self.backend.enable_interrupts(ack_bit);

        loop {
            if !self.wake.take(timeout_us) {
                self.backend.disable_interrupts(ack_bit);
                trace!("send on slot {} timed out waiting for ack", slot);
                return Err(Error::Timeout);
            }
            // The shared wake semaphore can carry a signal left over from an
            // earlier exchange; only the ack flag itself counts.
            if self.backend.raw_interrupt_status() & ack_bit != 0 {
                self.backend.disable_interrupts(ack_bit);
                self.backend.clear_interrupts(pair);
                return Ok(());
            }
        }
    }

    fn receive_locked(&self, timeout_us: Option<u32>) -> Result<usize, Error> {
        if async_receive_active() {
            return Err(Error::InvalidState);
        }

        loop {
            if let Some(message) = self.extract_pending() {
                return Ok(message);
            }
            self.backend.enable_interrupts(RX_PAYLOAD);
            // The full timeout budget applies to every wait in this loop; a
            // spurious wake-up extends the total admissible wait.
            if !self.wake.take(timeout_us) {
                self.backend.disable_interrupts(RX_PAYLOAD);
                return Err(Error::Timeout);
            }
        }
    }

    /// Scans the receive half for a pending payload; extracts and
    /// acknowledges the first one found, in slot order.
    fn extract_pending(&self) -> Option<usize> {
        let raw = self.backend.raw_interrupt_status();
        let mut slot = RX_FIRST;
        while slot < SLOT_COUNT {
            if raw & (1 << slot) != 0 {
                let message = self.backend.message(slot);
                self.backend.clear_interrupts(1 << slot);
                // The ack echoes the payload. Writing it raises our own flag
                // for the ack slot as well, which must not linger.
                self.backend.set_message(slot + 1, message);
                self.backend.clear_interrupts(1 << (slot + 1));
                return Some(message);
            }
            slot += 2;
        }
        None
    }

    /// Claims the next transmit pair. Serialized by the operation mutex;
    /// atomic only so the handle stays `Sync`.
    fn claim_tx_slot(&self) -> usize {
        let slot = self.tx_slot.load(Ordering::Relaxed);
        let mut next = slot + 2;
        if next >= TX_FIRST + HALF {
            next = TX_FIRST;
        }
        self.tx_slot.store(next, Ordering::Relaxed);
        slot
    }
}

impl Drop for LpMailbox {
    fn drop(&mut self) {
        self.backend.remove_interrupt_handler();
        self.backend.disable_interrupts(ALL_SLOTS);
        self.backend.clear_interrupts(ALL_SLOTS);
        critical_section::with(|cs| {
            *ISR_STATE.borrow_ref_mut(cs) = None;
        });
        TAKEN.store(false, Ordering::Release);
        debug!("lp mailbox released");
    }
}

fn async_receive_active() -> bool {
    critical_section::with(|cs| {
        ISR_STATE
            .borrow_ref(cs)
            .as_ref()
            .is_some_and(|state| state.async_receive.is_some())
    })
}

/// The mailbox interrupt handler, installed into the backend by
/// [`LpMailbox::take`].
///
/// In synchronous mode it pends the triggering interrupts and wakes the
/// blocked task, which does the actual slot work. In asynchronous mode it
/// extracts and acknowledges every pending payload itself, capped at the
/// registration's remaining count, and invokes the callback once per
/// message after releasing the state lock.
fn interrupt_handler() {
    let mut delivered: heapless::Vec<usize, MAX_BURST> = heapless::Vec::new();
    let mut callback = None;

    critical_section::with(|cs| {
        let mut state = ISR_STATE.borrow_ref_mut(cs);
        let Some(state) = state.as_mut() else {
            return;
        };
        let backend = state.backend;
        let status = backend.interrupt_status();

        match state.async_receive.as_mut() {
            None => {
                // Pend, don't clear: the woken task extracts the message (or
                // the ack) and clears the flags itself.
                backend.disable_interrupts(RX_PAYLOAD | status);
                state.wake.try_give_from_isr();
            }
            Some(async_receive) => {
                let mut processed = 0u32;
                let mut slot = RX_FIRST;
                while slot < SLOT_COUNT {
                    if status & (1 << slot) != 0 {
                        if async_receive.remaining == 0 {
                            // Cap reached; the rest stays pending for the
                            // next registration or a synchronous receive.
                            break;
                        }
                        let message = backend.message(slot);
                        // Ack before the callback runs so the LP side can
                        // reuse the pair as early as possible.
                        backend.set_message(slot + 1, message);
                        backend.clear_interrupts(1 << (slot + 1));
                        async_receive.remaining -= 1;
                        processed |= 1 << slot;
                        // Capacity equals the number of payload slots, and
                        // each is visited once.
                        let _ = delivered.push(message);
                    }
                    slot += 2;
                }
                backend.clear_interrupts(processed);
                callback = Some(async_receive.callback);
                if async_receive.remaining == 0 {
                    backend.disable_interrupts(RX_PAYLOAD);
                    state.async_receive = None;
                    trace!("async receive complete");
                }
            }
        }
    });

    if let Some(callback) = callback {
        for message in delivered {
            callback(message);
        }
    }
}

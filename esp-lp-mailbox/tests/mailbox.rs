//! Host-side mailbox tests.
//!
//! The tests drive the HP side through [`LpMailbox`] and play the LP core's
//! role by hand through the software backend's LP endpoint, the way the LP
//! firmware would: scan raw flags, consume payloads, write acks.
//!
//! The mailbox is a process-wide singleton, so the tests serialize
//! themselves and fully release the mailbox before returning.

use std::{
    sync::{Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use esp_lp_mailbox::{
    Config,
    Error,
    LpMailbox,
    MailboxBackend,
    SLOT_COUNT,
    soft::{SoftEndpoint, SoftMailbox},
};
use esp_rtos_std as _;

const RX_FIRST: usize = SLOT_COUNT / 2;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Plays the LP core: consumes `count` HP-to-LP payloads and acks each with
/// an echo of the payload. Returns the consumed (slot, value) pairs.
fn lp_respond(lp: &'static SoftEndpoint, count: usize) -> thread::JoinHandle<Vec<(usize, usize)>> {
    thread::spawn(move || {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.len() < count && Instant::now() < deadline {
            let raw = lp.raw_interrupt_status();
            let mut found = false;
            for slot in (0..RX_FIRST).step_by(2) {
                if raw & (1 << slot) != 0 {
                    let value = lp.message(slot);
                    lp.clear_interrupts(1 << slot);
                    lp.set_message(slot + 1, value);
                    lp.clear_interrupts(1 << (slot + 1));
                    seen.push((slot, value));
                    found = true;
                }
            }
            if !found {
                thread::sleep(Duration::from_micros(200));
            }
        }
        seen
    })
}

/// Sends one LP-to-HP message without waiting for the ack.
fn lp_send(lp: &SoftEndpoint, slot: usize, value: usize) {
    lp.set_message(slot, value);
    lp.clear_interrupts(1 << slot);
}

/// Waits for the HP side's ack to an LP-to-HP message and returns its value.
fn lp_await_ack(lp: &SoftEndpoint, slot: usize) -> usize {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if lp.raw_interrupt_status() & (1 << (slot + 1)) != 0 {
            lp.clear_interrupts(1 << (slot + 1));
            return lp.message(slot + 1);
        }
        assert!(Instant::now() < deadline, "no ack on slot {}", slot + 1);
        thread::sleep(Duration::from_micros(200));
    }
}

#[test]
fn take_requires_peer_and_is_exclusive() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();

    // The LP side has not published its half yet.
    assert!(matches!(
        LpMailbox::take(&HP, Config::default()),
        Err(Error::InvalidState)
    ));

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();
    assert!(matches!(
        LpMailbox::take(&HP, Config::default()),
        Err(Error::InvalidState)
    ));

    // Releasing the handle frees the singleton slot.
    drop(mailbox);
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();
    mailbox.deinit();
}

#[test]
fn sends_are_acked_and_fifo() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();

    // Five sends with four transmit pairs exercises the cursor wrap.
    let responder = lp_respond(&LP, 5);
    for message in [10, 11, 12, 13, 14] {
        mailbox.send(message, Some(1_000_000)).unwrap();
    }
    let seen = responder.join().unwrap();

    let values: Vec<usize> = seen.iter().map(|(_, value)| *value).collect();
    assert_eq!(values, [10, 11, 12, 13, 14]);
    // The cursor steps by two and wraps within the transmit half.
    let slots: Vec<usize> = seen.iter().map(|(slot, _)| *slot).collect();
    assert_eq!(slots, [0, 2, 4, 6, 0]);

    drop(mailbox);
}

#[test]
fn send_times_out_and_recovers() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();

    // Nobody is responding: the send must time out, after its full budget.
    let start = Instant::now();
    assert_eq!(mailbox.send(42, Some(50_000)), Err(Error::Timeout));
    assert!(start.elapsed() >= Duration::from_millis(50));

    // A late responder consumes both the abandoned message and the new one;
    // the new send succeeds without any manual recovery.
    let responder = lp_respond(&LP, 2);
    mailbox.send(43, Some(1_000_000)).unwrap();
    let seen = responder.join().unwrap();
    assert_eq!(seen, [(0, 42), (2, 43)]);

    drop(mailbox);
}

#[test]
fn receive_picks_up_message_sent_before_init() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();

    LP.attach();
    // The LP core speaks first; the message waits, masked but not cleared.
    lp_send(&LP, RX_FIRST, 0x5151);

    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();
    assert_eq!(mailbox.receive(Some(0)), Ok(0x5151));
    assert_eq!(lp_await_ack(&LP, RX_FIRST), 0x5151);

    // Nothing else is pending.
    assert_eq!(mailbox.receive(Some(0)), Err(Error::Timeout));

    drop(mailbox);
}

#[test]
fn receive_blocks_and_preserves_arrival_order() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();

    let sender = thread::spawn(|| {
        thread::sleep(Duration::from_millis(50));
        lp_send(&LP, RX_FIRST, 1);
        lp_send(&LP, RX_FIRST + 2, 2);
        lp_send(&LP, RX_FIRST + 4, 3);
    });

    // The first call blocks until the burst lands; all three come out in
    // arrival order.
    assert_eq!(mailbox.receive(Some(1_000_000)), Ok(1));
    assert_eq!(mailbox.receive(Some(1_000_000)), Ok(2));
    assert_eq!(mailbox.receive(Some(1_000_000)), Ok(3));
    sender.join().unwrap();

    drop(mailbox);
}

#[test]
fn async_receive_delivers_burst_in_order_then_disarms() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();
    static RECEIVED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record(message: usize) {
        RECEIVED.lock().unwrap().push(message);
    }

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();

    // Three messages arrive while receive interrupts are masked; arming the
    // async receive delivers them all in one burst.
    lp_send(&LP, RX_FIRST, 100);
    lp_send(&LP, RX_FIRST + 2, 200);
    lp_send(&LP, RX_FIRST + 4, 300);
    mailbox.receive_async(3, record).unwrap();

    assert_eq!(*RECEIVED.lock().unwrap(), [100, 200, 300]);
    // The interrupt handler acked each message before its callback ran.
    assert_eq!(lp_await_ack(&LP, RX_FIRST), 100);
    assert_eq!(lp_await_ack(&LP, RX_FIRST + 2), 200);
    assert_eq!(lp_await_ack(&LP, RX_FIRST + 4), 300);

    // The registration cleared itself after the third message: a message
    // sent now is not delivered to the callback, and synchronous receive
    // works again without an explicit cancel.
    lp_send(&LP, RX_FIRST + 6, 400);
    assert_eq!(*RECEIVED.lock().unwrap(), [100, 200, 300]);
    assert_eq!(mailbox.receive(Some(0)), Ok(400));

    drop(mailbox);
}

#[test]
fn async_receive_caps_at_requested_count() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();
    static RECEIVED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record(message: usize) {
        RECEIVED.lock().unwrap().push(message);
    }

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();

    lp_send(&LP, RX_FIRST, 7);
    lp_send(&LP, RX_FIRST + 2, 8);
    lp_send(&LP, RX_FIRST + 4, 9);
    mailbox.receive_async(2, record).unwrap();

    // Delivery stops at the requested count; the excess message stays
    // pending, unacked, for whoever consumes it next.
    assert_eq!(*RECEIVED.lock().unwrap(), [7, 8]);
    assert_eq!(mailbox.receive(Some(0)), Ok(9));
    assert_eq!(lp_await_ack(&LP, RX_FIRST + 4), 9);

    drop(mailbox);
}

#[test]
fn async_mode_excludes_other_operations() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();

    fn ignore(_message: usize) {}

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();

    assert_eq!(mailbox.receive_async(0, ignore), Err(Error::InvalidArgument));
    mailbox.receive_async(2, ignore).unwrap();

    assert_eq!(mailbox.send(1, Some(0)), Err(Error::InvalidState));
    assert_eq!(mailbox.send_async(1), Err(Error::InvalidState));
    assert_eq!(mailbox.receive(Some(0)), Err(Error::InvalidState));
    assert_eq!(mailbox.receive_async(1, ignore), Err(Error::InvalidState));

    // Cancelling reports how many messages never arrived and re-opens the
    // mailbox for synchronous use.
    assert_eq!(mailbox.receive_async_cancel(), Ok(2));
    assert_eq!(mailbox.receive_async_cancel(), Err(Error::InvalidState));

    let responder = lp_respond(&LP, 1);
    mailbox.send(5, Some(1_000_000)).unwrap();
    assert_eq!(responder.join().unwrap(), [(0, 5)]);

    drop(mailbox);
}

#[test]
fn send_async_is_fire_and_forget() {
    let _lock = lock();
    static MAILBOX: SoftMailbox = SoftMailbox::new();
    static HP: SoftEndpoint = MAILBOX.hp();
    static LP: SoftEndpoint = MAILBOX.lp();

    LP.attach();
    let mailbox = LpMailbox::take(&HP, Config::default()).unwrap();

    mailbox.send_async(21).unwrap();
    mailbox.send_async(22).unwrap();

    // Both messages are already visible to the LP side, no ack required.
    assert_eq!(LP.message(0), 21);
    assert_eq!(LP.message(2), 22);
    assert_eq!(LP.raw_interrupt_status() & 0b101, 0b101);

    // The cursor advanced past both: a synchronous send uses the third
    // pair. The responder drains the two fire-and-forget messages too.
    let responder = lp_respond(&LP, 3);
    mailbox.send(23, Some(1_000_000)).unwrap();
    assert_eq!(responder.join().unwrap(), [(0, 21), (2, 22), (4, 23)]);

    drop(mailbox);
}

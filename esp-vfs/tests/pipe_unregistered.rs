//! Runs in its own process so the pipe driver is guaranteed unregistered.

use esp_rtos_std as _;
use esp_vfs::{Errno, pipe};

#[test]
fn pipe_creation_requires_the_driver_to_be_registered() {
    assert_eq!(pipe::pipe(), Err(Errno::EPERM));
}

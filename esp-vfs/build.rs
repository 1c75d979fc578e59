use esp_config::{Value, generate_config};

fn main() {
    generate_config(
        "esp_vfs",
        &[
            (
                "max_fds",
                Value::UnsignedInteger(64),
                "Size of the global file descriptor table. Every descriptor handed out \
                by the VFS, including the reserved socket range, lives below this value.",
            ),
            (
                "max_drivers",
                Value::UnsignedInteger(8),
                "Number of filesystem driver registrations the VFS can hold at once.",
            ),
            (
                "socket_fds",
                Value::UnsignedInteger(16),
                "Number of descriptors at the top of the table reserved for the \
                socket-space driver. Set to 0 if no socket stack is registered.",
            ),
            (
                "path_max",
                Value::UnsignedInteger(15),
                "Longest allowed registration prefix, in bytes.",
            ),
            (
                "pipe_count",
                Value::UnsignedInteger(8),
                "Number of anonymous pipes that can exist at the same time.",
            ),
            (
                "select_watchers",
                Value::UnsignedInteger(16),
                "Size of the pipe driver's watcher pool. One watcher is used per pipe \
                descriptor of interest in each concurrently blocked select() call.",
            ),
        ],
        true,
    );
}

use esp_config::{Value, generate_config};

fn main() {
    generate_config(
        "esp_lp_mailbox",
        &[(
            "slot_count",
            Value::UnsignedInteger(16),
            "Total number of message slots shared between the HP and LP cores. Each \
            direction owns half of them, used as payload/acknowledgement pairs, so the \
            value must be a multiple of 4. At most 32 slots are supported since slot \
            interrupt state is tracked in a 32-bit mask.",
        )],
        true,
    );
}

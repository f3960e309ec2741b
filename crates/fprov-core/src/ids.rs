#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Usb,
    Emulator,
    Network,
}

pub(crate) fn classify_serial(serial: &str) -> ConnectionKind {
    if serial.starts_with("emulator-") {
        ConnectionKind::Emulator
    } else if serial.contains(':') {
        ConnectionKind::Network
    } else {
        ConnectionKind::Usb
    }
}

/// Folds the loopback spellings adb accepts for network devices into one
/// form so `localhost:5555` and `127.0.0.1:5555` compare equal.
pub(crate) fn canonicalize_serial(serial: &str) -> String {
    let serial = serial.trim();
    let lower = serial.to_ascii_lowercase();
    for prefix in ["localhost:", "0.0.0.0:", "[::1]:", "[::]:"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return format!("127.0.0.1:{rest}");
        }
    }
    serial.to_string()
}

pub(crate) fn same_serial(a: &str, b: &str) -> bool {
    let a = canonicalize_serial(a);
    let b = canonicalize_serial(b);
    if a.contains(':') || b.contains(':') {
        a.eq_ignore_ascii_case(&b)
    } else {
        a == b
    }
}

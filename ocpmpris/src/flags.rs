use std::sync::atomic::{AtomicBool, Ordering};

/// Level-triggered command mailbox into the bridge loop.
///
/// Any thread may set a flag; the loop drains them once per tick. Setting a
/// flag twice before a drain has the effect of setting it once.
#[derive(Debug, Default)]
pub struct CommandFlags {
    pub stop_all: AtomicBool,
    pub pause_all: AtomicBool,
    pub prev: AtomicBool,
    pub next: AtomicBool,
    pub resume: AtomicBool,
    pub shuffle: AtomicBool,
    pub repeat: AtomicBool,
    /// Exported properties changed; re-announce them on the bus.
    pub props_dirty: AtomicBool,
}

impl CommandFlags {
    pub fn set(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    /// Read-and-clear in one step so a flag set during handling is kept for
    /// the next tick instead of being lost.
    pub fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_the_flag() {
        let flags = CommandFlags::default();
        CommandFlags::set(&flags.next);
        CommandFlags::set(&flags.next);
        assert!(CommandFlags::take(&flags.next));
        assert!(!CommandFlags::take(&flags.next));
    }
}

//! Cooperative signal delivery.
//!
//! Signals are only ever observed at a checkpoint. Raising one just sets a
//! pending bit in the owning process; [`SignalState::dispatch`] consumes it
//! and tells the caller what to do.

/// Address of a handler routine inside the process's memory.
pub type Handler = u16;

/// Exit code of a process terminated by a signal's default action.
pub const SIGNAL_EXIT_CODE: i16 = -1;

/// Signal kinds. The discriminant is the syscall ABI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    Cancel = 0,
    Break = 1,
}

impl Signal {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl TryFrom<u8> for Signal {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cancel),
            1 => Ok(Self::Break),
            _ => Err(value),
        }
    }
}

/// Set of pending signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSet(u8);

impl SignalSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, signal: Signal) {
        self.0 |= signal.bit();
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !signal.bit();
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.0 & signal.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Raw bit pattern (`bit0` = cancel, `bit1` = break).
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// What should happen for a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Enter the registered handler.
    Handler(Handler),
    /// No handler registered; terminate the process.
    Default,
}

/// Result of evaluating a cooperative checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Cancelled(Disposition),
    Broken(Disposition),
}

impl Outcome {
    fn delivered(signal: Signal, disposition: Disposition) -> Self {
        match signal {
            Signal::Cancel => Outcome::Cancelled(disposition),
            Signal::Break => Outcome::Broken(disposition),
        }
    }

    /// Disposition carried by a delivered signal.
    pub fn disposition(&self) -> Option<Disposition> {
        match self {
            Outcome::Continue => None,
            Outcome::Cancelled(d) | Outcome::Broken(d) => Some(*d),
        }
    }
}

/// Per-process signal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalState {
    pub pending: SignalSet,
    pub cancel: Option<Handler>,
    pub brk: Option<Handler>,
}

impl SignalState {
    /// Mark a signal pending.
    pub fn raise(&mut self, signal: Signal) {
        self.pending.insert(signal);
    }

    /// Register (or clear, with `None`) the handler for a signal.
    pub fn set_handler(&mut self, signal: Signal, handler: Option<Handler>) {
        match signal {
            Signal::Cancel => self.cancel = handler,
            Signal::Break => self.brk = handler,
        }
    }

    pub fn handler(&self, signal: Signal) -> Option<Handler> {
        match signal {
            Signal::Cancel => self.cancel,
            Signal::Break => self.brk,
        }
    }

    /// Consume one pending signal. Cancel wins over break.
    pub fn dispatch(&mut self) -> Outcome {
        for signal in [Signal::Cancel, Signal::Break] {
            if self.pending.contains(signal) {
                self.pending.remove(signal);
                let disposition = match self.handler(signal) {
                    Some(h) => Disposition::Handler(h),
                    None => Disposition::Default,
                };
                return Outcome::delivered(signal, disposition);
            }
        }
        Outcome::Continue
    }
}

/// Signal raised by a console key, if any.
///
/// `CAN` (0x18) cancels, `ETX` (Ctrl-C) breaks.
pub fn signal_for_key(key: u8) -> Option<Signal> {
    match key {
        0x18 => Some(Signal::Cancel),
        0x03 => Some(Signal::Break),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_nothing_pending() {
        let mut state = SignalState::default();
        assert_eq!(state.dispatch(), Outcome::Continue);
    }

    #[test]
    fn test_dispatch_cancel_with_handler() {
        let mut state = SignalState::default();
        state.set_handler(Signal::Cancel, Some(0x8123));
        state.raise(Signal::Cancel);

        assert_eq!(
            state.dispatch(),
            Outcome::Cancelled(Disposition::Handler(0x8123))
        );
        // Bit cleared
        assert_eq!(state.dispatch(), Outcome::Continue);
    }

    #[test]
    fn test_dispatch_break_default() {
        let mut state = SignalState::default();
        state.set_handler(Signal::Cancel, Some(0x8123));
        state.raise(Signal::Break);

        assert_eq!(state.dispatch(), Outcome::Broken(Disposition::Default));
    }

    #[test]
    fn test_cancel_before_break() {
        let mut state = SignalState::default();
        state.raise(Signal::Break);
        state.raise(Signal::Cancel);

        assert!(matches!(state.dispatch(), Outcome::Cancelled(_)));
        assert!(matches!(state.dispatch(), Outcome::Broken(_)));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_signal_from_abi() {
        assert_eq!(Signal::try_from(0), Ok(Signal::Cancel));
        assert_eq!(Signal::try_from(1), Ok(Signal::Break));
        assert_eq!(Signal::try_from(7), Err(7));
        assert_eq!(signal_for_key(0x18), Some(Signal::Cancel));
        assert_eq!(signal_for_key(b'a'), None);
    }
}

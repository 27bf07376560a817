//! Small shared helpers.

use core::cell::RefCell;

use critical_section::Mutex;

/// Holder for state that an interrupt handler needs but cannot receive as an
/// argument. The platform glue fills the cell at boot, after configuration,
/// and the ISR trampoline calls [`IsrCell::with`].
pub struct IsrCell<T> {
    inner: Mutex<RefCell<Option<T>>>,
}

impl<T> IsrCell<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    pub fn put(&self, value: T) {
        critical_section::with(|cs| {
            self.inner.borrow(cs).replace(Some(value));
        });
    }

    pub fn take(&self) -> Option<T> {
        critical_section::with(|cs| self.inner.borrow(cs).take())
    }

    /// Run `f` on the stored value, if any.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        critical_section::with(|cs| self.inner.borrow(cs).borrow_mut().as_mut().map(f))
    }
}

impl<T> Default for IsrCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// `(a * b) >> 24`, saturated into 16 bits.
///
/// Replaces the hand-scheduled multiply the speed recalculation used on
/// 8-bit targets: `a` is an elapsed-tick accumulator, `b` an acceleration
/// rate, and the high word is the step-rate delta.
#[inline(always)]
pub fn mul_u24x24_h16(a: u32, b: u32) -> u16 {
    let wide = (a as u64 * b as u64) >> 24;
    if wide > u16::MAX as u64 {
        u16::MAX
    } else {
        wide as u16
    }
}

#[cfg(test)]
use mockall::automock;

/// Raw access to the card's HPI registers.
///
/// This is the vendor primitive: whoever maps the PCI BAR supplies an
/// implementation. Offsets are byte offsets from the start of the register
/// window, already scaled by the bus stride.
#[cfg_attr(test, automock)]
pub trait RegisterAccess: Send {
    /// Read a 32-bit register.
    fn read_register(&mut self, offset: u32) -> u32;

    /// Write a 32-bit register.
    fn write_register(&mut self, offset: u32, value: u32);
}

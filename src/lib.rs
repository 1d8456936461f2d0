//! Host driver for UPC2 PCI DSP acquisition cards.
//!
//! The integrator supplies register access to each card's HPI window
//! ([`traits::RegisterAccess`]); the driver handles the memory transport,
//! command protocol, frame ring buffer, firmware programming and a demo
//! data path for machines without a card.

pub mod pci;
pub mod settings;
pub mod traits;

#[cfg(test)]
mod test_helpers;

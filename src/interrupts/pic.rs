//! # Programmable Interrupt Controller (8259 PIC)
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐
//! │   PIC 1     │     │   PIC 2     │
//! │  (Master)   │◀────│  (Slave)    │
//! │ IRQ 0-7     │ IR2 │ IRQ 8-15    │
//! └─────────────┘     └─────────────┘
//!       │
//!       ▼
//!     CPU
//! ```
//!
//! ## Vector Remapping
//!
//! Out of reset IRQ 0-7 land on CPU exception vectors, so both chips are
//! moved:
//! - PIC 1: vectors 0x20-0x27 (IRQ 0-7)
//! - PIC 2: vectors 0x28-0x2F (IRQ 8-15)
//!
//! Every line starts masked. Drivers unmask the lines they own.

use crate::arch::PicChips;
use crate::config::{PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET};
use crate::serial_println;
use crate::sync::IrqMutex;

use super::idt::InterruptError;

pub const IRQ_LINES: u8 = 16;
/// Master input the slave is wired to.
pub const CASCADE_LINE: u8 = 2;

pub struct Pic {
    chips: PicChips,
    offsets: [u8; 2],
}

impl Pic {
    pub const fn new(master_offset: u8, slave_offset: u8) -> Self {
        Self {
            chips: unsafe { PicChips::new(master_offset, slave_offset) },
            offsets: [master_offset, slave_offset],
        }
    }

    /// Runs the ICW1-ICW4 sequence with new vector bases. The masks in
    /// force before the remap are put back afterwards.
    pub fn remap(&mut self, master_offset: u8, slave_offset: u8) {
        let masks = unsafe { self.chips.read_masks() };
        self.chips = unsafe { PicChips::new(master_offset, slave_offset) };
        self.offsets = [master_offset, slave_offset];
        unsafe {
            self.chips.initialize();
            self.chips.write_masks(masks[0], masks[1]);
        }
    }

    pub fn offsets(&self) -> [u8; 2] {
        self.offsets
    }

    pub fn masks(&mut self) -> [u8; 2] {
        unsafe { self.chips.read_masks() }
    }

    pub fn mask_all(&mut self) {
        unsafe { self.chips.write_masks(0xFF, 0xFF) }
    }

    /// Chip index and bit for a logical line.
    fn route(line: u8) -> Result<(usize, u8), InterruptError> {
        match line {
            0..=7 => Ok((0, 1 << line)),
            8..=15 => Ok((1, 1 << (line - 8))),
            _ => Err(InterruptError::InvalidLine(line)),
        }
    }

    pub fn set_mask(&mut self, line: u8) -> Result<(), InterruptError> {
        let (chip, bit) = Self::route(line)?;
        let mut masks = self.masks();
        masks[chip] |= bit;
        unsafe { self.chips.write_masks(masks[0], masks[1]) };
        Ok(())
    }

    /// Unmasks `line`; a slave line also opens the cascade input.
    pub fn clear_mask(&mut self, line: u8) -> Result<(), InterruptError> {
        let (chip, bit) = Self::route(line)?;
        let mut masks = self.masks();
        masks[chip] &= !bit;
        if chip == 1 {
            masks[0] &= !(1 << CASCADE_LINE);
        }
        unsafe { self.chips.write_masks(masks[0], masks[1]) };
        Ok(())
    }

    pub fn irq_vector(&self, line: u8) -> Result<u8, InterruptError> {
        let (chip, _) = Self::route(line)?;
        Ok(self.offsets[chip] + line % 8)
    }

    pub fn line_for_vector(&self, vector: u8) -> Option<u8> {
        self.offsets
            .iter()
            .enumerate()
            .find(|&(_, &base)| (base..base.saturating_add(8)).contains(&vector))
            .map(|(chip, &base)| vector - base + 8 * chip as u8)
    }

    /// Acknowledges `line`: master always, slave too for lines 8-15.
    pub fn send_eoi(&mut self, line: u8) -> Result<(), InterruptError> {
        let vector = self.irq_vector(line)?;
        unsafe { self.chips.notify_end_of_interrupt(vector) };
        Ok(())
    }
}

pub static PIC: IrqMutex<Pic> = IrqMutex::new(Pic::new(PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET));

/// Remaps to 0x20/0x28 with every line masked.
pub fn init() {
    let mut pic = PIC.lock();
    pic.remap(PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET);
    pic.mask_all();
    serial_println!("[pic] remapped to {:#x}/{:#x}, all lines masked", PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET);
}

pub fn set_mask(line: u8) -> Result<(), InterruptError> {
    PIC.lock().set_mask(line)
}

pub fn clear_mask(line: u8) -> Result<(), InterruptError> {
    PIC.lock().clear_mask(line)
}

pub fn send_eoi(line: u8) -> Result<(), InterruptError> {
    PIC.lock().send_eoi(line)
}

pub fn irq_vector(line: u8) -> Result<u8, InterruptError> {
    PIC.lock().irq_vector(line)
}

pub fn line_for_vector(vector: u8) -> Option<u8> {
    PIC.lock().line_for_vector(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remapped() -> Pic {
        let mut pic = Pic::new(0x08, 0x70);
        pic.remap(PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET);
        pic.mask_all();
        pic
    }

    #[test]
    fn test_remap_keeps_masks() {
        let mut pic = Pic::new(0x08, 0x70);
        unsafe { pic.chips.write_masks(0b1011_0000, 0b0000_0110) };
        pic.remap(0x20, 0x28);
        assert_eq!(pic.offsets(), [0x20, 0x28]);
        assert_eq!(pic.masks(), [0b1011_0000, 0b0000_0110]);
        assert_eq!(pic.chips.initialized, 1);
    }

    #[test]
    fn test_lines_route_to_their_chip() {
        let mut pic = remapped();
        pic.clear_mask(1).unwrap();
        assert_eq!(pic.masks(), [0xFF & !0b10, 0xFF]);

        pic.clear_mask(12).unwrap();
        assert_eq!(pic.masks(), [0xFF & !0b10 & !(1 << CASCADE_LINE), 0xFF & !(1 << 4)]);

        pic.set_mask(12).unwrap();
        assert_eq!(pic.masks()[1], 0xFF);
        pic.set_mask(1).unwrap();
        assert_eq!(pic.masks()[0] & 0b10, 0b10);
    }

    #[test]
    fn test_invalid_line_is_rejected() {
        let mut pic = remapped();
        assert_eq!(pic.clear_mask(16), Err(InterruptError::InvalidLine(16)));
        assert_eq!(pic.set_mask(200), Err(InterruptError::InvalidLine(200)));
        assert_eq!(pic.send_eoi(16), Err(InterruptError::InvalidLine(16)));
        assert_eq!(pic.masks(), [0xFF, 0xFF]);
    }

    #[test]
    fn test_eoi_reaches_slave_only_for_high_lines() {
        let mut pic = remapped();
        pic.send_eoi(1).unwrap();
        assert_eq!(pic.chips.eoi_sent, [1, 0]);
        pic.send_eoi(12).unwrap();
        assert_eq!(pic.chips.eoi_sent, [2, 1]);
    }

    #[test]
    fn test_vector_translation() {
        let pic = remapped();
        assert_eq!(pic.irq_vector(0), Ok(0x20));
        assert_eq!(pic.irq_vector(15), Ok(0x2F));
        assert_eq!(pic.line_for_vector(0x21), Some(1));
        assert_eq!(pic.line_for_vector(0x2C), Some(12));
        assert_eq!(pic.line_for_vector(0x30), None);
        assert_eq!(pic.line_for_vector(0x80), None);
    }
}

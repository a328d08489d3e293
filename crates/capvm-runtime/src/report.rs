//! Human-readable trap reports

use std::fmt;

use capvm_arch::cause::MCAUSE_CHERI;
use capvm_arch::regs::REGISTER_NAMES;
use capvm_arch::{mem, Capability, CheriFault, FaultRegister, Reg, RegisterFile, TrappedFrame, CAP_BYTES};

/// Capability-sized slots shown in the stack view.
pub const STACK_VIEW_SLOTS: u32 = 32;

/// Packs a trap into the argument of the `OSError` it becomes: cause in the
/// top byte, the low 24 bits of the detail below it.
pub fn pack_fault(mcause: u32, mtval: u32) -> u32 {
    (mcause << 24) | (mtval & 0x00ff_ffff)
}

/// Everything worth knowing about one trap, captured from the trapped frame.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub compartment: String,
    pub mcause: u32,
    pub mtval: u32,
    pub pcc: Capability,
    pub registers: RegisterFile,
    /// Capabilities read upwards from `csp`; stops at the first slot the
    /// stack capability cannot reach.
    pub stack: Vec<Capability>,
}

impl FaultReport {
    pub fn capture(compartment: &str, frame: &TrappedFrame, mcause: u32, mtval: u32) -> Self {
        let sp = frame.register(Reg::Sp);
        let stack = if sp.is_tagged() {
            (0..STACK_VIEW_SLOTS)
                .map_while(|i| {
                    let bytes = mem::read_bytes(&sp, i * CAP_BYTES as u32, CAP_BYTES as u32).ok()?;
                    let mut image = [0u8; CAP_BYTES];
                    image.copy_from_slice(&bytes);
                    Some(Capability::from_bytes(&image))
                })
                .collect()
        } else {
            Vec::new()
        };
        FaultReport {
            compartment: compartment.to_string(),
            mcause,
            mtval,
            pcc: frame.pcc(),
            registers: *frame.registers(),
            stack,
        }
    }

    /// The decoded violation, for CHERI traps.
    pub fn cheri(&self) -> Option<CheriFault> {
        (self.mcause == MCAUSE_CHERI).then(|| CheriFault::decode(self.mtval))
    }

    pub fn packed(&self) -> u32 {
        pack_fault(self.mcause, self.mtval)
    }
}

fn write_cap(f: &mut fmt::Formatter<'_>, cap: &Capability) -> fmt::Result {
    write!(
        f,
        "{} [base {:#x}, len {:#x}, perms {:#x}, tag {}]",
        cap,
        cap.base(),
        cap.length(),
        cap.perms().bits(),
        u8::from(cap.is_tagged())
    )
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cheri() {
            Some(fault) => {
                writeln!(f, "CHERI fault (type {}):", fault.name())?;
                writeln!(f, "\tat {} in compartment '{}'", self.pcc, self.compartment)?;
                match fault.register {
                    FaultRegister::Special(reg) => writeln!(f, "\ton {}", reg.name())?,
                    FaultRegister::Unknown(index) => writeln!(f, "\ton unknown register {:#x}", index)?,
                    FaultRegister::Zero if self.mtval == 0 => {}
                    FaultRegister::Zero => writeln!(
                        f,
                        "\ton capability {} [base 0x0, len 0x0, perms 0x0] in register c{}",
                        Capability::NULL,
                        REGISTER_NAMES[0]
                    )?,
                    FaultRegister::General(reg) => {
                        let cap = self.registers.get(reg);
                        writeln!(
                            f,
                            "\ton capability {} [base {:#x}, len {:#x}, perms {:#x}] in register c{}",
                            cap,
                            cap.base(),
                            cap.length(),
                            cap.perms().bits(),
                            reg.name()
                        )?
                    }
                }
            }
            None => {
                writeln!(f, "Error (mcause {:#x}; mtval {:#x}):", self.mcause, self.mtval)?;
                writeln!(f, "\tat {}", self.pcc)?;
            }
        }
        writeln!(f, "\tRegisters:")?;
        for reg in Reg::ALL {
            write!(f, "\t\tc{} : ", reg.name())?;
            write_cap(f, &self.registers.get(reg))?;
            writeln!(f)?;
        }
        writeln!(f, "\tStack view:")?;
        for (i, cap) in self.stack.iter().enumerate() {
            write!(f, "\t\t+{:02x} : ", i * CAP_BYTES)?;
            write_cap(f, cap)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capvm_arch::cause::{MCAUSE_ILLEGAL_INSTRUCTION, MTVAL_SPECIAL_REGISTER};
    use capvm_arch::{Allocator, CapFault};

    fn frame_with(reg: Reg, cap: Capability) -> TrappedFrame {
        let mut registers = RegisterFile::default();
        registers.set(reg, cap);
        TrappedFrame::new(Capability::from_address(0x2000_0010), registers)
    }

    #[test]
    fn test_packing_keeps_cause_and_low_detail() {
        assert_eq!(pack_fault(0x1c, 0x161), 0x1c00_0161);
        assert_eq!(pack_fault(0x2, 0xabcd_ef12), 0x02cd_ef12);
    }

    #[test]
    fn test_general_register_fault_names_the_capability() {
        let heap = Allocator::with_quota(64);
        let cap = heap.alloc(16).unwrap();
        let mtval = CheriFault::encode(Reg::A1, CapFault::Bounds);
        let report = FaultReport::capture("mp_vm", &frame_with(Reg::A1, cap), MCAUSE_CHERI, mtval);
        let text = report.to_string();
        assert!(text.starts_with("CHERI fault (type BOUNDS):\n\tat 0x20000010 in compartment 'mp_vm'\n"));
        assert!(text.contains(&format!("\ton capability {} [base {:#x}, len 0x10, perms", cap, cap.base())));
        assert!(text.contains("in register ca1\n"));
        assert!(text.contains("\t\tcra : 0x00000000 [base 0x0, len 0x0, perms 0x0, tag 0]\n"));
        assert_eq!(text.matches("\t\tc").count(), 15);
    }

    #[test]
    fn test_special_register_fault() {
        let frame = frame_with(Reg::Ra, Capability::NULL);
        let report = FaultReport::capture("mp_vm", &frame, MCAUSE_CHERI, MTVAL_SPECIAL_REGISTER | 0x11);
        let text = report.to_string();
        assert!(text.starts_with("CHERI fault (type EXEC):"));
        assert!(text.contains("\ton PCC\n"));
    }

    #[test]
    fn test_other_traps_report_cause_and_detail() {
        let frame = frame_with(Reg::Ra, Capability::NULL);
        let report = FaultReport::capture("mp_vm", &frame, MCAUSE_ILLEGAL_INSTRUCTION, 0x1234);
        assert!(report.cheri().is_none());
        assert!(report.to_string().starts_with("Error (mcause 0x2; mtval 0x1234):\n\tat 0x20000010\n"));
    }

    #[test]
    fn test_stack_view_reads_through_csp() {
        let heap = Allocator::with_quota(0x400);
        let stack = heap.alloc(0x40).unwrap();
        let saved = heap.alloc(8).unwrap();
        mem::write_bytes(&stack, 0, &saved.to_bytes()).unwrap();
        let report = FaultReport::capture("mp_vm", &frame_with(Reg::Sp, stack), MCAUSE_ILLEGAL_INSTRUCTION, 0);
        assert_eq!(report.stack.len(), 4);
        assert_eq!(report.stack[0].address(), saved.address());
        assert!(!report.stack[0].is_tagged());
        assert!(report.to_string().contains("\t\t+30 : "));
    }
}

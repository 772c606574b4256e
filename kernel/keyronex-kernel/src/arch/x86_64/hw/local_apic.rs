//! Local APIC driver.
//!
//! Controls per-CPU interrupt acceptance, IPI delivery, and the periodic
//! timer that drives the scheduler's hardclock.

use crate::addr::VirtAddr;

const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_SPURIOUS: u32 = 0x0F0;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;
const REG_TPR: u32 = 0x080;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INITIAL_COUNT: u32 = 0x380;
const REG_TIMER_CURRENT_COUNT: u32 = 0x390;
const REG_TIMER_DIVIDE_CONFIG: u32 = 0x3E0;

const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const LVT_MASKED: u32 = 1 << 16;
const APIC_SW_ENABLE: u32 = 1 << 8;

/// Delivery mode for an inter-processor interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiDeliveryMode {
    /// Deliver the vector normally.
    Fixed = 0b000,
    /// Non-maskable interrupt.
    Nmi = 0b100,
    /// INIT signal, used during AP bring-up.
    Init = 0b101,
    /// Startup IPI, used during AP bring-up.
    StartUp = 0b110,
}

/// Local APIC driver using MMIO register access.
pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// Creates a new Local APIC driver.
    ///
    /// # Safety
    ///
    /// `virt_base` must be a valid mapping of the Local APIC MMIO region.
    pub unsafe fn new(virt_base: VirtAddr) -> Self {
        Self { base: virt_base }
    }

    /// Returns this CPU's Local APIC ID.
    pub fn id(&self) -> u8 {
        ((self.read_reg(REG_ID) >> 24) & 0xFF) as u8
    }

    /// Software-enables the APIC and sets the spurious interrupt vector.
    pub fn enable(&self, spurious_vector: u8) {
        self.write_reg(
            REG_SPURIOUS,
            u32::from(spurious_vector) | APIC_SW_ENABLE,
        );
    }

    /// Sets the Task Priority Register, gating which vectors are accepted.
    /// A value of 0 accepts all interrupts.
    pub fn set_tpr(&self, priority: u8) {
        self.write_reg(REG_TPR, u32::from(priority));
    }

    /// Signals End-Of-Interrupt to the Local APIC.
    pub fn eoi(&self) {
        self.write_reg(REG_EOI, 0);
    }

    /// Starts the timer in one-shot mode with the given initial count and
    /// divide value (1, 2, 4, 8, 16, 32, 64, or 128).
    pub fn start_timer_oneshot(&self, vector: u8, initial_count: u32, divide: u8) {
        self.write_reg(REG_LVT_TIMER, u32::from(vector));
        self.write_reg(REG_TIMER_DIVIDE_CONFIG, encode_divide(divide));
        self.write_reg(REG_TIMER_INITIAL_COUNT, initial_count);
    }

    /// Starts the timer in periodic mode with the given initial count and
    /// divide value.
    pub fn start_timer_periodic(&self, vector: u8, initial_count: u32, divide: u8) {
        self.write_reg(REG_LVT_TIMER, u32::from(vector) | LVT_TIMER_PERIODIC);
        self.write_reg(REG_TIMER_DIVIDE_CONFIG, encode_divide(divide));
        self.write_reg(REG_TIMER_INITIAL_COUNT, initial_count);
    }

    /// Masks the timer LVT entry, stopping delivery.
    pub fn stop_timer(&self) {
        self.write_reg(REG_LVT_TIMER, LVT_MASKED);
        self.write_reg(REG_TIMER_INITIAL_COUNT, 0);
    }

    /// Reads the timer's current countdown value.
    pub fn timer_current_count(&self) -> u32 {
        self.read_reg(REG_TIMER_CURRENT_COUNT)
    }

    /// Sends an IPI to a specific destination APIC ID.
    pub fn send_ipi(&self, dest_apic_id: u8, vector: u8, mode: IpiDeliveryMode) {
        self.write_reg(REG_ICR_HIGH, u32::from(dest_apic_id) << 24);
        self.write_reg(
            REG_ICR_LOW,
            u32::from(vector) | (u32::from(mode as u8) << 8),
        );
        self.wait_for_icr_idle();
    }

    /// Sends an NMI to every other CPU (used to halt all cores on panic).
    pub fn send_broadcast_nmi(&self) {
        // Shorthand 0b11 (all excluding self) in bits 18:19, NMI delivery mode.
        self.write_reg(REG_ICR_HIGH, 0);
        self.write_reg(REG_ICR_LOW, (0b11 << 18) | (u32::from(IpiDeliveryMode::Nmi as u8) << 8));
    }

    fn wait_for_icr_idle(&self) {
        // Bit 12 of ICR_LOW is the delivery status bit; 0 means idle.
        while self.read_reg(REG_ICR_LOW) & (1 << 12) != 0 {
            core::hint::spin_loop();
        }
    }

    #[inline]
    fn read_reg(&self, reg: u32) -> u32 {
        // SAFETY: The caller of `LocalApic::new` guarantees `self.base` points
        // to a valid Local APIC MMIO region; all registers used here fall
        // within the architecturally-defined 4 KiB window.
        unsafe { core::ptr::read_volatile((self.base.as_u64() + u64::from(reg)) as *const u32) }
    }

    #[inline]
    fn write_reg(&self, reg: u32, value: u32) {
        // SAFETY: See `read_reg`.
        unsafe {
            core::ptr::write_volatile((self.base.as_u64() + u64::from(reg)) as *mut u32, value);
        }
    }
}

/// Encodes a divide value (1..=128, power of two) into the APIC's bitfield.
fn encode_divide(divide: u8) -> u32 {
    match divide {
        1 => 0b1011,
        2 => 0b0000,
        4 => 0b0001,
        8 => 0b0010,
        16 => 0b0011,
        32 => 0b1000,
        64 => 0b1001,
        128 => 0b1010,
        _ => 0b0011, // default to 16
    }
}

//! Minimal ACPI static table parser.
//!
//! Firmware table discovery (RSDP -> RSDT/XSDT -> MADT/HPET/MCFG) is platform
//! bring-up, not part of the executive core proper — this module exists only
//! to hand the interrupt and timer subsystems the handful of addresses they
//! need (Local APIC base, I/O APIC entries, HPET base). It intentionally does
//! not parse AML or any table beyond what `acpi::init` consumes.

use core::marker::PhantomData;
use core::mem::size_of;

/// Errors produced while locating or validating ACPI tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The RSDP signature or checksum did not validate.
    InvalidRsdp,
    /// A requested table signature was not present in the RSDT/XSDT.
    NotFound,
    /// A table's checksum did not validate.
    BadChecksum,
}

/// Translates physical ACPI table addresses into readable pointers.
///
/// # Safety
///
/// Implementations must return a pointer that stays valid and mapped for at
/// least `size` bytes for the lifetime of the `AcpiTables` instance.
pub unsafe trait AcpiHandler {
    /// Maps `size` bytes at physical address `phys` and returns a read pointer.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> *const u8;
}

#[repr(C, packed)]
struct RsdpV1 {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8,
    rsdt_address: u32,
}

#[repr(C, packed)]
struct RsdpV2 {
    v1: RsdpV1,
    length: u32,
    xsdt_address: u64,
    extended_checksum: u8,
    reserved: [u8; 3],
}

/// A generic ACPI System Description Table header, common to every table.
#[repr(C, packed)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

/// Parsed ACPI table set: validated RSDP plus a handle on the RSDT/XSDT.
pub struct AcpiTables<H: AcpiHandler> {
    handler: H,
    root_addr: u64,
    xsdt: bool,
    entry_count: usize,
}

impl<H: AcpiHandler> AcpiTables<H> {
    /// Validates the RSDP at `rsdp_phys` and locates the RSDT or XSDT.
    pub fn new(rsdp_phys: u64, handler: H) -> Result<Self, AcpiError> {
        // SAFETY: The caller guarantees `rsdp_phys` is a genuine RSDP address
        // (from the bootloader); RsdpV2 is the maximal size we might read.
        let ptr = unsafe { handler.map_physical_region(rsdp_phys, size_of::<RsdpV2>()) };
        // SAFETY: `ptr` points to at least `size_of::<RsdpV1>()` readable bytes.
        let v1 = unsafe { &*(ptr as *const RsdpV1) };
        if &v1.signature != b"RSD PTR " {
            return Err(AcpiError::InvalidRsdp);
        }
        if !checksum_ok(ptr, size_of::<RsdpV1>()) {
            return Err(AcpiError::InvalidRsdp);
        }

        if v1.revision >= 2 {
            // SAFETY: revision >= 2 means the firmware laid out a full RsdpV2.
            let v2 = unsafe { &*(ptr as *const RsdpV2) };
            let xsdt_address = v2.xsdt_address;
            if xsdt_address != 0 {
                return Self::from_root(handler, xsdt_address, true);
            }
        }
        let rsdt_address = u64::from(v1.rsdt_address);
        Self::from_root(handler, rsdt_address, false)
    }

    fn from_root(handler: H, root_addr: u64, xsdt: bool) -> Result<Self, AcpiError> {
        // SAFETY: `root_addr` is taken from a validated RSDP; the header is
        // the minimum amount of any SDT that must be readable.
        let hdr_ptr = unsafe { handler.map_physical_region(root_addr, size_of::<SdtHeader>()) };
        // SAFETY: see above.
        let hdr = unsafe { &*(hdr_ptr as *const SdtHeader) };
        let expected_sig: &[u8; 4] = if xsdt { b"XSDT" } else { b"RSDT" };
        if &hdr.signature != expected_sig {
            return Err(AcpiError::InvalidRsdp);
        }
        let length = hdr.length as usize;
        let entry_size = if xsdt { 8 } else { 4 };
        let entry_count = (length.saturating_sub(size_of::<SdtHeader>())) / entry_size;

        Ok(Self {
            handler,
            root_addr,
            xsdt,
            entry_count,
        })
    }

    /// Returns whether the root table is an XSDT (vs. legacy RSDT).
    pub fn is_xsdt(&self) -> bool {
        self.xsdt
    }

    /// Returns the physical address of the root RSDT/XSDT.
    pub fn rsdt_addr(&self) -> u64 {
        self.root_addr
    }

    fn entry_addr(&self, index: usize) -> u64 {
        let entries_offset = self.root_addr + size_of::<SdtHeader>() as u64;
        if self.xsdt {
            let ptr = unsafe {
                self.handler
                    .map_physical_region(entries_offset + index as u64 * 8, 8)
            };
            unsafe { core::ptr::read_unaligned(ptr as *const u64) }
        } else {
            let ptr = unsafe {
                self.handler
                    .map_physical_region(entries_offset + index as u64 * 4, 4)
            };
            u64::from(unsafe { core::ptr::read_unaligned(ptr as *const u32) })
        }
    }

    fn find_table(&self, signature: &[u8; 4]) -> Result<(u64, usize), AcpiError> {
        for i in 0..self.entry_count {
            let addr = self.entry_addr(i);
            // SAFETY: `addr` came from the RSDT/XSDT entry array, which points
            // at valid SDTs per the ACPI specification.
            let hdr_ptr =
                unsafe { self.handler.map_physical_region(addr, size_of::<SdtHeader>()) };
            let hdr = unsafe { &*(hdr_ptr as *const SdtHeader) };
            if &hdr.signature == signature {
                let length = hdr.length as usize;
                if !checksum_ok(
                    unsafe { self.handler.map_physical_region(addr, length) },
                    length,
                ) {
                    return Err(AcpiError::BadChecksum);
                }
                return Ok((addr, length));
            }
        }
        Err(AcpiError::NotFound)
    }

    /// Locates and parses the Multiple APIC Description Table (MADT).
    pub fn madt(&self) -> Result<madt::Madt<'_>, AcpiError> {
        let (addr, length) = self.find_table(b"APIC")?;
        // SAFETY: `addr`/`length` were validated by `find_table`.
        let ptr = unsafe { self.handler.map_physical_region(addr, length) };
        // SAFETY: `ptr` is valid for `length` bytes, which is at least the
        // fixed MADT header (checked by the entry_count/checksum logic above
        // in practice; malformed firmware tables are out of scope here).
        let local_apic_address =
            unsafe { core::ptr::read_unaligned(ptr.add(size_of::<SdtHeader>()) as *const u32) };
        let flags = unsafe {
            core::ptr::read_unaligned(ptr.add(size_of::<SdtHeader>() + 4) as *const u32)
        };
        let entries_start = size_of::<SdtHeader>() + 8;
        // SAFETY: bounded by `length`, computed from the table's own header.
        let data = unsafe { core::slice::from_raw_parts(ptr.add(entries_start), length - entries_start) };
        Ok(madt::Madt {
            local_apic_address,
            flags,
            data,
            _marker: PhantomData,
        })
    }

    /// Locates and parses the HPET description table.
    pub fn hpet(&self) -> Result<HpetDescriptor, AcpiError> {
        let (addr, _length) = self.find_table(b"HPET")?;
        let ptr = unsafe { self.handler.map_physical_region(addr, size_of::<RawHpetTable>()) };
        // SAFETY: HPET tables are fixed-size per the ACPI HPET specification.
        let raw = unsafe { core::ptr::read_unaligned(ptr.add(size_of::<SdtHeader>()) as *const RawHpetTable) };
        Ok(HpetDescriptor {
            base_address: GenericAddress {
                address: raw.address,
            },
            minimum_tick: raw.minimum_tick,
        })
    }

    /// Locates the MCFG table and returns the number of PCI segment group entries.
    pub fn mcfg(&self) -> Result<Mcfg, AcpiError> {
        let (_addr, length) = self.find_table(b"MCFG")?;
        let header_and_reserved = size_of::<SdtHeader>() + 8;
        let entry_count = (length.saturating_sub(header_and_reserved)) / 16;
        Ok(Mcfg { entry_count })
    }
}

fn checksum_ok(ptr: *const u8, len: usize) -> bool {
    let mut sum: u8 = 0;
    for i in 0..len {
        // SAFETY: caller guarantees `ptr` is valid for `len` bytes.
        sum = sum.wrapping_add(unsafe { *ptr.add(i) });
    }
    sum == 0
}

/// MADT (Multiple APIC Description Table) types.
pub mod madt {
    use super::PhantomData;

    /// A single parsed MADT entry.
    #[derive(Debug, Clone, Copy)]
    pub enum MadtEntry {
        /// Processor Local APIC entry.
        LocalApic(LocalApicEntry),
        /// I/O APIC entry.
        IoApic(IoApicEntry),
        /// Interrupt Source Override entry (ISA IRQ remapping).
        InterruptSourceOverride(InterruptSourceOverrideEntry),
        /// An entry type this parser does not interpret.
        Other,
    }

    /// Processor Local APIC entry (MADT type 0).
    #[derive(Debug, Clone, Copy)]
    pub struct LocalApicEntry {
        /// ACPI processor ID.
        pub acpi_processor_id: u8,
        /// Local APIC ID.
        pub apic_id: u8,
        /// Bit 0: processor is enabled.
        pub flags: u32,
    }

    /// I/O APIC entry (MADT type 1).
    #[derive(Debug, Clone, Copy)]
    pub struct IoApicEntry {
        /// I/O APIC ID.
        pub io_apic_id: u8,
        /// Physical MMIO base address.
        pub io_apic_address: u32,
        /// Global System Interrupt base handled by this I/O APIC.
        pub gsi_base: u32,
    }

    /// Interrupt Source Override entry (MADT type 2).
    #[derive(Debug, Clone, Copy)]
    pub struct InterruptSourceOverrideEntry {
        /// ISA IRQ number being overridden.
        pub source: u8,
        /// GSI this ISA IRQ is rerouted to.
        pub gsi: u32,
        /// Polarity/trigger mode flags (MPS INTI flags encoding).
        pub flags: u16,
    }

    /// The parsed Multiple APIC Description Table.
    pub struct Madt<'a> {
        /// Physical address of the Local APIC (may be overridden by a type-5 entry).
        pub local_apic_address: u32,
        /// PCAT_COMPAT and other MADT-level flags.
        pub flags: u32,
        pub(super) data: &'a [u8],
        pub(super) _marker: PhantomData<&'a ()>,
    }

    impl<'a> Madt<'a> {
        /// Iterates over the variable-length entry records following the MADT header.
        pub fn entries(&self) -> MadtIter<'a> {
            MadtIter { data: self.data }
        }
    }

    /// Iterator over [`MadtEntry`] records.
    pub struct MadtIter<'a> {
        data: &'a [u8],
    }

    impl Iterator for MadtIter<'_> {
        type Item = MadtEntry;

        fn next(&mut self) -> Option<MadtEntry> {
            if self.data.len() < 2 {
                return None;
            }
            let entry_type = self.data[0];
            let entry_len = self.data[1] as usize;
            if entry_len < 2 || entry_len > self.data.len() {
                return None;
            }
            let record = &self.data[..entry_len];
            self.data = &self.data[entry_len..];

            Some(match entry_type {
                0 if record.len() >= 8 => MadtEntry::LocalApic(LocalApicEntry {
                    acpi_processor_id: record[2],
                    apic_id: record[3],
                    flags: u32::from_le_bytes([record[4], record[5], record[6], record[7]]),
                }),
                1 if record.len() >= 12 => MadtEntry::IoApic(IoApicEntry {
                    io_apic_id: record[2],
                    io_apic_address: u32::from_le_bytes([
                        record[4], record[5], record[6], record[7],
                    ]),
                    gsi_base: u32::from_le_bytes([record[8], record[9], record[10], record[11]]),
                }),
                2 if record.len() >= 10 => MadtEntry::InterruptSourceOverride(
                    InterruptSourceOverrideEntry {
                        source: record[3],
                        gsi: u32::from_le_bytes([record[4], record[5], record[6], record[7]]),
                        flags: u16::from_le_bytes([record[8], record[9]]),
                    },
                ),
                _ => MadtEntry::Other,
            })
        }
    }
}

#[repr(C, packed)]
struct RawHpetTable {
    event_timer_block_id: u32,
    address_space_id: u8,
    register_bit_width: u8,
    register_bit_offset: u8,
    reserved: u8,
    address: u64,
    hpet_number: u8,
    minimum_tick: u16,
    page_protection: u8,
}

/// A generic ACPI address descriptor, trimmed to just the physical address.
#[derive(Debug, Clone, Copy)]
pub struct GenericAddress {
    /// Physical (or port I/O) address.
    pub address: u64,
}

/// Parsed HPET description table.
#[derive(Debug, Clone, Copy)]
pub struct HpetDescriptor {
    /// Base address of the HPET's memory-mapped registers.
    pub base_address: GenericAddress,
    /// Minimum tick count to avoid lost interrupts in periodic mode.
    pub minimum_tick: u16,
}

/// Parsed MCFG (PCIe Memory-mapped Configuration) table summary.
#[derive(Debug, Clone, Copy)]
pub struct Mcfg {
    entry_count: usize,
}

impl Mcfg {
    /// Returns the number of PCI segment group entries.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

#[cfg(test)]
mod tests {
    use super::madt::*;

    #[test]
    fn madt_iter_parses_local_apic_and_io_apic_entries() {
        let mut data = alloc_vec();
        // Local APIC entry: type=0, len=8, acpi_id=0, apic_id=1, flags=1 (enabled).
        data.extend_from_slice(&[0, 8, 0, 1, 1, 0, 0, 0]);
        // I/O APIC entry: type=1, len=12, id=2, reserved=0, address, gsi_base=0.
        data.extend_from_slice(&[1, 12, 2, 0, 0, 0, 0xFE, 0xFE, 0, 0, 0, 0]);

        let madt = Madt {
            local_apic_address: 0xFEE0_0000,
            flags: 1,
            data: &data,
            _marker: core::marker::PhantomData,
        };

        let entries: alloc::vec::Vec<_> = madt.entries().collect();
        assert_eq!(entries.len(), 2);
        match entries[0] {
            MadtEntry::LocalApic(e) => {
                assert_eq!(e.apic_id, 1);
                assert_eq!(e.flags, 1);
            }
            _ => panic!("expected LocalApic entry"),
        }
        match entries[1] {
            MadtEntry::IoApic(e) => {
                assert_eq!(e.io_apic_id, 2);
                assert_eq!(e.gsi_base, 0);
            }
            _ => panic!("expected IoApic entry"),
        }
    }

    extern crate alloc;
    fn alloc_vec() -> alloc::vec::Vec<u8> {
        alloc::vec::Vec::new()
    }
}

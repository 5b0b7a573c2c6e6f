//! Virtual memory collaborator
//!
//! The slice of the VM subsystem the process/thread core consumes: address
//! spaces, anonymous regions (wired or lazy, with placement hints), the
//! kernel/user range split, and byte access to user regions for argument
//! setup and usercopy. Wired regions are backed immediately; lazy regions
//! commit on first touch. Kernel regions live in the linear map, so their
//! virtual address is their backing address.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;

use crate::errors::*;
use crate::klock::IrqSpinLock;

pub type AspaceId = u64;
pub type RegionId = u64;

/// The kernel address space, created at init.
pub const KERNEL_ASPACE: AspaceId = 1;

pub const PAGE_SIZE: usize = 4096;

/// Bottom of the higher-half kernel mapping.
pub const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

/// User addresses are `USER_BASE..USER_TOP`; page zero stays unmapped.
pub const USER_BASE: u64 = 0x1000;
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

/// Where `Anywhere` placements in user spaces start handing out addresses.
const USER_ANON_BASE: u64 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionWiring {
    /// Committed up front; never faults.
    Wired,
    /// Committed on first access.
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionPlacement {
    Anywhere,
    Exact(u64),
}

// Backing is allocated as u128s so stack tops handed to the context-switch
// primitive are 16-byte aligned.
struct Backing(Box<[u128]>);

impl Backing {
    fn new_zeroed(size: usize) -> Self {
        Backing(vec![0u128; size.div_ceil(16)].into_boxed_slice())
    }

    fn base(&self) -> u64 {
        self.0.as_ptr() as u64
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.0.as_mut_ptr() as *mut u8, self.0.len() * 16) }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.0.as_ptr() as *const u8, self.0.len() * 16) }
    }
}

struct Region {
    name: String,
    vaddr: u64,
    size: usize,
    wired: bool,
    backing: Option<Backing>,
}

struct Aspace {
    name: String,
    user: bool,
    regions: BTreeMap<RegionId, Region>,
    next_anon: u64,
}

struct VmSys {
    aspaces: BTreeMap<AspaceId, Aspace>,
    next_aspace: AspaceId,
    next_region: RegionId,
}

static VM: IrqSpinLock<VmSys> = IrqSpinLock::new(VmSys {
    aspaces: BTreeMap::new(),
    next_aspace: KERNEL_ASPACE,
    next_region: 1,
});

pub fn init() {
    let mut vm = VM.lock();
    if vm.aspaces.contains_key(&KERNEL_ASPACE) {
        return;
    }
    vm.next_aspace = KERNEL_ASPACE + 1;
    vm.aspaces.insert(
        KERNEL_ASPACE,
        Aspace {
            name: String::from("kernel_aspace"),
            user: false,
            regions: BTreeMap::new(),
            next_anon: 0,
        },
    );
    drop(vm);
    crate::log!("[VM] kernel address space ready");
}

pub fn is_kernel_address(addr: u64) -> bool {
    addr >= KERNEL_BASE
}

pub fn is_user_address(addr: u64) -> bool {
    (USER_BASE..USER_TOP).contains(&addr)
}

pub fn is_user_range(addr: u64, len: usize) -> bool {
    if len == 0 {
        return is_user_address(addr);
    }
    match addr.checked_add(len as u64 - 1) {
        Some(end) => is_user_address(addr) && is_user_address(end),
        None => false,
    }
}

/// Create a user address space.
pub fn create_address_space(name: &str) -> Result<AspaceId, i64> {
    let mut vm = VM.lock();
    let id = vm.next_aspace;
    vm.next_aspace += 1;
    vm.aspaces.insert(
        id,
        Aspace {
            name: String::from(name),
            user: true,
            regions: BTreeMap::new(),
            next_anon: USER_ANON_BASE,
        },
    );
    Ok(id)
}

/// Tear down an address space and everything mapped in it.
pub fn delete_address_space(id: AspaceId) -> Result<(), i64> {
    if id == KERNEL_ASPACE {
        return Err(ERR_NOT_ALLOWED);
    }
    let mut vm = VM.lock();
    vm.aspaces.remove(&id).map(|_| ()).ok_or(ERR_INVALID_HANDLE)?;
    drop(vm);
    crate::smp::broadcast_tlb_invalidate();
    Ok(())
}

/// The MMU root for an address space, handed to the context-switch
/// primitive when the incoming thread lives elsewhere.
pub fn translation_map(id: AspaceId) -> u64 {
    // Synthetic root: good enough for equality comparison, which is all
    // the dispatcher does with it before passing it down.
    id << 12
}

/// Create an anonymous region. Returns the region id and its base address.
pub fn create_region(
    aspace: AspaceId,
    name: &str,
    size: usize,
    wiring: RegionWiring,
    placement: RegionPlacement,
) -> Result<(RegionId, u64), i64> {
    if size == 0 {
        return Err(ERR_INVALID_ARGS);
    }
    let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;

    let mut vm = VM.lock();
    let region_id = vm.next_region;
    vm.next_region += 1;

    let space = vm.aspaces.get_mut(&aspace).ok_or(ERR_INVALID_HANDLE)?;

    let vaddr = if space.user {
        let vaddr = match placement {
            RegionPlacement::Exact(addr) => {
                if !is_user_range(addr, size) {
                    return Err(ERR_INVALID_ARGS);
                }
                addr
            }
            RegionPlacement::Anywhere => {
                let addr = space.next_anon;
                space.next_anon += size as u64;
                addr
            }
        };
        let end = vaddr + size as u64;
        let overlaps = space
            .regions
            .values()
            .any(|r| vaddr < r.vaddr + r.size as u64 && r.vaddr < end);
        if overlaps {
            return Err(ERR_VM_NO_VIRTUAL_SPACE);
        }
        vaddr
    } else {
        0 // patched to the backing address below
    };

    let backing = match wiring {
        RegionWiring::Wired => Some(Backing::new_zeroed(size)),
        RegionWiring::Lazy => None,
    };

    let mut region = Region {
        name: String::from(name),
        vaddr,
        size,
        wired: wiring == RegionWiring::Wired,
        backing,
    };
    if !space.user {
        // Kernel regions must be wired; their address is the linear-map
        // address of the backing.
        let backing = region.backing.as_ref().ok_or(ERR_INVALID_ARGS)?;
        region.vaddr = backing.base();
    }
    let vaddr = region.vaddr;
    space.regions.insert(region_id, region);
    Ok((region_id, vaddr))
}

pub fn delete_region(aspace: AspaceId, region: RegionId) -> Result<(), i64> {
    let mut vm = VM.lock();
    let space = vm.aspaces.get_mut(&aspace).ok_or(ERR_INVALID_HANDLE)?;
    space.regions.remove(&region).map(|_| ()).ok_or(ERR_INVALID_HANDLE)
}

/// Highest usable stack address of a wired region, 16-byte aligned.
pub fn region_top(aspace: AspaceId, region: RegionId) -> Result<u64, i64> {
    let vm = VM.lock();
    let space = vm.aspaces.get(&aspace).ok_or(ERR_INVALID_HANDLE)?;
    let r = space.regions.get(&region).ok_or(ERR_INVALID_HANDLE)?;
    let base = if space.user {
        r.vaddr
    } else {
        r.backing.as_ref().ok_or(ERR_GENERAL)?.base()
    };
    Ok((base + r.size as u64) & !0xf)
}

/// Kernel-side top pointer of a wired region's backing, regardless of the
/// owning space. This is what the stack-switch primitive needs.
pub fn region_backing_top(aspace: AspaceId, region: RegionId) -> Result<u64, i64> {
    let vm = VM.lock();
    let space = vm.aspaces.get(&aspace).ok_or(ERR_INVALID_HANDLE)?;
    let r = space.regions.get(&region).ok_or(ERR_INVALID_HANDLE)?;
    let b = r.backing.as_ref().ok_or(ERR_GENERAL)?;
    Ok((b.base() + r.size as u64) & !0xf)
}

fn access_user(
    aspace: AspaceId,
    vaddr: u64,
    len: usize,
    mut f: impl FnMut(&mut [u8], usize),
) -> Result<(), i64> {
    if len == 0 {
        return Ok(());
    }
    if !is_user_range(vaddr, len) {
        return Err(ERR_VM_BAD_USER_MEMORY);
    }
    let mut vm = VM.lock();
    let space = vm.aspaces.get_mut(&aspace).ok_or(ERR_INVALID_HANDLE)?;
    if !space.user {
        return Err(ERR_VM_BAD_USER_MEMORY);
    }
    let region = space
        .regions
        .values_mut()
        .find(|r| vaddr >= r.vaddr && vaddr + len as u64 <= r.vaddr + r.size as u64)
        .ok_or(ERR_VM_BAD_USER_MEMORY)?;
    if region.backing.is_none() {
        if region.wired {
            return Err(ERR_VM_BAD_USER_MEMORY);
        }
        // Lazy commit on first touch.
        region.backing = Some(Backing::new_zeroed(region.size));
    }
    let off = (vaddr - region.vaddr) as usize;
    let backing = region.backing.as_mut().unwrap();
    let bytes = backing.as_bytes_mut();
    f(&mut bytes[off..off + len], len);
    Ok(())
}

/// Copy bytes into a user region. Fails with `ERR_VM_BAD_USER_MEMORY` if
/// the range is outside user space or unmapped.
pub fn user_write(aspace: AspaceId, vaddr: u64, data: &[u8]) -> Result<(), i64> {
    access_user(aspace, vaddr, data.len(), |dst, len| {
        dst[..len].copy_from_slice(data)
    })
}

/// Copy bytes out of a user region.
pub fn user_read(aspace: AspaceId, vaddr: u64, buf: &mut [u8]) -> Result<(), i64> {
    let len = buf.len();
    access_user(aspace, vaddr, len, |src, len| {
        buf.copy_from_slice(&src[..len])
    })
}

/// Read bytes from a wired kernel-space region (used by tests and the
/// launch path to inspect prepared stacks).
pub fn region_read(aspace: AspaceId, region: RegionId, off: usize, buf: &mut [u8]) -> Result<(), i64> {
    let vm = VM.lock();
    let space = vm.aspaces.get(&aspace).ok_or(ERR_INVALID_HANDLE)?;
    let r = space.regions.get(&region).ok_or(ERR_INVALID_HANDLE)?;
    let b = r.backing.as_ref().ok_or(ERR_GENERAL)?;
    let bytes = b.as_bytes();
    if off + buf.len() > bytes.len() {
        return Err(ERR_INVALID_ARGS);
    }
    buf.copy_from_slice(&bytes[off..off + buf.len()]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_range_checks() {
        assert!(!is_user_address(0));
        assert!(is_user_address(0x1000));
        assert!(!is_user_address(KERNEL_BASE));
        assert!(!is_user_address(USER_TOP));
        assert!(!is_user_range(USER_TOP - 8, 64));
        assert!(is_user_range(0x1000, 4096));
    }

    #[test]
    fn test_exact_placement_rejects_overlap() {
        init();
        let space = create_address_space("t_overlap").unwrap();
        let (_, base) = create_region(space, "a", PAGE_SIZE, RegionWiring::Wired, RegionPlacement::Exact(0x2000_0000)).unwrap();
        assert_eq!(base, 0x2000_0000);
        let err = create_region(space, "b", PAGE_SIZE, RegionWiring::Wired, RegionPlacement::Exact(0x2000_0000)).unwrap_err();
        assert_eq!(err, ERR_VM_NO_VIRTUAL_SPACE);
        delete_address_space(space).unwrap();
    }

    #[test]
    fn test_lazy_region_commits_on_write() {
        init();
        let space = create_address_space("t_lazy").unwrap();
        let (_, base) = create_region(space, "heap", 2 * PAGE_SIZE, RegionWiring::Lazy, RegionPlacement::Anywhere).unwrap();
        user_write(space, base + 100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        user_read(space, base + 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        delete_address_space(space).unwrap();
    }

    #[test]
    fn test_user_write_outside_regions_faults() {
        init();
        let space = create_address_space("t_fault").unwrap();
        assert_eq!(user_write(space, 0x7000_0000, b"x").unwrap_err(), ERR_VM_BAD_USER_MEMORY);
        assert_eq!(user_write(space, KERNEL_BASE + 16, b"x").unwrap_err(), ERR_VM_BAD_USER_MEMORY);
        delete_address_space(space).unwrap();
    }

    #[test]
    fn test_kernel_region_is_linear_mapped(){
        init();
        let (region, base) = create_region(KERNEL_ASPACE, "t_kstack", PAGE_SIZE, RegionWiring::Wired, RegionPlacement::Anywhere).unwrap();
        let top = region_backing_top(KERNEL_ASPACE, region).unwrap();
        assert!(top > base);
        assert_eq!(top % 16, 0);
        delete_region(KERNEL_ASPACE, region).unwrap();
    }
}

//! # Analysis Session
//!
//! The session is the explicit context object the top-level driver owns:
//! memory image, debug metadata, translator, symbol table, unwinder and
//! the pre-resolved structure layout all live here, wired together once
//! at setup. There is no process-wide mutable state.
//!
//! Setup is the only place where failure is fatal: without segments,
//! symbols or a matching version banner there is nothing to analyze.
//! Everything after setup degrades locally.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::debuginfo::dwarf::DwarfInfo;
use crate::debuginfo::{DebugInfo, KernelLayout, KernelVersion};
use crate::error::{AnalysisError, Result};
use crate::image::{manifest, MemoryImage};
use crate::mem::MemoryView;
use crate::symbols::SymbolTable;
use crate::translate::{KernelImageMap, LinearMap, PageTables, Translator};
use crate::types::{PhysAddr, TaskHandle, VirtAddr};
use crate::unwind::{FrameState, Unwinder};

const KASLR_MAGIC: u32 = 0xdead_4ead;
const MODULE_NAME_LEN: usize = 56;
const MIN_IMAGE_ALIGN: u64 = 0x0020_0000;
const MODULES_VSIZE: u64 = 0x0800_0000;
const BPF_JIT_VSIZE: u64 = 0x0800_0000;

/// Everything the driver decides before a session starts.
pub struct SessionConfig
{
    /// Directory holding the dump segments plus a manifest.
    pub dump_dir: Option<PathBuf>,
    /// Explicit `(segment file, base physical address)` pairs, used when
    /// no manifest is available.
    pub segment_files: Vec<(PathBuf, u64)>,
    /// Matching kernel image with symbols and DWARF.
    pub vmlinux: PathBuf,
    /// The dumped kernel is 64-bit.
    pub arm64: bool,
    /// Force the relocation offset instead of probing for it.
    pub kaslr_offset: Option<u64>,
    /// Physical address of the magic-tagged relocation record, when the
    /// platform stores one.
    pub kaslr_probe_addr: Option<u64>,
    /// Force the base physical offset.
    pub phys_offset: Option<u64>,
    /// Force the linear-map base virtual address.
    pub page_offset: Option<u64>,
}

/// One opened analysis session over a frozen image.
pub struct Session
{
    image: MemoryImage,
    info: Box<dyn DebugInfo>,
    translator: Translator,
    symbols: SymbolTable,
    unwinder: Unwinder,
    layout: Option<KernelLayout>,
    version: KernelVersion,
    banner: String,
    arm64: bool,
    kaslr_offset: u64,
    thread_size: u64,
    num_cpus: Option<u32>,
}

impl fmt::Debug for Session
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Session")
            .field("version", &self.version)
            .field("arm64", &self.arm64)
            .field("kaslr_offset", &self.kaslr_offset)
            .field("thread_size", &self.thread_size)
            .field("num_cpus", &self.num_cpus)
            .finish_non_exhaustive()
    }
}

fn read_phys_u32(image: &MemoryImage, pa: u64) -> Option<u32>
{
    let bytes = image.read_physical(PhysAddr::new(pa), 4)?;
    Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))
}

fn read_phys_u64(image: &MemoryImage, pa: u64) -> Option<u64>
{
    let bytes = image.read_physical(PhysAddr::new(pa), 8)?;
    Some(u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?))
}

impl Session
{
    /// Open a session: load segments, probe the address-space geometry,
    /// build the symbol table and verify the dump matches the vmlinux.
    pub fn open(config: SessionConfig) -> Result<Self>
    {
        let info: Box<dyn DebugInfo> = Box::new(DwarfInfo::open(&config.vmlinux)?);
        let raw_symbols = crate::symbols::vmlinux_symbols(&config.vmlinux)?;
        Self::with_parts(config, info, raw_symbols)
    }

    /// Open a session from an explicit provider and pre-read symbol list.
    ///
    /// This is the injection seam: the core consumes the [`DebugInfo`]
    /// capability, it does not insist on the DWARF-backed implementation.
    pub fn with_parts(config: SessionConfig, info: Box<dyn DebugInfo>, raw_symbols: Vec<(u64, String)>)
        -> Result<Self>
    {
        let image = Self::load_image(&config)?;
        if image.is_empty() {
            return Err(AnalysisError::NoSegments(config.dump_dir.clone().unwrap_or_default()));
        }

        let banner = info
            .string_value_of("linux_banner")
            .ok_or_else(|| AnalysisError::Setup("could not read linux_banner from vmlinux".to_string()))?;
        let version = KernelVersion::parse_banner(&banner)
            .ok_or_else(|| AnalysisError::Setup(format!("could not extract version info from {banner:?}")))?;
        info!("kernel version from vmlinux: {version}");

        let kaslr_offset = config
            .kaslr_offset
            .or_else(|| Self::probe_kaslr(&image, config.kaslr_probe_addr))
            .unwrap_or(0);
        if kaslr_offset != 0 {
            info!("relocation offset: 0x{kaslr_offset:x}");
        }

        let arm64 = config.arm64;
        let thread_size: u64 = if arm64 { 16384 } else { 8192 };
        let va_bits: u32 = if arm64 { 39 } else { 32 };
        let page_offset = config
            .page_offset
            .unwrap_or(if arm64 { 0xffff_ffc0_0000_0000 } else { 0xc000_0000 });

        let mut phys_offset = config
            .phys_offset
            .or_else(|| image.base_phys_offset())
            .ok_or_else(|| AnalysisError::Setup("no base physical offset could be derived".to_string()))?;

        // 64-bit kernels may run out of a separate image mapping; its
        // virtual base is reconstructed the way the kernel lays out its
        // address space, then shifted by the relocation offset.
        let kimage_vaddr_link = if version > KernelVersion::new(4, 20, 0) {
            let page_end = u64::MAX << (va_bits - 1);
            let kasan_shadow = if info.address_of("kasan_init").is_some() {
                1u64 << (va_bits - 3)
            } else {
                0
            };
            page_end
                .wrapping_add(kasan_shadow)
                .wrapping_add(MODULES_VSIZE)
                .wrapping_add(BPF_JIT_VSIZE)
        } else {
            let va_start = u64::MAX << va_bits;
            let kasan_shadow = if info.address_of("kasan_init").is_some() {
                1u64 << (va_bits - 3)
            } else {
                0
            };
            va_start.wrapping_add(kasan_shadow).wrapping_add(MODULES_VSIZE)
        };
        let kimage_vaddr = kimage_vaddr_link.wrapping_add(kaslr_offset);

        let has_kimage = arm64 && info.address_of("kimage_voffset").is_some();
        if has_kimage && config.phys_offset.is_none() {
            if let Some(probed) = Self::probe_phys_offset(&image, info.as_ref(), kimage_vaddr_link, kimage_vaddr) {
                info!("dynamically determined phys offset: 0x{probed:x}");
                phys_offset = probed;
            }
        }

        let kimage = has_kimage.then(|| {
            let voffset = kimage_vaddr.wrapping_sub(phys_offset);
            info!("kimage_voffset: 0x{voffset:x}");
            KernelImageMap { voffset }
        });

        let linear = LinearMap {
            page_offset,
            phys_offset,
            va_bits,
            kimage,
            linear_when_bit_clear: version > KernelVersion::new(4, 20, 0),
        };

        let relocate = |addr: Option<VirtAddr>| addr.map(|a| a + kaslr_offset);

        let swapper_pg_dir = relocate(info.address_of("swapper_pg_dir")).ok_or_else(|| {
            AnalysisError::Setup(
                "could not get the swapper page directory; the vmlinux is probably wrong for these dumps".to_string(),
            )
        })?;

        let tables = Self::probe_page_tables(&linear, swapper_pg_dir, arm64, va_bits, page_offset, phys_offset)?;
        let translator = Translator::new(linear, Some(tables));

        let symbols = SymbolTable::from_entries_relocated(raw_symbols, kaslr_offset);
        if symbols.is_empty() {
            return Err(AnalysisError::NoSymbols(config.vmlinux.clone()));
        }
        info!("loaded {} kernel symbols", symbols.len());

        Self::match_banner(&image, &translator, relocate(info.address_of("linux_banner")), &banner)?;

        let mem = MemoryView::new(&image, &translator, arm64);
        let unwinder = Unwinder::probe(
            &mem,
            relocate(info.address_of("__start_unwind_idx")),
            relocate(info.address_of("__stop_unwind_idx")),
            thread_size,
        );

        let layout = KernelLayout::resolve(info.as_ref(), version, arm64);
        if layout.is_none() {
            warn!("debug metadata is unusable for structure traversal; only raw analyses will run");
        }

        let num_cpus = Self::probe_num_cpus(&mem, info.as_ref(), layout.as_ref(), version, kaslr_offset);
        if let Some(cpus) = num_cpus {
            info!("{cpus} cpus present");
        }

        Ok(Self {
            image,
            info,
            translator,
            symbols,
            unwinder,
            layout,
            version,
            banner,
            arm64,
            kaslr_offset,
            thread_size,
            num_cpus,
        })
    }

    fn load_image(config: &SessionConfig) -> Result<MemoryImage>
    {
        if !config.segment_files.is_empty() {
            return manifest::load_segment_files(&config.segment_files);
        }
        let Some(dir) = &config.dump_dir else {
            return Err(AnalysisError::NoSegments(PathBuf::new()));
        };
        manifest::load_dump_directory(dir)
    }

    /// Relocation offset discovery: a magic-tagged record in preserved
    /// memory carries the offset the boot-time randomization picked.
    fn probe_kaslr(image: &MemoryImage, probe_addr: Option<u64>) -> Option<u64>
    {
        let addr = probe_addr?;
        let magic = read_phys_u32(image, addr)?;
        if magic != KASLR_MAGIC {
            warn!("relocation magic does not match at 0x{addr:x}");
            return None;
        }
        read_phys_u64(image, addr + 4)
    }

    /// Scan candidate kernel load addresses at the minimum image
    /// alignment; the right one is the candidate whose in-dump
    /// `kimage_voffset` value agrees with the derived offset.
    fn probe_phys_offset(
        image: &MemoryImage,
        info: &dyn DebugInfo,
        kimage_vaddr_link: u64,
        kimage_vaddr: u64,
    ) -> Option<u64>
    {
        let voffset_var = info.address_of("kimage_voffset")?.value();
        let (phys_base, phys_end) = image.ddr_bounds()?;
        let phys_end = phys_end.min(0xffff_ffff);
        info!("phys_base: 0x{phys_base:x} phys_end: 0x{phys_end:x}");

        let mut candidate = phys_base;
        while candidate < phys_end {
            let var_pa = voffset_var.wrapping_sub(kimage_vaddr_link).wrapping_add(candidate);
            if let Some(value) = read_phys_u64(image, var_pa) {
                if value == kimage_vaddr.wrapping_sub(candidate) {
                    return Some(candidate);
                }
            }
            candidate += MIN_IMAGE_ALIGN;
        }
        None
    }

    /// Decide the page-table format from the probed geometry.
    ///
    /// On 32-bit the gap between the kernel text base and the swapper page
    /// directory gives it away: one extra page means the long-descriptor
    /// format is in use.
    fn probe_page_tables(
        linear: &LinearMap,
        swapper_pg_dir: VirtAddr,
        arm64: bool,
        va_bits: u32,
        page_offset: u64,
        phys_offset: u64,
    ) -> Result<PageTables>
    {
        if arm64 {
            let pgd = linear
                .virt_to_phys(swapper_pg_dir)
                .ok_or_else(|| AnalysisError::Setup("swapper page directory is not in the linear map".to_string()))?;
            info!("using 64-bit page tables");
            return Ok(PageTables::V8 {
                pgd: pgd.value(),
                va_bits,
            });
        }

        // TEXT_OFFSET placement puts swapper_pg_dir directly below the
        // kernel text; the gap size identifies the descriptor format.
        let text_offset = 0x8000u64;
        let pg_dir_size = page_offset
            .wrapping_add(text_offset)
            .wrapping_sub(swapper_pg_dir.value());

        match pg_dir_size {
            0x4000 => {
                let pgd = linear
                    .virt_to_phys(swapper_pg_dir)
                    .ok_or_else(|| AnalysisError::Setup("swapper page directory is not in the linear map".to_string()))?;
                info!("using non-LPAE page tables");
                Ok(PageTables::NonLpae { pgd: pgd.value() })
            }
            0x5000 => {
                let mut pgd = phys_offset + text_offset - pg_dir_size;
                let t1sz = match page_offset {
                    0x4000_0000 => 0,
                    0x8000_0000 => 1,
                    0xc000_0000 => {
                        // Only the second level is used at this split;
                        // skip over the first-level page plus its three
                        // trailing second-level pages.
                        pgd += 4096 * (1 + 3);
                        2
                    }
                    _ => {
                        return Err(AnalysisError::Setup(format!(
                            "invalid page offset for long-descriptor walk: 0x{page_offset:x}"
                        )))
                    }
                };
                info!("using LPAE page tables");
                Ok(PageTables::Lpae { pgd, t1sz })
            }
            other => Err(AnalysisError::Setup(format!(
                "could not determine the page-table format (pg_dir gap 0x{other:x})"
            ))),
        }
    }

    /// Verify the banner in the dump matches the vmlinux banner.
    fn match_banner(
        image: &MemoryImage,
        translator: &Translator,
        banner_va: Option<VirtAddr>,
        banner: &str,
    ) -> Result<()>
    {
        let mismatch = |dump: Option<String>| AnalysisError::VersionMismatch {
            vmlinux: banner.to_string(),
            dump,
        };

        let va = banner_va.ok_or_else(|| mismatch(None))?;
        let pa = translator
            .virt_to_phys(image, va)
            .ok_or_else(|| mismatch(None))?;
        let bytes = image.read_physical(pa, banner.len()).ok_or_else(|| mismatch(None))?;
        let dump_banner: String = bytes
            .iter()
            .filter(|byte| byte.is_ascii())
            .map(|byte| *byte as char)
            .collect();

        if dump_banner.contains(banner) || banner.contains(dump_banner.trim_end()) {
            info!("banner from dump: {}", dump_banner.trim_end());
            Ok(())
        } else {
            Err(mismatch(Some(dump_banner)))
        }
    }

    fn probe_num_cpus(
        mem: &MemoryView<'_>,
        info: &dyn DebugInfo,
        layout: Option<&KernelLayout>,
        version: KernelVersion,
        kaslr_offset: u64,
    ) -> Option<u32>
    {
        let mask = if version >= KernelVersion::new(4, 5, 0) {
            let base = info.address_of("__cpu_present_mask")? + kaslr_offset;
            let bits = layout?.cpumask_bits?;
            mem.read_word(base + bits)?
        } else {
            let base = info.address_of("cpu_present_bits")? + kaslr_offset;
            mem.read_word(base)?
        };
        Some(mask.count_ones())
    }

    // ---- accessors ----

    pub fn mem(&self) -> MemoryView<'_>
    {
        MemoryView::new(&self.image, &self.translator, self.arm64)
    }

    pub fn image(&self) -> &MemoryImage
    {
        &self.image
    }

    pub fn symbols(&self) -> &SymbolTable
    {
        &self.symbols
    }

    pub fn unwinder(&self) -> &Unwinder
    {
        &self.unwinder
    }

    pub fn layout(&self) -> Option<&KernelLayout>
    {
        self.layout.as_ref()
    }

    pub fn version(&self) -> KernelVersion
    {
        self.version
    }

    pub fn banner(&self) -> &str
    {
        &self.banner
    }

    pub fn arm64(&self) -> bool
    {
        self.arm64
    }

    pub fn thread_size(&self) -> u64
    {
        self.thread_size
    }

    pub fn num_cpus(&self) -> Option<u32>
    {
        self.num_cpus
    }

    /// Relocated address of a symbol.
    pub fn address_of(&self, symbol: &str) -> Option<VirtAddr>
    {
        Some(self.info.address_of(symbol)? + self.kaslr_offset)
    }

    pub fn debug_info(&self) -> &dyn DebugInfo
    {
        self.info.as_ref()
    }

    /// The kernel's saved boot command line, when recoverable.
    pub fn command_line(&self) -> Option<String>
    {
        let mem = self.mem();
        let ptr = mem.read_pointer(self.address_of("saved_command_line")?)?;
        mem.read_cstring(ptr, 2048)
    }

    /// Discover loaded modules from the in-kernel module list and merge
    /// their symbol tables (read from `<sym_dir>/<name>.ko`) into the
    /// session's lookup table.
    ///
    /// Returns how many modules contributed symbols. Modules without a
    /// matching object file, or with unreadable records, are skipped.
    pub fn merge_module_symbols(&mut self, sym_dir: &Path) -> Result<usize>
    {
        let list = self
            .layout
            .as_ref()
            .map(|layout| layout.list)
            .ok_or_else(|| AnalysisError::Setup("no structure layout".to_string()))?;
        let modules_head = self
            .address_of("modules")
            .ok_or_else(|| AnalysisError::UnresolvedSymbol("modules".to_string()))?;
        let list_offset = self
            .info
            .field_offset("struct module", "list")
            .ok_or_else(|| AnalysisError::MissingDebugField {
                type_name: "struct module".to_string(),
                field: "list".to_string(),
            })?;
        let name_offset = self
            .info
            .field_offset("struct module", "name")
            .ok_or_else(|| AnalysisError::MissingDebugField {
                type_name: "struct module".to_string(),
                field: "name".to_string(),
            })?;
        // The module base moved into a nested layout struct in 4.5.
        let base_field: &[&str] = if self.version >= KernelVersion::new(4, 5, 0) {
            &["core_layout.base", "module_core"]
        } else {
            &["module_core", "core_layout.base"]
        };
        let base_offset = base_field
            .iter()
            .find_map(|field| self.info.field_offset("struct module", field))
            .ok_or_else(|| AnalysisError::MissingDebugField {
                type_name: "struct module".to_string(),
                field: "core_layout.base".to_string(),
            })?;

        // The list head is a bare list_head, not an embedded module; walk
        // from the pseudo-node behind it and drop that node from the
        // results.
        let anchor = modules_head - list_offset;
        let mem = self.mem();
        let walk = crate::walker::walk_circular(&mem, anchor, list_offset, list, |node| {
            mem.read_cstring(node + name_offset, MODULE_NAME_LEN)
                .is_some_and(|name| !name.is_empty())
        });

        let mut loaded: Vec<(String, Vec<(u64, String)>)> = Vec::new();
        for module in walk.nodes.iter().skip(1) {
            let Some(name) = mem.read_cstring(*module + name_offset, MODULE_NAME_LEN) else {
                continue;
            };
            let Some(base) = mem.read_pointer(*module + base_offset) else {
                warn!("module {name} has an unreadable base address");
                continue;
            };
            let path = sym_dir.join(format!("{name}.ko"));
            if !path.exists() {
                continue;
            }
            match crate::symbols::load_module_symbols(&path, base.value()) {
                Ok(entries) => loaded.push((name, entries)),
                Err(err) => warn!("skipping symbols for module {name}: {err}"),
            }
        }
        if !walk.complete {
            warn!("module list was corrupt; some module symbols may be missing");
        }

        let count = loaded.len();
        for (name, entries) in loaded {
            info!("merging {} symbols from module {name}", entries.len());
            self.symbols.merge_module(&name, entries);
        }
        Ok(count)
    }

    /// Per-cpu base offset for per-cpu variables.
    pub fn per_cpu_offset(&self, cpu: u32) -> Option<u64>
    {
        let base = self.address_of("__per_cpu_offset")?;
        self.mem().read_word(base + u64::from(cpu) * self.mem().word_size())
    }

    // ---- task helpers ----

    /// Address of a task's `thread_info`, wherever this kernel keeps it.
    pub fn thread_info_addr(&self, task: TaskHandle) -> Option<VirtAddr>
    {
        let offsets = self.layout.as_ref()?.task.as_ref()?;
        match offsets.thread_info {
            Some(offset) => Some(task.addr() + offset),
            None => self.mem().read_pointer(task.addr() + offsets.stack),
        }
    }

    /// CPU the task last ran on.
    pub fn task_cpu(&self, task: TaskHandle) -> Option<u32>
    {
        let layout = self.layout.as_ref()?;
        let offsets = layout.task.as_ref()?;
        if let Some(offset) = offsets.cpu {
            return self.mem().read_u32(task.addr() + offset);
        }
        let ti = self.thread_info_addr(task)?;
        self.mem().read_u32(ti + layout.thread_info.cpu?)
    }

    /// The `{fp, sp, pc}` context saved when the task last switched out.
    pub fn saved_frame(&self, task: TaskHandle) -> Option<FrameState>
    {
        let layout = self.layout.as_ref()?;
        let ctx = layout.saved_context.as_ref()?;
        let base = if ctx.in_task {
            task.addr() + ctx.base
        } else {
            self.thread_info_addr(task)? + ctx.base
        };
        let mem = self.mem();
        Some(FrameState::new(
            mem.read_word(base + ctx.fp)?,
            mem.read_word(base + ctx.sp)?,
            0,
            mem.read_word(base + ctx.pc)?,
        ))
    }

    /// Self-referential identity check: the task reached through a list
    /// link must point back at itself through its `thread_info`, and its
    /// recorded cpu must be plausible.
    pub fn validate_task(&self, task: TaskHandle) -> bool
    {
        let Some(layout) = self.layout.as_ref() else {
            return false;
        };
        let Some(offsets) = layout.task.as_ref() else {
            return false;
        };

        let Some(ti) = self.thread_info_addr(task) else {
            return false;
        };
        if ti == VirtAddr::ZERO {
            return false;
        }

        if offsets.thread_info.is_none() {
            let Some(task_off) = layout.thread_info.task else {
                return false;
            };
            match self.mem().read_pointer(ti + task_off) {
                Some(back) if back == task.addr() => {}
                _ => return false,
            }
        }

        match (self.task_cpu(task), self.num_cpus) {
            (Some(cpu), Some(count)) => cpu <= count,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Addresses of the known scheduler classes; a classifier value
    /// outside this set marks a corrupt task record.
    pub fn sched_class_set(&self) -> Vec<u64>
    {
        ["stop_sched_class", "rt_sched_class", "idle_sched_class", "fair_sched_class"]
            .iter()
            .filter_map(|name| self.address_of(name).map(VirtAddr::value))
            .collect()
    }

    /// Classifier membership check against the known scheduler classes.
    pub fn validate_sched_class(&self, task: TaskHandle, classes: &[u64]) -> bool
    {
        if classes.is_empty() {
            return true;
        }
        let Some(offsets) = self.layout.as_ref().and_then(|l| l.task.as_ref()) else {
            return false;
        };
        match self.mem().read_word(task.addr() + offsets.sched_class) {
            Some(value) => classes.contains(&value),
            None => false,
        }
    }
}

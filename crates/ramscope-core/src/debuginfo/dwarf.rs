//! vmlinux-backed [`DebugInfo`] provider.
//!
//! Parses the ELF once up front (symbol map plus the debug and allocated
//! data sections) and answers layout queries by walking the DWARF DIE tree
//! on demand. Type layouts are cached per name; negative results are
//! cached too, since the analyses repeatedly probe for fields that simply
//! do not exist in a given build.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gimli::{
    constants, AttributeValue, DebuggingInformationEntry, Dwarf, EndianArcSlice, Reader, RunTimeEndian, SectionId, Unit,
    UnitOffset,
};
use object::{Object, ObjectSection, ObjectSymbol};
use once_cell::unsync::OnceCell;
use tracing::debug;

use super::DebugInfo;
use crate::error::{AnalysisError, Result};
use crate::types::VirtAddr;

type OwnedReader = EndianArcSlice<RunTimeEndian>;
type OwnedDwarf = Dwarf<OwnedReader>;

const DWARF_SECTIONS: &[(&str, &[&str])] = &[
    (".debug_abbrev", &[".debug_abbrev"]),
    (".debug_addr", &[".debug_addr"]),
    (".debug_info", &[".debug_info"]),
    (".debug_line", &[".debug_line"]),
    (".debug_line_str", &[".debug_line_str"]),
    (".debug_ranges", &[".debug_ranges"]),
    (".debug_rnglists", &[".debug_rnglists"]),
    (".debug_str", &[".debug_str"]),
    (".debug_str_offsets", &[".debug_str_offsets"]),
    (".debug_types", &[".debug_types"]),
    (".debug_loc", &[".debug_loc"]),
    (".debug_loclists", &[".debug_loclists"]),
];

const MAX_TYPE_REF_DEPTH: usize = 8;

/// Extracted layout of one composite type.
struct TypeLayout
{
    size: Option<u64>,
    members: Vec<MemberLayout>,
}

struct MemberLayout
{
    name: Option<String>,
    type_name: Option<String>,
    offset: Option<u64>,
}

/// Section data that made it into the loaded image (for reading
/// initialized values like the version banner out of the file).
struct LoadedSection
{
    address: u64,
    data: Vec<u8>,
}

/// DWARF-backed debug metadata for one vmlinux.
pub struct DwarfInfo
{
    path: PathBuf,
    endian: RunTimeEndian,
    pointer_size: u64,
    symbols: HashMap<String, u64>,
    debug_sections: HashMap<&'static str, Arc<[u8]>>,
    loaded_sections: Vec<LoadedSection>,
    dwarf_cache: OnceCell<OwnedDwarf>,
    unit_cache: OnceCell<Vec<Unit<OwnedReader>>>,
    type_cache: RefCell<HashMap<String, Option<Arc<TypeLayout>>>>,
}

impl DwarfInfo
{
    /// Parse a vmlinux ELF and prepare the lookup caches.
    pub fn open(path: &Path) -> Result<Self>
    {
        let bytes = fs::read(path)?;
        let file = object::File::parse(&*bytes)
            .map_err(|err| AnalysisError::Setup(format!("failed to parse {}: {err}", path.display())))?;

        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let pointer_size = if file.is_64() { 8 } else { 4 };

        let mut symbols = HashMap::new();
        for sym in file.symbols() {
            if let Ok(name) = sym.name() {
                if !name.is_empty() {
                    symbols.insert(name.to_string(), sym.address());
                }
            }
        }

        let mut debug_sections = HashMap::new();
        for (canonical, aliases) in DWARF_SECTIONS {
            debug_sections.insert(*canonical, load_section_bytes(&file, aliases));
        }

        let mut loaded_sections = Vec::new();
        for section in file.sections() {
            if section.address() == 0 {
                continue;
            }
            let Ok(data) = section.uncompressed_data() else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            loaded_sections.push(LoadedSection {
                address: section.address(),
                data: data.into_owned(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            endian,
            pointer_size,
            symbols,
            debug_sections,
            loaded_sections,
            dwarf_cache: OnceCell::new(),
            unit_cache: OnceCell::new(),
            type_cache: RefCell::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    pub fn pointer_size(&self) -> u64
    {
        self.pointer_size
    }

    fn section_reader(&self, id: SectionId) -> OwnedReader
    {
        let data = self
            .debug_sections
            .get(id.name())
            .cloned()
            .unwrap_or_else(|| Arc::<[u8]>::from(Vec::new()));
        EndianArcSlice::new(data, self.endian)
    }

    fn dwarf(&self) -> Option<&OwnedDwarf>
    {
        self.dwarf_cache
            .get_or_try_init(|| Dwarf::load(|section| Ok::<_, gimli::Error>(self.section_reader(section))))
            .ok()
    }

    fn units(&self) -> &[Unit<OwnedReader>]
    {
        self.unit_cache.get_or_init(|| {
            let Some(dwarf) = self.dwarf() else {
                return Vec::new();
            };
            let mut units = Vec::new();
            let mut headers = dwarf.units();
            loop {
                match headers.next() {
                    Ok(Some(header)) => match dwarf.unit(header) {
                        Ok(unit) => units.push(unit),
                        Err(err) => debug!("skipping unparsable compilation unit: {err}"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        debug!("stopping unit iteration: {err}");
                        break;
                    }
                }
            }
            units
        })
    }

    /// Cached layout for a type name (the `struct `/`union ` prefix is
    /// accepted and ignored).
    fn layout_of(&self, type_name: &str) -> Option<Arc<TypeLayout>>
    {
        let bare = bare_type_name(type_name);
        if let Some(cached) = self.type_cache.borrow().get(bare) {
            return cached.clone();
        }
        let computed = self.extract_layout(bare);
        if computed.is_none() {
            debug!("no DWARF layout for {bare}");
        }
        self.type_cache
            .borrow_mut()
            .insert(bare.to_string(), computed.clone());
        computed
    }

    fn extract_layout(&self, bare: &str) -> Option<Arc<TypeLayout>>
    {
        for unit in self.units() {
            let mut cursor = unit.entries();
            while let Ok(Some((_delta, entry))) = cursor.next_dfs() {
                if !matches!(
                    entry.tag(),
                    constants::DW_TAG_structure_type | constants::DW_TAG_union_type | constants::DW_TAG_class_type
                ) {
                    continue;
                }
                if is_declaration(entry) {
                    continue;
                }
                let Some(name) = self.entry_name(unit, entry) else {
                    continue;
                };
                if name != bare {
                    continue;
                }
                let size = entry
                    .attr(constants::DW_AT_byte_size)
                    .ok()
                    .flatten()
                    .and_then(|attr| attr.udata_value());
                let members = self.collect_members(unit, entry.offset());
                return Some(Arc::new(TypeLayout { size, members }));
            }
        }
        None
    }

    fn collect_members(&self, unit: &Unit<OwnedReader>, offset: UnitOffset<usize>) -> Vec<MemberLayout>
    {
        let mut members = Vec::new();
        let Ok(mut tree) = unit.entries_tree(Some(offset)) else {
            return members;
        };
        let Ok(root) = tree.root() else {
            return members;
        };
        let mut children = root.children();
        while let Ok(Some(child)) = children.next() {
            let entry = child.entry();
            if entry.tag() != constants::DW_TAG_member {
                continue;
            }
            let offset = entry
                .attr(constants::DW_AT_data_member_location)
                .ok()
                .flatten()
                .and_then(|attr| attr.udata_value());
            let type_name = entry
                .attr(constants::DW_AT_type)
                .ok()
                .flatten()
                .and_then(|attr| self.type_name_of(unit, attr.value(), 0));
            members.push(MemberLayout {
                name: self.entry_name(unit, entry),
                type_name,
                offset,
            });
        }
        members
    }

    /// Resolve the name a type reference points at, chasing typedefs and
    /// qualifiers up to a small depth.
    fn type_name_of(&self, unit: &Unit<OwnedReader>, value: AttributeValue<OwnedReader>, depth: usize) -> Option<String>
    {
        if depth >= MAX_TYPE_REF_DEPTH {
            return None;
        }
        let AttributeValue::UnitRef(offset) = value else {
            return None;
        };
        let die = unit.entry(offset).ok()?;
        if let Some(name) = self.entry_name(unit, &die) {
            return Some(name);
        }
        let attr = die.attr(constants::DW_AT_type).ok().flatten()?;
        self.type_name_of(unit, attr.value(), depth + 1)
    }

    fn entry_name(&self, unit: &Unit<OwnedReader>, entry: &DebuggingInformationEntry<'_, '_, OwnedReader>)
        -> Option<String>
    {
        let attr = entry.attr(constants::DW_AT_name).ok().flatten()?;
        let reader = self.dwarf()?.attr_string(unit, attr.value()).ok()?;
        let text = reader.to_string_lossy().ok()?;
        Some(match text {
            Cow::Borrowed(s) => s.to_string(),
            Cow::Owned(s) => s,
        })
    }
}

impl DebugInfo for DwarfInfo
{
    fn address_of(&self, symbol: &str) -> Option<VirtAddr>
    {
        self.symbols.get(symbol).copied().map(VirtAddr::new)
    }

    fn size_of(&self, type_name: &str) -> Option<u64>
    {
        if type_name.trim_end().ends_with('*') {
            return Some(self.pointer_size);
        }
        self.layout_of(type_name)?.size
    }

    fn field_offset(&self, type_name: &str, field: &str) -> Option<u64>
    {
        let (head, rest) = match field.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (field, None),
        };

        let layout = self.layout_of(type_name)?;
        let member = layout
            .members
            .iter()
            .find(|member| member.name.as_deref() == Some(head))?;
        let offset = member.offset?;

        match rest {
            None => Some(offset),
            Some(rest) => {
                let inner = member.type_name.as_deref()?;
                Some(offset + self.field_offset(inner, rest)?)
            }
        }
    }

    fn string_value_of(&self, symbol: &str) -> Option<String>
    {
        let addr = *self.symbols.get(symbol)?;
        let section = self
            .loaded_sections
            .iter()
            .find(|sec| addr >= sec.address && addr < sec.address + sec.data.len() as u64)?;
        let start = (addr - section.address) as usize;
        let tail = &section.data[start..];
        let terminated = tail.split(|byte| *byte == 0).next()?;
        Some(String::from_utf8_lossy(terminated).into_owned())
    }
}

fn bare_type_name(type_name: &str) -> &str
{
    type_name
        .trim()
        .trim_start_matches("struct ")
        .trim_start_matches("union ")
        .trim()
}

fn is_declaration(entry: &DebuggingInformationEntry<'_, '_, OwnedReader>) -> bool
{
    entry
        .attr(constants::DW_AT_declaration)
        .ok()
        .flatten()
        .is_some_and(|attr| matches!(attr.value(), AttributeValue::Flag(true)))
}

fn load_section_bytes<'data>(file: &object::File<'data>, names: &[&str]) -> Arc<[u8]>
{
    for name in names {
        if let Some(section) = file.section_by_name(name) {
            if let Ok(data) = section.uncompressed_data() {
                return match data {
                    Cow::Borrowed(bytes) => Arc::<[u8]>::from(bytes.to_vec()),
                    Cow::Owned(vec) => vec.into(),
                };
            }
        }
    }
    Arc::<[u8]>::from(Vec::new())
}

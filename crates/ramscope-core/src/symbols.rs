//! # Symbol Table
//!
//! Sorted `(address, name)` index over the kernel image, with binary-search
//! lookup of the closest symbol at or below an address.
//!
//! The table is built once from the vmlinux symbol table, filtered to the
//! image's text range (the symbol file contains many artificial symbols we
//! don't care about) and relocated by the same offset the translator uses.
//! Per-module tables can be merged in afterwards; module entries get a
//! disambiguating `[module]` suffix and the whole table is re-sorted.

use std::fs;
use std::path::Path;

use object::{Object, ObjectSymbol};

use crate::error::{AnalysisError, Result};

/// One `(address, name)` pair. Addresses are globally unique after
/// construction (entries sharing an address are de-duplicated by last
/// write).
#[derive(Debug, Clone)]
pub struct SymbolEntry
{
    pub addr: u64,
    pub name: String,
}

/// How [`SymbolTable::lookup`] reports the second half of its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode
{
    /// `addr - entry.addr`
    Offset,
    /// `next_entry.addr - entry.addr`, 0 for the last entry
    Size,
}

/// Sorted symbol index with strictly ascending addresses.
pub struct SymbolTable
{
    entries: Vec<SymbolEntry>,
}

impl SymbolTable
{
    /// Build a table from raw `(address, name)` pairs.
    ///
    /// Entries are sorted ascending; when several share an address the one
    /// appearing last wins.
    pub fn from_entries(entries: Vec<(u64, String)>) -> Self
    {
        let mut table = Self { entries: Vec::new() };
        table.extend_sorted(entries);
        table
    }

    fn extend_sorted(&mut self, entries: Vec<(u64, String)>)
    {
        self.entries
            .extend(entries.into_iter().map(|(addr, name)| SymbolEntry { addr, name }));
        // Stable sort keeps insertion order within an address, so dedup's
        // "keep last" below implements last-write-wins.
        self.entries.sort_by_key(|entry| entry.addr);
        self.entries.reverse();
        self.entries.dedup_by_key(|entry| entry.addr);
        self.entries.reverse();
    }

    /// Build the kernel table from pre-filtered link-time entries,
    /// applying the relocation offset to every address.
    pub fn from_entries_relocated(entries: Vec<(u64, String)>, relocation: u64) -> Self
    {
        Self::from_entries(
            entries
                .into_iter()
                .map(|(addr, name)| (addr.wrapping_add(relocation), name))
                .collect(),
        )
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    /// `[min, max]` address span of the table.
    pub fn address_range(&self) -> Option<(u64, u64)>
    {
        Some((self.entries.first()?.addr, self.entries.last()?.addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolEntry>
    {
        self.entries.iter()
    }

    /// Find the entry with the greatest address at or below `addr`.
    ///
    /// Fails (returns `None`) when `addr` is `None` or lies outside the
    /// table's `[min, max]` span.
    pub fn lookup(&self, addr: Option<u64>, mode: LookupMode) -> Option<(&str, u64)>
    {
        let addr = addr?;
        let (min, max) = self.address_range()?;
        if addr < min || addr > max {
            return None;
        }

        let idx = self.entries.partition_point(|entry| entry.addr <= addr) - 1;
        let entry = &self.entries[idx];
        let second = match mode {
            LookupMode::Offset => addr - entry.addr,
            LookupMode::Size => self
                .entries
                .get(idx + 1)
                .map_or(0, |next| next.addr - entry.addr),
        };
        Some((entry.name.as_str(), second))
    }

    /// Merge a module's symbols into the table.
    ///
    /// Every entry gets a `[module]` suffix so its origin stays visible in
    /// backtraces; the table is fully re-sorted afterwards.
    pub fn merge_module(&mut self, module: &str, entries: Vec<(u64, String)>)
    {
        let tagged = entries
            .into_iter()
            .filter(|(addr, _)| *addr != 0)
            .map(|(addr, name)| (addr, format!("{name}[{module}]")))
            .collect();
        self.extend_sorted(tagged);
    }
}

/// Read the symbol table out of a vmlinux ELF, filtered to the image's
/// text range (the symbol file contains many artificial symbols we don't
/// care about). Addresses are link-time; relocation happens at table
/// construction.
pub fn vmlinux_symbols(path: &Path) -> Result<Vec<(u64, String)>>
{
    let data = fs::read(path)?;
    let file = object::File::parse(&*data)
        .map_err(|err| AnalysisError::Setup(format!("failed to parse {}: {err}", path.display())))?;

    let mut raw: Vec<(u64, String)> = Vec::new();
    let mut text = 0u64;
    let mut end = u64::MAX;
    for sym in file.symbols() {
        let Ok(name) = sym.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        match name {
            "_text" => text = sym.address(),
            "_end" => end = sym.address(),
            _ => {}
        }
        raw.push((sym.address(), name.to_string()));
    }

    let entries: Vec<(u64, String)> = raw
        .into_iter()
        .filter(|(addr, _)| *addr >= text && *addr < end)
        .collect();

    if entries.is_empty() {
        return Err(AnalysisError::NoSymbols(path.to_path_buf()));
    }
    Ok(entries)
}

/// Read a module object (`.ko`) and relocate its symbols to `load_addr`.
pub fn load_module_symbols(path: &Path, load_addr: u64) -> Result<Vec<(u64, String)>>
{
    let data = fs::read(path)?;
    let file = object::File::parse(&*data)
        .map_err(|err| AnalysisError::Setup(format!("failed to parse {}: {err}", path.display())))?;

    let mut entries = Vec::new();
    for sym in file.symbols() {
        let Ok(name) = sym.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        entries.push((sym.address().wrapping_add(load_addr), name.to_string()));
    }
    Ok(entries)
}

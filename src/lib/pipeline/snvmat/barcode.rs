//! Cell barcode processing functionality

use std::path::Path;

use anyhow::Context;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smartstring::alias::String as CompactString;

use crate::core::io::get_reader;

/// Strip the GEM-well suffix (`-1`), trim and uppercase a barcode.
///
/// Returns `None` for empty barcodes or barcodes with characters outside `ACGTN`.
pub fn normalize_barcode(raw: &str) -> Option<CompactString> {
    let clean = raw.split('-').next().unwrap_or(raw).trim();
    if clean.is_empty() {
        return None;
    }
    let mut barcode = CompactString::new();
    for byte in clean.bytes() {
        match byte.to_ascii_uppercase() {
            b @ (b'A' | b'C' | b'G' | b'T' | b'N') => barcode.push(b as char),
            _ => return None,
        }
    }
    Some(barcode)
}

#[derive(Debug, Default)]
struct RegistryInner {
    ordered: Vec<CompactString>,
    barcode_to_id: FxHashMap<CompactString, u32>,
}

/// Shared barcode → provisional cell id registry.
///
/// In open mode ids are assigned first-writer-wins on first sight of a barcode;
/// the exclusive lock is only taken for barcodes not seen before. In whitelist
/// mode the id space is fixed up front and unknown barcodes are refused.
#[derive(Debug)]
pub struct BarcodeRegistry {
    inner: RwLock<RegistryInner>,
    whitelist: bool,
}

impl BarcodeRegistry {
    /// Registry that accepts any well-formed barcode.
    pub fn open() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            whitelist: false,
        }
    }

    /// Registry restricted to an explicit barcode list, preserving its order.
    pub fn from_whitelist<I, S>(barcodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = RegistryInner::default();
        for raw in barcodes {
            if let Some(barcode) = normalize_barcode(raw.as_ref()) {
                if !inner.barcode_to_id.contains_key(&barcode) {
                    let id = inner.ordered.len() as u32;
                    inner.ordered.push(barcode.clone());
                    inner.barcode_to_id.insert(barcode, id);
                }
            }
        }
        inner.ordered.shrink_to_fit();
        inner.barcode_to_id.shrink_to_fit();
        Self {
            inner: RwLock::new(inner),
            whitelist: true,
        }
    }

    /// Load a whitelist with one barcode per line (plain or gzip).
    pub fn from_whitelist_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut reader = get_reader(path, false)
            .with_context(|| format!("Failed to read barcodes from {}", path.display()))?;
        let mut barcodes = Vec::with_capacity(1024);
        for record in reader.records() {
            let record = record?;
            if let Some(first) = record.get(0) {
                barcodes.push(first.to_string());
            }
        }
        Ok(Self::from_whitelist(barcodes))
    }

    pub fn is_whitelist(&self) -> bool {
        self.whitelist
    }

    /// Lookup the provisional id for an already normalized barcode, registering it
    /// on first sight in open mode.
    pub fn id_of_or_insert(&self, barcode: &str) -> Option<u32> {
        if let Some(&id) = self.inner.read().barcode_to_id.get(barcode) {
            return Some(id);
        }
        if self.whitelist {
            return None;
        }

        let mut inner = self.inner.write();
        if let Some(&id) = inner.barcode_to_id.get(barcode) {
            return Some(id);
        }
        let id = inner.ordered.len() as u32;
        let barcode = CompactString::from(barcode);
        inner.ordered.push(barcode.clone());
        inner.barcode_to_id.insert(barcode, id);
        Some(id)
    }

    /// Lookup without registering.
    pub fn id_of(&self, barcode: &str) -> Option<u32> {
        self.inner.read().barcode_to_id.get(barcode).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the registry into its canonical cell order.
    ///
    /// Whitelist mode keeps whitelist order. Open mode sorts barcodes so the row
    /// order does not depend on which thread saw a barcode first.
    pub fn freeze(self) -> BarcodeTable {
        let RegistryInner { ordered, .. } = self.inner.into_inner();
        if self.whitelist {
            let remap = (0..ordered.len() as u32).collect();
            let sorted = ordered.windows(2).all(|w| w[0] <= w[1]);
            return BarcodeTable {
                barcodes: ordered,
                remap,
                sorted,
            };
        }

        let mut order: Vec<u32> = (0..ordered.len() as u32).collect();
        order.sort_unstable_by(|&a, &b| ordered[a as usize].cmp(&ordered[b as usize]));

        let mut remap = vec![0u32; ordered.len()];
        for (final_id, &provisional) in order.iter().enumerate() {
            remap[provisional as usize] = final_id as u32;
        }
        let barcodes = order
            .iter()
            .map(|&provisional| ordered[provisional as usize].clone())
            .collect();
        BarcodeTable {
            barcodes,
            remap,
            sorted: true,
        }
    }
}

/// Frozen cell id ↔ barcode mapping handed to output adapters.
#[derive(Debug, Clone)]
pub struct BarcodeTable {
    barcodes: Vec<CompactString>,
    remap: Vec<u32>,
    sorted: bool,
}

impl BarcodeTable {
    /// Final cell id for a provisional id assigned during accumulation.
    #[inline]
    pub(crate) fn final_id(&self, provisional: u32) -> u32 {
        self.remap[provisional as usize]
    }

    #[inline]
    pub fn barcode_by_id(&self, id: u32) -> Option<&str> {
        self.barcodes.get(id as usize).map(|s| s.as_str())
    }

    /// Binary search when rows are in barcode order, linear scan otherwise.
    pub fn id_of(&self, barcode: &str) -> Option<u32> {
        if self.sorted {
            self.barcodes
                .binary_search_by(|b| b.as_str().cmp(barcode))
                .ok()
                .map(|i| i as u32)
        } else {
            self.barcodes
                .iter()
                .position(|b| b.as_str() == barcode)
                .map(|i| i as u32)
        }
    }

    pub fn len(&self) -> usize {
        self.barcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barcodes.is_empty()
    }

    /// Borrow barcodes in row order.
    pub fn barcodes(&self) -> impl Iterator<Item = &str> {
        self.barcodes.iter().map(|s| s.as_str())
    }
}

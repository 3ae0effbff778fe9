use crate::file::CacheFile;

/// A packed index probe: the slot index in the high 32 bits and the probed
/// value (a byte position in the log) in the low 32. Negative values encode
/// the two out-of-band outcomes, so a position is always 31 bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Probe(u64);

const RETRY_VALUE: i32 = -1;
const NEXT_VALUE: i32 = -2;

/// Probing reached the appendable tail: try again once more is published.
pub const RETRY_SEGMENT: Probe = Probe::pack(-1, RETRY_VALUE);
/// This segment is exhausted: move to the next one.
pub const NEXT_SEGMENT: Probe = Probe::pack(-1, NEXT_VALUE);

/// Sentinel for "no position constraint" when resetting conditions.
pub const POSITION_UNSET: i32 = -1;

impl Probe {
    pub const fn pack(index: i32, value: i32) -> Self {
        Probe(((index as u32 as u64) << 32) | value as u32 as u64)
    }

    pub const fn index(self) -> i32 {
        (self.0 >> 32) as i32
    }

    pub const fn value(self) -> i32 {
        self.0 as u32 as i32
    }

    pub const fn is_retry(self) -> bool {
        self.value() == RETRY_VALUE
    }

    pub const fn is_next_segment(self) -> bool {
        self.value() == NEXT_VALUE
    }

    pub const fn is_sentinel(self) -> bool {
        self.value() < 0
    }

    pub const fn next_index(self) -> Self {
        Probe::pack(self.index() + 1, self.value())
    }

    pub const fn previous_index(self) -> Self {
        Probe::pack(self.index() - 1, self.value())
    }

    pub const fn next_value(self) -> Self {
        Probe::pack(self.index(), self.value() + 1)
    }
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value() {
            RETRY_VALUE => write!(f, "Probe(RETRY_SEGMENT)"),
            NEXT_VALUE => write!(f, "Probe(NEXT_SEGMENT)"),
            value => write!(f, "Probe({}, {})", self.index(), value),
        }
    }
}

/// The smaller of two probes by value; sentinels lose to real positions.
pub fn min_by_value(a: Probe, b: Probe) -> Probe {
    match (a.is_sentinel(), b.is_sentinel()) {
        (true, _) => b,
        (_, true) => a,
        _ if a.value() <= b.value() => a,
        _ => b,
    }
}

/// The larger of two probes by value; sentinels lose to real positions.
pub fn max_by_value(a: Probe, b: Probe) -> Probe {
    match (a.is_sentinel(), b.is_sentinel()) {
        (true, _) => b,
        (_, true) => a,
        _ if a.value() >= b.value() => a,
        _ => b,
    }
}

const ROW_LEN: u32 = 8;

/// A sorted array of 8-byte `(key32, value32)` rows over a cache file,
/// probed by binary search.
///
/// The offset index is sorted at all times (offsets ascend with append).
/// The hash index of the head segment is in append order - which is still
/// ascending by value - and is probed by linear scan until the segment
/// freezes and [`IndexFile::freeze_sorted`] orders it by `(key, value)`.
pub struct IndexFile {
    file: CacheFile,
}

impl IndexFile {
    pub fn new(file: CacheFile) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &CacheFile {
        &self.file
    }

    pub fn entries(&self) -> i32 {
        (self.file.published() / ROW_LEN) as i32
    }

    pub fn available(&self) -> u32 {
        self.file.available()
    }

    fn row(&self, slot: i32) -> (u32, i32) {
        let bytes = self.file.bytes();
        let at = slot as usize * ROW_LEN as usize;
        let key = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        let value = u32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap()) as i32;
        (key, value)
    }

    pub fn append(&self, key: u32, value: i32) -> crate::Result<()> {
        debug_assert!(value >= 0);
        let mut row = [0u8; ROW_LEN as usize];
        row[..4].copy_from_slice(&key.to_be_bytes());
        row[4..].copy_from_slice(&(value as u32).to_le_bytes());
        self.file.append(&row)?;
        Ok(())
    }

    fn miss(&self) -> Probe {
        if self.file.appendable() {
            RETRY_SEGMENT
        } else {
            NEXT_SEGMENT
        }
    }

    /// Smallest slot whose key is >= `key`. Requires the file to be sorted
    /// by key, which holds for the offset index always and for the hash
    /// index once frozen.
    pub fn first(&self, key: u32) -> Probe {
        let entries = self.entries();
        let mut lo = 0;
        let mut hi = entries;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.row(mid).0 < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == entries {
            return self.miss();
        }
        Probe::pack(lo, self.row(lo).1)
    }

    /// The first row at or after the probe's slot whose value reaches the
    /// probe's value, or the out-of-band outcome past the tail. Values
    /// ascend with slot here, so this resolves by binary search even while
    /// the file is appendable.
    pub fn resolve(&self, probe: Probe) -> Probe {
        let bound = probe.value().max(0);
        let entries = self.entries();
        let mut lo = probe.index().max(0);
        let mut hi = entries;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.row(mid).1 < bound {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= entries {
            return self.miss();
        }
        Probe::pack(lo, self.row(lo).1)
    }

    /// Smallest row with this exact key whose value is >= the prior probe's
    /// value (and, while append-ordered, slot >= the prior slot). Exhausting
    /// the key's run yields RETRY_SEGMENT while appendable, NEXT_SEGMENT
    /// once frozen.
    pub fn ceiling(&self, key: u32, prior: Probe) -> Probe {
        let bound = prior.value().max(0);
        let entries = self.entries();

        if self.file.appendable() {
            // Append order: slot order equals value order across all keys.
            let mut slot = prior.index().max(0);
            while slot < entries {
                let (row_key, row_value) = self.row(slot);
                if row_key == key && row_value >= bound {
                    return Probe::pack(slot, row_value);
                }
                slot += 1;
            }
            return RETRY_SEGMENT;
        }

        // Frozen: rows are sorted by (key, value). Slots may have moved at
        // freeze time, so resumption binds on value alone within the run.
        let mut lo = 0;
        let mut hi = entries;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (row_key, row_value) = self.row(mid);
            if row_key < key || (row_key == key && row_value < bound) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == entries || self.row(lo).0 != key {
            return NEXT_SEGMENT;
        }
        Probe::pack(lo, self.row(lo).1)
    }

    /// Sort rows by `(key, value)` and end the append lifetime.
    pub fn freeze_sorted(&self) -> crate::Result<()> {
        let entries = self.entries();
        let mut rows: Vec<(u32, i32)> = (0..entries).map(|slot| self.row(slot)).collect();
        rows.sort_unstable();

        let mut buf = Vec::with_capacity(rows.len() * ROW_LEN as usize);
        for (key, value) in rows {
            buf.extend_from_slice(&key.to_be_bytes());
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        self.file.overwrite(0, &buf)?;
        self.file.freeze();
        Ok(())
    }
}

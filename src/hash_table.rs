//! A high-performance hash table using group-scanned open addressing.
//!
//! The table is a flat, power-of-two sized array of slots with a parallel
//! array of one-byte control tags, one per slot. A slot's tag is either
//! `EMPTY` (never occupied since the last rehash, or reclaimed by a
//! removal), `TOMBSTONE` (occupied until recently; probes must keep going
//! past it), or a 7-bit fingerprint of the occupant's hash with the sign bit
//! clear. The sign bit is the load-bearing trick: both available states have
//! it set and every fingerprint has it clear, so a single `movemask` over a
//! group of tags answers "where can I insert" without touching slot data,
//! and one byte-compare answers "which slots might match".
//!
//! [`HashTable<V>`] stores values of type `V` and requires you to provide
//! both the hash value and an equality predicate for each operation. This is
//! a fairly low-level structure; prefer the [`HashMap<K, V, S>`] or
//! [`HashSet<T, S>`] wrappers for a conventional keyed interface unless you
//! are building your own map or set on top.
//!
//! ## Design
//!
//! Control tags are scanned a group at a time. A group is a contiguous,
//! group-aligned window of `GROUP_WIDTH` tags (32 bytes when compiled with
//! AVX2, 16 bytes otherwise, with a scalar loop over the same window when
//! SSE2 is unavailable). The bits of a value's hash above the low 7 select
//! its starting group and the low 7 bits become its fingerprint. It matters
//! that the two bit ranges don't overlap: deriving both from the same bits
//! correlates a tag with its position in the table and shows up directly as
//! extra fingerprint collisions in probe-heavy benchmarks.
//!
//! Lookup compares the fingerprint against a whole group with one vector
//! compare, verifies the (rare) candidate slots with the caller's equality
//! predicate, and stops at the first group containing an `EMPTY` tag.
//! Insertion takes the lowest available slot of the first group that has
//! one, and therefore never places a value past a group containing an
//! `EMPTY` tag. That is exactly the invariant that makes the early stop on
//! lookup sound.
//!
//! Removal is where churn-heavy workloads live or die. Clearing a slot back
//! to `EMPTY` would cut later probe chains short, so a removed slot becomes
//! a `TOMBSTONE` unless its own group still contains an `EMPTY` tag. In that
//! case any probe chain passing through the group already terminates inside
//! it and the slot can be reclaimed as `EMPTY` immediately. Tombstones are
//! reused by insertion (they are available slots) and purged wholesale by
//! rehashing, so a workload that erases and inserts keys in pairs forever
//! neither grows the table without bound nor degrades into scanning a table
//! full of tombstones.
//!
//! The table counts occupied slots and tombstones together against a
//! maximum load of 7/8 of the slot count. Exceeding it on insert triggers a
//! rehash sized from the *live* entry count, which may keep the same
//! capacity when the pressure is all tombstones. Capacities are powers of
//! two so that selecting the starting group is a mask rather than a modulo.
//!
//! All data lives in one contiguous type-erased allocation, control tags
//! first, then slots: `[ Tags | Values ]`. Keeping the tags in their own
//! contiguous block lets the group scan use wide loads regardless of the
//! size of `V` and keeps the probe working set dense: a miss usually costs
//! one cache line of tags, not a line per probed slot. Slot storage is
//! uninitialized until a value is written, so no `V` is ever default
//! constructed on the table's behalf.
//!
//! ## Safety Invariants
//!
//! The implementation relies on the following key invariants:
//!
//! 1. **Bounds**: group indices are always masked by
//!    `buckets / GROUP_WIDTH - 1`, so every scanned window
//!    `[base, base + GROUP_WIDTH)` lies inside the control array.
//!    Capacities are powers of two, at least `MIN_BUCKETS`, and therefore
//!    multiples of `GROUP_WIDTH`.
//! 2. **Initialization**: a tag with the sign bit clear marks a slot whose
//!    `MaybeUninit<V>` is initialized; `EMPTY` and `TOMBSTONE` tags mark
//!    slots whose storage must not be read.
//! 3. **Probe reachability**: for every occupied slot, walking groups from
//!    the occupant's starting group reaches the slot's group without
//!    crossing a group that contains an `EMPTY` tag.
//! 4. **Accounting**: `populated` equals the number of tags with the sign
//!    bit clear, `tombstones` equals the number of `TOMBSTONE` tags, and
//!    `populated + tombstones` never exceeds 7/8 of `buckets` between
//!    public operations. In particular a non-empty table always contains an
//!    `EMPTY` tag, which bounds every probe loop.
//!
//! [`HashMap<K, V, S>`]: crate::hash_map::HashMap
//! [`HashSet<T, S>`]: crate::hash_set::HashSet

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;
use core::alloc::Layout;
#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;
use core::fmt::Debug;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use cfg_if::cfg_if;

/// Tag marking a slot that has never held a value since the last rehash, or
/// whose removal happened in a group that still had another empty slot.
///
/// Chosen as 0x80 (sign bit set, all other bits zero) so `movemask`-based
/// scans can use the sign bit to find available slots and an exact byte
/// compare to find empty ones.
const EMPTY: u8 = 0x80;

/// Tag marking a slot whose value was removed while its group was otherwise
/// saturated. Probes continue past it; insertion may reclaim it.
const TOMBSTONE: u8 = 0xFF;

/// Smallest non-zero slot count. Power of two and a multiple of the group
/// width for both supported widths.
const MIN_BUCKETS: usize = 32;

/// Occupied slots plus tombstones may use at most `7/8` of the slot count
/// before an insert forces a rehash.
const MAX_LOAD_NUM: usize = 7;
const MAX_LOAD_DEN: usize = 8;

#[inline(always)]
fn hashtag(hash: u64) -> u8 {
    (hash & 0x7F) as u8
}

#[inline(always)]
fn is_full(tag: u8) -> bool {
    tag & 0x80 == 0
}

/// Slot count to rehash into so that `entries` live values sit comfortably
/// below the maximum load afterwards.
#[inline(always)]
fn grown_buckets(entries: usize) -> usize {
    ((entries * 32).div_ceil(24) + 1)
        .next_power_of_two()
        .max(MIN_BUCKETS)
}

/// Prefetches data into the cache.
///
/// # Safety
///
/// The caller must ensure that `ptr` points to a memory location that is
/// safe to read from. While `_mm_prefetch` might not fault on invalid
/// addresses, the behavior is undefined if the address is not valid for
/// reads.
#[inline(always)]
unsafe fn prefetch<T>(ptr: *const T) {
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse"
    ))]
    // SAFETY: Caller guarantees `ptr` is valid for reads.
    unsafe {
        _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
    }

    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse"
    )))]
    let _ = ptr;
}

/// A bitmask over one group of control tags, one bit per tag.
///
/// Iterates set bits from the lowest index upward, which makes probe order
/// deterministic: the first matching or available slot reported for a group
/// is always the one with the smallest index.
#[derive(Clone, Copy)]
struct BitMask(u32);

impl BitMask {
    #[inline(always)]
    fn any(self) -> bool {
        self.0 != 0
    }

    #[inline(always)]
    fn lowest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }
}

impl Iterator for BitMask {
    type Item = usize;

    #[inline(always)]
    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }

        let index = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(index)
    }
}

cfg_if! {
    if #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "avx2"
    ))] {
        const GROUP_WIDTH: usize = 32;

        /// Scan one group of tags for bytes equal to `tag`.
        ///
        /// # Safety
        ///
        /// The caller must ensure `group` points at a group-aligned offset
        /// into the control array with at least `GROUP_WIDTH` readable
        /// bytes.
        #[inline(always)]
        unsafe fn match_tag(group: *const u8, tag: u8) -> BitMask {
            // SAFETY: Caller guarantees 32 readable bytes at `group`, and
            // this branch only exists when AVX2 is available at compile
            // time.
            unsafe {
                let data = _mm256_loadu_si256(group as *const __m256i);
                let cmp = _mm256_cmpeq_epi8(data, _mm256_set1_epi8(tag as i8));
                BitMask(_mm256_movemask_epi8(cmp) as u32)
            }
        }

        /// Scan one group of tags for available slots (`EMPTY` or
        /// `TOMBSTONE`), both of which carry the sign bit.
        ///
        /// # Safety
        ///
        /// Same contract as [`match_tag`].
        #[inline(always)]
        unsafe fn match_available(group: *const u8) -> BitMask {
            // SAFETY: Caller guarantees 32 readable bytes at `group`, and
            // this branch only exists when AVX2 is available at compile
            // time.
            unsafe {
                let data = _mm256_loadu_si256(group as *const __m256i);
                BitMask(_mm256_movemask_epi8(data) as u32)
            }
        }
    } else {
        const GROUP_WIDTH: usize = 16;

        /// Scan one group of tags for bytes equal to `tag`.
        ///
        /// # Safety
        ///
        /// The caller must ensure `group` points at a group-aligned offset
        /// into the control array with at least `GROUP_WIDTH` readable
        /// bytes.
        #[inline(always)]
        unsafe fn match_tag(group: *const u8, tag: u8) -> BitMask {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            if cfg!(target_feature = "sse2") {
                // SAFETY: Caller guarantees 16 readable bytes at `group`,
                // and we have confirmed SSE2 support.
                unsafe {
                    let data = _mm_loadu_si128(group as *const __m128i);
                    let cmp = _mm_cmpeq_epi8(data, _mm_set1_epi8(tag as i8));
                    return BitMask(_mm_movemask_epi8(cmp) as u32);
                }
            }

            // Scalar reference scan over the same window. Produces masks
            // bit-identical to the vector paths.
            let mut mask = 0u32;
            for i in 0..GROUP_WIDTH {
                // SAFETY: Caller guarantees `GROUP_WIDTH` readable bytes at
                // `group`.
                if unsafe { *group.add(i) } == tag {
                    mask |= 1 << i;
                }
            }
            BitMask(mask)
        }

        /// Scan one group of tags for available slots (`EMPTY` or
        /// `TOMBSTONE`), both of which carry the sign bit.
        ///
        /// # Safety
        ///
        /// Same contract as [`match_tag`].
        #[inline(always)]
        unsafe fn match_available(group: *const u8) -> BitMask {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            if cfg!(target_feature = "sse2") {
                // SAFETY: Caller guarantees 16 readable bytes at `group`,
                // and we have confirmed SSE2 support.
                unsafe {
                    let data = _mm_loadu_si128(group as *const __m128i);
                    return BitMask(_mm_movemask_epi8(data) as u32);
                }
            }

            let mut mask = 0u32;
            for i in 0..GROUP_WIDTH {
                // SAFETY: Caller guarantees `GROUP_WIDTH` readable bytes at
                // `group`.
                if unsafe { *group.add(i) } & 0x80 != 0 {
                    mask |= 1 << i;
                }
            }
            BitMask(mask)
        }
    }
}

/// Scan one group of tags for `EMPTY` slots exactly, excluding tombstones.
///
/// # Safety
///
/// Same contract as [`match_tag`].
#[inline(always)]
unsafe fn match_empty(group: *const u8) -> BitMask {
    // SAFETY: Contract forwarded to the caller. `EMPTY` never collides with
    // a fingerprint because fingerprints have the sign bit clear.
    unsafe { match_tag(group, EMPTY) }
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    ctrl_offset: usize,
    slots_offset: usize,
}

impl DataLayout {
    fn new<V>(buckets: usize) -> Self {
        let ctrl_layout = Layout::array::<u8>(buckets)
            .and_then(|layout| layout.align_to(GROUP_WIDTH))
            .expect("allocation size overflow");
        let slots_layout =
            Layout::array::<MaybeUninit<V>>(buckets).expect("allocation size overflow");

        let (layout, ctrl_offset) = Layout::new::<()>().extend(ctrl_layout).unwrap();
        let (layout, slots_offset) = layout.extend(slots_layout).unwrap();

        DataLayout {
            layout,
            ctrl_offset,
            slots_offset,
        }
    }
}

/// Table occupancy statistics for debugging and capacity tuning.
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of values currently in the table.
    pub populated: usize,
    /// Number of tombstone tags awaiting reuse or the next rehash.
    pub tombstones: usize,
    /// Total number of slots allocated.
    pub buckets: usize,
    /// Maximum value count before a resize is forced.
    pub capacity: usize,
    /// Fraction of slots charged against the load limit, tombstones
    /// included.
    pub load_factor: f64,
    /// Total memory in bytes used by the table's allocation.
    pub total_bytes: usize,
}

#[cfg(feature = "stats")]
impl DebugStats {
    /// Pretty-print the statistics.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!("=== Hash Table Debug Statistics ===");
        println!(
            "Population: {}/{} ({:.2}% load factor incl. {} tombstones)",
            self.populated,
            self.capacity,
            self.load_factor * 100.0,
            self.tombstones,
        );
        println!(
            "Slots: {} ({} bytes allocated)",
            self.buckets, self.total_bytes
        );
    }
}

/// A high-performance hash table using group-scanned open addressing.
///
/// `HashTable<V>` stores values of type `V` and provides fast insertion,
/// lookup, and removal operations. Unlike standard hash maps, this
/// implementation requires you to provide both the hash value and an
/// equality predicate for each operation, which also makes lookups with
/// borrowed or foreign key representations trivial.
///
/// ## Performance Characteristics
///
/// - **Memory**: 1 byte per slot overhead, plus the size of `V` per slot.
/// - **Probes**: lookups scan `GROUP_WIDTH` control tags per step with a
///   single vector compare and stop at the first group containing an empty
///   slot.
pub struct HashTable<V> {
    layout: DataLayout,
    alloc: NonNull<u8>,

    buckets: usize,
    populated: usize,
    tombstones: usize,

    _phantom: core::marker::PhantomData<V>,
}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use alloc::format;
        use alloc::string::String;

        let mut ctrl = String::new();
        if self.buckets != 0 {
            // SAFETY: A non-zero bucket count means `self.alloc` is a live
            // allocation matching `self.layout`, so the control slice is
            // valid for reads.
            for (index, &tag) in unsafe { self.ctrl_ptr().as_ref() }.iter().enumerate() {
                if index != 0 && index % GROUP_WIDTH == 0 {
                    ctrl.push('|');
                }
                if tag == EMPTY {
                    ctrl.push_str("..");
                } else if tag == TOMBSTONE {
                    ctrl.push_str("xx");
                } else {
                    ctrl.push_str(&format!("{tag:02x}"));
                }
            }
        }

        f.debug_struct("HashTable")
            .field("buckets", &self.buckets)
            .field("populated", &self.populated)
            .field("tombstones", &self.tombstones)
            .field("ctrl", &ctrl)
            .finish()
    }
}

impl<V> Drop for HashTable<V> {
    fn drop(&mut self) {
        // SAFETY: We only drop values in slots whose tag marks them
        // initialized, and we only deallocate an allocation we own.
        unsafe {
            if core::mem::needs_drop::<V>() && self.populated > 0 {
                for (index, &tag) in self.ctrl_ptr().as_ref().iter().enumerate() {
                    if is_full(tag) {
                        self.slots_ptr()
                            .as_mut()
                            .get_unchecked_mut(index)
                            .assume_init_drop();
                    }
                }
            }

            if self.layout.layout.size() != 0 {
                alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
            }
        }
    }
}

impl<V> HashTable<V> {
    /// Creates a new hash table with at least the specified number of slots.
    ///
    /// The slot count is rounded up to a power of two no smaller than the
    /// implementation minimum. A capacity of zero defers allocation until
    /// the first insertion.
    pub fn with_capacity(capacity: usize) -> Self {
        let buckets = if capacity == 0 {
            0
        } else {
            capacity.next_power_of_two().max(MIN_BUCKETS)
        };

        Self::with_buckets(buckets)
    }

    fn with_buckets(buckets: usize) -> Self {
        debug_assert!(buckets == 0 || (buckets.is_power_of_two() && buckets >= MIN_BUCKETS));

        let layout = DataLayout::new::<V>(buckets);
        let alloc = if layout.layout.size() == 0 {
            NonNull::dangling()
        } else {
            // SAFETY: We have validated that the layout size is non-zero.
            // The `alloc` function returns a valid pointer, and we handle
            // allocation errors if it returns null.
            unsafe {
                let raw_alloc = alloc::alloc::alloc(layout.layout);
                if raw_alloc.is_null() {
                    handle_alloc_error(layout.layout);
                }

                core::ptr::write_bytes(raw_alloc.add(layout.ctrl_offset), EMPTY, buckets);

                NonNull::new_unchecked(raw_alloc)
            }
        };

        Self {
            layout,
            alloc,
            buckets,
            populated: 0,
            tombstones: 0,
            _phantom: core::marker::PhantomData,
        }
    }

    fn ctrl_ptr(&self) -> NonNull<[u8]> {
        // SAFETY: `self.alloc` points to a valid allocation described by
        // `self.layout` whenever `self.buckets` is non-zero, and the offset
        // and length are derived from that same layout. A zero bucket count
        // yields an empty slice from the dangling pointer, which is valid.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.ctrl_offset).cast(),
                self.buckets,
            )
        }
    }

    fn slots_ptr(&self) -> NonNull<[MaybeUninit<V>]> {
        // SAFETY: Same argument as `ctrl_ptr`; the slot block starts at
        // `slots_offset` and holds exactly `self.buckets` slots.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.slots_offset).cast(),
                self.buckets,
            )
        }
    }

    #[inline(always)]
    fn group_mask(&self) -> usize {
        debug_assert!(self.buckets >= GROUP_WIDTH);
        self.buckets / GROUP_WIDTH - 1
    }

    #[inline(always)]
    fn max_load(&self) -> usize {
        self.buckets / MAX_LOAD_DEN * MAX_LOAD_NUM
    }

    /// Returns `true` if the table contains no values.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Returns the number of values in the table.
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Returns the number of values the table can hold before a resize is
    /// forced, assuming no removals in between.
    pub fn capacity(&self) -> usize {
        self.max_load()
    }

    /// Returns the total number of slots in the table.
    ///
    /// Always zero or a power of two no smaller than the implementation
    /// minimum.
    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    /// Returns the fraction of the slot count charged against the load
    /// limit.
    ///
    /// Tombstones count: a table that is mostly tombstones reports a high
    /// load factor even though `len` is small.
    pub fn load_factor(&self) -> f32 {
        if self.buckets == 0 {
            0.0
        } else {
            (self.populated + self.tombstones) as f32 / self.buckets as f32
        }
    }

    /// Returns the load factor at which an insertion forces a rehash.
    pub fn max_load_factor(&self) -> f32 {
        MAX_LOAD_NUM as f32 / MAX_LOAD_DEN as f32
    }

    /// Walk groups from the hash's starting group looking for a value the
    /// predicate accepts. Returns its slot index.
    ///
    /// The scan stops at the first group containing an `EMPTY` tag: no
    /// value with this hash can live beyond that group, because insertion
    /// never places one past it.
    #[inline]
    fn search(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<usize> {
        if self.populated == 0 {
            return None;
        }

        let tag = hashtag(hash);
        let group_mask = self.group_mask();
        let mut group = ((hash >> 7) as usize) & group_mask;

        loop {
            let base = group * GROUP_WIDTH;

            // SAFETY: `group` is masked by `group_mask`, so the window
            // `[base, base + GROUP_WIDTH)` lies inside the control array.
            let ctrl = unsafe { self.ctrl_ptr().as_ref().as_ptr().add(base) };

            // SAFETY: `base` is group-aligned and validated above.
            let candidates = unsafe { match_tag(ctrl, tag) };
            if candidates.any() {
                // SAFETY: `base` is within the slot array; prefetch targets
                // do not need to be initialized.
                unsafe {
                    prefetch(self.slots_ptr().as_ref().as_ptr().add(base));
                }
            }

            for bit in candidates {
                let index = base + bit;

                // SAFETY: A matching fingerprint has the sign bit clear, so
                // the slot at `index` is initialized, and `index` is inside
                // the window validated above.
                if eq(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
                {
                    return Some(index);
                }
            }

            // SAFETY: Same window as above.
            if unsafe { match_empty(ctrl) }.any() {
                return None;
            }

            group = (group + 1) & group_mask;
        }
    }

    /// Walk groups from the hash's starting group and return the first
    /// available slot in probe order.
    ///
    /// The caller must have made room beforehand; the load limit guarantees
    /// an `EMPTY` tag exists somewhere, which bounds the walk.
    #[inline]
    fn probe_available(&self, hash: u64) -> usize {
        debug_assert!(self.buckets != 0);
        debug_assert!(self.populated + self.tombstones < self.buckets);

        let group_mask = self.group_mask();
        let mut group = ((hash >> 7) as usize) & group_mask;

        loop {
            let base = group * GROUP_WIDTH;

            // SAFETY: `group` is masked by `group_mask`, so the window
            // `[base, base + GROUP_WIDTH)` lies inside the control array.
            let available = unsafe { match_available(self.ctrl_ptr().as_ref().as_ptr().add(base)) };
            if let Some(bit) = available.lowest() {
                return base + bit;
            }

            group = (group + 1) & group_mask;
        }
    }

    /// Finds a value in the table by hash and equality predicate.
    ///
    /// Returns a reference to the value if found, or `None` if no matching
    /// value exists.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value to search for
    /// * `eq` - A predicate function that returns `true` for the desired
    ///   value
    #[inline]
    pub fn find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&V> {
        let index = self.search(hash, eq)?;

        // SAFETY: `search` only returns indices of initialized slots.
        Some(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
    }

    /// Finds a value in the table and returns a mutable reference to it.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value to search for
    /// * `eq` - A predicate function that returns `true` for the desired
    ///   value
    #[inline]
    pub fn find_mut(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        let index = self.search(hash, eq)?;

        // SAFETY: `search` only returns indices of initialized slots.
        Some(unsafe {
            self.slots_ptr()
                .as_mut()
                .get_unchecked_mut(index)
                .assume_init_mut()
        })
    }

    /// Removes and returns a value from the table.
    ///
    /// The value is identified by its hash and an equality predicate. If
    /// the value is found, it is removed from the table and returned.
    /// Otherwise, `None` is returned.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value of the entry to remove
    /// * `eq` - A predicate function that returns `true` for the value to
    ///   remove
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        let index = self.search(hash, eq)?;

        // SAFETY: `search` only returns in-bounds indices of initialized
        // slots.
        Some(unsafe { self.remove_at(index) })
    }

    /// Remove the value at `index` and retire its slot.
    ///
    /// The slot becomes `EMPTY` when its group still contains an `EMPTY`
    /// tag, because any probe passing through the group already terminates
    /// inside it. Otherwise it becomes a `TOMBSTONE` so longer probe chains
    /// keep working.
    ///
    /// # Safety
    ///
    /// The caller must ensure `index` is in bounds and that the slot at
    /// `index` is occupied.
    unsafe fn remove_at(&mut self, index: usize) -> V {
        let group_base = index & !(GROUP_WIDTH - 1);

        // SAFETY: Caller guarantees `index` is in bounds and occupied;
        // `group_base` is the group-aligned window containing it.
        unsafe {
            debug_assert!(is_full(*self.ctrl_ptr().as_ref().get_unchecked(index)));

            let value = self
                .slots_ptr()
                .as_ref()
                .get_unchecked(index)
                .assume_init_read();

            let group_has_empty =
                match_empty(self.ctrl_ptr().as_ref().as_ptr().add(group_base)).any();
            if group_has_empty {
                *self.ctrl_ptr().as_mut().get_unchecked_mut(index) = EMPTY;
            } else {
                *self.ctrl_ptr().as_mut().get_unchecked_mut(index) = TOMBSTONE;
                self.tombstones += 1;
            }

            self.populated -= 1;

            value
        }
    }

    /// Gets an entry for the given hash and equality predicate.
    ///
    /// This method returns an [`Entry`] enum that allows for efficient
    /// insertion or modification of values. No value is constructed when
    /// the entry turns out to be occupied.
    ///
    /// Taking a vacant entry may rehash the table to make room, which is
    /// why a `rehash` function producing the hash of an arbitrary stored
    /// value is required.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value for the entry
    /// * `eq` - A predicate function that returns `true` for matching
    ///   values
    /// * `rehash` - A function returning the hash of a stored value
    #[inline]
    pub fn entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Entry<'_, V> {
        if let Some(index) = self.search(hash, &eq) {
            return Entry::Occupied(OccupiedEntry { table: self, index });
        }

        if self.populated + self.tombstones + 1 > self.max_load() {
            self.do_resize_rehash(grown_buckets(self.populated), &rehash);
        }

        let index = self.probe_available(hash);
        Entry::Vacant(VacantEntry {
            table: self,
            index,
            hash,
        })
    }

    /// Reserves capacity for at least `count` values in total.
    ///
    /// Grows and rehashes when `count` values (on top of the tombstones
    /// currently awaiting reuse) would not fit under the load limit. Does
    /// nothing when capacity is already sufficient.
    ///
    /// # Arguments
    ///
    /// * `count` - The total number of values the table should be able to
    ///   hold without resizing
    /// * `rehash` - A function returning the hash of a stored value
    pub fn reserve(&mut self, count: usize, rehash: impl Fn(&V) -> u64) {
        if (count + self.tombstones) * MAX_LOAD_DEN > self.buckets * MAX_LOAD_NUM {
            self.do_resize_rehash(grown_buckets(count.max(self.populated)), &rehash);
        }
    }

    /// Resizes the table to at least `count` slots and rehashes every
    /// value.
    ///
    /// The slot count is rounded up to a power of two and never below what
    /// the current population requires. Rehashing purges all tombstones;
    /// calling this with the current slot count is the supported way to
    /// reclaim tombstone space without growing.
    ///
    /// # Arguments
    ///
    /// * `count` - The requested lower bound on the slot count
    /// * `rehash` - A function returning the hash of a stored value
    pub fn rehash(&mut self, count: usize, rehash: impl Fn(&V) -> u64) {
        let required = (self.populated * MAX_LOAD_DEN)
            .div_ceil(MAX_LOAD_NUM)
            .next_power_of_two()
            .max(MIN_BUCKETS);
        let new_buckets = count.next_power_of_two().max(required);

        if new_buckets != self.buckets || self.tombstones > 0 {
            self.do_resize_rehash(new_buckets, &rehash);
        }
    }

    #[cold]
    fn do_resize_rehash(&mut self, new_buckets: usize, rehash: &dyn Fn(&V) -> u64) {
        debug_assert!(new_buckets.is_power_of_two() && new_buckets >= MIN_BUCKETS);
        debug_assert!(self.populated <= new_buckets / MAX_LOAD_DEN * MAX_LOAD_NUM);

        let new_layout = DataLayout::new::<V>(new_buckets);
        // SAFETY: The layout size is non-zero (`new_buckets >= MIN_BUCKETS`)
        // and allocation failure is handled.
        let new_alloc = unsafe {
            let raw_alloc = alloc::alloc::alloc(new_layout.layout);
            if raw_alloc.is_null() {
                handle_alloc_error(new_layout.layout);
            }

            core::ptr::write_bytes(raw_alloc.add(new_layout.ctrl_offset), EMPTY, new_buckets);

            NonNull::new_unchecked(raw_alloc)
        };

        let old_layout = core::mem::replace(&mut self.layout, new_layout);
        let old_alloc = core::mem::replace(&mut self.alloc, new_alloc);
        let old_buckets = core::mem::replace(&mut self.buckets, new_buckets);
        self.tombstones = 0;

        // SAFETY: This block moves every initialized value from the old
        // allocation into the new one.
        // - The old control slice identifies exactly the initialized slots,
        //   so each `assume_init_read` reads a live value whose ownership
        //   transfers to the new table.
        // - Every destination index comes from `probe_available` on the new
        //   table and is therefore in bounds and unoccupied; the new table
        //   starts all-`EMPTY` and receives the same population, which fits
        //   under the new load limit.
        // - The old allocation is deallocated without dropping the
        //   moved-out values; only the new table will drop them.
        unsafe {
            if self.populated != 0 {
                let old_ctrl: NonNull<[u8]> = NonNull::slice_from_raw_parts(
                    old_alloc.add(old_layout.ctrl_offset).cast(),
                    old_buckets,
                );
                let old_slots: NonNull<[MaybeUninit<V>]> = NonNull::slice_from_raw_parts(
                    old_alloc.add(old_layout.slots_offset).cast(),
                    old_buckets,
                );

                for (index, &tag) in old_ctrl.as_ref().iter().enumerate() {
                    if !is_full(tag) {
                        continue;
                    }

                    let value = old_slots.as_ref().get_unchecked(index).assume_init_read();
                    let hash = rehash(&value);

                    let dest = self.probe_available(hash);
                    *self.ctrl_ptr().as_mut().get_unchecked_mut(dest) = hashtag(hash);
                    self.slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(dest)
                        .write(value);
                }
            }

            if old_layout.layout.size() != 0 {
                alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
            }
        }
    }

    /// Removes all values from the table.
    ///
    /// This operation preserves the table's allocated capacity. All values
    /// are properly dropped if they implement `Drop`, every control tag is
    /// reset to empty, and all tombstones are discarded.
    pub fn clear(&mut self) {
        // SAFETY: We only drop values in slots whose tag marks them
        // initialized, and only reset control bytes inside our allocation.
        unsafe {
            if core::mem::needs_drop::<V>() && self.populated > 0 {
                for (index, &tag) in self.ctrl_ptr().as_ref().iter().enumerate() {
                    if is_full(tag) {
                        self.slots_ptr()
                            .as_mut()
                            .get_unchecked_mut(index)
                            .assume_init_drop();
                    }
                }
            }

            if self.layout.layout.size() != 0 {
                core::ptr::write_bytes(
                    self.alloc.as_ptr().add(self.layout.ctrl_offset),
                    EMPTY,
                    self.buckets,
                );
            }
        }

        self.populated = 0;
        self.tombstones = 0;
    }

    /// Returns a copy of the table sized to its live population,
    /// re-inserting every value under the provided hash function.
    ///
    /// This is deliberately not a byte-wise clone: the copy starts with no
    /// tombstones and a capacity fitted to the value count, and its layout
    /// follows `rehash` rather than the positions values happened to occupy
    /// in `self`.
    ///
    /// # Arguments
    ///
    /// * `rehash` - A function returning the hash of a stored value
    pub fn clone_with(&self, rehash: impl Fn(&V) -> u64) -> Self
    where
        V: Clone,
    {
        let mut new_table = Self::with_buckets(if self.populated == 0 {
            0
        } else {
            grown_buckets(self.populated)
        });

        for value in self.iter() {
            let value = value.clone();
            let hash = rehash(&value);

            let index = new_table.probe_available(hash);
            // SAFETY: `probe_available` returns an in-bounds available
            // slot. The new table is all-`EMPTY` apart from the values
            // written by this loop, and its population stays below the load
            // limit by construction of `grown_buckets`.
            unsafe {
                *new_table.ctrl_ptr().as_mut().get_unchecked_mut(index) = hashtag(hash);
                new_table
                    .slots_ptr()
                    .as_mut()
                    .get_unchecked_mut(index)
                    .write(value);
            }
            new_table.populated += 1;
        }

        new_table
    }

    /// Returns an iterator over all values in the table.
    ///
    /// The iterator yields `&V` references in an arbitrary order. The
    /// iteration order is not specified and may change after any rehash.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: self,
            index: 0,
        }
    }

    /// Returns an iterator that removes and yields all values from the
    /// table.
    ///
    /// After calling `drain()`, the table is empty. The iterator yields
    /// owned values in an arbitrary order.
    ///
    /// Calling `mem::forget` on the iterator will leak all unyielded values
    /// in the table without dropping them. This will cause memory to be
    /// leaked.
    pub fn drain(&mut self) -> Drain<'_, V> {
        if self.buckets == 0 {
            return Drain {
                occupied: Box::new([]),
                table: self,
                index: 0,
            };
        }

        let mut occupied = Box::new_uninit_slice(self.buckets);

        // SAFETY: `occupied` and the control slice have the same length. We
        // copy the tags out, then reset the table's tags to `EMPTY` so the
        // table no longer considers any slot initialized; ownership of the
        // values transfers to the iterator, which reads them through the
        // copied tags. `assume_init` is sound because the copy fully wrote
        // the buffer.
        let occupied = unsafe {
            core::ptr::copy_nonoverlapping(
                self.ctrl_ptr().as_ref().as_ptr(),
                occupied.as_mut_ptr().cast(),
                self.buckets,
            );

            core::ptr::write_bytes(
                self.alloc.as_ptr().add(self.layout.ctrl_offset),
                EMPTY,
                self.buckets,
            );

            occupied.assume_init()
        };

        self.populated = 0;
        self.tombstones = 0;

        Drain {
            occupied,
            table: self,
            index: 0,
        }
    }

    /// Returns table occupancy statistics for debugging.
    #[cfg(feature = "stats")]
    pub fn debug_stats(&self) -> DebugStats {
        DebugStats {
            populated: self.populated,
            tombstones: self.tombstones,
            buckets: self.buckets,
            capacity: self.max_load(),
            load_factor: if self.buckets == 0 {
                0.0
            } else {
                (self.populated + self.tombstones) as f64 / self.buckets as f64
            },
            total_bytes: self.layout.layout.size(),
        }
    }
}

/// A view into a single entry in the hash table, which may be vacant or
/// occupied.
///
/// This enum is constructed from the [`entry`] method on [`HashTable`].
///
/// [`entry`]: HashTable::entry
pub enum Entry<'a, V> {
    /// A vacant entry - no matching value is present in the table
    Vacant(VacantEntry<'a, V>),
    /// An occupied entry - a matching value is present in the table
    Occupied(OccupiedEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Inserts a default value if the entry is vacant and returns a mutable
    /// reference.
    ///
    /// If the entry is occupied, returns a mutable reference to the
    /// existing value.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts a value computed from a closure if the entry is vacant and
    /// returns a mutable reference.
    ///
    /// If the entry is occupied, returns a mutable reference to the
    /// existing value and the closure is never called.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Provides in-place mutable access to an occupied entry.
    ///
    /// If the entry is vacant, returns `None` without inserting anything.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Option<&'a mut V> {
        match self {
            Entry::Occupied(entry) => {
                let value = entry.into_mut();
                f(value);
                Some(value)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Inserts `V::default()` if the entry is vacant and returns a mutable
    /// reference.
    pub fn or_default(self) -> &'a mut V
    where
        V: Default,
    {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the hash table.
///
/// This struct is created by the [`entry`] method on [`HashTable`] when no
/// matching value is present. It holds the slot chosen by the probe, so
/// inserting through it does no further scanning.
///
/// [`entry`]: HashTable::entry
pub struct VacantEntry<'a, V> {
    table: &'a mut HashTable<V>,
    index: usize,
    hash: u64,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value into the vacant entry and returns a mutable
    /// reference to it.
    ///
    /// Inserting into a slot that was a tombstone reclaims it.
    pub fn insert(self, value: V) -> &'a mut V {
        // SAFETY: A `VacantEntry` is only constructed by `entry` after
        // making room, with `index` taken from an available-slot scan. The
        // index is therefore in bounds and its tag has the sign bit set, so
        // the slot storage is unoccupied and safe to overwrite.
        unsafe {
            let tag = *self.table.ctrl_ptr().as_ref().get_unchecked(self.index);
            debug_assert!(!is_full(tag));
            if tag == TOMBSTONE {
                self.table.tombstones -= 1;
            }

            *self.table.ctrl_ptr().as_mut().get_unchecked_mut(self.index) = hashtag(self.hash);
            self.table.populated += 1;

            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .write(value)
        }
    }
}

// Safety invariant for OccupiedEntry methods:
// An `OccupiedEntry` is only created after `search` finds a valid, occupied
// slot, so `index` is in bounds and the `MaybeUninit<V>` at `index` is
// initialized. No table mutation can happen while the entry borrows the
// table, so `get_unchecked`, `assume_init_ref`, and `assume_init_mut` are
// sound.
/// A view into an occupied entry in the hash table.
///
/// This struct is created by the [`entry`] method on [`HashTable`] when a
/// matching value is present. It provides methods to access, modify, or
/// remove the existing value.
///
/// [`entry`]: HashTable::entry
pub struct OccupiedEntry<'a, V> {
    table: &'a mut HashTable<V>,
    index: usize,
}

impl<'a, V> OccupiedEntry<'a, V> {
    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        // SAFETY: See safety invariant comment above the struct.
        unsafe {
            self.table
                .slots_ptr()
                .as_ref()
                .get_unchecked(self.index)
                .assume_init_ref()
        }
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: See safety invariant comment above the struct.
        unsafe {
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .assume_init_mut()
        }
    }

    /// Converts the entry into a mutable reference to the value with the
    /// lifetime of the entry.
    pub fn into_mut(self) -> &'a mut V {
        // SAFETY: See safety invariant comment above the struct.
        unsafe {
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .assume_init_mut()
        }
    }

    /// Replaces the value in the entry and returns the old value.
    pub fn insert(&mut self, value: V) -> V {
        core::mem::replace(self.get_mut(), value)
    }

    /// Removes the entry from the table and returns the value.
    ///
    /// The freed slot is reclaimed as empty when its group still contains
    /// an empty slot, and becomes a tombstone otherwise.
    pub fn remove(self) -> V {
        // SAFETY: See safety invariant comment above the struct.
        unsafe { self.table.remove_at(self.index) }
    }
}

/// An iterator over the values in a [`HashTable`].
///
/// This struct is created by the [`iter`] method on [`HashTable`]. It
/// yields `&V` references in an arbitrary order.
///
/// [`iter`]: HashTable::iter
pub struct Iter<'a, V> {
    table: &'a HashTable<V>,
    index: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `self.index` stays below `self.table.buckets`, which is
        // the length of both the control and slot slices, and a tag with
        // the sign bit clear guarantees the slot it covers is initialized.
        unsafe {
            while self.index < self.table.buckets {
                let tag = *self.table.ctrl_ptr().as_ref().get_unchecked(self.index);
                if is_full(tag) {
                    let slot = self.table.slots_ptr().as_ref().get_unchecked(self.index);
                    self.index += 1;
                    return Some(slot.assume_init_ref());
                }

                self.index += 1;
            }

            None
        }
    }
}

/// A draining iterator over the values in a [`HashTable`].
///
/// This struct is created by the [`drain`] method on [`HashTable`]. It
/// yields owned `V` values; the table is already empty from its own point
/// of view, and dropping the iterator drops any values not yet yielded.
///
/// [`drain`]: HashTable::drain
pub struct Drain<'a, V> {
    occupied: Box<[u8]>,
    table: &'a mut HashTable<V>,
    index: usize,
}

impl<V> Drop for Drain<'_, V> {
    fn drop(&mut self) {
        for _ in &mut *self {}
    }
}

impl<V> Iterator for Drain<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `occupied` is a snapshot of the control bytes taken
        // before they were reset, with the same length as the slot slice. A
        // tag with the sign bit clear means the corresponding slot still
        // holds an initialized value that only this iterator will read, so
        // `assume_init_read` takes ownership exactly once.
        unsafe {
            while self.index < self.occupied.len() {
                if is_full(*self.occupied.get_unchecked(self.index)) {
                    let slot = self.table.slots_ptr().as_ref().get_unchecked(self.index);
                    self.index += 1;
                    return Some(slot.assume_init_read());
                }

                self.index += 1;
            }

            None
        }
    }
}

//! Mostly-copying garbage collector.
//!
//! The heap is a contiguous run of fixed-size pages. Objects carry a one
//! word header and are bump-allocated into the current page run; when the
//! live space crosses the half-heap watermark a collection copies every
//! exactly reachable object into a fresh space, while pages hinted at by
//! ambiguous root words are promoted in place and swept instead of copied.
//!
//! This crate is decoupled from any specific host. Consumers provide:
//! - A [`HintSource`] yielding ambiguous root words at collection entry
//!   (usually [`MachineStack`]).
//! - Global root cells registered with [`Heap::add_global_root`], whose
//!   contents are relocated exactly.

use std::ptr::{self, NonNull};

use crate::header::{Gcp, Header, HeaderWord, WORD_BYTES};
use crate::system;

// ── Page geometry ─────────────────────────────────────────────────────

/// Size of a heap page in bytes.
pub const PAGE_BYTES: usize = 512;
/// Size of a heap page in words.
pub const PAGE_WORDS: usize = PAGE_BYTES / WORD_BYTES;

/// Space tags wrap within 15 bits; tag 0 marks a free page.
const SPACE_MASK: u16 = 0x7FFF;
const FREE_SPACE: u16 = 0;

/// Reserved page index marking an empty queue or the end of a list.
const NO_PAGE: usize = usize::MAX;

// ── Public API types ──────────────────────────────────────────────────

/// Supplies ambiguous root words for the conservative phase.
///
/// Every word passed to the visitor is treated as a potential address into
/// the heap; words that land on a live page pin that page's whole run in
/// place for the current collection. The source is deliberately allowed to
/// over-report (integers that look like heap addresses cost at most a
/// retained page), but it must not under-report: a live object reachable
/// only through a word the source skips will be reclaimed.
pub trait HintSource {
    fn visit_hints(&mut self, visitor: &mut dyn FnMut(usize));
}

/// [`HintSource`] that walks the machine stack.
///
/// The scan covers every pointer-aligned word from the current stack top up
/// to the base recorded at construction. Capture the base in a frame above
/// all frames that may hold managed pointers, most easily with
/// [`system::with_stack_base`]; keep individual pointers observable across
/// an allocation with `std::hint::black_box(&p)`.
pub struct MachineStack {
    base: usize,
}

impl MachineStack {
    #[must_use]
    pub fn new(stack_base: *const u8) -> Self {
        Self {
            base: stack_base as usize,
        }
    }
}

impl HintSource for MachineStack {
    fn visit_hints(&mut self, visitor: &mut dyn FnMut(usize)) {
        let stride = align_of::<usize>();
        let top = system::stack_pointer() as usize;
        debug_assert!(top <= self.base, "stack base lies below the scan top");

        // Callee-saved registers were spilled at or below `top` by the
        // opaque call that produced it, so the range covers them too.
        let mut addr = top.next_multiple_of(stride);
        while addr <= self.base {
            // SAFETY: [top, base] lies within this thread's mapped stack.
            visitor(unsafe { *(addr as *const usize) });
            addr += stride;
        }
    }
}

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the collected heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of the heap in bytes. Must be a positive multiple of
    /// [`PAGE_BYTES`] spanning at least 8 pages.
    pub heap_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl HeapSettings {
    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 {
            return Err("heap_size must be > 0");
        }
        if !self.heap_size.is_multiple_of(PAGE_BYTES) {
            return Err("heap_size must be a multiple of PAGE_BYTES");
        }
        if self.heap_size / PAGE_BYTES < 8 {
            return Err("heap must span at least 8 pages");
        }
        Ok(())
    }
}

// ── Page directory ────────────────────────────────────────────────────

/// How a page participates in an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// The page begins with an object header.
    Object,
    /// Interior or tail page of a multi-page object.
    Continued,
}

/// Per-page metadata, indexed by page number relative to the region start.
///
/// `link` threads the promotion queue through the directory itself. A page
/// is enqueued at most once per collection, on its current-to-next space
/// transition, so the intrusive list never needs cycle checks.
struct PageDirectory {
    space: Box<[u16]>,
    kind: Box<[PageKind]>,
    link: Box<[usize]>,
    head: usize,
    tail: usize,
}

impl PageDirectory {
    fn new(pages: usize) -> Self {
        Self {
            space: vec![FREE_SPACE; pages].into_boxed_slice(),
            kind: vec![PageKind::Object; pages].into_boxed_slice(),
            link: vec![NO_PAGE; pages].into_boxed_slice(),
            head: NO_PAGE,
            tail: NO_PAGE,
        }
    }

    #[inline(always)]
    fn space(&self, page: usize) -> u16 {
        self.space[page]
    }

    #[inline(always)]
    fn kind(&self, page: usize) -> PageKind {
        self.kind[page]
    }

    #[inline(always)]
    fn set_space(&mut self, page: usize, space: u16) {
        self.space[page] = space;
    }

    #[inline(always)]
    fn set(&mut self, page: usize, space: u16, kind: PageKind) {
        self.space[page] = space;
        self.kind[page] = kind;
    }

    fn enqueue(&mut self, page: usize) {
        debug_assert_ne!(page, NO_PAGE);
        if self.head == NO_PAGE {
            self.head = page;
        } else {
            self.link[self.tail] = page;
        }
        self.link[page] = NO_PAGE;
        self.tail = page;
    }

    fn dequeue(&mut self) -> Option<usize> {
        if self.head == NO_PAGE {
            return None;
        }
        let page = self.head;
        self.head = self.link[page];
        if self.head == NO_PAGE {
            self.tail = NO_PAGE;
        }
        Some(page)
    }

    fn reset_queue(&mut self) {
        self.head = NO_PAGE;
        self.tail = NO_PAGE;
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

/// The collected heap: a paged region, its directory, the bump window, and
/// the registered roots.
///
/// All state is owned by the instance; hosts may run several independent
/// heaps. Collection is synchronous and stop-the-world, entered from
/// [`Heap::allocate`] when the half-heap watermark is crossed, so a single
/// mutator thread observes it atomically at the allocation's return.
pub struct Heap {
    settings: HeapSettings,
    region: NonNull<u8>,
    page_count: usize,
    directory: PageDirectory,
    /// First unwritten word of the bump window; null when no window is
    /// open.
    free_ptr: *mut usize,
    /// Words left in the bump window.
    free_words: usize,
    /// Rotating scan cursor: the page after the last claimed run.
    free_cursor: usize,
    /// Pages claimed by the space being formed.
    allocated_pages: usize,
    current_space: u16,
    next_space: u16,
    globals: Vec<*mut Gcp>,
    hints: Box<dyn HintSource>,
    collections: u64,
}

impl Heap {
    /// Maps the region and builds the directory. The heap starts empty,
    /// with both space tags on the first live space.
    #[must_use]
    pub fn new(settings: HeapSettings, hints: Box<dyn HintSource>) -> Self {
        settings.validate().expect("invalid heap settings");

        let page_count = settings.heap_size / PAGE_BYTES;
        let region = system::map_memory(settings.heap_size)
            .expect("failed to map heap region");
        debug_assert!((region.as_ptr() as usize).is_multiple_of(PAGE_BYTES));

        Self {
            settings,
            region,
            page_count,
            directory: PageDirectory::new(page_count),
            free_ptr: ptr::null_mut(),
            free_words: 0,
            free_cursor: 0,
            allocated_pages: 0,
            current_space: 1,
            next_space: 1,
            globals: Vec::new(),
            hints,
            collections: 0,
        }
    }

    /// Registers `cell` as an exact root and nulls it.
    ///
    /// The collector rewrites the cell in place whenever the object it
    /// refers to is relocated.
    ///
    /// # Safety
    ///
    /// `cell` must stay valid for reads and writes for the heap's whole
    /// lifetime, and outside of [`Heap::allocate`] calls it must hold
    /// either null or a pointer returned by [`Heap::allocate`].
    pub unsafe fn add_global_root(&mut self, cell: *mut Gcp) {
        // SAFETY: valid for writes per the contract above.
        unsafe { *cell = ptr::null_mut() };
        self.globals.push(cell);
    }

    /// Allocates an object of `bytes` user bytes, the first `ptrs` words of
    /// which hold managed pointers.
    ///
    /// Returns the address one word past the object's header: word aligned,
    /// never the first word of a page. Pointer words are nulled; the
    /// remaining user words are uninitialized.
    ///
    /// Crossing the half-heap watermark runs a collection inside this call.
    /// Any object the host still needs must then be reachable from a
    /// registered global cell or visible to the configured [`HintSource`].
    pub fn allocate(&mut self, bytes: usize, ptrs: usize) -> Gcp {
        let user_words = bytes.div_ceil(WORD_BYTES).max(1);
        assert!(
            ptrs <= user_words,
            "object of {user_words} words cannot hold {ptrs} pointers"
        );
        self.allocate_raw(user_words + 1, ptrs)
    }

    /// Serves `words` (header included) from the bump window, acquiring
    /// pages and collecting as needed. The header is written only after a
    /// fitting window exists, so no caller ever sees a partial object.
    fn allocate_raw(&mut self, words: usize, ptrs: usize) -> Gcp {
        let pages = words.div_ceil(PAGE_WORDS);
        if pages >= self.page_count / 2 {
            // The watermark keeps half the pages in reserve for copying, so
            // a request this large can never be satisfied.
            panic!(
                "gc: object of {words} words can never fit in a {} page heap",
                self.page_count
            );
        }

        let mut collected = false;
        while words > self.free_words {
            self.seal_window();
            if !self.acquire_pages(pages) {
                if collected {
                    panic!(
                        "gc: unable to allocate {pages} pages in a {} page heap",
                        self.page_count
                    );
                }
                collected = true;
            }
        }

        let header_at = self.free_ptr;
        // SAFETY: the bump window spans free_words >= words unwritten words
        // on pages owned by the forming space.
        unsafe {
            *header_at = Header::new(words, ptrs).raw();
            for slot in 1..=ptrs {
                *header_at.add(slot) = 0;
            }
        }
        // SAFETY: words >= 2, so one word past the header is in bounds.
        let object = unsafe { header_at.add(1) };

        if words < PAGE_WORDS {
            self.free_words -= words;
            // SAFETY: stays within the claimed run, at most one past it.
            self.free_ptr = unsafe { header_at.add(words) };
        } else {
            // The object consumed its pages wholesale; no window remains.
            self.free_words = 0;
            self.free_ptr = ptr::null_mut();
        }
        object
    }

    /// Covers the unused tail of the bump window with a filler header and
    /// invalidates the frontier.
    ///
    /// Sweeps rely on both effects: queued pages hold a contiguous run of
    /// headers, and the frontier comparison never matches a stale address.
    fn seal_window(&mut self) {
        if self.free_words != 0 {
            // SAFETY: free_ptr addresses the first of free_words unwritten
            // words on the current allocation pages.
            unsafe { *self.free_ptr = Header::filler(self.free_words).raw() };
            self.free_words = 0;
        }
        self.free_ptr = ptr::null_mut();
    }

    /// Points the bump window at `count` contiguous free pages.
    ///
    /// Returns false when the half-heap watermark forced a collection
    /// instead; the caller's retry loop re-checks its fit afterwards.
    /// Faults when no run of `count` free pages exists below the watermark.
    fn acquire_pages(&mut self, count: usize) -> bool {
        if self.allocated_pages + count >= self.page_count / 2 {
            self.collect();
            return false;
        }

        let mut run = 0;
        let mut base = 0;
        for _ in 0..self.page_count {
            let page = self.free_cursor;
            if self.page_is_free(page) {
                if run == 0 {
                    base = page;
                }
                run += 1;
                if run == count {
                    self.claim_run(base, count);
                    self.free_cursor = self.next_page(page);
                    return true;
                }
            } else {
                run = 0;
            }
            self.free_cursor = self.next_page(page);
            // Runs may not straddle the wraparound.
            if self.free_cursor == 0 {
                run = 0;
            }
        }
        panic!(
            "gc: unable to allocate {count} pages in a {} page heap",
            self.page_count
        );
    }

    /// Tags a claimed run for the forming space and opens the bump window
    /// over it. During a collection the base page joins the sweep queue.
    fn claim_run(&mut self, base: usize, count: usize) {
        self.free_ptr = self.page_base(base);
        self.free_words = count * PAGE_WORDS;
        self.allocated_pages += count;
        if self.collecting() {
            self.directory.enqueue(base);
        }
        self.directory.set(base, self.next_space, PageKind::Object);
        for page in base + 1..base + count {
            self.directory
                .set(page, self.next_space, PageKind::Continued);
        }
        tracing::trace!(
            target: "gc",
            base,
            count,
            space = self.next_space,
            "claimed pages"
        );
    }

    // ── Forwarding ────────────────────────────────────────────────────

    /// Relocates one object into the forming space, leaving a forwarding
    /// word in its old header slot, and returns its post-collection
    /// address.
    ///
    /// Null and pointers onto promoted or destination pages pass through
    /// unchanged; an already-forwarded header short-circuits to the
    /// existing copy, so no object is moved twice per cycle.
    fn forward(&mut self, cp: Gcp) -> Gcp {
        if cp.is_null() {
            return cp;
        }
        let page = self
            .page_of(cp)
            .expect("exact root does not point into the heap");
        if self.directory.space(page) == self.next_space {
            return cp;
        }
        debug_assert_eq!(self.directory.space(page), self.current_space);
        // The first user word of a run always lies on its Object page, so
        // an exact pointer can never name a Continued page.
        assert_eq!(
            self.directory.kind(page),
            PageKind::Object,
            "exact root into the interior of a multi-page object"
        );

        // SAFETY: cp came from allocate, so the word below it is its
        // header slot.
        let raw = unsafe { *cp.sub(1) };
        match HeaderWord::from_raw(raw) {
            HeaderWord::Forwarded(np) => np,
            HeaderWord::Live(header) => {
                let words = header.words();
                // Pointer count 0: the copy overwrites every destination
                // word anyway, including the fresh header.
                let np = self.allocate_raw(words, 0);
                // SAFETY: source and destination runs are disjoint pages
                // and both span `words` words.
                unsafe {
                    ptr::copy_nonoverlapping(cp.sub(1), np.sub(1), words);
                    *cp.sub(1) = np as usize;
                }
                debug_assert!((np as usize) & 1 == 0);
                np
            }
        }
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Runs a full stop-the-world collection.
    ///
    /// Normally entered on allocation pressure, but harmless to call
    /// directly. On return every live object either kept its address on a
    /// promoted page or moved to a destination page, and every registered
    /// global cell holds the post-collection address.
    pub fn collect(&mut self) {
        // Allocation inside a collection must never recurse into another
        // one: live data overflowing the watermark mid-copy is fatal.
        if self.next_space != self.current_space {
            panic!("gc: out of space during collect");
        }
        let _span = tracing::span!(
            tracing::Level::DEBUG,
            "collect",
            space = self.current_space
        )
        .entered();

        self.seal_window();
        self.next_space = advance_space(self.current_space);
        self.allocated_pages = 0;
        self.directory.reset_queue();

        // Conservative phase: any word that looks like an address into a
        // live page pins that page's whole run in place.
        let start = self.region.as_ptr() as usize;
        let end = start + self.settings.heap_size;
        let mut hinted = Vec::new();
        self.hints.visit_hints(&mut |word| {
            if (start..end).contains(&word) {
                hinted.push((word - start) / PAGE_BYTES);
            }
        });
        for page in hinted {
            self.promote(page);
        }
        let promoted = self.allocated_pages;

        // Exact phase: global cells are rewritten to the new locations.
        for index in 0..self.globals.len() {
            let cell = self.globals[index];
            // SAFETY: registered cells stay valid for the heap's lifetime
            // and hold null or a managed pointer.
            unsafe { *cell = self.forward(*cell) };
        }

        // Transitive sweep: rewrite the pointer words of every object on a
        // queued page. Forwarding claims destination pages as it goes and
        // those join the queue behind the cursor, so the loop runs until
        // the scan catches up with the bump frontier.
        while let Some(page) = self.directory.dequeue() {
            let mut cp = self.page_base(page);
            loop {
                if cp == self.free_ptr || self.page_index(cp as usize) != page
                {
                    break;
                }
                // SAFETY: queued pages hold a contiguous run of headers up
                // to the page end or the bump frontier.
                let header = match HeaderWord::from_raw(unsafe { *cp }) {
                    HeaderWord::Live(header) => header,
                    HeaderWord::Forwarded(_) => {
                        unreachable!("forwarding word swept on a live page")
                    }
                };
                for slot in 1..=header.ptrs() {
                    // SAFETY: the leading user words of a live object hold
                    // managed pointers or null.
                    unsafe {
                        let cell = cp.add(slot);
                        *cell = self.forward(*cell as Gcp) as usize;
                    }
                }
                // SAFETY: the object's span stays inside the region, so the
                // cursor lands in it or one word past its last page.
                cp = unsafe { cp.add(header.words()) };
            }
        }

        // Commit. Whatever still carries the old tag is garbage; tagging it
        // free also keeps stale tags from aliasing a future space number.
        for page in 0..self.page_count {
            if self.directory.space(page) != self.next_space {
                self.directory.set_space(page, FREE_SPACE);
            }
        }
        self.current_space = self.next_space;
        self.collections += 1;

        tracing::debug!(
            target: "gc",
            promoted,
            retained = self.allocated_pages,
            space = self.current_space,
            "collection finished"
        );
    }

    /// Retags a hinted page's whole run in place and queues its base for
    /// the sweep. Hints onto free, destination, or already-promoted pages
    /// are no-ops.
    fn promote(&mut self, mut page: usize) {
        if self.directory.space(page) != self.current_space {
            return;
        }
        while self.directory.kind(page) == PageKind::Continued {
            self.directory.set_space(page, self.next_space);
            self.allocated_pages += 1;
            debug_assert!(page > 0, "continued page at the region start");
            page -= 1;
        }
        self.directory.set_space(page, self.next_space);
        self.allocated_pages += 1;
        self.directory.enqueue(page);
    }

    // ── Page arithmetic ───────────────────────────────────────────────

    #[inline(always)]
    fn page_base(&self, page: usize) -> *mut usize {
        debug_assert!(page < self.page_count);
        // SAFETY: page is in range, so the offset stays inside the region.
        unsafe { self.region.as_ptr().add(page * PAGE_BYTES) as *mut usize }
    }

    /// Page number for an address inside (or one past) the region.
    #[inline(always)]
    fn page_index(&self, addr: usize) -> usize {
        (addr - self.region.as_ptr() as usize) / PAGE_BYTES
    }

    #[inline(always)]
    fn page_is_free(&self, page: usize) -> bool {
        let space = self.directory.space(page);
        space != self.current_space && space != self.next_space
    }

    #[inline(always)]
    fn next_page(&self, page: usize) -> usize {
        if page == self.page_count - 1 { 0 } else { page + 1 }
    }

    #[inline(always)]
    fn collecting(&self) -> bool {
        self.current_space != self.next_space
    }

    // ── Introspection ─────────────────────────────────────────────────

    /// Page number for a managed pointer, or None for foreign addresses.
    pub fn page_of(&self, ptr: *const usize) -> Option<usize> {
        let start = self.region.as_ptr() as usize;
        let addr = ptr as usize;
        if (start..start + self.settings.heap_size).contains(&addr) {
            Some((addr - start) / PAGE_BYTES)
        } else {
            None
        }
    }

    /// Number of pages in the region.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Pages claimed by the space being formed (the live space, outside of
    /// a collection).
    pub fn allocated_pages(&self) -> usize {
        self.allocated_pages
    }

    /// Completed collection cycles.
    pub fn collections(&self) -> u64 {
        self.collections
    }

    /// Tag of the live space.
    pub fn current_space(&self) -> u16 {
        self.current_space
    }

    /// Space tag of `page`; 0 means free.
    pub fn page_space(&self, page: usize) -> u16 {
        self.directory.space(page)
    }

    pub fn page_kind(&self, page: usize) -> PageKind {
        self.directory.kind(page)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        system::unmap_memory(self.region, self.settings.heap_size);
    }
}

fn advance_space(space: u16) -> u16 {
    let next = (space + 1) & SPACE_MASK;
    // Tag 0 marks free pages; skip it on wraparound.
    if next == FREE_SPACE { FREE_SPACE + 1 } else { next }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A hint source fed from a plain vector, so tests control the
    /// conservative phase deterministically.
    #[derive(Clone, Default)]
    struct TestHints(Rc<RefCell<Vec<usize>>>);

    impl TestHints {
        fn push(&self, word: usize) {
            self.0.borrow_mut().push(word);
        }
    }

    impl HintSource for TestHints {
        fn visit_hints(&mut self, visitor: &mut dyn FnMut(usize)) {
            for &word in self.0.borrow().iter() {
                visitor(word);
            }
        }
    }

    fn test_settings(pages: usize) -> HeapSettings {
        HeapSettings {
            heap_size: pages * PAGE_BYTES,
        }
    }

    fn create_test_env(pages: usize) -> (Heap, TestHints) {
        let hints = TestHints::default();
        let heap = Heap::new(test_settings(pages), Box::new(hints.clone()));
        (heap, hints)
    }

    /// An object whose header and user words fill one page exactly.
    fn alloc_full_page(heap: &mut Heap) -> Gcp {
        heap.allocate(PAGE_BYTES - WORD_BYTES, 0)
    }

    unsafe fn header_of(p: Gcp) -> Header {
        match HeaderWord::from_raw(unsafe { *p.sub(1) }) {
            HeaderWord::Live(header) => header,
            HeaderWord::Forwarded(_) => panic!("object is forwarded"),
        }
    }

    unsafe fn write_word(p: Gcp, index: usize, value: usize) {
        unsafe { *p.add(index) = value }
    }

    unsafe fn read_word(p: Gcp, index: usize) -> usize {
        unsafe { *p.add(index) }
    }

    #[test]
    fn single_object_allocation() {
        let (mut heap, _hints) = create_test_env(10);

        let p = heap.allocate(50, 2);
        assert_eq!(p as usize % WORD_BYTES, 0);
        // The header sits below the object, inside the same page.
        assert!(p as usize % PAGE_BYTES >= WORD_BYTES);

        let header = unsafe { header_of(p) };
        assert_eq!(header.words(), 50usize.div_ceil(WORD_BYTES) + 1);
        assert_eq!(header.ptrs(), 2);

        assert_eq!(unsafe { read_word(p, 0) }, 0);
        assert_eq!(unsafe { read_word(p, 1) }, 0);

        let page = heap.page_of(p).expect("object inside the heap");
        assert_eq!(heap.page_kind(page), PageKind::Object);
        assert_eq!(heap.page_space(page), heap.current_space());
        assert_eq!(heap.allocated_pages(), 1);
    }

    #[test]
    fn pointer_slots_nulled() {
        let (mut heap, _hints) = create_test_env(10);
        let p = heap.allocate(40, 5);
        for slot in 0..5 {
            assert_eq!(unsafe { read_word(p, slot) }, 0);
        }
    }

    #[test]
    fn sealing_covers_page_tail_with_filler() {
        let (mut heap, _hints) = create_test_env(10);

        // 30 bytes + header = 5 words; 12 objects leave 4 words of tail.
        let first = heap.allocate(30, 0);
        for _ in 0..11 {
            heap.allocate(30, 0);
        }
        let first_page = heap.page_of(first).unwrap();
        assert_eq!(heap.allocated_pages(), 1);

        let spill = heap.allocate(30, 0);
        assert_ne!(heap.page_of(spill), Some(first_page));
        assert_eq!(heap.allocated_pages(), 2);

        let page_start = first as usize - WORD_BYTES;
        let filler_at = (page_start + 60 * WORD_BYTES) as *const usize;
        match HeaderWord::from_raw(unsafe { *filler_at }) {
            HeaderWord::Live(filler) => {
                assert_eq!(filler.words(), PAGE_WORDS - 60);
                assert_eq!(filler.ptrs(), 0);
            }
            HeaderWord::Forwarded(_) => {
                panic!("filler decoded as forwarding word")
            }
        }
    }

    #[test]
    fn global_root_forwarded_with_identical_contents() {
        let (mut heap, _hints) = create_test_env(16);

        let mut cell: Gcp = ptr::null_mut();
        let cell_addr = &raw mut cell;
        unsafe { heap.add_global_root(cell_addr) };
        assert!(unsafe { (*cell_addr).is_null() }, "registration nulls");

        let obj = heap.allocate(3 * WORD_BYTES, 1);
        unsafe {
            write_word(obj, 1, 0xDEAD);
            write_word(obj, 2, 0xBEEF);
            *cell_addr = obj;
        }
        let old_header = unsafe { header_of(obj) };

        heap.collect();

        let moved = unsafe { *cell_addr };
        assert!(!moved.is_null());
        assert_ne!(moved, obj, "unpinned object must be copied");
        assert_eq!(unsafe { header_of(moved) }, old_header);
        assert_eq!(unsafe { read_word(moved, 1) }, 0xDEAD);
        assert_eq!(unsafe { read_word(moved, 2) }, 0xBEEF);

        let page = heap.page_of(moved).unwrap();
        assert_eq!(heap.page_space(page), heap.current_space());
    }

    #[test]
    fn shared_target_copied_once() {
        let (mut heap, _hints) = create_test_env(16);

        let mut cell_a: Gcp = ptr::null_mut();
        let mut cell_b: Gcp = ptr::null_mut();
        let a_addr = &raw mut cell_a;
        let b_addr = &raw mut cell_b;
        unsafe {
            heap.add_global_root(a_addr);
            heap.add_global_root(b_addr);
        }

        let obj = heap.allocate(2 * WORD_BYTES, 0);
        unsafe {
            write_word(obj, 0, 0x11);
            *a_addr = obj;
            *b_addr = obj;
        }

        heap.collect();

        let via_a = unsafe { *a_addr };
        let via_b = unsafe { *b_addr };
        assert_ne!(via_a, obj);
        assert_eq!(via_a, via_b, "both cells follow the single copy");
        assert_eq!(unsafe { read_word(via_a, 0) }, 0x11);
    }

    #[test]
    fn cycle_survives_collection() {
        let (mut heap, _hints) = create_test_env(16);

        let mut cell: Gcp = ptr::null_mut();
        let cell_addr = &raw mut cell;
        unsafe { heap.add_global_root(cell_addr) };

        let a = heap.allocate(2 * WORD_BYTES, 1);
        let b = heap.allocate(2 * WORD_BYTES, 1);
        unsafe {
            write_word(a, 0, b as usize);
            write_word(b, 0, a as usize);
            write_word(a, 1, 1);
            write_word(b, 1, 2);
            *cell_addr = a;
        }

        heap.collect();

        let a2 = unsafe { *cell_addr };
        let b2 = unsafe { read_word(a2, 0) } as Gcp;
        assert_ne!(a2, a);
        assert_ne!(b2, b);
        assert_eq!(unsafe { read_word(b2, 0) }, a2 as usize);
        assert_eq!(unsafe { read_word(a2, 1) }, 1);
        assert_eq!(unsafe { read_word(b2, 1) }, 2);

        let space = heap.current_space();
        assert_eq!(heap.page_space(heap.page_of(a2).unwrap()), space);
        assert_eq!(heap.page_space(heap.page_of(b2).unwrap()), space);
    }

    #[test]
    fn multi_page_object_layout_and_pinning() {
        let (mut heap, hints) = create_test_env(16);

        // 1000 bytes = 125 user words + header = 126 words over 2 pages.
        let big = heap.allocate(1000, 0);
        let base = heap.page_of(big).unwrap();
        assert_eq!(heap.page_kind(base), PageKind::Object);
        assert_eq!(heap.page_kind(base + 1), PageKind::Continued);
        assert_eq!(heap.allocated_pages(), 2);

        unsafe { write_word(big, 124, 0x5A5A) };

        // A hint into the middle of the continued page pins the whole run.
        hints.push(big as usize + PAGE_BYTES + 16);
        heap.collect();

        let space = heap.current_space();
        assert_eq!(heap.page_space(base), space);
        assert_eq!(heap.page_space(base + 1), space);
        assert_eq!(heap.page_kind(base), PageKind::Object);
        assert_eq!(heap.page_kind(base + 1), PageKind::Continued);
        assert_eq!(unsafe { read_word(big, 124) }, 0x5A5A);
    }

    #[test]
    fn conservative_hint_pins_page_in_place() {
        let (mut heap, hints) = create_test_env(16);

        let obj = heap.allocate(2 * WORD_BYTES, 0);
        unsafe { write_word(obj, 0, 0xABCD) };
        let page = heap.page_of(obj).unwrap();

        // An interior address is hint enough; exactness is not required.
        hints.push(obj as usize + WORD_BYTES);
        heap.collect();

        assert_eq!(heap.page_space(page), heap.current_space());
        assert_eq!(unsafe { read_word(obj, 0) }, 0xABCD);
        assert_eq!(heap.collections(), 1);
    }

    #[test]
    fn foreign_hint_words_are_ignored() {
        let (mut heap, hints) = create_test_env(16);

        let obj = alloc_full_page(&mut heap);
        let page = heap.page_of(obj).unwrap();
        hints.push(0);
        hints.push(8);
        hints.push(0xFFFF_0000);

        heap.collect();
        assert_eq!(heap.page_space(page), FREE_SPACE);
    }

    #[test]
    fn garbage_pages_become_free() {
        let (mut heap, _hints) = create_test_env(16);

        let mut pages = Vec::new();
        for _ in 0..3 {
            let garbage = alloc_full_page(&mut heap);
            pages.push(heap.page_of(garbage).unwrap());
        }

        heap.collect();

        for page in pages {
            assert_eq!(heap.page_space(page), FREE_SPACE);
        }
        assert_eq!(heap.allocated_pages(), 0);
    }

    #[test]
    fn allocation_succeeds_after_collection() {
        let (mut heap, _hints) = create_test_env(16);

        for _ in 0..6 {
            alloc_full_page(&mut heap);
        }
        heap.collect();

        let p = alloc_full_page(&mut heap);
        let page = heap.page_of(p).unwrap();
        assert_eq!(heap.page_space(page), heap.current_space());
        assert_eq!(heap.allocated_pages(), 1);
    }

    #[test]
    fn watermark_triggers_collection() {
        let (mut heap, _hints) = create_test_env(16);

        // 20 unreachable pages cross the 8 page watermark repeatedly.
        for _ in 0..20 {
            alloc_full_page(&mut heap);
            assert!(heap.allocated_pages() < heap.page_count() / 2);
        }
        assert!(heap.collections() >= 1);
    }

    #[test]
    fn multi_page_object_forwarded_transitively() {
        let (mut heap, _hints) = create_test_env(32);

        let mut cell: Gcp = ptr::null_mut();
        let cell_addr = &raw mut cell;
        unsafe { heap.add_global_root(cell_addr) };

        let small = heap.allocate(WORD_BYTES, 0);
        let big = heap.allocate(1000, 1);
        unsafe {
            write_word(small, 0, 0x77);
            write_word(big, 0, small as usize);
            write_word(big, 100, 0x42);
            *cell_addr = big;
        }

        heap.collect();

        let big2 = unsafe { *cell_addr };
        assert_ne!(big2, big);
        let base = heap.page_of(big2).unwrap();
        assert_eq!(heap.page_kind(base), PageKind::Object);
        assert_eq!(heap.page_kind(base + 1), PageKind::Continued);

        let small2 = unsafe { read_word(big2, 0) } as Gcp;
        assert_ne!(small2, small);
        assert_eq!(unsafe { read_word(small2, 0) }, 0x77);
        assert_eq!(unsafe { read_word(big2, 100) }, 0x42);
    }

    #[test]
    fn chain_of_objects_preserved_across_pressure() {
        let (mut heap, _hints) = create_test_env(32);

        let mut cell: Gcp = ptr::null_mut();
        let cell_addr = &raw mut cell;
        unsafe { heap.add_global_root(cell_addr) };

        // Node layout: next pointer, then a payload word. Every fourth
        // node joins the chain; the rest is garbage driving collections.
        for index in 0..400usize {
            let node = heap.allocate(2 * WORD_BYTES, 1);
            unsafe {
                write_word(node, 1, index);
                if index % 4 == 0 {
                    write_word(node, 0, *cell_addr as usize);
                    *cell_addr = node;
                }
            }
        }
        assert!(heap.collections() >= 1);

        // Walk the list back down; edge structure and payloads must hold.
        let mut node = unsafe { *cell_addr };
        let mut expected: isize = 396;
        while !node.is_null() {
            assert_eq!(unsafe { read_word(node, 1) }, expected as usize);
            node = unsafe { read_word(node, 0) } as Gcp;
            expected -= 4;
        }
        assert_eq!(expected, -4);
    }

    #[test]
    fn empty_heap_collects() {
        let (mut heap, _hints) = create_test_env(16);
        heap.collect();
        assert_eq!(heap.collections(), 1);
        assert_eq!(heap.allocated_pages(), 0);
        assert_eq!(heap.current_space(), 2);
    }

    #[test]
    fn space_tag_skips_zero_on_wraparound() {
        assert_eq!(advance_space(1), 2);
        assert_eq!(advance_space(SPACE_MASK), 1);
    }

    #[test]
    #[should_panic(expected = "can never fit")]
    fn oversized_object_faults() {
        let (mut heap, _hints) = create_test_env(16);
        heap.allocate(8 * PAGE_BYTES, 0);
    }

    #[test]
    #[should_panic(expected = "unable to allocate")]
    fn pinned_heap_exhaustion_faults() {
        let (mut heap, hints) = create_test_env(32);
        for _ in 0..20 {
            let p = alloc_full_page(&mut heap);
            hints.push(p as usize);
        }
    }

    #[test]
    fn machine_stack_pins_stack_referenced_object() {
        system::with_stack_base(|base| {
            let mut heap = Heap::new(
                test_settings(64),
                Box::new(MachineStack::new(base)),
            );

            let obj = heap.allocate(2 * WORD_BYTES, 0);
            unsafe { write_word(obj, 0, 0xABCD) };
            std::hint::black_box(&obj);

            heap.collect();

            let page = heap.page_of(obj).unwrap();
            assert_eq!(heap.page_space(page), heap.current_space());
            assert_eq!(unsafe { read_word(obj, 0) }, 0xABCD);
            std::hint::black_box(&obj);
        });
    }
}

/// Number of bytes in a heap word. Every object is measured and aligned in
/// these units.
pub const WORD_BYTES: usize = size_of::<usize>();

/// A managed pointer: the address of an object's first user word. The
/// object's header occupies the word immediately below it.
pub type Gcp = *mut usize;

const LIVE_BIT: usize = 1;
const WORDS_SHIFT: u32 = 1;
const WORDS_BITS: u32 = usize::BITS / 2 - 1;
const WORDS_MASK: usize = (1 << WORDS_BITS) - 1;
const PTRS_SHIFT: u32 = usize::BITS / 2;
const PTRS_MASK: usize = (1 << (usize::BITS - PTRS_SHIFT)) - 1;

/// The one-word header at the start of every heap object.
///
/// ```text
/// bit  0:      1 when this word is a live header
/// bits 1..32:  object size in words, header included
/// bits 32..64: leading pointer-typed words in the user area
/// ```
///
/// (Field widths shown for a 64-bit word; both size fields scale with the
/// target word, keeping bit 0 as the liveness flag.)
///
/// When an object is relocated its header slot is overwritten with the
/// word-aligned address of the copy. Alignment keeps bit 0 clear, which is
/// how [`HeaderWord`] tells the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header(usize);

const _: () = assert!(size_of::<Header>() == WORD_BYTES);

impl Header {
    /// Largest encodable object size, in words.
    pub const MAX_WORDS: usize = WORDS_MASK;

    #[inline(always)]
    pub fn new(words: usize, ptrs: usize) -> Self {
        debug_assert!(words >= 1 && words <= WORDS_MASK);
        debug_assert!(ptrs <= PTRS_MASK && ptrs < words);
        Self(ptrs << PTRS_SHIFT | words << WORDS_SHIFT | LIVE_BIT)
    }

    /// Header covering the unused tail of a sealed page.
    #[inline(always)]
    pub fn filler(words: usize) -> Self {
        Self::new(words, 0)
    }

    #[inline(always)]
    pub fn raw(self) -> usize {
        self.0
    }

    /// Total size in words, header included.
    #[inline(always)]
    pub fn words(self) -> usize {
        self.0 >> WORDS_SHIFT & WORDS_MASK
    }

    /// Number of pointer-typed words at the start of the user area.
    #[inline(always)]
    pub fn ptrs(self) -> usize {
        self.0 >> PTRS_SHIFT & PTRS_MASK
    }
}

/// What a header slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderWord {
    /// The object is in place.
    Live(Header),
    /// The object has been copied; the slot holds the new location.
    Forwarded(Gcp),
}

impl HeaderWord {
    #[inline(always)]
    pub fn from_raw(raw: usize) -> Self {
        if raw & LIVE_BIT != 0 {
            HeaderWord::Live(Header(raw))
        } else {
            HeaderWord::Forwarded(raw as Gcp)
        }
    }
}

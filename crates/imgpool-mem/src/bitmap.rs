//! Decoded-image buffers: the `Bitmap` value type, its pool, and the counter
//! that caps bitmaps living outside the pool.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use imgpool_core::config::PoolParams;
use imgpool_core::id::BitmapId;
use imgpool_core::memory::MemoryTrimmableRegistry;
use imgpool_core::reference::{CloseableReference, ResourceReleaser};

use crate::error::{Error, Result};
use crate::pool::{BasePool, PoolAllocator, PoolValue};
use crate::stats::PoolStatsTracker;
use crate::trace::debug_event;

/// Bytes per BGRA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Max number of un-pooled bitmaps a default counter admits.
pub const MAX_BITMAP_COUNT: usize = 384;

struct BitmapState {
    disposed: bool,
    read_only: bool,
    pixels: Vec<u8>,
}

struct BitmapInner {
    id: BitmapId,
    width: usize,
    height: usize,
    byte_count: usize,
    state: Mutex<BitmapState>,
}

/// A BGRA8 pixel buffer. Clones are handles on the same pixels.
#[derive(Clone)]
pub struct Bitmap {
    inner: Arc<BitmapInner>,
}

impl Bitmap {
    /// A single-row bitmap backed by exactly `byte_count` bytes.
    pub fn allocate(byte_count: usize) -> Result<Self> {
        if byte_count == 0 {
            return Err(Error::InvalidSize { size: byte_count });
        }
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(byte_count)
            .map_err(|_| Error::AllocFailed {
                tag: "bitmap",
                bytes: byte_count,
            })?;
        pixels.resize(byte_count, 0u8);
        Ok(Self {
            inner: Arc::new(BitmapInner {
                id: BitmapId::next(),
                width: byte_count.div_ceil(BYTES_PER_PIXEL),
                height: 1,
                byte_count,
                state: Mutex::new(BitmapState {
                    disposed: false,
                    read_only: false,
                    pixels,
                }),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BitmapState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> BitmapId {
        self.inner.id
    }

    pub fn width(&self) -> usize {
        self.inner.width
    }

    pub fn height(&self) -> usize {
        self.inner.height
    }

    /// Bytes of the backing allocation.
    pub fn allocation_byte_count(&self) -> usize {
        self.inner.byte_count
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    pub fn dispose(&self) {
        let mut state = self.lock();
        if !state.disposed {
            state.disposed = true;
            state.pixels = Vec::new();
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.lock().read_only
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.lock().read_only = read_only;
    }

    /// Run `f` on the pixel bytes.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let state = self.lock();
        if state.disposed {
            return Err(Error::Closed);
        }
        Ok(f(&state.pixels))
    }

    /// Run `f` on the pixel bytes mutably. Read-only bitmaps are rejected.
    pub fn with_pixels_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut state = self.lock();
        if state.disposed {
            return Err(Error::Closed);
        }
        if state.read_only {
            return Err(Error::invalid_argument("bitmap is read-only"));
        }
        Ok(f(&mut state.pixels))
    }
}

impl PoolValue for Bitmap {
    fn identity(&self) -> u64 {
        self.id().get()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("id", &self.id())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bytes", &self.allocation_byte_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Bitmaps keyed by their exact byte count.
#[derive(Debug, Default, Clone, Copy)]
pub struct BitmapAllocator;

impl PoolAllocator for BitmapAllocator {
    type Value = Bitmap;

    fn alloc(&self, bucketed_size: usize) -> Result<Bitmap> {
        Bitmap::allocate(bucketed_size)
    }

    fn free(&self, value: Bitmap) {
        value.dispose();
    }

    fn bucketed_size(&self, requested: usize) -> Result<usize> {
        if requested == 0 {
            return Err(Error::InvalidSize { size: requested });
        }
        Ok(requested)
    }

    fn bucketed_size_for_value(&self, value: &Bitmap) -> usize {
        value.allocation_byte_count()
    }

    fn is_reusable(&self, value: &Bitmap) -> bool {
        !value.is_disposed() && !value.is_read_only()
    }
}

pub type BitmapPool = BasePool<BitmapAllocator>;

impl BasePool<BitmapAllocator> {
    pub fn new(
        params: PoolParams,
        registry: &dyn MemoryTrimmableRegistry,
        tracker: Arc<dyn PoolStatsTracker>,
    ) -> Result<Arc<Self>> {
        Self::create(BitmapAllocator, params, registry, tracker)
    }
}

#[derive(Debug, Default)]
struct Tally {
    count: usize,
    size: usize,
}

struct CounterInner {
    max_count: usize,
    max_size: usize,
    tally: Mutex<Tally>,
}

impl CounterInner {
    fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn increase(&self, bitmap: &Bitmap) -> bool {
        let size = bitmap.allocation_byte_count();
        let mut tally = self.lock();
        if tally.count >= self.max_count || tally.size + size > self.max_size {
            return false;
        }
        tally.count += 1;
        tally.size += size;
        true
    }

    fn decrease(&self, bitmap: &Bitmap) -> Result<()> {
        let size = bitmap.allocation_byte_count();
        let mut tally = self.lock();
        if tally.count == 0 {
            return Err(Error::invalid_argument("no bitmaps registered"));
        }
        if size > tally.size {
            return Err(Error::invalid_argument(format!(
                "bitmap size {size} bigger than the total registered size {}",
                tally.size
            )));
        }
        tally.size -= size;
        tally.count -= 1;
        Ok(())
    }
}

/// Caps the number and total size of decoded bitmaps that bypass the pool.
#[derive(Clone)]
pub struct BitmapCounter {
    inner: Arc<CounterInner>,
    releaser: Arc<dyn ResourceReleaser<Bitmap>>,
}

impl BitmapCounter {
    pub fn new(max_count: usize, max_size: usize) -> Result<Self> {
        if max_count == 0 || max_size == 0 {
            return Err(Error::invalid_argument(
                "bitmap counter limits must be positive",
            ));
        }
        let inner = Arc::new(CounterInner {
            max_count,
            max_size,
            tally: Mutex::new(Tally::default()),
        });
        let counted = Arc::clone(&inner);
        let releaser: Arc<dyn ResourceReleaser<Bitmap>> = Arc::new(move |bitmap: Bitmap| {
            if counted.decrease(&bitmap).is_err() {
                debug_event!(bitmap = %bitmap.id(), "released bitmap was not counted");
            }
            bitmap.dispose();
        });
        Ok(Self { inner, releaser })
    }

    /// Counter with [`MAX_BITMAP_COUNT`] and the bitmap pool's hard cap.
    pub fn for_params(params: &PoolParams) -> Result<Self> {
        Self::new(MAX_BITMAP_COUNT, params.max_size_hard_cap)
    }

    /// Count `bitmap` if both limits still allow it.
    pub fn increase(&self, bitmap: &Bitmap) -> bool {
        self.inner.increase(bitmap)
    }

    pub fn decrease(&self, bitmap: &Bitmap) -> Result<()> {
        self.inner.decrease(bitmap)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn max_count(&self) -> usize {
        self.inner.max_count
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Releaser that uncounts and disposes a bitmap.
    pub fn releaser(&self) -> Arc<dyn ResourceReleaser<Bitmap>> {
        Arc::clone(&self.releaser)
    }

    /// Count every bitmap and wrap each in a reference released through
    /// [`releaser`](Self::releaser). If any bitmap does not fit, the ones
    /// already counted are uncounted, all are disposed, and
    /// `TooManyBitmaps` is returned.
    pub fn associate_bitmaps(&self, bitmaps: Vec<Bitmap>) -> Result<Vec<CloseableReference<Bitmap>>> {
        let mut counted = 0;
        while counted < bitmaps.len() {
            if !self.increase(&bitmaps[counted]) {
                break;
            }
            counted += 1;
        }

        if counted < bitmaps.len() {
            for (i, bitmap) in bitmaps.iter().enumerate() {
                if i < counted {
                    let _ = self.decrease(bitmap);
                }
                bitmap.dispose();
            }
            return Err(Error::TooManyBitmaps);
        }

        Ok(bitmaps
            .into_iter()
            .map(|bitmap| CloseableReference::of(bitmap, self.releaser()))
            .collect())
    }
}

impl fmt::Debug for BitmapCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapCounter")
            .field("count", &self.count())
            .field("size", &self.size())
            .field("max_count", &self.inner.max_count)
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

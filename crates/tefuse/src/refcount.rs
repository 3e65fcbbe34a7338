//! Intrusive atomic reference counting for shared IR objects.
//!
//! An object opts in by embedding a [`RefCount`] and implementing [`RefCounted`]. [`Ref`] is
//! the owning handle: cloning takes a reference, dropping releases one, and the object is
//! destroyed exactly once when the last reference is released.
//!
//! In debug builds every [`RefCount`] is tracked by a process-wide live counter so tests can
//! assert that nothing leaked ([`live_objects`], [`check_no_live_objects`]).

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[cfg(debug_assertions)]
static LIVE_OBJECTS: AtomicUsize = AtomicUsize::new(0);

const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Number of [`RefCount`] instances currently alive. Always 0 in release builds.
pub fn live_objects() -> usize {
    #[cfg(debug_assertions)]
    {
        LIVE_OBJECTS.load(Ordering::SeqCst)
    }
    #[cfg(not(debug_assertions))]
    {
        0
    }
}

/// Returns true when no reference-counted object is alive.
pub fn check_no_live_objects() -> bool {
    live_objects() == 0
}

/// Embedded reference counter. A fresh counter starts at zero (constructed, not yet owned).
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    pub fn new() -> Self {
        #[cfg(debug_assertions)]
        LIVE_OBJECTS.fetch_add(1, Ordering::SeqCst);
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Current number of holders.
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether exactly one holder exists.
    pub fn is_one(&self) -> bool {
        self.count.load(Ordering::Acquire) == 1
    }

    fn increment(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        if prev > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    /// Drops one reference and reports whether it was the last one.
    fn decrement(&self) -> bool {
        debug_assert!(
            self.count.load(Ordering::Relaxed) > 0,
            "released an object whose reference count is already zero"
        );
        // A sole holder cannot race with an increment, so the atomic RMW can be skipped.
        if self.is_one() {
            #[cfg(debug_assertions)]
            self.count.store(0, Ordering::Relaxed);
            return true;
        }
        if self.count.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        atomic::fence(Ordering::Acquire);
        true
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloned object is a distinct object and starts unowned.
impl Clone for RefCount {
    fn clone(&self) -> Self {
        Self::new()
    }
}

/// Counters never distinguish two objects.
impl PartialEq for RefCount {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for RefCount {}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

impl Drop for RefCount {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(
                *self.count.get_mut(),
                0,
                "object destroyed while still referenced"
            );
            LIVE_OBJECTS.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Implemented by objects that embed a [`RefCount`].
///
/// # Safety
///
/// `ref_count` must return the same embedded counter for the whole lifetime of the object and
/// nothing but [`Ref`] may modify it.
pub unsafe trait RefCounted {
    fn ref_count(&self) -> &RefCount;
}

/// Owning handle to a heap-allocated [`RefCounted`] object.
///
/// All objects managed through `Ref` are allocated by [`Ref::new`]; raw pointers passed to
/// [`Ref::from_raw`], [`Ref::acquire`] and [`Ref::release`] must come from the same place.
pub struct Ref<T: RefCounted> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: RefCounted + Send + Sync> Send for Ref<T> {}
unsafe impl<T: RefCounted + Send + Sync> Sync for Ref<T> {}

impl<T: RefCounted> Ref<T> {
    /// Moves `value` to the heap and takes the first reference.
    pub fn new(value: T) -> Self {
        debug_assert_eq!(
            value.ref_count().get(),
            0,
            "a new object must not be owned yet"
        );
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        // SAFETY: freshly leaked box, valid and uniquely owned here.
        unsafe { ptr.as_ref() }.ref_count().increment();
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Number of holders of the referent.
    pub fn count(this: &Self) -> usize {
        this.ref_count().get()
    }

    /// Whether this handle is the only holder.
    pub fn is_unique(this: &Self) -> bool {
        this.ref_count().is_one()
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Mutable access when this handle is the sole holder.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if Self::is_unique(this) {
            // SAFETY: no other holder exists, so no other reference to the referent can exist.
            Some(unsafe { this.ptr.as_mut() })
        } else {
            None
        }
    }

    /// Gives up the handle without releasing the reference.
    pub fn into_raw(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        std::mem::forget(this);
        ptr
    }

    /// Adopts a reference previously leaked with [`Ref::into_raw`] or taken with
    /// [`Ref::acquire`]. The count is not touched.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from a `Ref<T>` and carry one reference owned by the caller.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Takes an additional reference on a live object.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from a `Ref<T>` and the object must still be alive.
    pub unsafe fn acquire(ptr: NonNull<T>) {
        ptr.as_ref().ref_count().increment();
    }

    /// Releases one reference, destroying the object when it was the last one.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from a `Ref<T>` and the caller must own the reference it releases.
    pub unsafe fn release(ptr: NonNull<T>) {
        if ptr.as_ref().ref_count().decrement() {
            drop(Box::from_raw(ptr.as_ptr()));
        }
    }

    fn ref_count(&self) -> &RefCount {
        (**self).ref_count()
    }
}

impl<T: RefCounted + Clone> Ref<T> {
    /// Copy-on-write access: clones the referent first when it is shared.
    pub fn make_mut(this: &mut Self) -> &mut T {
        if !Self::is_unique(this) {
            *this = Ref::new((**this).clone());
        }
        // SAFETY: uniqueness was established above.
        unsafe { this.ptr.as_mut() }
    }
}

impl<T: RefCounted> Clone for Ref<T> {
    fn clone(&self) -> Self {
        self.ref_count().increment();
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: RefCounted> Drop for Ref<T> {
    fn drop(&mut self) {
        // SAFETY: the handle owns one reference to an object allocated by `Ref::new`.
        unsafe { Self::release(self.ptr) }
    }
}

impl<T: RefCounted> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the handle keeps the referent alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: RefCounted + PartialEq> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        Ref::ptr_eq(self, other) || **self == **other
    }
}

impl<T: RefCounted + Serialize> Serialize for Ref<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (**self).serialize(serializer)
    }
}

impl<'de, T: RefCounted + Deserialize<'de>> Deserialize<'de> for Ref<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Ref::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Tracked {
        refs: RefCount,
        drops: Arc<AtomicUsize>,
    }

    unsafe impl RefCounted for Tracked {
        fn ref_count(&self) -> &RefCount {
            &self.refs
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked() -> (Ref<Tracked>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let handle = Ref::new(Tracked {
            refs: RefCount::new(),
            drops: Arc::clone(&drops),
        });
        (handle, drops)
    }

    #[test]
    fn fresh_counter_starts_at_zero() {
        let count = RefCount::new();
        assert_eq!(count.get(), 0);
        assert!(!count.is_one());
    }

    #[test]
    fn clone_and_drop_track_holders() {
        let (a, drops) = tracked();
        assert_eq!(Ref::count(&a), 1);
        let b = a.clone();
        assert_eq!(Ref::count(&a), 2);
        assert!(Ref::ptr_eq(&a, &b));
        drop(a);
        assert_eq!(Ref::count(&b), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_mut_requires_unique_handle() {
        let (mut a, _drops) = tracked();
        assert!(Ref::get_mut(&mut a).is_some());
        let b = a.clone();
        assert!(Ref::get_mut(&mut a).is_none());
        drop(b);
        assert!(Ref::get_mut(&mut a).is_some());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already zero")]
    fn releasing_an_unowned_object_is_fatal() {
        let count = RefCount::new();
        let _ = count.decrement();
    }
}

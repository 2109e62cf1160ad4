//! Single-owner wrappers for handles returned by protocol and graphics
//! factories.
//!
//! A factory call hands back something that may be absent (a null proxy, a
//! zero object id). [`wrap`] refuses absent values at the call site, so an
//! [`OwnedHandle`] is always valid, and pairs the value with the operation
//! that releases it. The release runs exactly once, when the wrapper is
//! dropped, unless ownership is moved out with [`OwnedHandle::into_raw`].

use std::borrow::Cow;
use std::fmt;
use std::ptr::NonNull;

use tracing::trace;

use crate::error::{Error, Result};

/// A value a factory may return in place of a real handle.
pub trait RawHandle: Copy {
    /// True for the sentinel meaning "nothing was produced".
    fn is_absent(&self) -> bool;
}

impl<T: ?Sized> RawHandle for *mut T {
    fn is_absent(&self) -> bool {
        self.is_null()
    }
}

impl<T: ?Sized> RawHandle for *const T {
    fn is_absent(&self) -> bool {
        self.is_null()
    }
}

impl<T: ?Sized> RawHandle for NonNull<T> {
    fn is_absent(&self) -> bool {
        false
    }
}

macro_rules! zero_is_absent {
    ($($int:ty),*) => {
        $(
            impl RawHandle for $int {
                fn is_absent(&self) -> bool {
                    *self == 0
                }
            }
        )*
    };
}

// Protocol object ids and graphics names never use zero.
zero_is_absent!(u16, u32, u64, usize);

/// Default release operation of a resource type.
///
/// Implemented on the opaque type a factory returns a pointer to, so that
/// `OwnedHandle::new(ptr)` picks the right destructor from the pointee.
///
/// # Safety
///
/// `release` must accept any non-null pointer produced by the factories of
/// this type and must not be relied on to tolerate a second call.
pub unsafe trait Release {
    /// Frees the resource behind `raw`.
    ///
    /// # Safety
    ///
    /// `raw` is non-null, owned by the caller and not used afterwards.
    unsafe fn release(raw: *mut Self);
}

fn release_default<T: Release>(raw: *mut T) {
    // SAFETY: only reachable through `OwnedHandle::new`, which checked
    // `raw` for null and owns it exclusively.
    unsafe { T::release(raw) }
}

/// An owned, never-absent handle.
///
/// Move-only: there is no `Clone`, and dropping it runs the release
/// operation once.
#[must_use = "dropping an OwnedHandle releases it immediately"]
pub struct OwnedHandle<H: RawHandle, F: FnOnce(H) = fn(H)> {
    raw: H,
    release: Option<F>,
}

/// Wraps `raw`, failing with [`Error::ResourceAcquisition`] if it is absent.
///
/// `release` may capture whatever extra context the release call needs,
/// e.g. the display a graphics context was created on.
#[track_caller]
pub fn wrap<H: RawHandle, F: FnOnce(H)>(raw: H, release: F) -> Result<OwnedHandle<H, F>> {
    wrap_named(raw, release, std::any::type_name::<H>())
}

/// [`wrap`] with an explicit name for the producing operation, used in the
/// failure message.
#[track_caller]
pub fn wrap_named<H: RawHandle, F: FnOnce(H)>(
    raw: H,
    release: F,
    what: impl Into<Cow<'static, str>>,
) -> Result<OwnedHandle<H, F>> {
    if raw.is_absent() {
        return Err(Error::acquisition(what));
    }
    Ok(OwnedHandle {
        raw,
        release: Some(release),
    })
}

impl<T: Release> OwnedHandle<*mut T> {
    /// Wraps `raw` with the default release of `T`.
    #[track_caller]
    pub fn new(raw: *mut T) -> Result<Self> {
        wrap(raw, release_default::<T> as fn(*mut T))
    }

    /// [`OwnedHandle::new`] naming the producing operation.
    #[track_caller]
    pub fn named(raw: *mut T, what: impl Into<Cow<'static, str>>) -> Result<Self> {
        wrap_named(raw, release_default::<T> as fn(*mut T), what)
    }
}

impl<T: ?Sized, F: FnOnce(*mut T)> OwnedHandle<*mut T, F> {
    /// The handle as a non-null pointer.
    pub fn as_non_null(&self) -> NonNull<T> {
        // SAFETY: absent (null) values are rejected by `wrap`.
        unsafe { NonNull::new_unchecked(self.raw) }
    }
}

impl<H: RawHandle, F: FnOnce(H)> OwnedHandle<H, F> {
    /// The wrapped value. Ownership stays with the wrapper.
    pub fn get(&self) -> H {
        self.raw
    }

    /// Gives up ownership without releasing. The caller becomes
    /// responsible for the returned handle.
    pub fn into_raw(mut self) -> H {
        self.release = None;
        self.raw
    }

    /// Releases now instead of at the end of scope.
    pub fn release(self) {
        drop(self)
    }
}

impl<H: RawHandle, F: FnOnce(H)> Drop for OwnedHandle<H, F> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            trace!(handle = std::any::type_name::<H>(), "releasing");
            release(self.raw);
        }
    }
}

impl<H: RawHandle + fmt::Debug, F: FnOnce(H)> fmt::Debug for OwnedHandle<H, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedHandle").field(&self.raw).finish()
    }
}

/// Wraps the result of a factory expression, naming the expression in the
/// failure.
///
/// `owned!(expr)` uses the pointee's [`Release`]; `owned!(expr, release)`
/// takes an explicit release operation.
#[macro_export]
macro_rules! owned {
    ($raw:expr) => {
        $crate::handle::OwnedHandle::named($raw, stringify!($raw))
    };
    ($raw:expr, $release:expr) => {
        $crate::handle::wrap_named($raw, $release, stringify!($raw))
    };
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_releases_once_at_end_of_scope() {
        let released = Rc::new(Cell::new(0));
        {
            let counter = released.clone();
            let handle = wrap(42u32, move |h| {
                assert_eq!(h, 42);
                counter.set(counter.get() + 1);
            })
            .unwrap();
            assert_eq!(handle.get(), 42);
            assert_eq!(released.get(), 0);
        }
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_absent_handle_never_releases() {
        let released = Rc::new(Cell::new(0));
        let counter = released.clone();
        let err = wrap(std::ptr::null_mut::<u8>(), move |_| {
            counter.set(counter.get() + 1)
        })
        .unwrap_err();

        assert!(matches!(err, Error::ResourceAcquisition { .. }));
        assert_eq!(err.location().unwrap().file(), file!());
        assert_eq!(released.get(), 0);
    }

    #[test]
    fn test_moving_the_wrapper_keeps_a_single_release() {
        let released = Rc::new(Cell::new(0));
        let counter = released.clone();
        let handle = wrap(7u64, move |_| counter.set(counter.get() + 1)).unwrap();

        let moved = vec![handle];
        assert_eq!(released.get(), 0);
        drop(moved);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_into_raw_skips_release() {
        let released = Rc::new(Cell::new(false));
        let flag = released.clone();
        let handle = wrap(9usize, move |_| flag.set(true)).unwrap();

        assert_eq!(handle.into_raw(), 9);
        assert!(!released.get());
    }

    #[test]
    fn test_explicit_release_runs_immediately() {
        let released = Rc::new(Cell::new(0));
        let counter = released.clone();
        let handle = wrap(3u16, move |_| counter.set(counter.get() + 1)).unwrap();

        handle.release();
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_release_can_carry_context() {
        // A context handle whose release needs the display it came from.
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));
        let display = 5u32;
        let sink = log.clone();
        let context = wrap(11u32, move |ctx| sink.borrow_mut().push((display, ctx))).unwrap();

        drop(context);
        assert_eq!(*log.borrow(), vec![(5, 11)]);
    }

    struct Counted;

    thread_local! {
        static COUNTED_RELEASES: Cell<usize> = const { Cell::new(0) };
    }

    unsafe impl Release for Counted {
        unsafe fn release(raw: *mut Self) {
            drop(unsafe { Box::from_raw(raw) });
            COUNTED_RELEASES.with(|c| c.set(c.get() + 1));
        }
    }

    #[test]
    fn test_default_release_comes_from_the_pointee() {
        let handle = OwnedHandle::new(Box::into_raw(Box::new(Counted))).unwrap();
        assert_eq!(handle.as_non_null().as_ptr(), handle.get());
        drop(handle);
        assert_eq!(COUNTED_RELEASES.with(Cell::get), 1);
    }

    #[test]
    fn test_owned_macro_names_the_expression() {
        fn connect() -> *mut Counted {
            std::ptr::null_mut()
        }
        let err = owned!(connect()).unwrap_err();
        assert!(err.to_string().starts_with("connect() returned no handle"));

        let err = owned!(0u32, |_| ()).unwrap_err();
        assert!(err.to_string().starts_with("0u32 returned no handle"));
    }
}

//! Borrowed path and file-name slices for the path walk.

use core::cmp;

use cstr_core::CStr;

use super::DIRSIZ;

/// One path element.
#[derive(PartialEq, Debug)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - The slice contains no NUL characters.
    // - The slice is not longer than DIRSIZ.
    inner: [u8],
}

impl FileName {
    /// Truncates bytes after the first DIRSIZ.
    ///
    /// # Safety
    ///
    /// `bytes` must not contain any NUL characters.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        debug_assert!(!bytes.contains(&0));
        // SAFETY: `&FileName` is layout-compatible with `[u8]` because of
        // repr(transparent), and the truncated slice satisfies the
        // invariant.
        unsafe { &*(&bytes[..cmp::min(DIRSIZ, bytes.len())] as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

#[repr(transparent)]
pub struct Path {
    // Invariant: the slice contains no NUL characters.
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of
        // repr(transparent), and CStr::to_bytes contains no NUL.
        unsafe { Self::from_bytes(cstr.to_bytes()) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL characters.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Splits off the next path element.
    ///
    /// Returns `Some((path, name))` where `name` is the next element and
    /// `path` is the rest with its leading slashes removed, so the caller
    /// can check `path.is_empty_string()` to see if `name` is the last
    /// element. Returns `None` if there is no element to remove.
    ///
    /// Examples:
    ///   skipelem("a/bb/c") = Some(("bb/c", "a"))
    ///   skipelem("///a//bb") = Some(("bb", "a"))
    ///   skipelem("a") = Some(("", "a"))
    ///   skipelem("") = skipelem("////") = None
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        fn trim_slashes(bytes: &[u8]) -> &[u8] {
            let start = bytes
                .iter()
                .position(|ch| *ch != b'/')
                .unwrap_or(bytes.len());
            &bytes[start..]
        }

        let bytes = trim_slashes(&self.inner);
        if bytes.is_empty() {
            return None;
        }
        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or(bytes.len());

        // SAFETY: subslices of self.inner contain no NUL.
        let name = unsafe { FileName::from_bytes(&bytes[..len]) };
        let rest = unsafe { Self::from_bytes(trim_slashes(&bytes[len..])) };
        Some((rest, name))
    }

    /// Returns true if the path begins with '/'.
    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(bytes: &[u8]) -> &Path {
        unsafe { Path::from_bytes(bytes) }
    }

    fn split(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
        path(bytes)
            .skipelem()
            .map(|(p, n)| (p.as_bytes(), n.as_bytes()))
    }

    #[test]
    fn skipelem_walks_elements() {
        assert_eq!(split(b"a/bb/c"), Some((&b"bb/c"[..], &b"a"[..])));
        assert_eq!(split(b"///a//bb"), Some((&b"bb"[..], &b"a"[..])));
        assert_eq!(split(b"a"), Some((&b""[..], &b"a"[..])));
        assert_eq!(split(b""), None);
        assert_eq!(split(b"////"), None);
    }

    #[test]
    fn skipelem_truncates_long_names() {
        let (rest, name) = path(b"0123456789abcdefgh/x").skipelem().unwrap();
        assert_eq!(name.as_bytes(), &b"0123456789abcd"[..]);
        assert_eq!(rest.as_bytes(), &b"x"[..]);
    }

    #[test]
    fn absolute_vs_relative() {
        assert!(path(b"/init").is_absolute());
        assert!(!path(b"init").is_absolute());
        assert!(!path(b"").is_absolute());
    }
}

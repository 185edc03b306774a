//! The units module provides common WebAssembly units like [`Pages`] and
//! conversion functions into other units.
use crate::error::PageError;
use std::{
    fmt,
    ops::{Add, Sub},
};

/// The page size in bytes of a wasm page.
pub const WASM_PAGE_SIZE: usize = 65_536;
/// The maximum number of pages of a wasm linear memory.
pub const WASM_MAX_PAGES: usize = 65_536;

/// A unit of WebAssembly pages.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pages(pub u32);

impl Pages {
    /// Checked addition of two page counts, erroring when the sum exceeds the
    /// wasm addressable maximum.
    pub fn checked_add(self, add: Pages) -> Result<Pages, PageError> {
        let added = (self.0 as usize) + (add.0 as usize);
        if added <= WASM_MAX_PAGES {
            Ok(Pages(added as u32))
        } else {
            Err(PageError::ExceededMaxPages(
                self.0 as usize,
                add.0 as usize,
                added,
            ))
        }
    }

    /// The page count representing the wasm addressable maximum.
    pub fn max() -> Pages {
        Pages(WASM_MAX_PAGES as u32)
    }

    /// The size in bytes of this page count.
    pub fn bytes(self) -> Bytes {
        self.into()
    }
}

impl fmt::Display for Pages {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} pages", self.0)
    }
}

/// A unit of bytes.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytes(pub usize);

impl From<Pages> for Bytes {
    fn from(pages: Pages) -> Bytes {
        Bytes((pages.0 as usize) * WASM_PAGE_SIZE)
    }
}

impl From<Bytes> for Pages {
    fn from(bytes: Bytes) -> Pages {
        Pages((bytes.0 / WASM_PAGE_SIZE) as u32)
    }
}

impl Add for Pages {
    type Output = Pages;
    fn add(self, rhs: Pages) -> Pages {
        Pages(self.0 + rhs.0)
    }
}

impl Sub for Pages {
    type Output = Pages;
    fn sub(self, rhs: Pages) -> Pages {
        Pages(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_byte_conversion() {
        assert_eq!(Bytes::from(Pages(3)), Bytes(3 * WASM_PAGE_SIZE));
        assert_eq!(Pages::from(Bytes(2 * WASM_PAGE_SIZE)), Pages(2));
    }

    #[test]
    fn checked_add_respects_the_addressable_maximum() {
        assert_eq!(Pages(1).checked_add(Pages(2)), Ok(Pages(3)));
        assert!(Pages(WASM_MAX_PAGES as u32)
            .checked_add(Pages(1))
            .is_err());
    }
}

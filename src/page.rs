//! Pagination and slicing.
//!
//! A [`PageRequest`] is a zero-based window plus optional sort keys. A
//! [`Page`] carries the window's content together with the total element
//! count from a companion count query; a [`Slice`] skips the count and only
//! knows whether a next window exists, learned by over-fetching one row.

use crate::error::{QuarryError, QuarryResult};
use crate::plan::SortKey;

/// A zero-based page window with optional request-level sorting.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub page: u64,
    pub size: u64,
    pub sort: Vec<SortKey>,
}

impl PageRequest {
    pub fn of(page: u64, size: u64) -> Self {
        Self {
            page,
            size,
            sort: Vec::new(),
        }
    }

    pub fn with_sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn offset(&self) -> u64 {
        self.page * self.size
    }

    /// A zero-size window can neither advance nor hold content.
    pub(crate) fn validate(&self) -> QuarryResult<()> {
        if self.size == 0 {
            return Err(QuarryError::InvalidPageRequest {
                reason: "page size must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// One window of results plus the total matching-element count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    content: Vec<T>,
    page: u64,
    size: u64,
    total_elements: u64,
}

impl<T> Page<T> {
    pub(crate) fn new(content: Vec<T>, request: &PageRequest, total_elements: u64) -> Self {
        Self {
            content,
            page: request.page,
            size: request.size,
            total_elements,
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> u64 {
        self.page
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    pub fn total_pages(&self) -> u64 {
        if self.total_elements == 0 {
            0
        } else {
            self.total_elements.div_ceil(self.size)
        }
    }

    pub fn is_first(&self) -> bool {
        self.page == 0
    }

    pub fn is_last(&self) -> bool {
        self.page * self.size + self.content.len() as u64 >= self.total_elements
    }

    pub fn has_next(&self) -> bool {
        !self.is_last()
    }

    /// Map the content while keeping the window metadata, for returning
    /// view records instead of entities.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

/// One window of results that knows whether another window follows, without
/// ever counting the full result set.
#[derive(Debug, Clone)]
pub struct Slice<T> {
    content: Vec<T>,
    page: u64,
    size: u64,
    has_next: bool,
}

impl<T> Slice<T> {
    /// Build from an over-fetched window of up to `size + 1` rows; the
    /// sentinel row proves a next window exists and is trimmed off.
    pub(crate) fn from_overfetch(mut content: Vec<T>, request: &PageRequest) -> Self {
        let has_next = content.len() as u64 > request.size;
        if has_next {
            content.truncate(request.size as usize);
        }
        Self {
            content,
            page: request.page,
            size: request.size,
            has_next,
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> u64 {
        self.page
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn has_next(&self) -> bool {
        self.has_next
    }

    pub fn is_first(&self) -> bool {
        self.page == 0
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Slice<U> {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            has_next: self.has_next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_elements_at_size_three() {
        let request = PageRequest::of(0, 3);
        let page = Page::new(vec![1, 2, 3], &request, 5);
        assert_eq!(page.content().len(), 3);
        assert_eq!(page.total_elements(), 5);
        assert_eq!(page.total_pages(), 2);
        assert!(page.is_first());
        assert!(!page.is_last());
        assert!(page.has_next());

        let request = PageRequest::of(1, 3);
        let last = Page::new(vec![4, 5], &request, 5);
        assert_eq!(last.content().len(), 2);
        assert!(!last.is_first());
        assert!(last.is_last());
        assert!(!last.has_next());
    }

    #[test]
    fn empty_result_set() {
        let request = PageRequest::of(0, 3);
        let page: Page<i32> = Page::new(vec![], &request, 0);
        assert_eq!(page.total_pages(), 0);
        assert!(page.is_last());
    }

    #[test]
    fn offset_math() {
        assert_eq!(PageRequest::of(0, 3).offset(), 0);
        assert_eq!(PageRequest::of(2, 3).offset(), 6);
    }

    #[test]
    fn zero_size_is_invalid() {
        let err = PageRequest::of(0, 0).validate().unwrap_err();
        assert!(matches!(err, QuarryError::InvalidPageRequest { .. }));
    }

    #[test]
    fn slice_trims_the_sentinel_row() {
        let request = PageRequest::of(0, 3);
        let slice = Slice::from_overfetch(vec![1, 2, 3, 4], &request);
        assert_eq!(slice.content(), &[1, 2, 3]);
        assert!(slice.has_next());

        let slice = Slice::from_overfetch(vec![4, 5], &PageRequest::of(1, 3));
        assert_eq!(slice.content(), &[4, 5]);
        assert!(!slice.has_next());
    }

    #[test]
    fn page_map_keeps_metadata() {
        let page = Page::new(vec![1, 2], &PageRequest::of(1, 2), 6);
        let mapped = page.map(|v| v.to_string());
        assert_eq!(mapped.content(), &["1".to_string(), "2".to_string()]);
        assert_eq!(mapped.total_pages(), 3);
        assert_eq!(mapped.number(), 1);
    }
}
